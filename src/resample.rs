//! Calendar resample rules such as `1Y` or `3M`.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use std::fmt;
use std::str::FromStr;

/// Calendar unit a rule counts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyUnit {
    /// Calendar days, labelled by the first day of the bucket.
    Day,
    /// Weeks ending on Sunday.
    Week,
    /// Calendar months, labelled by month end.
    Month,
    /// Calendar quarters of a December year, labelled by quarter end.
    Quarter,
    /// Calendar years, labelled by December 31.
    Year,
}

/// Parsed resample rule: `count` consecutive `unit` periods per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResampleRule {
    count: u32,
    unit: FrequencyUnit,
}

/// The rule string could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported resample rule `{0}`")]
pub struct InvalidFrequency(pub String);

impl FromStr for ResampleRule {
    type Err = InvalidFrequency;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidFrequency(raw.to_string());
        let trimmed = raw.trim();
        let digits_end = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (digits, unit) = trimmed.split_at(digits_end);
        let count = if digits.is_empty() {
            1
        } else {
            digits.parse::<u32>().map_err(|_| invalid())?
        };
        if count == 0 {
            return Err(invalid());
        }
        let unit = match unit.to_ascii_uppercase().as_str() {
            "D" => FrequencyUnit::Day,
            "W" | "W-SUN" => FrequencyUnit::Week,
            "M" | "ME" => FrequencyUnit::Month,
            "Q" | "QE" | "Q-DEC" => FrequencyUnit::Quarter,
            "Y" | "YE" | "A" | "Y-DEC" | "A-DEC" => FrequencyUnit::Year,
            _ => return Err(invalid()),
        };
        Ok(Self { count, unit })
    }
}

impl fmt::Display for ResampleRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            FrequencyUnit::Day => "D",
            FrequencyUnit::Week => "W",
            FrequencyUnit::Month => "M",
            FrequencyUnit::Quarter => "Q",
            FrequencyUnit::Year => "Y",
        };
        write!(f, "{}{}", self.count, unit)
    }
}

impl ResampleRule {
    /// Periods per bucket.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Calendar unit.
    pub fn unit(&self) -> FrequencyUnit {
        self.unit
    }

    /// Ordinal of the calendar period containing `ts`; consecutive periods differ by one.
    pub fn period_of(&self, ts: &DateTime<Utc>) -> i64 {
        let date = ts.date_naive();
        match self.unit {
            FrequencyUnit::Day => i64::from(date.num_days_from_ce()),
            // Day 1 of the proleptic calendar is a Monday.
            FrequencyUnit::Week => i64::from(date.num_days_from_ce() - 1).div_euclid(7),
            FrequencyUnit::Month => i64::from(date.year()) * 12 + i64::from(date.month0()),
            FrequencyUnit::Quarter => i64::from(date.year()) * 4 + i64::from(date.month0() / 3),
            FrequencyUnit::Year => i64::from(date.year()),
        }
    }

    /// Bucket index of `period` for a series anchored at `anchor`.
    pub fn bucket_of(&self, anchor: i64, period: i64) -> i64 {
        (period - anchor).div_euclid(i64::from(self.count))
    }

    /// Timestamp labelling `bucket` of a series anchored at `anchor`.
    pub fn bucket_label(&self, anchor: i64, bucket: i64) -> Option<DateTime<Utc>> {
        let count = i64::from(self.count);
        let date = match self.unit {
            FrequencyUnit::Day => {
                let day = i32::try_from(anchor + bucket * count).ok()?;
                NaiveDate::from_num_days_from_ce_opt(day)?
            }
            FrequencyUnit::Week => {
                let last_week = anchor + (bucket + 1) * count - 1;
                let sunday = i32::try_from(last_week * 7 + 7).ok()?;
                NaiveDate::from_num_days_from_ce_opt(sunday)?
            }
            FrequencyUnit::Month => {
                let last = anchor + (bucket + 1) * count - 1;
                month_end(last.div_euclid(12), last.rem_euclid(12) as u32 + 1)?
            }
            FrequencyUnit::Quarter => {
                let last = anchor + (bucket + 1) * count - 1;
                month_end(last.div_euclid(4), last.rem_euclid(4) as u32 * 3 + 3)?
            }
            FrequencyUnit::Year => {
                let last = anchor + (bucket + 1) * count - 1;
                NaiveDate::from_ymd_opt(i32::try_from(last).ok()?, 12, 31)?
            }
        };
        Some(date.and_hms_opt(0, 0, 0)?.and_utc())
    }
}

fn month_end(year: i64, month: u32) -> Option<NaiveDate> {
    let year = i32::try_from(year).ok()?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    next.checked_sub_signed(Duration::days(1))
}
