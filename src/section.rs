//! The fixed set of 10-K filing sections and a container holding one value per section.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the three filing regions that carry their own topic model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Section {
    /// Item 1, Business.
    Section1,
    /// Item 1A, Risk Factors.
    Section1A,
    /// Item 7, Management's Discussion and Analysis.
    Section7,
}

impl Section {
    /// Every section in canonical order.
    pub const ALL: [Section; 3] = [Section::Section1, Section::Section1A, Section::Section7];

    /// Identifier used in asset files, model filenames and JSON responses.
    pub fn name(self) -> &'static str {
        match self {
            Self::Section1 => "Section1",
            Self::Section1A => "Section1A",
            Self::Section7 => "Section7",
        }
    }

    /// Human description of what the section covers.
    pub fn description(self) -> &'static str {
        match self {
            Self::Section1 => {
                "Business: requires a description of the company's business, including its main \
                 products and services, what subsidiaries it owns, and what markets it operates in. \
                 This section may also include information about recent events, competition the \
                 company faces, regulations that apply to it, labor issues, special operating costs, \
                 or seasonal factors."
            }
            Self::Section1A => {
                "Risk Factors: includes information about the most significant risks that apply to \
                 the company or to its securities. Companies generally list the risk factors in \
                 order of their importance."
            }
            Self::Section7 => {
                "Management's Discussion and Analysis of Financial Condition and Results of \
                 Operations: gives the company's perspective on the business results of the past \
                 financial year."
            }
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Section1 => 0,
            Self::Section1A => 1,
            Self::Section7 => 2,
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a string names no known section.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown section `{0}`")]
pub struct UnknownSection(pub String);

impl FromStr for Section {
    type Err = UnknownSection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Section::ALL
            .into_iter()
            .find(|section| section.name() == s)
            .ok_or_else(|| UnknownSection(s.to_string()))
    }
}

/// Exactly one `T` per section, serialized as an object keyed by section name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerSection<T> {
    #[serde(rename = "Section1")]
    section1: T,
    #[serde(rename = "Section1A")]
    section1a: T,
    #[serde(rename = "Section7")]
    section7: T,
}

impl<T> PerSection<T> {
    /// Builds the container by evaluating `f` once per section, in canonical order.
    pub fn from_fn<F>(mut f: F) -> Self
    where
        F: FnMut(Section) -> T,
    {
        Self {
            section1: f(Section::Section1),
            section1a: f(Section::Section1A),
            section7: f(Section::Section7),
        }
    }

    /// Like [`PerSection::from_fn`] but stops at the first error.
    pub fn try_from_fn<F, E>(mut f: F) -> Result<Self, E>
    where
        F: FnMut(Section) -> Result<T, E>,
    {
        Ok(Self {
            section1: f(Section::Section1)?,
            section1a: f(Section::Section1A)?,
            section7: f(Section::Section7)?,
        })
    }

    /// Builds the container from values listed in canonical section order.
    pub fn from_array(values: [T; 3]) -> Self {
        let [section1, section1a, section7] = values;
        Self {
            section1,
            section1a,
            section7,
        }
    }

    /// Value for `section`.
    pub fn get(&self, section: Section) -> &T {
        match section.index() {
            0 => &self.section1,
            1 => &self.section1a,
            _ => &self.section7,
        }
    }

    /// Mutable value for `section`.
    pub fn get_mut(&mut self, section: Section) -> &mut T {
        match section.index() {
            0 => &mut self.section1,
            1 => &mut self.section1a,
            _ => &mut self.section7,
        }
    }

    /// Applies `f` to every value, keeping the section association.
    pub fn map<U, F>(self, mut f: F) -> PerSection<U>
    where
        F: FnMut(Section, T) -> U,
    {
        PerSection {
            section1: f(Section::Section1, self.section1),
            section1a: f(Section::Section1A, self.section1a),
            section7: f(Section::Section7, self.section7),
        }
    }

    /// Iterates `(section, value)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (Section, &T)> {
        Section::ALL.into_iter().map(move |section| (section, self.get(section)))
    }

    /// Consumes the container into values listed in canonical order.
    pub fn into_array(self) -> [T; 3] {
        [self.section1, self.section1a, self.section7]
    }
}
