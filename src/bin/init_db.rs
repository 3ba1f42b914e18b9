use anyhow::{Context, Result};
use clap::Parser;
use filing_topics::UrlCache;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "filing-topics-init-db",
    about = "Create an empty URL cache database, e.g. while building a container image"
)]
struct InitCli {
    /// SQLite file to create
    #[arg(long, env = "FILING_TOPICS_DB_PATH", default_value = "api/db/data_docker.db")]
    db_path: PathBuf,
}

fn main() -> Result<()> {
    let cli = InitCli::parse();
    let cache = UrlCache::open(&cli.db_path)
        .with_context(|| format!("failed to create {}", cli.db_path.display()))?;
    let records = cache.len().context("failed to count cached urls")?;
    println!(
        "url cache ready at {} ({records} records)",
        cli.db_path.display()
    );
    Ok(())
}
