use anyhow::{Context, Result};
use console::style;

use crate::config::Config;
use crate::core::jobs::{JobLedger, JobStatus};
use crate::core::store::Store;

const DEFAULT_LIMIT: usize = 20;

pub async fn run_jobs_command(config: &Config, args: &[String]) -> Result<()> {
    let limit = match args.first() {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("\"{}\" is not a number", raw))?,
        None => DEFAULT_LIMIT,
    };

    let jobs = JobLedger::new(Store::open(&config.database))
        .latest(limit)
        .await?;
    if jobs.is_empty() {
        println!("  {} No jobs recorded yet.", style("●").dim());
        return Ok(());
    }

    for job in &jobs {
        let padded = format!("{:<10}", job.status.as_str());
        let status = match job.status {
            JobStatus::Running => style(padded).cyan(),
            JobStatus::Successful => style(padded).green(),
            JobStatus::Failed => style(padded).red(),
            JobStatus::Killed => style(padded).yellow(),
        };
        println!(
            "  {:>6}  {}  {:<12}  {}  {}",
            format!("#{}", job.id),
            status,
            job.request.username,
            style(job.start_time.format("%Y-%m-%d %H:%M:%S")).dim(),
            job.request.command_line()
        );
    }
    Ok(())
}
