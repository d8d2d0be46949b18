//! serp-harvest - keyword-partitioned search result scraping
//!
//! A run loads keywords and proxies, splits the keywords across a bounded
//! number of workers, pins each worker to one egress proxy and funnels every
//! scraped results page through one serial SQLite writer.

pub mod crawling;
pub mod domain;
pub mod infrastructure;
pub mod scheduling;

pub use crawling::{
    Collaborators, Orchestrator, RunOptions, RunOutcome, RunReport, ScrapeError, SimulationReport,
};
pub use infrastructure::{AppConfig, ConfigManager, DatabaseConnection};

use serde_json::Value;
use std::io::Write;

/// Programmatic entry point: runs one scrape with `overrides` merged over the
/// user's configuration file.
///
/// Returns the storage handle of a completed run so callers can query what was
/// persisted; simulated runs and maintenance-only runs return `None`. Nothing is
/// written to stdout; callers that want the report use [`Orchestrator::run`]
/// and [`print_outcome`].
///
/// # Errors
/// Any [`ScrapeError`] raised by the run.
pub async fn scrape_with_config(overrides: Value) -> Result<Option<DatabaseConnection>, ScrapeError> {
    let manager = ConfigManager::new()
        .map_err(|e| ScrapeError::configuration(format!("Failed to locate configuration: {e:#}")))?;
    let config = manager
        .load_config()
        .await
        .map_err(|e| ScrapeError::configuration(format!("Failed to load configuration: {e:#}")))?;
    let config = ConfigManager::apply_overrides(config, &overrides)?;

    let collaborators = Collaborators::from_config(&config);
    let orchestrator = Orchestrator::new(config, collaborators, RunOptions::default());

    match orchestrator.run().await? {
        RunOutcome::Completed(report) => Ok(report.storage),
        RunOutcome::ConfigShown(_) | RunOutcome::CacheRepaired { .. } | RunOutcome::Simulated(_) => {
            Ok(None)
        }
    }
}

/// Writes the human readable report of `outcome`
///
/// # Errors
/// Propagates write failures of `out`.
pub fn print_outcome(out: &mut impl Write, outcome: &RunOutcome) -> std::io::Result<()> {
    match outcome {
        RunOutcome::ConfigShown(rendered) => writeln!(out, "{rendered}"),
        RunOutcome::CacheRepaired { renamed } => {
            writeln!(out, "Renamed {renamed} cache files to their canonical names")
        }
        RunOutcome::Simulated(report) => writeln!(out, "{report}"),
        RunOutcome::Completed(report) => {
            writeln!(
                out,
                "Run {} ({}) finished in {:.1}s",
                report.run_id,
                report.method,
                report.elapsed.as_secs_f64()
            )?;
            writeln!(
                out,
                "  keywords: {} total, {} scraped by {} workers, {} pages replayed from cache",
                report.keywords_total, report.keywords_scraped, report.workers, report.pages_from_cache
            )?;
            writeln!(
                out,
                "  persisted: {} pages, {} links in {} commits",
                report.handler.batches_processed, report.handler.links_persisted, report.handler.commits
            )?;
            for job in &report.jobs {
                writeln!(
                    out,
                    "  worker {} via {}: {} ({} keywords)",
                    job.worker_identity,
                    job.proxy,
                    job.outcome.label(),
                    job.keywords
                )?;
            }
            Ok(())
        }
    }
}
