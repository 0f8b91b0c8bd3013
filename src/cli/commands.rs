use anyhow::{Result, Context};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::cli::config::HarvesterConfig;
use crate::crawler::board::BoardCrawler;
use crate::crawler::job::{CrawlJob, TriggerOrigin};
use crate::crawler::orchestrator::{CrawlReport, Orchestrator, SourceResult};
use crate::crawler::source::SourceRegistry;
use crate::crawler::tracker::JobTracker;
use crate::dedup::engine::DedupEngine;
use crate::fetch;
use crate::storage;
use crate::storage::history::HistoryStore;

/// Wire the orchestrator together from configuration.
async fn build_orchestrator(
    config: &HarvesterConfig,
) -> Result<(Orchestrator, Arc<fetch::FetchChain>)> {
    let index = storage::create_index(&config.storage.index)?;
    let history = storage::create_history(&config.storage.history).await?;

    let chain = Arc::new(fetch::build_chain(&config.fetch)?);
    let dedup = Arc::new(DedupEngine::new(index, history.clone(), &config.dedup));
    let tracker = JobTracker::new(history, config.crawl.recent_jobs);

    let mut registry = SourceRegistry::new();
    let page_delay = Duration::from_millis(config.crawl.page_delay_ms);
    for source in &config.sources {
        match BoardCrawler::new(source, chain.clone(), page_delay) {
            Ok(crawler) => registry.register(Arc::new(crawler)),
            Err(e) => warn!("skipping source '{}': {}", source.name, e),
        }
    }
    if registry.is_empty() {
        anyhow::bail!("no usable sources configured");
    }

    Ok((
        Orchestrator::new(registry, dedup, tracker, &config.crawl),
        chain,
    ))
}

fn load_config(profile: Option<&str>) -> Result<HarvesterConfig> {
    match profile {
        Some(profile) => HarvesterConfig::load_profile(profile)
            .context(format!("Failed to load profile: {}", profile)),
        None => HarvesterConfig::load_default(),
    }
}

async fn history_store(config: &HarvesterConfig) -> Result<Arc<dyn HistoryStore>> {
    storage::create_history(&config.storage.history).await
}

/// Crawl every configured source
pub async fn crawl_all(profile: Option<String>, limit: Option<usize>) -> Result<()> {
    let config = load_config(profile.as_deref())?;
    let max = limit.unwrap_or(config.crawl.max_per_source);

    let (orchestrator, chain) = build_orchestrator(&config).await?;
    let report = orchestrator.crawl_all(max, TriggerOrigin::Manual).await;
    print_report(&report);
    print_strategy_stats(&chain).await;

    Ok(())
}

/// Crawl a single source on demand
pub async fn crawl_one(source: String, profile: Option<String>, limit: Option<usize>) -> Result<()> {
    let config = load_config(profile.as_deref())?;
    let max = limit.unwrap_or(config.crawl.max_per_source);

    let (orchestrator, _) = build_orchestrator(&config).await?;
    let result = orchestrator
        .crawl_one(&source, max, TriggerOrigin::Manual)
        .await?;
    print_source_result(&result);

    Ok(())
}

/// Show one job's step-by-step progress
pub async fn status(job_id: String) -> Result<()> {
    let config = load_config(None)?;
    let store = history_store(&config).await?;

    let id = Uuid::parse_str(&job_id).context("Invalid job id")?;
    match store.load_job(id).await? {
        Some(job) => print_job(&job),
        None => println!("Job not found: {}", job_id),
    }

    Ok(())
}

/// List recent crawl jobs
pub async fn history(source: Option<String>, limit: usize) -> Result<()> {
    let config = load_config(None)?;
    let store = history_store(&config).await?;

    let jobs = store.recent_jobs(source.as_deref(), limit).await?;
    if jobs.is_empty() {
        println!("No crawl jobs recorded.");
        return Ok(());
    }

    for job in jobs {
        println!(
            "{}  {:<16} {:<10} found {:>4}  added {:>4}  duplicates {:>4}  {}",
            job.id,
            job.source,
            job.status().to_string(),
            job.found,
            job.added,
            job.duplicates,
            job.started_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    Ok(())
}

/// Show duplicate-detection statistics
pub async fn stats() -> Result<()> {
    let config = load_config(None)?;
    let store = history_store(&config).await?;

    let stats = store.duplicate_stats().await?;
    if stats.is_empty() {
        println!("No duplicates recorded.");
        return Ok(());
    }

    println!("Duplicates by detection method:");
    let mut entries: Vec<_> = stats.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    for (method, count) in entries {
        println!("  {:<14} {}", method, count);
    }

    Ok(())
}

/// List the configured sources
pub async fn sources() -> Result<()> {
    let config = load_config(None)?;

    println!("Configured sources:");
    for source in &config.sources {
        println!("  - {} ({})", source.name, source.base_url);
    }

    Ok(())
}

/// List all available configuration profiles
pub async fn list_profiles() -> Result<()> {
    let profiles = HarvesterConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Manage a specific configuration profile
pub async fn manage_profile(profile_name: String) -> Result<()> {
    match HarvesterConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{:#?}", config);
        },
        Err(_) => {
            // Profile doesn't exist, create a new one
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = HarvesterConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub async fn show_config() -> Result<()> {
    let config = HarvesterConfig::load_default()?;
    println!("Current configuration:");
    println!("{:#?}", config);

    Ok(())
}

async fn print_strategy_stats(chain: &fetch::FetchChain) {
    let stats = chain.metrics().snapshot().await;
    if stats.is_empty() {
        return;
    }
    println!();
    println!("Fetch strategies:");
    for (strategy, stats) in stats {
        println!(
            "  {:<12} {:>3} attempts  {:>3} ok  {:.0}% success  avg {}ms",
            strategy,
            stats.attempts,
            stats.successes,
            stats.success_rate() * 100.0,
            stats.total_ms / stats.attempts.max(1),
        );
    }
}

fn print_report(report: &CrawlReport) {
    println!(
        "Batch crawl finished in {:.1}s",
        report.duration_ms as f64 / 1000.0
    );
    println!(
        "  total crawled: {}   added: {}   already indexed: {}",
        report.total_crawled, report.total_added, report.total_already_exist
    );
    println!();
    for result in &report.sources {
        print_source_result(result);
    }
    if !report.errors.is_empty() {
        println!("Errors:");
        for error in &report.errors {
            println!("  - {}", error);
        }
    }
}

fn print_source_result(result: &SourceResult) {
    println!(
        "{:<16} crawled {:>4}  added {:>4}  duplicates {:>4}  success rate {:.0}%{}",
        result.source,
        result.crawled,
        result.added,
        result.duplicates,
        result.success_rate * 100.0,
        result
            .error
            .as_deref()
            .map(|e| format!("  [{}]", e))
            .unwrap_or_default(),
    );
    if let Some(job_id) = result.job_id {
        println!("  job id: {}", job_id);
    }
}

fn print_job(job: &CrawlJob) {
    println!("Job ID: {}", job.id);
    println!("Source: {}", job.source);
    println!("Status: {}", job.status());
    println!("Started: {}", job.started_at);
    if let Some(completed) = job.completed_at {
        println!("Completed: {}", completed);
    }
    println!(
        "Counters: found {}  added {}  duplicates {}",
        job.found, job.added, job.duplicates
    );

    println!("Steps:");
    for step in &job.steps {
        println!(
            "  {:<20} {:<10} {:>3}%  {}",
            step.kind.to_string(),
            step.status.to_string(),
            step.progress,
            step.error
                .as_deref()
                .or(step.message.as_deref())
                .unwrap_or(""),
        );
    }

    if !job.errors.is_empty() {
        println!("Errors:");
        for error in &job.errors {
            println!("  - {}", error);
        }
    }
    if let Some(summary) = &job.summary {
        println!("Summary: {}", summary);
    }
}
