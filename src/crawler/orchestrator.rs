use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cli::config::CrawlSettings;
use crate::crawler::error::CrawlError;
use crate::crawler::job::{CrawlJob, StepKind, StepStatus, TriggerOrigin};
use crate::crawler::source::{SourceCrawler, SourceRegistry};
use crate::crawler::tracker::{JobHandle, JobTracker};
use crate::dedup::engine::{DedupEngine, IngestOutcome};

/// Aggregated outcome of one source's run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceResult {
    pub source: String,
    pub job_id: Option<Uuid>,
    pub crawled: u64,
    pub added: u64,
    pub duplicates: u64,
    pub success_rate: f64,
    pub error: Option<String>,
}

impl SourceResult {
    fn from_job(job: &CrawlJob) -> Self {
        let crawled = job.found;
        let added = job.added;
        Self {
            source: job.source.clone(),
            job_id: Some(job.id),
            crawled,
            added,
            duplicates: job.duplicates,
            success_rate: if crawled == 0 {
                0.0
            } else {
                added as f64 / crawled as f64
            },
            error: job.errors.first().cloned(),
        }
    }
}

/// Aggregated outcome of a batch run across every registered source.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub total_crawled: u64,
    pub total_added: u64,
    pub total_already_exist: u64,
    pub sources: Vec<SourceResult>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Fans crawl jobs out across the registered sources, isolating per-source
/// failures and aggregating counters.
pub struct Orchestrator {
    registry: SourceRegistry,
    dedup: Arc<DedupEngine>,
    tracker: Arc<JobTracker>,
    job_budget: Duration,
}

impl Orchestrator {
    pub fn new(
        registry: SourceRegistry,
        dedup: Arc<DedupEngine>,
        tracker: Arc<JobTracker>,
        settings: &CrawlSettings,
    ) -> Self {
        Self {
            registry,
            dedup,
            tracker,
            job_budget: Duration::from_secs(settings.job_budget_secs),
        }
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    pub fn source_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Run every registered source concurrently. One source failing - or
    /// panicking - never aborts its siblings.
    pub async fn crawl_all(&self, max_per_source: usize, trigger: TriggerOrigin) -> CrawlReport {
        let started = Instant::now();
        info!("starting batch crawl across {} sources", self.registry.len());

        let mut tasks = Vec::new();
        for crawler in self.registry.iter() {
            let crawler = crawler.clone();
            let dedup = self.dedup.clone();
            let tracker = self.tracker.clone();
            let budget = self.job_budget;
            let name = crawler.name().to_string();

            let task = tokio::spawn(async move {
                run_source(crawler, dedup, tracker, budget, max_per_source, trigger).await
            });
            tasks.push((name, task));
        }

        let mut report = CrawlReport {
            total_crawled: 0,
            total_added: 0,
            total_already_exist: 0,
            sources: Vec::new(),
            errors: Vec::new(),
            duration_ms: 0,
        };

        for (name, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!("source '{}' crawl task aborted: {}", name, e);
                    SourceResult {
                        source: name.clone(),
                        job_id: None,
                        crawled: 0,
                        added: 0,
                        duplicates: 0,
                        success_rate: 0.0,
                        error: Some(format!("crawl task aborted: {}", e)),
                    }
                }
            };

            report.total_crawled += result.crawled;
            report.total_added += result.added;
            report.total_already_exist += result.duplicates;
            if let Some(err) = &result.error {
                report.errors.push(format!("{}: {}", result.source, err));
            }
            report.sources.push(result);
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "batch crawl finished in {}ms: {} crawled, {} added, {} duplicates",
            report.duration_ms, report.total_crawled, report.total_added, report.total_already_exist
        );
        report
    }

    /// Run one source on demand, for manual retries.
    pub async fn crawl_one(
        &self,
        source_name: &str,
        max_postings: usize,
        trigger: TriggerOrigin,
    ) -> anyhow::Result<SourceResult> {
        let crawler = self.registry.get(source_name).ok_or_else(|| {
            anyhow::anyhow!(
                "unknown source '{}' (available: {})",
                source_name,
                self.registry.names().join(", ")
            )
        })?;

        Ok(run_source(
            crawler,
            self.dedup.clone(),
            self.tracker.clone(),
            self.job_budget,
            max_postings,
            trigger,
        )
        .await)
    }
}

/// Execute one source's crawl job through its step plan.
async fn run_source(
    crawler: Arc<dyn SourceCrawler>,
    dedup: Arc<DedupEngine>,
    tracker: Arc<JobTracker>,
    budget: Duration,
    max_postings: usize,
    trigger: TriggerOrigin,
) -> SourceResult {
    let source = crawler.name().to_string();
    let started = Instant::now();
    let handle = tracker.create(&source, crawler.step_plan(), trigger).await;

    if let Err(e) = handle.start_step(StepKind::Initialize).await {
        warn!("{}: could not start job: {}", source, e);
    }
    handle
        .complete_step(StepKind::Initialize, "crawler initialized")
        .await;

    // Availability gates the fetch budget: an unreachable source never
    // touches the strategy chain
    let _ = handle.start_step(StepKind::CheckAvailability).await;
    if !crawler.is_available().await {
        let err = CrawlError::NotAvailable(source.clone());
        warn!("{}", err);
        handle
            .fail_step(StepKind::CheckAvailability, err.to_string())
            .await;
        return SourceResult::from_job(&handle.snapshot().await);
    }
    handle
        .complete_step(StepKind::CheckAvailability, "source is reachable")
        .await;

    // The crawler reports its internal steps through the handle
    let postings = match crawler.crawl(max_postings, &handle).await {
        Ok(postings) => postings,
        Err(err) => {
            handle.fail_running(err.to_string()).await;
            return SourceResult::from_job(&handle.snapshot().await);
        }
    };

    // Sources that do not report incrementally still get a found count
    if handle.snapshot().await.found == 0 && !postings.is_empty() {
        handle.add_found(postings.len() as u64).await;
    }

    // Crawlers that do not walk their own fetch step still get it recorded
    let fetch_pending = handle
        .snapshot()
        .await
        .step(StepKind::FetchAndExtract)
        .map(|s| s.status == StepStatus::Pending)
        .unwrap_or(false);
    if fetch_pending {
        let _ = handle.start_step(StepKind::FetchAndExtract).await;
        handle
            .complete_step(
                StepKind::FetchAndExtract,
                format!("extracted {} postings", postings.len()),
            )
            .await;
    }

    if over_budget(&handle, started, budget, StepKind::Validate).await {
        return SourceResult::from_job(&handle.snapshot().await);
    }

    // Validate: invalid postings are dropped and counted, never fatal
    let _ = handle.start_step(StepKind::Validate).await;
    let total = postings.len();
    let mut valid = Vec::with_capacity(total);
    let mut dropped = 0u64;
    for posting in postings {
        match posting.validate() {
            Ok(()) => valid.push(posting),
            Err(err) => {
                dropped += 1;
                warn!("{}: dropping posting: {}", source, err);
            }
        }
    }
    handle
        .merge_details(StepKind::Validate, |details| {
            details.dropped = Some(dropped);
        })
        .await;
    handle
        .complete_step(
            StepKind::Validate,
            format!("{} valid postings, {} dropped", valid.len(), dropped),
        )
        .await;

    if over_budget(&handle, started, budget, StepKind::Deduplicate).await {
        return SourceResult::from_job(&handle.snapshot().await);
    }

    // Deduplicate: the engine persists new postings and records rejects;
    // counters move per posting so partial progress survives a failure
    if valid.is_empty() {
        handle
            .skip_step(StepKind::Deduplicate, "no postings to check")
            .await;
    } else {
        let _ = handle.start_step(StepKind::Deduplicate).await;
        let candidate_count = valid.len();
        for (index, posting) in valid.iter().enumerate() {
            match dedup.ingest(posting).await {
                Ok(IngestOutcome::New { .. }) => handle.add_added(1).await,
                Ok(IngestOutcome::Duplicate { .. }) => handle.add_duplicates(1).await,
                Err(err) => {
                    handle.fail_step(StepKind::Deduplicate, err.to_string()).await;
                    return SourceResult::from_job(&handle.snapshot().await);
                }
            }

            let percent = (((index + 1) * 100) / candidate_count.max(1)).min(100) as u8;
            handle
                .progress(
                    StepKind::Deduplicate,
                    percent,
                    format!("checked {}/{} postings", index + 1, candidate_count),
                )
                .await;
        }

        let snapshot = handle.snapshot().await;
        handle
            .complete_step(
                StepKind::Deduplicate,
                format!(
                    "{} new postings, {} duplicates",
                    snapshot.added, snapshot.duplicates
                ),
            )
            .await;
    }

    if over_budget(&handle, started, budget, StepKind::Cleanup).await {
        return SourceResult::from_job(&handle.snapshot().await);
    }

    let _ = handle.start_step(StepKind::Cleanup).await;
    handle
        .complete_step(StepKind::Cleanup, "resources released")
        .await;

    let snapshot = handle.snapshot().await;
    info!(
        "{}: crawl {} - found {}, added {}, duplicates {}",
        source,
        snapshot.status(),
        snapshot.found,
        snapshot.added,
        snapshot.duplicates
    );
    SourceResult::from_job(&snapshot)
}

/// Enforce the per-job wall-clock budget between steps. An over-budget job
/// is abandoned - the next step is marked failed and nothing further
/// starts - but an in-flight step is never interrupted.
async fn over_budget(
    handle: &JobHandle,
    started: Instant,
    budget: Duration,
    next_step: StepKind,
) -> bool {
    if budget.is_zero() || started.elapsed() <= budget {
        return false;
    }
    warn!(
        "job {} exceeded its {}s wall-clock budget, abandoning",
        handle.id(),
        budget.as_secs()
    );
    handle
        .fail_step(
            next_step,
            format!("job exceeded wall-clock budget of {}s", budget.as_secs()),
        )
        .await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::DedupSettings;
    use crate::crawler::job::{StepPlan, StepStatus};
    use crate::crawler::posting::Posting;
    use crate::crawler::source::MockSourceCrawler;
    use crate::storage::history::MemoryHistory;
    use crate::storage::index::MemoryIndex;
    use chrono::Utc;

    fn posting(title: &str, url: &str) -> Posting {
        Posting {
            title: title.to_string(),
            company: "Acme".to_string(),
            description: format!("{} at Acme", title),
            url: Some(url.to_string()),
            location: None,
            salary: None,
            job_type: None,
            experience_level: None,
            posted_at: Utc::now(),
            source: "mock".to_string(),
            source_native_id: None,
        }
    }

    fn invalid_posting() -> Posting {
        let mut p = posting("Untitled", "https://x.example/bad");
        p.title = String::new();
        p
    }

    fn mock_source(
        name: &'static str,
        available: bool,
        outcome: Result<Vec<Posting>, &'static str>,
    ) -> Arc<dyn SourceCrawler> {
        let mut mock = MockSourceCrawler::new();
        mock.expect_name().return_const(name.to_string());
        mock.expect_step_plan().return_const(StepPlan::Simple);
        mock.expect_is_available().returning(move || available);
        match outcome {
            Ok(postings) => {
                mock.expect_crawl()
                    .returning(move |max, _| Ok(postings.iter().take(max).cloned().collect()));
            }
            Err(reason) => {
                mock.expect_crawl().returning(move |_, _| {
                    Err(CrawlError::Persistence {
                        context: reason.to_string(),
                    })
                });
            }
        }
        Arc::new(mock)
    }

    fn orchestrator(registry: SourceRegistry) -> Orchestrator {
        let index = Arc::new(MemoryIndex::new());
        let history = Arc::new(MemoryHistory::new());
        let dedup = Arc::new(DedupEngine::new(
            index,
            history.clone(),
            &DedupSettings::default(),
        ));
        let tracker = JobTracker::new(history, 50);
        Orchestrator::new(
            registry,
            dedup,
            tracker,
            &CrawlSettings {
                max_per_source: 100,
                job_budget_secs: 600,
                page_delay_ms: 0,
                recent_jobs: 50,
            },
        )
    }

    #[tokio::test]
    async fn test_crawl_all_isolates_an_unavailable_source() {
        let mut registry = SourceRegistry::new();
        registry.register(mock_source(
            "alpha",
            true,
            Ok(vec![posting("Engineer A", "https://a.example/1")]),
        ));
        registry.register(mock_source("offline", false, Ok(vec![])));
        registry.register(mock_source(
            "beta",
            true,
            Ok(vec![posting("Engineer B", "https://b.example/1")]),
        ));
        registry.register(mock_source(
            "gamma",
            true,
            Ok(vec![posting("Engineer C", "https://c.example/1")]),
        ));

        let report = orchestrator(registry)
            .crawl_all(10, TriggerOrigin::Scheduled)
            .await;

        assert_eq!(report.sources.len(), 4);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("offline"));
        assert!(report.errors[0].contains("not available"));

        // The three live sources each contributed
        let live: Vec<_> = report
            .sources
            .iter()
            .filter(|s| s.source != "offline")
            .collect();
        assert!(live.iter().all(|s| s.crawled == 1 && s.added == 1));

        // Aggregate equals the per-source sum
        let sum: u64 = report.sources.iter().map(|s| s.added).sum();
        assert_eq!(report.total_added, sum);
        assert_eq!(report.total_added, 3);
    }

    #[tokio::test]
    async fn test_unavailable_source_short_circuits_with_zero_counters() {
        let mut registry = SourceRegistry::new();
        registry.register(mock_source("offline", false, Ok(vec![])));
        let orch = orchestrator(registry);

        let result = orch
            .crawl_one("offline", 10, TriggerOrigin::Manual)
            .await
            .unwrap();
        assert_eq!(result.crawled, 0);
        assert_eq!(result.added, 0);
        assert!(result.error.unwrap().contains("not available"));

        // The job record shows the failed availability step and untouched
        // later steps
        let job = orch
            .tracker()
            .snapshot(result.job_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status(), StepStatus::Failed);
        assert_eq!(
            job.step(StepKind::CheckAvailability).unwrap().status,
            StepStatus::Failed
        );
        assert_eq!(
            job.step(StepKind::FetchAndExtract).unwrap().status,
            StepStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_crawl_failure_preserves_prior_progress() {
        let mut registry = SourceRegistry::new();
        registry.register(mock_source("broken", true, Err("index write refused")));
        let orch = orchestrator(registry);

        let result = orch
            .crawl_one("broken", 10, TriggerOrigin::Manual)
            .await
            .unwrap();
        assert!(result.error.unwrap().contains("index write refused"));

        let job = orch
            .tracker()
            .snapshot(result.job_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status(), StepStatus::Failed);
        // Steps that finished before the failure stay completed
        assert_eq!(
            job.step(StepKind::CheckAvailability).unwrap().status,
            StepStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_duplicates_across_sources_are_counted_not_added() {
        let shared = posting("Engineer", "https://shared.example/1");
        let mut registry = SourceRegistry::new();
        registry.register(mock_source("first", true, Ok(vec![shared.clone()])));
        registry.register(mock_source("second", true, Ok(vec![shared])));

        let report = orchestrator(registry)
            .crawl_all(10, TriggerOrigin::Scheduled)
            .await;
        assert_eq!(report.total_crawled, 2);
        assert_eq!(report.total_added, 1);
        assert_eq!(report.total_already_exist, 1);
    }

    #[tokio::test]
    async fn test_invalid_postings_are_dropped_not_fatal() {
        let mut registry = SourceRegistry::new();
        registry.register(mock_source(
            "mixed",
            true,
            Ok(vec![
                posting("Engineer", "https://m.example/1"),
                invalid_posting(),
            ]),
        ));
        let orch = orchestrator(registry);

        let result = orch
            .crawl_one("mixed", 10, TriggerOrigin::Manual)
            .await
            .unwrap();
        assert_eq!(result.added, 1);
        assert!(result.error.is_none());

        let job = orch
            .tracker()
            .snapshot(result.job_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status(), StepStatus::Completed);
        assert_eq!(job.step(StepKind::Validate).unwrap().details.dropped, Some(1));
    }

    #[tokio::test]
    async fn test_crawl_one_unknown_source_lists_available() {
        let mut registry = SourceRegistry::new();
        registry.register(mock_source("alpha", true, Ok(vec![])));
        let orch = orchestrator(registry);

        let err = orch
            .crawl_one("nope", 10, TriggerOrigin::Manual)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("alpha"));
    }

    #[tokio::test]
    async fn test_success_rate_is_added_over_crawled() {
        let mut registry = SourceRegistry::new();
        registry.register(mock_source(
            "halved",
            true,
            Ok(vec![
                posting("Engineer", "https://h.example/1"),
                posting("Engineer", "https://h.example/1?utm=dup"),
            ]),
        ));

        let report = orchestrator(registry)
            .crawl_all(10, TriggerOrigin::Manual)
            .await;
        let result = &report.sources[0];
        assert_eq!(result.crawled, 2);
        assert_eq!(result.added, 1);
        assert!((result.success_rate - 0.5).abs() < f64::EPSILON);
    }
}
