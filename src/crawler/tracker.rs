use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::crawler::job::{
    CrawlJob, CrawlStep, StepDetails, StepKind, StepPlan, StepStatus, TriggerOrigin,
};
use crate::storage::history::HistoryStore;

/// Fixed-size cache of recently finished jobs, oldest evicted first.
/// Evicted jobs remain readable through the durable store.
struct RecentJobs {
    capacity: usize,
    order: VecDeque<Uuid>,
    jobs: HashMap<Uuid, CrawlJob>,
}

impl RecentJobs {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            jobs: HashMap::new(),
        }
    }

    fn insert(&mut self, job: CrawlJob) {
        if self.jobs.insert(job.id, job.clone()).is_none() {
            self.order.push_back(job.id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }

    fn get(&self, id: &Uuid) -> Option<&CrawlJob> {
        self.jobs.get(id)
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }
}

/// Owner of all in-flight and recently finished job state.
///
/// Each active job sits behind its own mutex, so updates to one job are
/// serialized (single writer) while status polls and other jobs proceed
/// concurrently. Every transition is pushed to the history store before the
/// updating call returns.
pub struct JobTracker {
    active: Mutex<HashMap<Uuid, Arc<Mutex<CrawlJob>>>>,
    recent: Mutex<RecentJobs>,
    store: Arc<dyn HistoryStore>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn HistoryStore>, recent_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(HashMap::new()),
            recent: Mutex::new(RecentJobs::new(recent_capacity)),
            store,
        })
    }

    /// Start tracking a new job and hand back the handle its run mutates it
    /// through.
    pub async fn create(
        self: &Arc<Self>,
        source: &str,
        plan: StepPlan,
        trigger: TriggerOrigin,
    ) -> JobHandle {
        let job = CrawlJob::new(source, plan, trigger);
        let id = job.id;

        if let Err(e) = self.store.save_job(&job).await {
            warn!("failed to persist new job {}: {}", id, e);
        }

        let shared = Arc::new(Mutex::new(job));
        self.active.lock().await.insert(id, shared.clone());

        JobHandle {
            id,
            job: shared,
            tracker: self.clone(),
        }
    }

    /// Current state of a job: active first, then the recent cache, then
    /// the durable store.
    pub async fn snapshot(&self, id: Uuid) -> Result<Option<CrawlJob>> {
        if let Some(job) = self.active.lock().await.get(&id) {
            return Ok(Some(job.lock().await.clone()));
        }
        if let Some(job) = self.recent.lock().await.get(&id) {
            return Ok(Some(job.clone()));
        }
        self.store.load_job(id).await
    }

    pub async fn active_jobs(&self) -> Vec<CrawlJob> {
        let active = self.active.lock().await;
        let mut jobs = Vec::with_capacity(active.len());
        for job in active.values() {
            jobs.push(job.lock().await.clone());
        }
        jobs
    }

    pub async fn recent_jobs(&self, source: Option<&str>, limit: usize) -> Result<Vec<CrawlJob>> {
        self.store.recent_jobs(source, limit).await
    }

    pub async fn recent_cache_len(&self) -> usize {
        self.recent.lock().await.len()
    }

    async fn retire(&self, id: Uuid, job: CrawlJob) {
        self.active.lock().await.remove(&id);
        self.recent.lock().await.insert(job);
    }
}

/// Write access to one job, held by its run's task.
#[derive(Clone)]
pub struct JobHandle {
    id: Uuid,
    job: Arc<Mutex<CrawlJob>>,
    tracker: Arc<JobTracker>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn snapshot(&self) -> CrawlJob {
        self.job.lock().await.clone()
    }

    pub async fn start_step(&self, kind: StepKind) -> Result<()> {
        let step = {
            let mut job = self.job.lock().await;
            job.start_step(kind).map_err(|e| anyhow::anyhow!(e))?;
            job.step(kind).cloned()
        };
        self.sync(step).await;
        Ok(())
    }

    pub async fn complete_step(&self, kind: StepKind, message: impl Into<String>) {
        let step = {
            let mut job = self.job.lock().await;
            job.complete_step(kind, message);
            job.step(kind).cloned()
        };
        self.sync(step).await;
    }

    pub async fn fail_step(&self, kind: StepKind, error: impl Into<String>) {
        let step = {
            let mut job = self.job.lock().await;
            job.fail_step(kind, error);
            job.step(kind).cloned()
        };
        self.sync(step).await;
    }

    /// Fail whichever step is currently running, or the next pending step
    /// when the failure happened between steps. Used when a crawler errors
    /// out of its own reported progress.
    pub async fn fail_running(&self, error: impl Into<String>) {
        let error = error.into();
        let step = {
            let mut job = self.job.lock().await;
            let kind = job.running_step().or_else(|| {
                job.steps
                    .iter()
                    .find(|s| s.status == StepStatus::Pending)
                    .map(|s| s.kind)
            });
            match kind {
                Some(kind) => {
                    job.fail_step(kind, error);
                    job.step(kind).cloned()
                }
                None => {
                    job.push_error(error);
                    None
                }
            }
        };
        self.sync(step).await;
    }

    pub async fn skip_step(&self, kind: StepKind, message: impl Into<String>) {
        let step = {
            let mut job = self.job.lock().await;
            job.skip_step(kind, message);
            job.step(kind).cloned()
        };
        self.sync(step).await;
    }

    pub async fn progress(&self, kind: StepKind, percent: u8, message: impl Into<String>) {
        let step = {
            let mut job = self.job.lock().await;
            job.set_progress(kind, percent, message);
            job.step(kind).cloned()
        };
        self.sync(step).await;
    }

    pub async fn merge_details(&self, kind: StepKind, update: impl FnOnce(&mut StepDetails)) {
        let mut job = self.job.lock().await;
        job.merge_details(kind, update);
    }

    pub async fn add_found(&self, n: u64) {
        self.job.lock().await.record_found(n);
    }

    pub async fn add_added(&self, n: u64) {
        self.job.lock().await.record_added(n);
    }

    pub async fn add_duplicates(&self, n: u64) {
        self.job.lock().await.record_duplicates(n);
    }

    pub async fn push_error(&self, error: impl Into<String>) {
        self.job.lock().await.push_error(error);
    }

    /// Push the latest state out so a concurrent observer sees it, and
    /// retire the job once it turns terminal.
    async fn sync(&self, step: Option<CrawlStep>) {
        let snapshot = self.job.lock().await.clone();

        if let Some(step) = step {
            if let Err(e) = self.tracker.store.update_step(self.id, &step).await {
                warn!("failed to persist step transition for job {}: {}", self.id, e);
            }
        }
        if let Err(e) = self.tracker.store.save_job(&snapshot).await {
            warn!("failed to persist job {}: {}", self.id, e);
        }

        if snapshot.is_terminal() {
            self.tracker.retire(self.id, snapshot).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::job::StepStatus;
    use crate::storage::history::MemoryHistory;

    fn tracker(capacity: usize) -> (Arc<JobTracker>, Arc<MemoryHistory>) {
        let store = Arc::new(MemoryHistory::new());
        (JobTracker::new(store.clone(), capacity), store)
    }

    #[tokio::test]
    async fn test_transitions_are_observable_from_the_store() {
        let (tracker, store) = tracker(10);
        let handle = tracker
            .create("exampleboard", StepPlan::Simple, TriggerOrigin::Manual)
            .await;

        handle.start_step(StepKind::Initialize).await.unwrap();

        // Another process reading the store sees the running step
        let observed = store.load_job(handle.id()).await.unwrap().unwrap();
        assert_eq!(observed.status(), StepStatus::Running);
        assert_eq!(
            observed.step(StepKind::Initialize).unwrap().status,
            StepStatus::Running
        );
    }

    #[tokio::test]
    async fn test_terminal_job_moves_to_recent_cache() {
        let (tracker, _) = tracker(10);
        let handle = tracker
            .create("exampleboard", StepPlan::Simple, TriggerOrigin::Manual)
            .await;

        handle.start_step(StepKind::Initialize).await.unwrap();
        handle.fail_step(StepKind::Initialize, "boom").await;

        assert!(tracker.active_jobs().await.is_empty());
        let snapshot = tracker.snapshot(handle.id()).await.unwrap().unwrap();
        assert_eq!(snapshot.status(), StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_recent_cache_is_bounded() {
        let (tracker, store) = tracker(2);
        let mut first_id = None;

        for _ in 0..3 {
            let handle = tracker
                .create("exampleboard", StepPlan::Simple, TriggerOrigin::Scheduled)
                .await;
            first_id.get_or_insert(handle.id());
            handle.start_step(StepKind::Initialize).await.unwrap();
            handle.fail_step(StepKind::Initialize, "boom").await;
        }

        assert_eq!(tracker.recent_cache_len().await, 2);
        // The evicted job is still readable through the durable store
        let evicted = first_id.unwrap();
        assert!(store.load_job(evicted).await.unwrap().is_some());
        assert!(tracker.snapshot(evicted).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_counters_survive_step_failure() {
        let (tracker, _) = tracker(10);
        let handle = tracker
            .create("exampleboard", StepPlan::Simple, TriggerOrigin::Manual)
            .await;

        handle.start_step(StepKind::Initialize).await.unwrap();
        handle.complete_step(StepKind::Initialize, "ready").await;
        handle.start_step(StepKind::CheckAvailability).await.unwrap();
        handle.complete_step(StepKind::CheckAvailability, "ok").await;
        handle.start_step(StepKind::FetchAndExtract).await.unwrap();
        handle.add_found(12).await;
        handle.fail_running("blocked mid-fetch").await;

        let snapshot = tracker.snapshot(handle.id()).await.unwrap().unwrap();
        assert_eq!(snapshot.status(), StepStatus::Failed);
        assert_eq!(snapshot.found, 12);
        assert_eq!(
            snapshot.step(StepKind::FetchAndExtract).unwrap().status,
            StepStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_fail_running_between_steps_fails_the_next_pending_step() {
        let (tracker, _) = tracker(10);
        let handle = tracker
            .create("exampleboard", StepPlan::Simple, TriggerOrigin::Manual)
            .await;

        handle.start_step(StepKind::Initialize).await.unwrap();
        handle.complete_step(StepKind::Initialize, "ready").await;
        handle.fail_running("crawler refused before starting its step").await;

        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.errors.len(), 1);
        assert_eq!(snapshot.status(), StepStatus::Failed);
        assert_eq!(
            snapshot.step(StepKind::CheckAvailability).unwrap().status,
            StepStatus::Failed
        );
        // Steps after the attributed failure stay pending
        assert_eq!(
            snapshot.step(StepKind::FetchAndExtract).unwrap().status,
            StepStatus::Pending
        );
    }
}
