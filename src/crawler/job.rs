use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a single crawl step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Identity of a pipeline stage. A step plan never repeats a kind, so the
/// kind doubles as the step's id within its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Initialize,
    CheckAvailability,
    EstablishSession,
    EnumerateTargets,
    FetchAndExtract,
    Validate,
    Deduplicate,
    Cleanup,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialize => "initialize",
            Self::CheckAvailability => "check_availability",
            Self::EstablishSession => "establish_session",
            Self::EnumerateTargets => "enumerate_targets",
            Self::FetchAndExtract => "fetch_and_extract",
            Self::Validate => "validate",
            Self::Deduplicate => "deduplicate",
            Self::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// The fixed ordered step list for a source type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPlan {
    /// Sources fetched through the full strategy chain with a browser
    /// session of their own.
    Chain,
    /// Sources reachable with plain requests.
    Simple,
}

impl StepPlan {
    pub fn steps(self) -> &'static [StepKind] {
        match self {
            Self::Chain => &[
                StepKind::Initialize,
                StepKind::CheckAvailability,
                StepKind::EstablishSession,
                StepKind::EnumerateTargets,
                StepKind::FetchAndExtract,
                StepKind::Validate,
                StepKind::Deduplicate,
                StepKind::Cleanup,
            ],
            Self::Simple => &[
                StepKind::Initialize,
                StepKind::CheckAvailability,
                StepKind::FetchAndExtract,
                StepKind::Validate,
                StepKind::Deduplicate,
                StepKind::Cleanup,
            ],
        }
    }
}

/// Common step counters plus an extensible map for anything
/// strategy- or source-specific.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub found: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub added: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicates: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropped: Option<u64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One stage in a crawl job's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlStep {
    pub kind: StepKind,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Progress within the step, 0-100
    pub progress: u8,

    pub message: Option<String>,
    pub error: Option<String>,

    #[serde(default)]
    pub details: StepDetails,
}

impl CrawlStep {
    fn new(kind: StepKind) -> Self {
        Self {
            kind,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            progress: 0,
            message: None,
            error: None,
            details: StepDetails::default(),
        }
    }
}

/// What kicked the run off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOrigin {
    Manual,
    Scheduled,
}

/// One crawl run against one source.
///
/// Mutated only by its run's execution task (through `JobHandle`); becomes
/// immutable once its derived status is terminal. The overall status is
/// never stored - it is always derived from the steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: Uuid,
    pub source: String,
    pub trigger: TriggerOrigin,
    pub steps: Vec<CrawlStep>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Postings extracted from the source this run
    pub found: u64,

    /// Postings accepted as new by the deduplication engine
    pub added: u64,

    /// Postings rejected as duplicates
    pub duplicates: u64,

    pub errors: Vec<String>,
    pub summary: Option<String>,
}

impl CrawlJob {
    pub fn new(source: &str, plan: StepPlan, trigger: TriggerOrigin) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            trigger,
            steps: plan.steps().iter().copied().map(CrawlStep::new).collect(),
            started_at: Utc::now(),
            completed_at: None,
            found: 0,
            added: 0,
            duplicates: 0,
            errors: Vec::new(),
            summary: None,
        }
    }

    /// Overall status, derived purely from the steps: Running if any step is
    /// running, Failed if any step failed, Completed once every step is
    /// completed or skipped, otherwise Pending.
    pub fn status(&self) -> StepStatus {
        if self.steps.iter().any(|s| s.status == StepStatus::Running) {
            StepStatus::Running
        } else if self.steps.iter().any(|s| s.status == StepStatus::Failed) {
            StepStatus::Failed
        } else if self
            .steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
        {
            StepStatus::Completed
        } else {
            StepStatus::Pending
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status(), StepStatus::Completed | StepStatus::Failed)
    }

    pub fn step(&self, kind: StepKind) -> Option<&CrawlStep> {
        self.steps.iter().find(|s| s.kind == kind)
    }

    fn step_mut(&mut self, kind: StepKind) -> Option<&mut CrawlStep> {
        self.steps.iter_mut().find(|s| s.kind == kind)
    }

    /// The step currently running, if any. At most one exists at a time.
    pub fn running_step(&self) -> Option<StepKind> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Running)
            .map(|s| s.kind)
    }

    /// Transition a pending step to Running.
    ///
    /// Refused when the job is already terminal or another step is still
    /// running - steps execute strictly in sequence.
    pub fn start_step(&mut self, kind: StepKind) -> Result<(), String> {
        if self.is_terminal() {
            return Err(format!(
                "job {} is already {} - cannot start step {}",
                self.id,
                self.status(),
                kind
            ));
        }
        if let Some(running) = self.running_step() {
            return Err(format!(
                "step {} is still running - cannot start step {}",
                running, kind
            ));
        }
        let step = self
            .step_mut(kind)
            .ok_or_else(|| format!("step {} is not part of this job's plan", kind))?;
        if step.status != StepStatus::Pending {
            return Err(format!("step {} is already {}", kind, step.status));
        }
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete_step(&mut self, kind: StepKind, message: impl Into<String>) {
        self.finish_step(kind, StepStatus::Completed, Some(message.into()), None);
    }

    pub fn fail_step(&mut self, kind: StepKind, error: impl Into<String>) {
        let error = error.into();
        self.errors.push(error.clone());
        self.finish_step(kind, StepStatus::Failed, None, Some(error));
    }

    pub fn skip_step(&mut self, kind: StepKind, message: impl Into<String>) {
        self.finish_step(kind, StepStatus::Skipped, Some(message.into()), None);
    }

    fn finish_step(
        &mut self,
        kind: StepKind,
        status: StepStatus,
        message: Option<String>,
        error: Option<String>,
    ) {
        if let Some(step) = self.step_mut(kind) {
            if step.status.is_terminal() {
                return;
            }
            step.status = status;
            step.completed_at = Some(Utc::now());
            if status == StepStatus::Completed {
                step.progress = 100;
            }
            if message.is_some() {
                step.message = message;
            }
            step.error = error;
        }
        if self.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
            let summary = self.build_summary();
            self.summary = Some(summary);
        }
    }

    /// Update progress and message of a running step without transitioning.
    pub fn set_progress(&mut self, kind: StepKind, progress: u8, message: impl Into<String>) {
        if let Some(step) = self.step_mut(kind) {
            if step.status == StepStatus::Running {
                step.progress = progress.min(100);
                step.message = Some(message.into());
            }
        }
    }

    pub fn merge_details(&mut self, kind: StepKind, update: impl FnOnce(&mut StepDetails)) {
        if let Some(step) = self.step_mut(kind) {
            update(&mut step.details);
        }
    }

    pub fn record_found(&mut self, n: u64) {
        self.found += n;
    }

    pub fn record_added(&mut self, n: u64) {
        self.added += n;
    }

    pub fn record_duplicates(&mut self, n: u64) {
        self.duplicates += n;
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Human-readable run summary, in the shape the status surfaces show.
    pub fn build_summary(&self) -> String {
        let mut summary = format!(
            "Crawl of '{}' {}: found {}, added {}, skipped {} duplicates.",
            self.source,
            match self.status() {
                StepStatus::Completed => "completed",
                StepStatus::Failed => "failed",
                other => return format!("Crawl of '{}' is {}.", self.source, other),
            },
            self.found,
            self.added,
            self.duplicates,
        );
        if let Some(failed) = self.steps.iter().find(|s| s.status == StepStatus::Failed) {
            summary.push_str(&format!(
                " Failed at step '{}'{}",
                failed.kind,
                failed
                    .error
                    .as_deref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            ));
        }
        summary
    }
}
