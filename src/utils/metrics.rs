use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Per-strategy fetch statistics collector.
///
/// Anti-bot defenses shift over time, so which rung of the chain actually
/// lands pages is operationally interesting - this is where that shows up.
#[derive(Debug, Clone)]
pub struct FetchMetrics {
    inner: Arc<Mutex<MetricsInner>>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    strategies: HashMap<String, StrategyStats>,
}

/// Counters for one fetch strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_ms: u64,
}

impl StrategyStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

impl FetchMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsInner::default())),
        }
    }

    /// Record one strategy invocation.
    pub async fn record(&self, strategy: &str, success: bool, elapsed: Duration) {
        let mut inner = self.inner.lock().await;
        let stats = inner.strategies.entry(strategy.to_string()).or_default();
        stats.attempts += 1;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.total_ms += elapsed.as_millis() as u64;
    }

    /// Snapshot of all per-strategy counters.
    pub async fn snapshot(&self) -> HashMap<String, StrategyStats> {
        self.inner.lock().await.strategies.clone()
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        *inner = MetricsInner::default();
    }
}

impl Default for FetchMetrics {
    fn default() -> Self {
        Self::new()
    }
}
