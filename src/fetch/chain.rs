use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fetch::challenge::{page_title, ChallengeDetector};
use crate::utils::metrics::FetchMetrics;

/// Hints a fetch call carries about the page it expects.
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    /// Site root, used for warm-up requests and referrer headers
    pub base_url: Option<String>,
    /// Selectors whose presence proves the page is real content
    pub positive_selectors: Vec<String>,
}

/// A successfully retrieved page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub html: String,
    pub final_url: String,
    /// Name of the strategy that produced the page
    pub strategy: String,
}

/// One strategy's failure, kept for the attempt ledger.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyAttempt {
    pub strategy: String,
    pub reason: String,
}

/// Failure of a single strategy.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("browser failure: {0}")]
    Browser(String),

    #[error("solver service failure: {0}")]
    Service(String),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("page is still an anti-bot challenge")]
    ChallengePage,

    #[error("challenge not resolved within {waited:?}")]
    ChallengeTimeout { waited: Duration },

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure of the whole chain. `ChallengeTimeout` is kept distinct from
/// `Exhausted` so a run blocked by defenses reads as exactly that, not as a
/// crawler bug.
#[derive(Debug)]
pub enum FetchError {
    Exhausted {
        url: String,
        attempts: Vec<StrategyAttempt>,
    },
    ChallengeTimeout {
        url: String,
        waited: Duration,
    },
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted { url, attempts } => {
                write!(f, "all fetch strategies exhausted for {}", url)?;
                let tried = attempts
                    .iter()
                    .map(|a| format!("{}: {}", a.strategy, a.reason))
                    .collect::<Vec<_>>()
                    .join("; ");
                if !tried.is_empty() {
                    write!(f, " (attempted {})", tried)?;
                }
                Ok(())
            }
            Self::ChallengeTimeout { url, waited } => write!(
                f,
                "anti-bot challenge unresolved for {} after {}s",
                url,
                waited.as_secs()
            ),
        }
    }
}

impl std::error::Error for FetchError {}

/// One technique for retrieving a page despite anti-automation defenses.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Budget for one invocation of this strategy.
    fn timeout(&self) -> Duration;

    async fn fetch(&self, url: &str, ctx: &FetchContext) -> Result<FetchedPage, StrategyError>;
}

/// Ordered fallback over fetch strategies, cheapest first.
///
/// The first strategy to return a page that is not itself a challenge wins
/// immediately; otherwise the chain moves on. Exhaustion always carries the
/// full attempt ledger - never a silent empty result.
pub struct FetchChain {
    strategies: Vec<Arc<dyn FetchStrategy>>,
    detector: ChallengeDetector,
    metrics: FetchMetrics,
}

impl FetchChain {
    pub fn new(strategies: Vec<Arc<dyn FetchStrategy>>, detector: ChallengeDetector) -> Self {
        Self {
            strategies,
            detector,
            metrics: FetchMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &FetchMetrics {
        &self.metrics
    }

    pub async fn fetch(&self, url: &str, ctx: &FetchContext) -> Result<FetchedPage, FetchError> {
        let mut attempts: Vec<StrategyAttempt> = Vec::new();
        let mut challenge_waited: Option<Duration> = None;

        for strategy in &self.strategies {
            let name = strategy.name().to_string();
            debug!("trying strategy '{}' for {}", name, url);
            let started = Instant::now();

            let outcome = tokio::time::timeout(strategy.timeout(), strategy.fetch(url, ctx)).await;
            let elapsed = started.elapsed();

            match outcome {
                Err(_) => {
                    self.metrics.record(&name, false, elapsed).await;
                    warn!("strategy '{}' timed out for {}", name, url);
                    attempts.push(StrategyAttempt {
                        strategy: name,
                        reason: StrategyError::Timeout(strategy.timeout()).to_string(),
                    });
                }
                Ok(Err(err)) => {
                    self.metrics.record(&name, false, elapsed).await;
                    if let StrategyError::ChallengeTimeout { waited } = &err {
                        challenge_waited = Some(*waited);
                    }
                    warn!("strategy '{}' failed for {}: {}", name, url, err);
                    attempts.push(StrategyAttempt {
                        strategy: name,
                        reason: err.to_string(),
                    });
                }
                Ok(Ok(mut page)) => {
                    let title = page_title(&page.html);
                    let challenged = self
                        .detector
                        .is_challenge(&title, &page.html, &ctx.positive_selectors);
                    if challenged {
                        self.metrics.record(&name, false, elapsed).await;
                        debug!("strategy '{}' got a challenge page for {}", name, url);
                        attempts.push(StrategyAttempt {
                            strategy: name,
                            reason: StrategyError::ChallengePage.to_string(),
                        });
                        continue;
                    }
                    if page.status >= 400 {
                        self.metrics.record(&name, false, elapsed).await;
                        attempts.push(StrategyAttempt {
                            strategy: name,
                            reason: StrategyError::Status(page.status).to_string(),
                        });
                        continue;
                    }

                    self.metrics.record(&name, true, elapsed).await;
                    info!("fetched {} via strategy '{}'", url, name);
                    page.strategy = name;
                    return Ok(page);
                }
            }
        }

        if let Some(waited) = challenge_waited {
            return Err(FetchError::ChallengeTimeout {
                url: url.to_string(),
                waited,
            });
        }
        Err(FetchError::Exhausted {
            url: url.to_string(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const REAL_PAGE: &str = r#"<html><head><title>Jobs in Hanoi</title></head>
        <body><div class="job-item">IT Lead</div></body></html>"#;
    const CHALLENGE_PAGE: &str =
        r#"<html><head><title>Just a moment...</title></head><body></body></html>"#;

    struct ScriptedStrategy {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        result: Result<&'static str, &'static str>,
    }

    impl ScriptedStrategy {
        fn ok(name: &'static str, html: &'static str, calls: &Arc<AtomicUsize>) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: calls.clone(),
                result: Ok(html),
            })
        }

        fn failing(name: &'static str, reason: &'static str, calls: &Arc<AtomicUsize>) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: calls.clone(),
                result: Err(reason),
            })
        }
    }

    #[async_trait]
    impl FetchStrategy for ScriptedStrategy {
        fn name(&self) -> &str {
            self.name
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn fetch(
            &self,
            url: &str,
            _ctx: &FetchContext,
        ) -> Result<FetchedPage, StrategyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.result {
                Ok(html) => Ok(FetchedPage {
                    status: 200,
                    html: html.to_string(),
                    final_url: url.to_string(),
                    strategy: String::new(),
                }),
                Err(reason) => Err(StrategyError::Request(reason.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_first_success_wins_after_failures() {
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        let c_calls = Arc::new(AtomicUsize::new(0));

        let chain = FetchChain::new(
            vec![
                ScriptedStrategy::failing("a", "connection reset", &a_calls),
                ScriptedStrategy::failing("b", "connection reset", &b_calls),
                ScriptedStrategy::ok("c", REAL_PAGE, &c_calls),
            ],
            ChallengeDetector::default(),
        );

        let page = chain
            .fetch("https://x.example/jobs", &FetchContext::default())
            .await
            .unwrap();

        assert_eq!(page.strategy, "c");
        assert_eq!(page.html, REAL_PAGE);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_winning_strategy_short_circuits_the_rest() {
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));

        let chain = FetchChain::new(
            vec![
                ScriptedStrategy::ok("a", REAL_PAGE, &a_calls),
                ScriptedStrategy::ok("b", REAL_PAGE, &b_calls),
            ],
            ChallengeDetector::default(),
        );

        let page = chain
            .fetch("https://x.example/jobs", &FetchContext::default())
            .await
            .unwrap();
        assert_eq!(page.strategy, "a");
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_challenge_page_does_not_win() {
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));

        let chain = FetchChain::new(
            vec![
                ScriptedStrategy::ok("a", CHALLENGE_PAGE, &a_calls),
                ScriptedStrategy::ok("b", REAL_PAGE, &b_calls),
            ],
            ChallengeDetector::default(),
        );

        let page = chain
            .fetch("https://x.example/jobs", &FetchContext::default())
            .await
            .unwrap();
        assert_eq!(page.strategy, "b");
    }

    #[tokio::test]
    async fn test_exhaustion_carries_every_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = FetchChain::new(
            vec![
                ScriptedStrategy::failing("a", "reset", &calls),
                ScriptedStrategy::ok("b", CHALLENGE_PAGE, &calls),
            ],
            ChallengeDetector::default(),
        );

        match chain
            .fetch("https://x.example/jobs", &FetchContext::default())
            .await
        {
            Err(FetchError::Exhausted { url, attempts }) => {
                assert_eq!(url, "https://x.example/jobs");
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].strategy, "a");
                assert!(attempts[0].reason.contains("reset"));
                assert!(attempts[1].reason.contains("challenge"));
            }
            other => panic!("unexpected result: {:?}", other.map(|p| p.strategy)),
        }
    }

    struct TimedOutInteractive;

    #[async_trait]
    impl FetchStrategy for TimedOutInteractive {
        fn name(&self) -> &str {
            "interactive"
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn fetch(
            &self,
            _url: &str,
            _ctx: &FetchContext,
        ) -> Result<FetchedPage, StrategyError> {
            Err(StrategyError::ChallengeTimeout {
                waited: Duration::from_secs(120),
            })
        }
    }

    #[tokio::test]
    async fn test_challenge_timeout_is_distinguished_from_exhaustion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = FetchChain::new(
            vec![
                ScriptedStrategy::failing("direct", "403", &calls),
                Arc::new(TimedOutInteractive),
            ],
            ChallengeDetector::default(),
        );

        match chain
            .fetch("https://x.example/jobs", &FetchContext::default())
            .await
        {
            Err(FetchError::ChallengeTimeout { waited, .. }) => {
                assert_eq!(waited, Duration::from_secs(120));
            }
            other => panic!("unexpected result: {:?}", other.map(|p| p.strategy)),
        }
    }
}
