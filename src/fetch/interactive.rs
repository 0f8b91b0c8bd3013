use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cli::config::InteractiveSettings;
use crate::fetch::browser::StealthSession;
use crate::fetch::chain::{FetchContext, FetchStrategy, FetchedPage, StrategyError};
use crate::fetch::challenge::ChallengeDetector;
use crate::fetch::fingerprint::ProfilePool;

/// Last-resort strategy: open a visible browser window and wait for a human
/// to solve the challenge.
///
/// Polls the page at a fixed interval up to `max_wait`, looking for
/// resolution signals - expected content present, challenge markers gone,
/// or the page moved off its initial challenge state. The wait suspends
/// only this job's task.
pub struct InteractiveStrategy {
    webdriver_url: String,
    pool: ProfilePool,
    poll_interval: Duration,
    max_wait: Duration,
    detector: ChallengeDetector,
}

impl InteractiveStrategy {
    pub fn new(
        settings: &InteractiveSettings,
        webdriver_url: &str,
        pool: ProfilePool,
        detector: ChallengeDetector,
    ) -> Self {
        Self {
            webdriver_url: webdriver_url.to_string(),
            pool,
            poll_interval: Duration::from_secs(settings.poll_interval_secs.max(1)),
            max_wait: Duration::from_secs(settings.max_wait_secs),
            detector,
        }
    }

    async fn poll_until_resolved(
        &self,
        session: &StealthSession,
        ctx: &FetchContext,
        initial_title: &str,
        initial_url: &str,
    ) -> Result<FetchedPage, StrategyError> {
        let started = Instant::now();

        loop {
            if started.elapsed() >= self.max_wait {
                warn!("no challenge resolution after {:?}", self.max_wait);
                return Err(StrategyError::ChallengeTimeout {
                    waited: self.max_wait,
                });
            }
            tokio::time::sleep(self.poll_interval).await;

            let title = match session.title().await {
                Ok(title) => title,
                Err(e) => {
                    // Mid-challenge reloads make transient driver errors
                    // normal; keep polling until the budget runs out
                    warn!("error checking challenge state: {}", e);
                    continue;
                }
            };
            let html = match session.page_source().await {
                Ok(html) => html,
                Err(e) => {
                    warn!("error reading page source: {}", e);
                    continue;
                }
            };
            let current_url = session.current_url().await.unwrap_or_default();

            if self.detector.looks_resolved(
                &title,
                &html,
                &current_url,
                initial_title,
                initial_url,
                &ctx.positive_selectors,
            ) {
                info!("challenge resolved after {:?}", started.elapsed());
                return Ok(FetchedPage {
                    status: 200,
                    html,
                    final_url: current_url,
                    strategy: String::new(),
                });
            }

            let remaining = self.max_wait.saturating_sub(started.elapsed());
            info!("still waiting for challenge resolution, {:?} remaining", remaining);
        }
    }
}

#[async_trait]
impl FetchStrategy for InteractiveStrategy {
    fn name(&self) -> &str {
        "interactive"
    }

    fn timeout(&self) -> Duration {
        // Must outlive the polling budget so the chain-level timeout never
        // masks a ChallengeTimeout
        self.max_wait + self.poll_interval + Duration::from_secs(30)
    }

    async fn fetch(&self, url: &str, ctx: &FetchContext) -> Result<FetchedPage, StrategyError> {
        let profile = self.pool.pick().clone();
        // Never headless: a human needs to see the window
        let mut session = StealthSession::connect(
            &self.webdriver_url,
            &profile,
            false,
            self.max_wait,
        )
        .await?;

        let result = async {
            session.goto(url).await?;
            let initial_title = session.title().await.unwrap_or_default();
            let initial_url = session.current_url().await.unwrap_or_else(|_| url.to_string());

            info!(
                "anti-bot challenge at {} - solve it in the browser window ({}s budget)",
                url,
                self.max_wait.as_secs()
            );
            self.poll_until_resolved(&session, ctx, &initial_title, &initial_url)
                .await
        }
        .await;

        session.close().await?;
        result
    }
}
