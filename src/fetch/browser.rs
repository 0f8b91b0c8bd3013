use std::time::Duration;

use async_trait::async_trait;
use thirtyfour::prelude::*;
use tracing::{debug, error};

use crate::cli::config::{BrowserSettings, HeaderProfile};
use crate::fetch::chain::{FetchContext, FetchStrategy, FetchedPage, StrategyError};
use crate::fetch::fingerprint::ProfilePool;

/// Script executed on every page to hide the automation flag.
const STEALTH_PATCH: &str = r#"
Object.defineProperty(navigator, 'webdriver', {
    get: () => undefined,
});
"#;

/// A WebDriver session configured to look like a regular browser.
///
/// Release is guaranteed on every exit path: `close()` on the normal path,
/// and a `Drop` that spawns the quit as a backstop for early returns.
pub struct StealthSession {
    driver: Option<WebDriver>,
}

impl StealthSession {
    pub async fn connect(
        webdriver_url: &str,
        profile: &HeaderProfile,
        headless: bool,
        page_load_timeout: Duration,
    ) -> Result<Self, StrategyError> {
        let mut caps = DesiredCapabilities::chrome();

        caps.add_chrome_arg(&format!("--user-agent={}", profile.user_agent))
            .map_err(browser_err)?;
        caps.add_chrome_arg(&format!(
            "--lang={}",
            profile.accept_language.split(',').next().unwrap_or("en-US")
        ))
        .map_err(browser_err)?;
        caps.add_chrome_arg("--window-size=1920,1080").map_err(browser_err)?;
        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")
            .map_err(browser_err)?;
        caps.add_chrome_arg("--disable-dev-shm-usage").map_err(browser_err)?;
        caps.add_chrome_arg("--no-sandbox").map_err(browser_err)?;

        if headless {
            caps.set_headless().map_err(browser_err)?;
        }

        caps.add_chrome_option("excludeSwitches", serde_json::json!(["enable-automation"]))
            .map_err(browser_err)?;
        caps.add_chrome_option("useAutomationExtension", serde_json::json!(false))
            .map_err(browser_err)?;

        let driver = WebDriver::new(webdriver_url, caps)
            .await
            .map_err(|e| StrategyError::Browser(format!("failed to connect to WebDriver: {}", e)))?;
        driver
            .set_page_load_timeout(page_load_timeout)
            .await
            .map_err(browser_err)?;

        debug!("stealth browser session started with profile {}", profile.name);
        Ok(Self {
            driver: Some(driver),
        })
    }

    fn driver(&self) -> Result<&WebDriver, StrategyError> {
        self.driver
            .as_ref()
            .ok_or_else(|| StrategyError::Browser("browser session not initialized".to_string()))
    }

    pub async fn goto(&self, url: &str) -> Result<(), StrategyError> {
        let driver = self.driver()?;
        driver.goto(url).await.map_err(browser_err)?;
        // Patch after navigation so the property is hidden before any
        // detection script we trigger runs
        driver
            .execute(STEALTH_PATCH, Vec::new())
            .await
            .map_err(browser_err)?;
        Ok(())
    }

    pub async fn page_source(&self) -> Result<String, StrategyError> {
        self.driver()?.source().await.map_err(browser_err)
    }

    pub async fn title(&self) -> Result<String, StrategyError> {
        self.driver()?.title().await.map_err(browser_err)
    }

    pub async fn current_url(&self) -> Result<String, StrategyError> {
        Ok(self.driver()?.current_url().await.map_err(browser_err)?.to_string())
    }

    pub async fn close(&mut self) -> Result<(), StrategyError> {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.quit().await {
                error!("error closing browser session: {}", e);
            }
            debug!("browser session closed");
        }
        Ok(())
    }
}

impl Drop for StealthSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            tokio::spawn(async move {
                if let Err(e) = driver.quit().await {
                    error!("error closing browser session during drop: {}", e);
                }
            });
        }
    }
}

fn browser_err(e: impl std::fmt::Display) -> StrategyError {
    StrategyError::Browser(e.to_string())
}

/// Real-browser strategy: drives a stealth-patched WebDriver session and
/// returns the rendered page source.
pub struct BrowserStrategy {
    webdriver_url: String,
    pool: ProfilePool,
    headless: bool,
    timeout: Duration,
    settle_delay: Duration,
}

impl BrowserStrategy {
    pub fn new(settings: &BrowserSettings, pool: ProfilePool) -> Self {
        Self {
            webdriver_url: settings.webdriver_url.clone(),
            pool,
            headless: settings.headless,
            timeout: Duration::from_secs(settings.timeout_secs),
            settle_delay: Duration::from_millis(settings.settle_delay_ms),
        }
    }
}

#[async_trait]
impl FetchStrategy for BrowserStrategy {
    fn name(&self) -> &str {
        "browser"
    }

    fn timeout(&self) -> Duration {
        self.timeout + self.settle_delay + Duration::from_secs(15)
    }

    async fn fetch(&self, url: &str, _ctx: &FetchContext) -> Result<FetchedPage, StrategyError> {
        let profile = self.pool.pick().clone();
        let mut session =
            StealthSession::connect(&self.webdriver_url, &profile, self.headless, self.timeout)
                .await?;

        let result = async {
            session.goto(url).await?;
            // Let dynamic listings render before we read the DOM
            tokio::time::sleep(self.settle_delay).await;

            let html = session.page_source().await?;
            let final_url = session.current_url().await?;
            Ok(FetchedPage {
                status: 200,
                html,
                final_url,
                strategy: String::new(),
            })
        }
        .await;

        session.close().await?;
        result
    }
}
