use std::time::Duration;

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use tracing::debug;

use crate::cli::config::DirectSettings;
use crate::fetch::chain::{FetchContext, FetchStrategy, FetchedPage, StrategyError};
use crate::fetch::fingerprint::{request_headers, ProfilePool};

/// Plain HTTP strategy with browser-like headers.
///
/// Cheapest rung of the chain: many defended sites only screen for obvious
/// non-browser clients. An optional warm-up request against the site root
/// picks up the cookies a first-time visitor would carry.
pub struct DirectStrategy {
    client: Client,
    pool: ProfilePool,
    warm_up: bool,
    timeout: Duration,
}

impl DirectStrategy {
    pub fn new(settings: &DirectSettings, pool: ProfilePool) -> Result<Self, StrategyError> {
        let client = Client::builder()
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| StrategyError::Request(e.to_string()))?;

        Ok(Self {
            client,
            pool,
            warm_up: settings.warm_up,
            timeout: Duration::from_secs(settings.timeout_secs),
        })
    }

    fn header_map(&self) -> HeaderMap {
        let profile = self.pool.pick();
        let mut headers = HeaderMap::new();
        for (key, value) in request_headers(profile) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, value);
            }
        }
        headers
    }
}

#[async_trait]
impl FetchStrategy for DirectStrategy {
    fn name(&self) -> &str {
        "direct"
    }

    fn timeout(&self) -> Duration {
        // Warm-up and target request each get the configured budget
        self.timeout * 2 + Duration::from_secs(2)
    }

    async fn fetch(&self, url: &str, ctx: &FetchContext) -> Result<FetchedPage, StrategyError> {
        let headers = self.header_map();

        if self.warm_up {
            if let Some(base) = &ctx.base_url {
                debug!("warming up session against {}", base);
                // Best-effort: a failed warm-up just means no session cookies
                let _ = self.client.get(base).headers(headers.clone()).send().await;
                let pause = thread_rng().gen_range(300..900);
                tokio::time::sleep(Duration::from_millis(pause)).await;
            }
        }

        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| StrategyError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        if response.status().is_server_error() {
            return Err(StrategyError::Status(status));
        }

        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .map_err(|e| StrategyError::Request(e.to_string()))?;

        Ok(FetchedPage {
            status,
            html,
            final_url,
            strategy: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::HeaderProfile;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn strategy(warm_up: bool) -> DirectStrategy {
        DirectStrategy::new(
            &DirectSettings {
                timeout_secs: 5,
                warm_up,
            },
            ProfilePool::new(HeaderProfile::defaults()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_sends_browser_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs"))
            .and(header_exists("user-agent"))
            .and(header_exists("accept-language"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let page = strategy(false)
            .fetch(&format!("{}/jobs", server.uri()), &FetchContext::default())
            .await
            .unwrap();
        assert_eq!(page.status, 200);
        assert_eq!(page.html, "<html>ok</html>");
    }

    #[tokio::test]
    async fn test_warm_up_hits_base_url_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = FetchContext {
            base_url: Some(server.uri()),
            positive_selectors: vec![],
        };
        strategy(true)
            .fetch(&format!("{}/jobs", server.uri()), &ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_error_body_is_returned_for_inspection() {
        // A 403 challenge page must come back as a page, not an error - the
        // chain decides what it is by looking at the content
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_string("<html><title>Just a moment...</title></html>"),
            )
            .mount(&server)
            .await;

        let page = strategy(false)
            .fetch(&format!("{}/jobs", server.uri()), &FetchContext::default())
            .await
            .unwrap();
        assert_eq!(page.status, 403);
        assert!(page.html.contains("Just a moment"));
    }

    #[tokio::test]
    async fn test_server_error_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = strategy(false)
            .fetch(&format!("{}/jobs", server.uri()), &FetchContext::default())
            .await;
        assert!(matches!(result, Err(StrategyError::Status(503))));
    }
}
