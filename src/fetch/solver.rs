use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cli::config::SolverSettings;
use crate::fetch::chain::{FetchContext, FetchStrategy, FetchedPage, StrategyError};

#[derive(Debug, Serialize)]
struct SolverRequest<'a> {
    cmd: &'static str,
    url: &'a str,
    #[serde(rename = "maxTimeout")]
    max_timeout: u64,
}

#[derive(Debug, Deserialize)]
struct SolverResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    solution: Option<SolverSolution>,
}

#[derive(Debug, Deserialize)]
struct SolverSolution {
    url: String,
    status: u16,
    response: String,
}

/// Third-party challenge-solver service strategy.
///
/// The service runs its own hardened browser farm and returns the solved
/// page over a JSON API. Pricier than a local attempt, cheaper than a
/// human - it sits between the browser and interactive rungs.
pub struct SolverStrategy {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl SolverStrategy {
    pub fn new(settings: &SolverSettings) -> Result<Self, StrategyError> {
        let timeout = Duration::from_secs(settings.timeout_secs);
        let client = Client::builder()
            .timeout(timeout + Duration::from_secs(5))
            .build()
            .map_err(|e| StrategyError::Service(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl FetchStrategy for SolverStrategy {
    fn name(&self) -> &str {
        "solver"
    }

    fn timeout(&self) -> Duration {
        self.timeout + Duration::from_secs(10)
    }

    async fn fetch(&self, url: &str, _ctx: &FetchContext) -> Result<FetchedPage, StrategyError> {
        let request = SolverRequest {
            cmd: "request.get",
            url,
            max_timeout: self.timeout.as_millis() as u64,
        };

        debug!("asking solver service at {} for {}", self.endpoint, url);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| StrategyError::Service(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StrategyError::Service(format!(
                "solver returned HTTP {}",
                response.status()
            )));
        }

        let body: SolverResponse = response
            .json()
            .await
            .map_err(|e| StrategyError::Service(format!("unparseable solver response: {}", e)))?;

        if body.status != "ok" {
            return Err(StrategyError::Service(
                body.message
                    .unwrap_or_else(|| "solver reported failure".to_string()),
            ));
        }

        let solution = body
            .solution
            .ok_or_else(|| StrategyError::Service("solver response without solution".to_string()))?;

        Ok(FetchedPage {
            status: solution.status,
            html: solution.response,
            final_url: solution.url,
            strategy: String::new(),
        })
    }
}
