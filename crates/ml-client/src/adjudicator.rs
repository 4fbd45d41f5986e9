use std::time::Duration;

use analysis_core::{Direction, StageName, StageResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{MLError, MLResult};

/// Score summary of one earlier stage, as sent to the reasoning service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: StageName,
    pub passed: bool,
    pub opinion: Direction,
    pub score: f64,
}

impl From<&StageResult> for StageSummary {
    fn from(result: &StageResult) -> Self {
        Self {
            stage: result.stage,
            passed: result.passed,
            opinion: result.opinion,
            score: result.score,
        }
    }
}

/// Structured request body for an adjudication call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjudicationContext {
    pub symbol: String,
    pub direction: Direction,
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_reward: f64,
    pub stages: Vec<StageSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjudicationResponse {
    pub approved: bool,
    pub confidence: f64,
    pub reason: String,
}

/// Reasoning service that approves or vetoes a candidate entry
#[async_trait]
pub trait Adjudicator: Send + Sync {
    async fn adjudicate(&self, context: &AdjudicationContext) -> MLResult<AdjudicationResponse>;

    fn backend_name(&self) -> &'static str;
}

/// HTTP-backed adjudicator with bearer-token authentication
#[derive(Clone)]
pub struct HttpAdjudicator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpAdjudicator {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> MLResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub async fn health_check(&self) -> MLResult<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl Adjudicator for HttpAdjudicator {
    async fn adjudicate(&self, context: &AdjudicationContext) -> MLResult<AdjudicationResponse> {
        let response = self
            .client
            .post(format!("{}/adjudicate", self.base_url))
            .bearer_auth(&self.api_key)
            .json(context)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }

        let result = response.json::<AdjudicationResponse>().await?;
        if !result.confidence.is_finite() || !(0.0..=1.0).contains(&result.confidence) {
            return Err(MLError::InvalidResponse(format!(
                "confidence {} outside [0, 1]",
                result.confidence
            )));
        }

        Ok(result)
    }

    fn backend_name(&self) -> &'static str {
        "http"
    }
}

/// Throttling and server-side failures are worth retrying, other statuses are not
pub fn status_error(status: StatusCode) -> MLError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        MLError::ServiceUnavailable(format!("Status: {}", status))
    } else {
        MLError::Rejected(format!("Status: {}", status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!status_error(StatusCode::UNAUTHORIZED).is_transient());
        assert!(!status_error(StatusCode::BAD_REQUEST).is_transient());
    }

    #[test]
    fn context_serializes_structured_stage_scores() {
        let stage = StageResult::pass(StageName::MlEnsemble, Direction::Long, 0.5, "ok");
        let context = AdjudicationContext {
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            confidence: 0.7,
            entry_price: 100.0,
            stop_loss: 98.0,
            take_profit: 104.0,
            risk_reward: 2.0,
            stages: vec![StageSummary::from(&stage)],
        };

        let json = serde_json::to_value(&context).unwrap();
        assert_eq!(json["direction"], "LONG");
        assert_eq!(json["stages"][0]["stage"], "ml_ensemble");
        assert!(json["stages"][0].get("reason").is_none());
    }
}
