use std::sync::Arc;
use std::time::Duration;

use analysis_core::{Direction, StageName, StageResult};
use serde::{Deserialize, Serialize};

use crate::adjudicator::{AdjudicationContext, AdjudicationResponse, Adjudicator};

/// What an exhausted or timed-out adjudication resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Default-approve
    FailOpen,
    /// Default-reject
    #[default]
    FailClosed,
}

impl FailurePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fail_open" | "open" => Some(FailurePolicy::FailOpen),
            "fail_closed" | "closed" => Some(FailurePolicy::FailClosed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::FailOpen => "fail_open",
            FailurePolicy::FailClosed => "fail_closed",
        }
    }
}

/// Timeout per attempt plus a bounded number of retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    /// Base delay between attempts, multiplied by the attempt number
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            max_retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Longest time a full adjudication can take
    pub fn budget(&self) -> Duration {
        let attempts = self.max_retries + 1;
        let backoff: u32 = (1..attempts).sum();
        self.timeout * attempts + self.backoff * backoff
    }
}

/// Result of an adjudication including retries
#[derive(Debug, Clone, PartialEq)]
pub enum AdjudicationOutcome {
    Ok(AdjudicationResponse),
    TimedOut { attempts: u32 },
    Failed { attempts: u32, error: String },
}

/// AI-adjudicator stage: can veto an entry, never approves one on its own
#[derive(Clone)]
pub struct AiAdjudicatorStage {
    client: Arc<dyn Adjudicator>,
    retry: RetryPolicy,
    on_failure: FailurePolicy,
}

impl AiAdjudicatorStage {
    pub fn new(client: Arc<dyn Adjudicator>, retry: RetryPolicy, on_failure: FailurePolicy) -> Self {
        Self {
            client,
            retry,
            on_failure,
        }
    }

    /// Call the service with a hard timeout per attempt, retrying transient failures
    pub async fn call(&self, context: &AdjudicationContext) -> AdjudicationOutcome {
        let max_attempts = self.retry.max_retries + 1;
        let mut last = AdjudicationOutcome::TimedOut { attempts: 0 };

        for attempt in 1..=max_attempts {
            match tokio::time::timeout(self.retry.timeout, self.client.adjudicate(context)).await {
                Ok(Ok(response)) => return AdjudicationOutcome::Ok(response),
                Ok(Err(e)) if e.is_transient() => {
                    tracing::warn!(
                        symbol = %context.symbol,
                        backend = self.client.backend_name(),
                        "AI adjudication attempt {}/{} failed: {}",
                        attempt,
                        max_attempts,
                        e
                    );
                    last = AdjudicationOutcome::Failed {
                        attempts: attempt,
                        error: e.to_string(),
                    };
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        symbol = %context.symbol,
                        "AI adjudication failed permanently: {}",
                        e
                    );
                    return AdjudicationOutcome::Failed {
                        attempts: attempt,
                        error: e.to_string(),
                    };
                }
                Err(_) => {
                    tracing::warn!(
                        symbol = %context.symbol,
                        "AI adjudication attempt {}/{} timed out after {}ms",
                        attempt,
                        max_attempts,
                        self.retry.timeout.as_millis()
                    );
                    last = AdjudicationOutcome::TimedOut { attempts: attempt };
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.retry.backoff * attempt).await;
            }
        }

        last
    }

    /// Adjudicate and fold the outcome into a stage result
    pub async fn evaluate(&self, context: &AdjudicationContext) -> StageResult {
        match self.call(context).await {
            AdjudicationOutcome::Ok(response) => {
                let result = if response.approved {
                    StageResult::pass(
                        StageName::AiAdjudicator,
                        Direction::Neutral,
                        response.confidence,
                        format!("AI approved: {}", response.reason),
                    )
                } else {
                    StageResult::fail(
                        StageName::AiAdjudicator,
                        Direction::Neutral,
                        response.confidence,
                        format!("AI vetoed: {}", response.reason),
                    )
                };
                result.with_detail("resolution", "response")
            }
            AdjudicationOutcome::TimedOut { attempts } => {
                self.resolve(format!("AI timed out after {} attempt(s)", attempts), attempts)
            }
            AdjudicationOutcome::Failed { attempts, error } => self.resolve(
                format!("AI unavailable after {} attempt(s): {}", attempts, error),
                attempts,
            ),
        }
    }

    fn resolve(&self, why: String, attempts: u32) -> StageResult {
        let result = match self.on_failure {
            FailurePolicy::FailOpen => StageResult::pass(
                StageName::AiAdjudicator,
                Direction::Neutral,
                0.0,
                format!("{}; fail-open approves", why),
            ),
            FailurePolicy::FailClosed => StageResult::fail(
                StageName::AiAdjudicator,
                Direction::Neutral,
                0.0,
                format!("{}; fail-closed rejects", why),
            ),
        };
        result
            .with_detail("resolution", self.on_failure.as_str())
            .with_detail("attempts", attempts)
    }
}
