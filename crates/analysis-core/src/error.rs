use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::StageName;

/// Failure categories of the entry pipeline.
///
/// Only `Configuration` is fatal. Every other variant is recovered close to
/// where it happens and ends up as a failed stage, a rejected order or a
/// degraded (memory-only) store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stage {stage} error: {message}")]
    StageEvaluation { stage: StageName, message: String },

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl PipelineError {
    pub fn stage(stage: StageName, message: impl Into<String>) -> Self {
        PipelineError::StageEvaluation {
            stage,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Configuration(message.into())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Exchange quantity rule a sized order breaks
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterViolation {
    #[error("quantity rounds to zero at step size {step_size}")]
    ZeroAfterRounding { step_size: Decimal },

    #[error("quantity {quantity} below minimum quantity {min_qty}")]
    BelowMinQuantity { quantity: Decimal, min_qty: Decimal },

    #[error("notional {notional} below minimum notional {min_notional}")]
    BelowMinNotional {
        notional: Decimal,
        min_notional: Decimal,
    },
}
