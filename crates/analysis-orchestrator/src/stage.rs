use analysis_core::{StageContext, StageName, StageResult};
use ml_client::{AiAdjudicatorStage, MlEnsembleStage};
use multi_timeframe::HtfAlignmentStage;
use technical_analysis::PriceActionStage;

use crate::config::AiMode;

/// One synchronous gating stage of the chain, selected at construction time
#[derive(Clone)]
pub enum Stage {
    MlEnsemble(MlEnsembleStage),
    PriceAction(PriceActionStage),
    HtfAlignment(HtfAlignmentStage),
    /// Skipped: neither blocks nor contributes
    Disabled(StageName),
}

impl Stage {
    pub fn name(&self) -> StageName {
        match self {
            Stage::MlEnsemble(_) => StageName::MlEnsemble,
            Stage::PriceAction(_) => StageName::PriceAction,
            Stage::HtfAlignment(_) => StageName::HtfAlignment,
            Stage::Disabled(name) => *name,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Stage::Disabled(_))
    }

    /// Whether the stage's verdict and opinion take part in the decision
    pub fn is_gate(&self) -> bool {
        match self {
            Stage::HtfAlignment(stage) => stage.is_gate(),
            Stage::Disabled(_) => false,
            _ => true,
        }
    }

    /// Evaluate the stage. `None` for a disabled stage; an error becomes a
    /// failed result carrying the error text.
    pub fn evaluate(&self, ctx: &StageContext<'_>) -> Option<StageResult> {
        let name = self.name();
        let outcome = match self {
            Stage::MlEnsemble(stage) => stage.evaluate(ctx),
            Stage::PriceAction(stage) => stage.evaluate(ctx),
            Stage::HtfAlignment(stage) => stage.evaluate(ctx),
            Stage::Disabled(_) => return None,
        };

        Some(outcome.unwrap_or_else(|e| {
            tracing::warn!(symbol = %ctx.symbol, stage = %name, "Stage evaluation failed: {}", e);
            StageResult::errored(name, &e)
        }))
    }
}

/// The adjudicator slot after the gating chain
#[derive(Clone)]
pub enum AiStage {
    Enabled {
        stage: AiAdjudicatorStage,
        mode: AiMode,
        band: f64,
    },
    Disabled,
}

impl AiStage {
    /// Whether a decision that passed every gate at `confidence` is sent for adjudication
    pub fn should_invoke(&self, confidence: f64, min_confidence: f64) -> bool {
        match self {
            AiStage::Enabled { mode: AiMode::All, .. } => true,
            AiStage::Enabled {
                mode: AiMode::Borderline,
                band,
                ..
            } => (confidence - min_confidence).abs() <= *band,
            AiStage::Disabled => false,
        }
    }
}
