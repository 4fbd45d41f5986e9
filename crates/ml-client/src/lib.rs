pub mod adjudicator;
pub mod ai_stage;
pub mod ensemble;
pub mod error;

pub use adjudicator::{
    AdjudicationContext, AdjudicationResponse, Adjudicator, HttpAdjudicator, StageSummary,
};
pub use ai_stage::{AdjudicationOutcome, AiAdjudicatorStage, FailurePolicy, RetryPolicy};
pub use ensemble::{
    classify, load_models, Feature, LinearSignalModel, MlEnsembleStage, MlParams, MlVerdict,
    ModelSpec, SignalModel, SnapshotModel, WeightedModel,
};
pub use error::{MLError, MLResult};
