use async_trait::async_trait;

use crate::{PipelineResult, SymbolFilters};

/// Exchange-side facts the sizer and the agent loop need.
///
/// Implemented by the exchange binding. Errors should be reported as
/// `PipelineError::ExternalService`.
#[async_trait]
pub trait ExchangeInfo: Send + Sync {
    /// Step size, minimum quantity and minimum notional for a symbol
    async fn symbol_filters(&self, symbol: &str) -> PipelineResult<SymbolFilters>;

    /// Free balance in quote currency
    async fn balance(&self) -> PipelineResult<f64>;

    /// Current mark price for a symbol
    async fn mark_price(&self, symbol: &str) -> PipelineResult<f64>;
}
