use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use analysis_core::{Direction, ExchangeInfo, PipelineError, PipelineResult, SymbolFilters};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;

/// Latest prices per symbol, published by the feed and read as marks
pub type MarkBoard = Arc<DashMap<String, f64>>;

/// Exchange facts from a static table, for paper trading and replays.
///
/// Symbols without an entry get permissive filters (step 0.000001, no
/// minimums).
pub struct StaticExchangeInfo {
    filters: HashMap<String, SymbolFilters>,
    fallback: SymbolFilters,
    balance: f64,
    marks: MarkBoard,
}

impl StaticExchangeInfo {
    pub fn new(filters: HashMap<String, SymbolFilters>, balance: f64, marks: MarkBoard) -> Self {
        Self {
            filters,
            fallback: SymbolFilters::new(Decimal::new(1, 6), Decimal::ZERO, Decimal::ZERO),
            balance,
            marks,
        }
    }

    /// Load `{"BTCUSDT": {"step_size": 0.001, "min_qty": 0.001, "min_notional": 5}}`
    pub async fn load(path: &Path, balance: f64, marks: MarkBoard) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading exchange info {}", path.display()))?;
        let filters: HashMap<String, SymbolFilters> = serde_json::from_str(&json)
            .with_context(|| format!("parsing exchange info {}", path.display()))?;
        tracing::info!("Loaded filters for {} symbols from {}", filters.len(), path.display());
        Ok(Self::new(filters, balance, marks))
    }
}

#[async_trait]
impl ExchangeInfo for StaticExchangeInfo {
    async fn symbol_filters(&self, symbol: &str) -> PipelineResult<SymbolFilters> {
        Ok(self
            .filters
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }

    async fn balance(&self) -> PipelineResult<f64> {
        Ok(self.balance)
    }

    async fn mark_price(&self, symbol: &str) -> PipelineResult<f64> {
        self.marks
            .get(symbol)
            .map(|price| *price)
            .ok_or_else(|| PipelineError::ExternalService(format!("no mark price for {}", symbol)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub price: f64,
}

/// Confirmed execution of an order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub order_id: String,
    pub price: f64,
    pub quantity: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// Places entry orders. Only a confirmed fill opens a position.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn submit(&self, order: &OrderRequest) -> PipelineResult<OrderFill>;
}

/// Fills every order at its requested price
#[derive(Debug, Default)]
pub struct PaperExecutor;

#[async_trait]
impl OrderExecutor for PaperExecutor {
    async fn submit(&self, order: &OrderRequest) -> PipelineResult<OrderFill> {
        if order.quantity <= Decimal::ZERO || !(order.price.is_finite() && order.price > 0.0) {
            return Err(PipelineError::Validation(format!(
                "paper order for {} has quantity {} at {}",
                order.symbol, order.quantity, order.price
            )));
        }

        let fill = OrderFill {
            order_id: format!("paper-{}", uuid::Uuid::new_v4()),
            price: order.price,
            quantity: order.quantity,
            filled_at: Utc::now(),
        };
        tracing::info!(
            symbol = %order.symbol,
            order_id = %fill.order_id,
            "Paper fill: {} {} @ ${:.2}",
            order.direction,
            order.quantity,
            order.price
        );
        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_static_filters_and_fallback() {
        let marks: MarkBoard = Arc::new(DashMap::new());
        let exchange = StaticExchangeInfo::new(
            HashMap::from([(
                "BTCUSDT".to_string(),
                SymbolFilters::new(dec!(0.001), dec!(0.001), dec!(5)),
            )]),
            1000.0,
            marks.clone(),
        );

        let btc = exchange.symbol_filters("BTCUSDT").await.unwrap();
        assert_eq!(btc.step_size, dec!(0.001));
        let other = exchange.symbol_filters("DOGEUSDT").await.unwrap();
        assert_eq!(other.step_size, dec!(0.000001));
        assert_eq!(other.min_notional, Decimal::ZERO);
        assert_eq!(exchange.balance().await.unwrap(), 1000.0);
    }

    #[tokio::test]
    async fn test_mark_price_comes_from_board() {
        let marks: MarkBoard = Arc::new(DashMap::new());
        let exchange = StaticExchangeInfo::new(HashMap::new(), 1000.0, marks.clone());

        assert!(matches!(
            exchange.mark_price("BTCUSDT").await,
            Err(PipelineError::ExternalService(_))
        ));
        marks.insert("BTCUSDT".to_string(), 70_000.0);
        assert_eq!(exchange.mark_price("BTCUSDT").await.unwrap(), 70_000.0);
    }

    #[tokio::test]
    async fn test_load_filters_file() {
        let path = std::env::temp_dir().join(format!("exchange-info-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"ETHUSDT": {"step_size": 0.0001, "min_qty": 0.0001, "min_notional": 10}}"#,
        )
        .unwrap();

        let exchange = StaticExchangeInfo::load(&path, 500.0, Arc::new(DashMap::new()))
            .await
            .unwrap();
        let eth = exchange.symbol_filters("ETHUSDT").await.unwrap();
        assert_eq!(eth.step_size, dec!(0.0001));
        assert_eq!(eth.min_notional, dec!(10));
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_paper_fill() {
        let order = OrderRequest {
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            quantity: dec!(0.001),
            price: 70_000.0,
        };
        let fill = PaperExecutor.submit(&order).await.unwrap();
        assert_eq!(fill.price, 70_000.0);
        assert_eq!(fill.quantity, dec!(0.001));
        assert!(fill.order_id.starts_with("paper-"));

        let empty = OrderRequest {
            quantity: Decimal::ZERO,
            ..order
        };
        assert!(PaperExecutor.submit(&empty).await.is_err());
    }
}
