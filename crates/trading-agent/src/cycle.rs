use std::sync::Arc;
use std::time::Instant;

use analysis_core::{Decision, ExchangeInfo};
use analysis_orchestrator::EntryPipeline;
use position_sizer::{PositionSizer, SizingConfig};
use risk_manager::{CooldownTracker, Fill, PositionBook, StateStore};
use tokio::sync::Mutex;

use crate::exchange::{OrderExecutor, OrderRequest};
use crate::feed::SnapshotFeed;
use crate::metrics::AgentMetrics;

/// What happened to one symbol in a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolOutcome {
    NoData,
    Holding,
    Exited,
    Rejected,
    CoolingDown,
    SizingRejected,
    OrderFailed,
    Entered,
}

/// Everything one polling cycle needs. Collaborators are trait objects so
/// the paper wiring can be swapped for a live exchange binding.
pub struct Agent {
    pub pipeline: EntryPipeline,
    pub cooldown: CooldownTracker,
    pub positions: PositionBook,
    pub feed: Arc<dyn SnapshotFeed>,
    pub exchange: Arc<dyn ExchangeInfo>,
    pub executor: Arc<dyn OrderExecutor>,
    pub sizing: SizingConfig,
    pub leverage: f64,
    pub watchlist: Vec<String>,
    pub metrics: Mutex<AgentMetrics>,
    pub store: Option<StateStore>,
}

impl Agent {
    /// Run the watchlist once. Symbols are handled in watchlist order; a
    /// failure on one symbol is logged and does not stop the others.
    pub async fn run_cycle(&self) -> Vec<(String, SymbolOutcome)> {
        let cycle_start = Instant::now();
        tracing::info!("Starting cycle over {} symbols", self.watchlist.len());

        let mut outcomes = Vec::with_capacity(self.watchlist.len());
        for symbol in &self.watchlist {
            let outcome = self.run_symbol(symbol).await;
            tracing::debug!(symbol = %symbol, outcome = ?outcome, "Symbol done");
            outcomes.push((symbol.clone(), outcome));
        }

        let mut metrics = self.metrics.lock().await;
        if metrics.finish_cycle(cycle_start) {
            metrics.log_metrics(&self.pipeline.metrics().snapshot());
        }
        tracing::info!(
            "Cycle #{} complete in {}ms ({} open positions)",
            metrics.cycles_run,
            metrics.last_cycle_duration_ms,
            self.positions.len().await
        );
        outcomes
    }

    async fn run_symbol(&self, symbol: &str) -> SymbolOutcome {
        if self.positions.has_position(symbol).await {
            return self.manage_position(symbol).await;
        }

        let snapshot = match self.feed.next(symbol).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return SymbolOutcome::NoData,
            Err(e) => {
                tracing::warn!("Failed to read snapshot for {}: {:#}", symbol, e);
                return SymbolOutcome::NoData;
            }
        };

        let decision = self
            .pipeline
            .evaluate(symbol, &snapshot.primary, snapshot.higher.as_ref())
            .await;
        self.metrics.lock().await.decisions_evaluated += 1;

        if !decision.should_enter {
            return SymbolOutcome::Rejected;
        }
        self.metrics.lock().await.entries_approved += 1;

        self.enter(symbol, &decision).await
    }

    /// Advance the feed and move the open position's stop
    async fn manage_position(&self, symbol: &str) -> SymbolOutcome {
        if let Err(e) = self.feed.next(symbol).await {
            tracing::warn!("Failed to read snapshot for {}: {:#}", symbol, e);
        }
        let price = match self.exchange.mark_price(symbol).await {
            Ok(price) => price,
            Err(e) => {
                tracing::warn!("No mark price for open position {}: {}", symbol, e);
                return SymbolOutcome::Holding;
            }
        };

        match self.positions.on_price(symbol, price).await {
            Some(exit) => {
                self.metrics.lock().await.record_exit(&exit);
                SymbolOutcome::Exited
            }
            None => SymbolOutcome::Holding,
        }
    }

    async fn enter(&self, symbol: &str, decision: &Decision) -> SymbolOutcome {
        let check = self.cooldown.can_signal(symbol, decision.direction).await;
        if !check.allowed {
            tracing::info!(symbol, "Entry skipped: {}", check.reason);
            self.metrics.lock().await.cooldown_rejections += 1;
            return SymbolOutcome::CoolingDown;
        }

        let (Some(stop_loss), Some(take_profit)) = (decision.stop_loss, decision.take_profit) else {
            tracing::warn!(symbol, "Approved decision carries no protective levels");
            return SymbolOutcome::Rejected;
        };

        let sized = async {
            let filters = self.exchange.symbol_filters(symbol).await?;
            let balance = self.exchange.balance().await?;
            PositionSizer::calculate_position_size(
                balance,
                decision.entry_price,
                self.leverage,
                &self.sizing,
                &filters,
            )
            .map_err(analysis_core::PipelineError::from)
        }
        .await;
        let size = match sized {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(symbol, "Entry not sized: {}", e);
                self.metrics.lock().await.sizing_rejections += 1;
                return SymbolOutcome::SizingRejected;
            }
        };
        tracing::info!(symbol, "Sized entry: {}", size.reasoning);

        let order = OrderRequest {
            symbol: symbol.to_string(),
            direction: decision.direction,
            quantity: size.quantity,
            price: decision.entry_price,
        };
        let fill = match self.executor.submit(&order).await {
            Ok(fill) => fill,
            Err(e) => {
                tracing::error!(symbol, "Order failed: {}", e);
                self.metrics.lock().await.orders_failed += 1;
                return SymbolOutcome::OrderFailed;
            }
        };
        self.metrics.lock().await.orders_filled += 1;

        // The cooldown starts only once the order is confirmed.
        self.cooldown
            .record_signal_at(symbol, decision.direction, fill.filled_at)
            .await;

        // Levels are re-anchored to the fill so the stop keeps its distance.
        let offset = fill.price - decision.entry_price;
        let opened = self
            .positions
            .open(Fill {
                symbol: symbol.to_string(),
                direction: decision.direction,
                price: fill.price,
                quantity: fill.quantity,
                stop_loss: stop_loss + offset,
                take_profit: take_profit + offset,
                order_id: fill.order_id,
                filled_at: fill.filled_at,
            })
            .await;

        match opened {
            Ok(_) => SymbolOutcome::Entered,
            Err(e) => {
                tracing::error!(symbol, "Filled order could not be tracked: {}", e);
                SymbolOutcome::OrderFailed
            }
        }
    }

    /// Persist the metrics counters. Failures only log.
    pub async fn persist_metrics(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let json = self.metrics.lock().await.to_json();
        if let Err(e) = store.save_metrics(&json).await {
            tracing::warn!("Failed to persist metrics: {}", e);
        }
    }

    /// Metrics summary plus every position still open
    pub async fn log_summary(&self) {
        self.metrics
            .lock()
            .await
            .log_metrics(&self.pipeline.metrics().snapshot());

        if self.positions.is_empty().await {
            tracing::info!("No open positions");
            return;
        }
        for symbol in self.positions.symbols().await {
            let Some(position) = self.positions.get(&symbol).await else {
                continue;
            };
            let mark = self.exchange.mark_price(&symbol).await.ok();
            tracing::info!(
                symbol = %symbol,
                order_id = %position.order_id,
                "Open {} {} @ ${:.2}, stop ${:.2}, target ${:.2}, unrealized {}",
                position.direction,
                position.quantity,
                position.entry_price,
                position.trailing.current_stop(),
                position.take_profit,
                mark.map(|m| format!("${:.2}", position.unrealized_pnl(m)))
                    .unwrap_or_else(|| "n/a".to_string())
            );
        }
    }
}
