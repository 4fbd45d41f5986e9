use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use analysis_core::{Direction, PipelineError};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::state_store::StateStore;
use crate::trailing_stop::{ExitReason, StopEvent, TrailingConfig, TrailingStop};

const KEY_PREFIX: &str = "position:";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("a position in {0} is already open")]
    PositionExists(String),

    #[error("invalid position: {0}")]
    Invalid(String),
}

impl From<PipelineError> for PositionError {
    fn from(e: PipelineError) -> Self {
        PositionError::Invalid(e.to_string())
    }
}

/// Confirmed fill to open a position from
#[derive(Debug, Clone)]
pub struct Fill {
    pub symbol: String,
    pub direction: Direction,
    pub price: f64,
    pub quantity: Decimal,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub order_id: String,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: Decimal,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub order_id: String,
    pub opened_at: DateTime<Utc>,
    pub trailing: TrailingStop,
}

impl Position {
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.direction.sign() * self.quantity.to_f64().unwrap_or(0.0)
    }
}

/// A position leaving the book
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitEvent {
    pub symbol: String,
    pub direction: Direction,
    pub reason: ExitReason,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: Decimal,
    pub pnl: f64,
}

/// Open positions, at most one per symbol. All mutations go through one lock
/// and are written through to the state store.
pub struct PositionBook {
    trailing: TrailingConfig,
    positions: Mutex<BTreeMap<String, Position>>,
    store: Option<StateStore>,
    degraded: AtomicBool,
}

impl PositionBook {
    pub fn new(trailing: TrailingConfig, store: Option<StateStore>) -> Self {
        Self {
            trailing,
            positions: Mutex::new(BTreeMap::new()),
            store,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Reload persisted open positions. Returns how many were restored.
    pub async fn restore(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let rows = match store.load_prefix(KEY_PREFIX).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Failed to load positions, starting empty: {}", e);
                self.degraded.store(true, Ordering::Relaxed);
                return 0;
            }
        };

        let mut positions = self.positions.lock().await;
        for (key, value) in rows {
            let symbol = key.trim_start_matches(KEY_PREFIX);
            match serde_json::from_str::<Position>(&value) {
                Ok(position) if !position.trailing.is_closed() => {
                    positions.insert(symbol.to_string(), position);
                }
                Ok(_) => tracing::warn!("Skipping closed position record for {}", symbol),
                Err(e) => tracing::warn!("Skipping corrupt position record for {}: {}", symbol, e),
            }
        }

        tracing::info!("Restored {} open positions", positions.len());
        positions.len()
    }

    pub async fn has_position(&self, symbol: &str) -> bool {
        self.positions.lock().await.contains_key(symbol)
    }

    pub async fn get(&self, symbol: &str) -> Option<Position> {
        self.positions.lock().await.get(symbol).cloned()
    }

    pub async fn symbols(&self) -> Vec<String> {
        self.positions.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.positions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.positions.lock().await.is_empty()
    }

    /// Open a position from a confirmed fill
    pub async fn open(&self, fill: Fill) -> Result<Position, PositionError> {
        let mut positions = self.positions.lock().await;
        if positions.contains_key(&fill.symbol) {
            return Err(PositionError::PositionExists(fill.symbol));
        }
        if fill.quantity <= Decimal::ZERO {
            return Err(PositionError::Invalid(format!(
                "quantity must be positive, got {}",
                fill.quantity
            )));
        }

        let trailing = TrailingStop::new(
            fill.direction,
            fill.price,
            fill.stop_loss,
            fill.take_profit,
            self.trailing,
        )?;
        let position = Position {
            symbol: fill.symbol.clone(),
            direction: fill.direction,
            entry_price: fill.price,
            quantity: fill.quantity,
            stop_loss: fill.stop_loss,
            take_profit: fill.take_profit,
            order_id: fill.order_id,
            opened_at: fill.filled_at,
            trailing,
        };

        self.persist(&position).await;
        positions.insert(fill.symbol, position.clone());

        tracing::info!(
            symbol = %position.symbol,
            direction = %position.direction,
            quantity = %position.quantity,
            "Opened position at ${:.2} (stop ${:.2}, target ${:.2})",
            position.entry_price,
            position.stop_loss,
            position.take_profit
        );
        Ok(position)
    }

    /// Feed a price into the symbol's trailing stop. Returns the exit when
    /// the update closes the position.
    pub async fn on_price(&self, symbol: &str, price: f64) -> Option<ExitEvent> {
        let mut positions = self.positions.lock().await;
        let position = positions.get_mut(symbol)?;

        match position.trailing.on_price(price) {
            StopEvent::Unchanged => None,
            StopEvent::Armed { stop } => {
                tracing::info!("Trailing stop armed for {} at ${:.2}", symbol, stop);
                let snapshot = position.clone();
                self.persist(&snapshot).await;
                None
            }
            StopEvent::Tightened { previous, stop } => {
                tracing::info!(
                    "Updated trailing stop for {}: ${:.2} -> ${:.2}",
                    symbol,
                    previous,
                    stop
                );
                let snapshot = position.clone();
                self.persist(&snapshot).await;
                None
            }
            StopEvent::Closed { reason, price } => {
                let closed = positions.remove(symbol)?;
                self.forget(symbol).await;
                Some(exit_event(closed, reason, price))
            }
        }
    }

    /// Close a position outside the stop engine
    pub async fn close(&self, symbol: &str, price: f64) -> Option<ExitEvent> {
        let mut positions = self.positions.lock().await;
        let mut position = positions.remove(symbol)?;
        position.trailing.close_external(price);
        self.forget(symbol).await;
        Some(exit_event(position, ExitReason::External, price))
    }

    async fn persist(&self, position: &Position) {
        let Some(store) = &self.store else {
            return;
        };
        let saved = match serde_json::to_string(position) {
            Ok(json) => {
                store
                    .save_state(&format!("{}{}", KEY_PREFIX, position.symbol), &json)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = saved {
            tracing::warn!(
                symbol = %position.symbol,
                "Failed to persist position, continuing in memory: {}",
                e
            );
            self.degraded.store(true, Ordering::Relaxed);
        }
    }

    async fn forget(&self, symbol: &str) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.delete_state(&format!("{}{}", KEY_PREFIX, symbol)).await {
            tracing::warn!(symbol, "Failed to delete closed position: {}", e);
            self.degraded.store(true, Ordering::Relaxed);
        }
    }
}

fn exit_event(position: Position, reason: ExitReason, price: f64) -> ExitEvent {
    let pnl = position.unrealized_pnl(price);

    tracing::info!(
        symbol = %position.symbol,
        reason = reason.as_str(),
        pnl,
        "Closed position at ${:.2} (entry ${:.2})",
        price,
        position.entry_price
    );

    ExitEvent {
        symbol: position.symbol,
        direction: position.direction,
        reason,
        entry_price: position.entry_price,
        exit_price: price,
        quantity: position.quantity,
        pnl,
    }
}
