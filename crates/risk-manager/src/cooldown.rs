use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use analysis_core::Direction;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::state_store::StateStore;

const KEY_PREFIX: &str = "cooldown:";

/// Which later signals a recorded signal locks out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownScope {
    /// Only signals in the recorded direction wait for the window
    #[default]
    SameDirection,
    /// Every signal on the symbol waits for the window
    AnyDirection,
}

impl CooldownScope {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "same_direction" | "same" => Some(CooldownScope::SameDirection),
            "any_direction" | "any" => Some(CooldownScope::AnyDirection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CooldownConfig {
    pub window: Duration,
    pub scope: CooldownScope,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            window: Duration::minutes(60),
            scope: CooldownScope::SameDirection,
        }
    }
}

/// Last signal recorded for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub direction: Direction,
    pub signaled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownState {
    NoRecord,
    CoolingDown,
    Eligible,
}

/// Answer to `can_signal`
#[derive(Debug, Clone, PartialEq)]
pub struct CooldownCheck {
    pub allowed: bool,
    pub state: CooldownState,
    pub reason: String,
    /// Time left in the window, while cooling down
    pub remaining: Option<Duration>,
}

/// Per-symbol signal cooldown. Reads and writes go through one lock; every
/// recorded signal is written through to the state store.
pub struct CooldownTracker {
    config: CooldownConfig,
    records: Mutex<HashMap<String, CooldownRecord>>,
    store: Option<StateStore>,
    degraded: AtomicBool,
}

impl CooldownTracker {
    pub fn new(config: CooldownConfig, store: Option<StateStore>) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
            store,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CooldownConfig {
        &self.config
    }

    /// True once a durable write has failed; state since then lives in memory only
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Reload persisted records. Returns how many were restored.
    pub async fn restore(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let rows = match store.load_prefix(KEY_PREFIX).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Failed to load cooldown state, starting empty: {}", e);
                self.degraded.store(true, Ordering::Relaxed);
                return 0;
            }
        };

        let mut records = self.records.lock().await;
        for (key, value) in rows {
            let symbol = key.trim_start_matches(KEY_PREFIX);
            match serde_json::from_str::<CooldownRecord>(&value) {
                Ok(record) => {
                    records.insert(symbol.to_string(), record);
                }
                Err(e) => tracing::warn!("Skipping corrupt cooldown record for {}: {}", symbol, e),
            }
        }

        tracing::info!("Restored {} cooldown records", records.len());
        records.len()
    }

    pub async fn record(&self, symbol: &str) -> Option<CooldownRecord> {
        self.records.lock().await.get(symbol).copied()
    }

    pub async fn can_signal(&self, symbol: &str, direction: Direction) -> CooldownCheck {
        self.can_signal_at(symbol, direction, Utc::now()).await
    }

    pub async fn can_signal_at(
        &self,
        symbol: &str,
        direction: Direction,
        now: DateTime<Utc>,
    ) -> CooldownCheck {
        let record = self.records.lock().await.get(symbol).copied();
        self.check(record, direction, now)
    }

    fn check(
        &self,
        record: Option<CooldownRecord>,
        direction: Direction,
        now: DateTime<Utc>,
    ) -> CooldownCheck {
        let Some(record) = record else {
            return CooldownCheck {
                allowed: true,
                state: CooldownState::NoRecord,
                reason: "no previous signal".to_string(),
                remaining: None,
            };
        };

        let elapsed = now - record.signaled_at;
        if elapsed >= self.config.window {
            return CooldownCheck {
                allowed: true,
                state: CooldownState::Eligible,
                reason: format!(
                    "last {} signal {} minutes ago",
                    record.direction,
                    elapsed.num_minutes()
                ),
                remaining: None,
            };
        }

        let remaining = self.config.window - elapsed;
        if self.config.scope == CooldownScope::SameDirection && record.direction != direction {
            return CooldownCheck {
                allowed: true,
                state: CooldownState::CoolingDown,
                reason: format!(
                    "cooling down for {} only, {} is allowed",
                    record.direction, direction
                ),
                remaining: Some(remaining),
            };
        }

        CooldownCheck {
            allowed: false,
            state: CooldownState::CoolingDown,
            reason: format!(
                "cooldown active after {} signal, {}m {}s remaining",
                record.direction,
                remaining.num_minutes(),
                remaining.num_seconds() % 60
            ),
            remaining: Some(remaining),
        }
    }

    pub async fn record_signal(&self, symbol: &str, direction: Direction) {
        self.record_signal_at(symbol, direction, Utc::now()).await
    }

    /// Start a new window for `symbol`. A failed durable write is logged and
    /// leaves the tracker in memory-only mode.
    pub async fn record_signal_at(&self, symbol: &str, direction: Direction, at: DateTime<Utc>) {
        let record = CooldownRecord {
            direction,
            signaled_at: at,
        };

        let mut records = self.records.lock().await;
        records.insert(symbol.to_string(), record);

        if let Some(store) = &self.store {
            let persisted = match serde_json::to_string(&record) {
                Ok(json) => store.save_state(&format!("{}{}", KEY_PREFIX, symbol), &json).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = persisted {
                tracing::warn!(
                    symbol,
                    "Failed to persist cooldown, continuing in memory: {}",
                    e
                );
                self.degraded.store(true, Ordering::Relaxed);
            }
        }
        drop(records);

        tracing::debug!(symbol, direction = %direction, "Recorded signal, cooldown started");
    }
}
