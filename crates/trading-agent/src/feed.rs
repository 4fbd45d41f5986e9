use std::collections::HashMap;
use std::path::Path;

use analysis_core::{Bar, MarketSnapshot, Timeframe};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use technical_analysis::SnapshotBuilder;
use tokio::sync::Mutex;

use crate::exchange::MarkBoard;

/// Primary snapshot of a symbol plus its higher-timeframe context
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub primary: MarketSnapshot,
    pub higher: Option<MarketSnapshot>,
}

/// Source of per-cycle market snapshots
#[async_trait]
pub trait SnapshotFeed: Send + Sync {
    /// Next snapshot for `symbol`, or None when the feed has nothing new
    async fn next(&self, symbol: &str) -> Result<Option<FeedSnapshot>>;
}

struct Series {
    primary: Vec<Bar>,
    higher: Vec<Bar>,
    cursor: usize,
}

/// Walks recorded candles one primary bar per call.
///
/// Reads `{dir}/{SYMBOL}_{tf}.json` (a JSON array of bars) for the primary and
/// the higher timeframe. Each snapshot holds the trailing `window` bars; the
/// higher snapshot only holds bars that closed by the primary bar's close.
pub struct ReplayFeed {
    builder: SnapshotBuilder,
    primary_timeframe: Timeframe,
    higher_timeframe: Timeframe,
    window: usize,
    series: Mutex<HashMap<String, Series>>,
    marks: MarkBoard,
}

impl ReplayFeed {
    pub fn new(
        builder: SnapshotBuilder,
        primary_timeframe: Timeframe,
        higher_timeframe: Timeframe,
        window: usize,
        marks: MarkBoard,
    ) -> Self {
        Self {
            builder,
            primary_timeframe,
            higher_timeframe,
            window: window.max(1),
            series: Mutex::new(HashMap::new()),
            marks,
        }
    }

    /// Register candles for a symbol. Replay starts once `warmup` bars are available.
    pub async fn insert(&self, symbol: &str, primary: Vec<Bar>, higher: Vec<Bar>, warmup: usize) {
        let cursor = warmup.saturating_sub(1).min(primary.len());
        self.series.lock().await.insert(
            symbol.to_string(),
            Series {
                primary,
                higher,
                cursor,
            },
        );
    }

    /// Load every watchlist symbol found under `dir`. Symbols without a
    /// primary file are skipped with a warning; a missing higher file leaves
    /// the symbol without HTF context.
    pub async fn load(&self, dir: &Path, symbols: &[String], warmup: usize) -> Result<usize> {
        let mut loaded = 0;
        for symbol in symbols {
            let primary_path = dir.join(format!("{}_{}.json", symbol, self.primary_timeframe.name()));
            if !primary_path.exists() {
                tracing::warn!("No replay data for {} at {}", symbol, primary_path.display());
                continue;
            }
            let primary = read_bars(&primary_path).await?;

            let higher_path = dir.join(format!("{}_{}.json", symbol, self.higher_timeframe.name()));
            let higher = if higher_path.exists() {
                read_bars(&higher_path).await?
            } else {
                tracing::warn!("No {} replay data for {}", self.higher_timeframe.name(), symbol);
                Vec::new()
            };

            tracing::info!(
                "Loaded {} {} bars and {} {} bars for {}",
                primary.len(),
                self.primary_timeframe.name(),
                higher.len(),
                self.higher_timeframe.name(),
                symbol
            );
            self.insert(symbol, primary, higher, warmup).await;
            loaded += 1;
        }
        Ok(loaded)
    }

    pub async fn remaining(&self, symbol: &str) -> usize {
        self.series
            .lock()
            .await
            .get(symbol)
            .map(|s| s.primary.len().saturating_sub(s.cursor))
            .unwrap_or(0)
    }
}

async fn read_bars(path: &Path) -> Result<Vec<Bar>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut bars: Vec<Bar> =
        serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?;
    bars.sort_by_key(|b| b.timestamp);
    Ok(bars)
}

#[async_trait]
impl SnapshotFeed for ReplayFeed {
    async fn next(&self, symbol: &str) -> Result<Option<FeedSnapshot>> {
        let mut series = self.series.lock().await;
        let Some(s) = series.get_mut(symbol) else {
            return Ok(None);
        };
        if s.cursor >= s.primary.len() {
            return Ok(None);
        }

        let end = s.cursor + 1;
        let start = end.saturating_sub(self.window);
        let candles = s.primary[start..end].to_vec();
        s.cursor += 1;

        let Some(last) = candles.last() else {
            return Ok(None);
        };
        let close = last.close;
        let closed_at = last.timestamp + Duration::minutes(self.primary_timeframe.to_minutes());
        let higher_span = Duration::minutes(self.higher_timeframe.to_minutes());

        let visible = s.higher.partition_point(|b| b.timestamp + higher_span <= closed_at);
        let higher = (visible > 0).then(|| {
            let from = visible.saturating_sub(self.window);
            self.builder
                .build(symbol, self.higher_timeframe, s.higher[from..visible].to_vec())
        });

        self.marks.insert(symbol.to_string(), close);
        Ok(Some(FeedSnapshot {
            primary: self.builder.build(symbol, self.primary_timeframe, candles),
            higher,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use dashmap::DashMap;
    use std::sync::Arc;

    fn bars(count: usize, step_minutes: i64) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..count)
            .map(|i| {
                let close = 100.0 + i as f64;
                Bar {
                    timestamp: start + Duration::minutes(step_minutes * i as i64),
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 1000.0,
                }
            })
            .collect()
    }

    fn feed(window: usize, marks: MarkBoard) -> ReplayFeed {
        ReplayFeed::new(
            SnapshotBuilder::default(),
            Timeframe::Minute15,
            Timeframe::Hour4,
            window,
            marks,
        )
    }

    #[tokio::test]
    async fn test_walks_one_bar_per_call() {
        let marks: MarkBoard = Arc::new(DashMap::new());
        let feed = feed(10, marks.clone());
        feed.insert("BTCUSDT", bars(12, 15), Vec::new(), 10).await;

        let first = feed.next("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(first.primary.candles.len(), 10);
        assert_eq!(first.primary.last_close(), Some(109.0));
        assert!(first.higher.is_none());
        assert_eq!(marks.get("BTCUSDT").map(|m| *m), Some(109.0));

        let second = feed.next("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(second.primary.candles.len(), 10);
        assert_eq!(second.primary.last_close(), Some(110.0));

        assert!(feed.next("BTCUSDT").await.unwrap().is_some());
        assert!(feed.next("BTCUSDT").await.unwrap().is_none());
        assert!(feed.next("ETHUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_higher_snapshot_never_sees_the_future() {
        let feed = feed(50, Arc::new(DashMap::new()));
        // 16 fifteen-minute bars per 4h bar
        feed.insert("BTCUSDT", bars(40, 15), bars(6, 240), 20).await;

        // primary bar 19 closes at 05:00, so only the 00:00-04:00 bar is final
        let snap = feed.next("BTCUSDT").await.unwrap().unwrap();
        let higher = snap.higher.unwrap();
        assert_eq!(higher.timeframe, Timeframe::Hour4);
        assert_eq!(higher.candles.len(), 1);

        for _ in 0..12 {
            feed.next("BTCUSDT").await.unwrap();
        }
        // bar 32 closes at 08:15: the 04:00-08:00 bar is now final too
        let later = feed.next("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(later.higher.unwrap().candles.len(), 2);
    }

    #[tokio::test]
    async fn test_load_from_directory() {
        let dir = std::env::temp_dir().join(format!("replay-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("BTCUSDT_15m.json"),
            serde_json::to_string(&bars(5, 15)).unwrap(),
        )
        .unwrap();

        let feed = feed(10, Arc::new(DashMap::new()));
        let loaded = feed
            .load(&dir, &["BTCUSDT".to_string(), "ETHUSDT".to_string()], 1)
            .await
            .unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(feed.remaining("BTCUSDT").await, 5);
        std::fs::remove_dir_all(&dir).ok();
    }
}
