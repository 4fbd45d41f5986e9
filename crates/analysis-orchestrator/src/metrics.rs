use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use analysis_core::StageName;
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Default)]
struct Counter {
    invocations: AtomicU64,
    passes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageCounts {
    pub invocations: u64,
    pub passes: u64,
    pub pass_rate: f64,
}

/// Per-stage invocation and pass counters. Monotonic for the lifetime of the pipeline.
#[derive(Debug, Default)]
pub struct StageMetrics {
    counters: DashMap<StageName, Counter>,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stage: StageName, passed: bool) {
        let counter = self.counters.entry(stage).or_default();
        counter.invocations.fetch_add(1, Ordering::Relaxed);
        if passed {
            counter.passes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn invocations(&self, stage: StageName) -> u64 {
        self.counters
            .get(&stage)
            .map(|c| c.invocations.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// `None` until the stage has run at least once
    pub fn pass_rate(&self, stage: StageName) -> Option<f64> {
        self.counts(stage).map(|c| c.pass_rate)
    }

    pub fn counts(&self, stage: StageName) -> Option<StageCounts> {
        let counter = self.counters.get(&stage)?;
        let invocations = counter.invocations.load(Ordering::Relaxed);
        if invocations == 0 {
            return None;
        }
        let passes = counter.passes.load(Ordering::Relaxed);
        Some(StageCounts {
            invocations,
            passes,
            pass_rate: passes as f64 / invocations as f64,
        })
    }

    /// Point-in-time copy ordered by stage, for reporting
    pub fn snapshot(&self) -> BTreeMap<StageName, StageCounts> {
        StageName::ALL
            .iter()
            .filter_map(|stage| self.counts(*stage).map(|c| (*stage, c)))
            .collect()
    }
}
