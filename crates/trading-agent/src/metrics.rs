use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use analysis_core::StageName;
use analysis_orchestrator::StageCounts;
use risk_manager::{ExitEvent, ExitReason};

const RECENT_WINDOW: usize = 20;

/// Aggregate counters of the agent loop, persisted under `agent_metrics`.
pub struct AgentMetrics {
    pub cycles_run: u64,
    pub decisions_evaluated: u64,
    pub entries_approved: u64,
    pub cooldown_rejections: u64,
    pub sizing_rejections: u64,
    pub orders_filled: u64,
    pub orders_failed: u64,
    pub exits_stop_loss: u64,
    pub exits_trailing_stop: u64,
    pub exits_take_profit: u64,
    pub exits_external: u64,
    pub realized_pnl: f64,
    pub winning_trades: u64,
    pub losing_trades: u64,

    pub last_cycle_duration_ms: u64,

    // Rolling 20-trade window
    recent_pnl: VecDeque<f64>,
    log_interval_cycles: u64,
}

impl AgentMetrics {
    pub fn new(log_interval_cycles: u64) -> Self {
        Self {
            cycles_run: 0,
            decisions_evaluated: 0,
            entries_approved: 0,
            cooldown_rejections: 0,
            sizing_rejections: 0,
            orders_filled: 0,
            orders_failed: 0,
            exits_stop_loss: 0,
            exits_trailing_stop: 0,
            exits_take_profit: 0,
            exits_external: 0,
            realized_pnl: 0.0,
            winning_trades: 0,
            losing_trades: 0,
            last_cycle_duration_ms: 0,
            recent_pnl: VecDeque::with_capacity(RECENT_WINDOW),
            log_interval_cycles,
        }
    }

    pub fn record_exit(&mut self, exit: &ExitEvent) {
        match exit.reason {
            ExitReason::StopLoss => self.exits_stop_loss += 1,
            ExitReason::TrailingStop => self.exits_trailing_stop += 1,
            ExitReason::TakeProfit => self.exits_take_profit += 1,
            ExitReason::External => self.exits_external += 1,
        }

        self.realized_pnl += exit.pnl;
        if exit.pnl > 0.0 {
            self.winning_trades += 1;
        } else {
            self.losing_trades += 1;
        }

        self.recent_pnl.push_back(exit.pnl);
        if self.recent_pnl.len() > RECENT_WINDOW {
            self.recent_pnl.pop_front();
        }
    }

    /// Close out a cycle. Returns true when this cycle is due a summary log.
    pub fn finish_cycle(&mut self, cycle_start: Instant) -> bool {
        self.last_cycle_duration_ms = cycle_start.elapsed().as_millis() as u64;
        self.cycles_run += 1;
        self.log_interval_cycles > 0 && self.cycles_run.is_multiple_of(self.log_interval_cycles)
    }

    pub fn exits_total(&self) -> u64 {
        self.exits_stop_loss + self.exits_trailing_stop + self.exits_take_profit + self.exits_external
    }

    /// Overall win rate (0-100%)
    pub fn overall_win_rate(&self) -> f64 {
        let total = self.winning_trades + self.losing_trades;
        if total == 0 {
            return 0.0;
        }
        (self.winning_trades as f64 / total as f64) * 100.0
    }

    /// Rolling average P&L from the last 20 exits
    pub fn recent_avg_pnl(&self) -> f64 {
        if self.recent_pnl.is_empty() {
            return 0.0;
        }
        self.recent_pnl.iter().sum::<f64>() / self.recent_pnl.len() as f64
    }

    /// Emit one structured summary, including per-stage pass rates
    pub fn log_metrics(&self, stages: &BTreeMap<StageName, StageCounts>) {
        let stage_summary = stages
            .iter()
            .map(|(name, c)| {
                format!(
                    "{}={}/{} ({:.0}%)",
                    name,
                    c.passes,
                    c.invocations,
                    c.pass_rate * 100.0
                )
            })
            .collect::<Vec<_>>()
            .join(", ");

        tracing::info!(
            cycles = self.cycles_run,
            decisions = self.decisions_evaluated,
            entries_approved = self.entries_approved,
            cooldown_rejections = self.cooldown_rejections,
            sizing_rejections = self.sizing_rejections,
            orders_filled = self.orders_filled,
            orders_failed = self.orders_failed,
            exits = self.exits_total(),
            realized_pnl = format!("{:.2}", self.realized_pnl),
            overall_win_rate = format!("{:.1}%", self.overall_win_rate()),
            recent_avg_pnl = format!("{:.2}", self.recent_avg_pnl()),
            last_cycle_ms = self.last_cycle_duration_ms,
            stages = %stage_summary,
            "Agent metrics summary"
        );
    }

    /// Serialize metrics to JSON for state persistence
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "cycles_run": self.cycles_run,
            "decisions_evaluated": self.decisions_evaluated,
            "entries_approved": self.entries_approved,
            "cooldown_rejections": self.cooldown_rejections,
            "sizing_rejections": self.sizing_rejections,
            "orders_filled": self.orders_filled,
            "orders_failed": self.orders_failed,
            "exits_stop_loss": self.exits_stop_loss,
            "exits_trailing_stop": self.exits_trailing_stop,
            "exits_take_profit": self.exits_take_profit,
            "exits_external": self.exits_external,
            "realized_pnl": self.realized_pnl,
            "winning_trades": self.winning_trades,
            "losing_trades": self.losing_trades,
        })
    }

    /// Restore counters from persisted JSON. Missing keys keep their value.
    pub fn restore_from_json(&mut self, json: &serde_json::Value) {
        let counters: [(&str, &mut u64); 13] = [
            ("cycles_run", &mut self.cycles_run),
            ("decisions_evaluated", &mut self.decisions_evaluated),
            ("entries_approved", &mut self.entries_approved),
            ("cooldown_rejections", &mut self.cooldown_rejections),
            ("sizing_rejections", &mut self.sizing_rejections),
            ("orders_filled", &mut self.orders_filled),
            ("orders_failed", &mut self.orders_failed),
            ("exits_stop_loss", &mut self.exits_stop_loss),
            ("exits_trailing_stop", &mut self.exits_trailing_stop),
            ("exits_take_profit", &mut self.exits_take_profit),
            ("exits_external", &mut self.exits_external),
            ("winning_trades", &mut self.winning_trades),
            ("losing_trades", &mut self.losing_trades),
        ];
        for (key, counter) in counters {
            if let Some(v) = json.get(key).and_then(|v| v.as_u64()) {
                *counter = v;
            }
        }
        if let Some(v) = json.get("realized_pnl").and_then(|v| v.as_f64()) {
            self.realized_pnl = v;
        }
        tracing::info!(
            "Restored metrics from persisted state (cycles={})",
            self.cycles_run
        );
    }
}
