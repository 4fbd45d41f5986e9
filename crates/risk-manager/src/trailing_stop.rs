use analysis_core::{Direction, PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingConfig {
    pub enabled: bool,
    /// Unrealized profit (percent of entry) that arms the trail
    pub activation_percent: f64,
    /// Distance kept behind the best price, percent of that price
    pub distance_percent: f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activation_percent: 1.0,
            distance_percent: 0.5,
        }
    }
}

impl TrailingConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if !(self.activation_percent.is_finite() && self.activation_percent >= 0.0) {
            return Err(PipelineError::config(format!(
                "trailing activation percent must be non-negative, got {}",
                self.activation_percent
            )));
        }
        if !(self.distance_percent > 0.0 && self.distance_percent < 100.0) {
            return Err(PipelineError::config(format!(
                "trailing distance percent must be in (0, 100), got {}",
                self.distance_percent
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    External,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::External => "external",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "reason", rename_all = "snake_case")]
pub enum TrailingPhase {
    /// Fixed stop and target only
    Initial,
    /// Activation threshold reached
    Armed,
    /// Stop has moved at least once
    Trailing,
    Closed(ExitReason),
}

/// What one price update did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopEvent {
    Unchanged,
    Armed { stop: f64 },
    Tightened { previous: f64, stop: f64 },
    Closed { reason: ExitReason, price: f64 },
}

/// Protective stop of one position. The stop only ever moves in the
/// position's favor; `Closed` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingStop {
    direction: Direction,
    entry_price: f64,
    take_profit: f64,
    config: TrailingConfig,
    best_price: f64,
    current_stop: f64,
    phase: TrailingPhase,
}

impl TrailingStop {
    pub fn new(
        direction: Direction,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        config: TrailingConfig,
    ) -> PipelineResult<Self> {
        if !direction.is_directional() {
            return Err(PipelineError::Validation(
                "trailing stop needs a LONG or SHORT position".to_string(),
            ));
        }
        if !(entry_price.is_finite() && entry_price > 0.0) {
            return Err(PipelineError::Validation(format!(
                "entry price must be positive, got {}",
                entry_price
            )));
        }
        let sign = direction.sign();
        if (entry_price - stop_loss) * sign <= 0.0 {
            return Err(PipelineError::Validation(format!(
                "stop {} is not on the losing side of entry {} for {}",
                stop_loss, entry_price, direction
            )));
        }
        if (take_profit - entry_price) * sign <= 0.0 {
            return Err(PipelineError::Validation(format!(
                "take-profit {} is not on the winning side of entry {} for {}",
                take_profit, entry_price, direction
            )));
        }

        Ok(Self {
            direction,
            entry_price,
            take_profit,
            config,
            best_price: entry_price,
            current_stop: stop_loss,
            phase: TrailingPhase::Initial,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn current_stop(&self) -> f64 {
        self.current_stop
    }

    pub fn take_profit(&self) -> f64 {
        self.take_profit
    }

    pub fn best_price(&self) -> f64 {
        self.best_price
    }

    pub fn phase(&self) -> TrailingPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, TrailingPhase::Closed(_))
    }

    /// Feed one price. Exits are checked against the stop in force before
    /// this update, then the best price and the stop are advanced.
    pub fn on_price(&mut self, price: f64) -> StopEvent {
        if self.is_closed() || !price.is_finite() {
            return StopEvent::Unchanged;
        }
        let sign = self.direction.sign();

        if (price - self.current_stop) * sign <= 0.0 {
            let reason = match self.phase {
                TrailingPhase::Initial => ExitReason::StopLoss,
                _ => ExitReason::TrailingStop,
            };
            return self.close(reason, price);
        }
        if (price - self.take_profit) * sign >= 0.0 {
            return self.close(ExitReason::TakeProfit, price);
        }

        if (price - self.best_price) * sign > 0.0 {
            self.best_price = price;
        }

        if !self.config.enabled {
            return StopEvent::Unchanged;
        }

        let mut armed = false;
        if self.phase == TrailingPhase::Initial {
            let profit_percent = (self.best_price - self.entry_price) * sign / self.entry_price * 100.0;
            if profit_percent < self.config.activation_percent {
                return StopEvent::Unchanged;
            }
            self.phase = TrailingPhase::Armed;
            armed = true;
        }

        let candidate = self.best_price * (1.0 - sign * self.config.distance_percent / 100.0);
        if (candidate - self.current_stop) * sign > 0.0 {
            let previous = self.current_stop;
            self.current_stop = candidate;
            self.phase = TrailingPhase::Trailing;
            return StopEvent::Tightened {
                previous,
                stop: candidate,
            };
        }

        if armed {
            StopEvent::Armed {
                stop: self.current_stop,
            }
        } else {
            StopEvent::Unchanged
        }
    }

    /// Position closed outside the engine (manual exit, liquidation, ...)
    pub fn close_external(&mut self, price: f64) -> StopEvent {
        if self.is_closed() {
            return StopEvent::Unchanged;
        }
        self.close(ExitReason::External, price)
    }

    fn close(&mut self, reason: ExitReason, price: f64) -> StopEvent {
        self.phase = TrailingPhase::Closed(reason);
        StopEvent::Closed { reason, price }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn long() -> TrailingStop {
        TrailingStop::new(Direction::Long, 100.0, 98.0, 110.0, TrailingConfig::default()).unwrap()
    }

    fn short() -> TrailingStop {
        TrailingStop::new(Direction::Short, 100.0, 102.0, 90.0, TrailingConfig::default()).unwrap()
    }

    #[test]
    fn test_stays_initial_below_activation() {
        let mut stop = long();
        assert_eq!(stop.on_price(100.5), StopEvent::Unchanged);
        assert_eq!(stop.phase(), TrailingPhase::Initial);
        assert_eq!(stop.current_stop(), 98.0);
    }

    #[test]
    fn test_long_arms_and_trails() {
        let mut stop = long();

        // +1% arms the trail and puts the stop 0.5% under 101
        match stop.on_price(101.0) {
            StopEvent::Tightened { previous, stop: new_stop } => {
                assert_eq!(previous, 98.0);
                assert_relative_eq!(new_stop, 100.495, epsilon = 1e-9);
            }
            other => panic!("expected Tightened, got {:?}", other),
        }
        assert_eq!(stop.phase(), TrailingPhase::Trailing);

        // Pullback above the stop leaves it alone
        assert_eq!(stop.on_price(100.8), StopEvent::Unchanged);
        assert_relative_eq!(stop.current_stop(), 100.495, epsilon = 1e-9);

        stop.on_price(104.0);
        assert_relative_eq!(stop.current_stop(), 103.48, epsilon = 1e-9);

        assert_eq!(
            stop.on_price(103.4),
            StopEvent::Closed {
                reason: ExitReason::TrailingStop,
                price: 103.4
            }
        );
        assert!(stop.is_closed());
    }

    #[test]
    fn test_armed_without_tightening_when_trail_is_wide() {
        let config = TrailingConfig {
            enabled: true,
            activation_percent: 1.0,
            distance_percent: 5.0,
        };
        let mut stop = TrailingStop::new(Direction::Long, 100.0, 98.0, 110.0, config).unwrap();

        // 101 * 0.95 = 95.95 would loosen the 98 stop
        assert_eq!(stop.on_price(101.0), StopEvent::Armed { stop: 98.0 });
        assert_eq!(stop.phase(), TrailingPhase::Armed);
        assert_eq!(stop.current_stop(), 98.0);
    }

    #[test]
    fn test_short_trails_downward() {
        let mut stop = short();
        stop.on_price(98.0);
        assert_relative_eq!(stop.current_stop(), 98.49, epsilon = 1e-9);

        // Bounce that stays under the stop
        assert_eq!(stop.on_price(98.3), StopEvent::Unchanged);
        assert_relative_eq!(stop.current_stop(), 98.49, epsilon = 1e-9);

        assert!(matches!(
            stop.on_price(98.6),
            StopEvent::Closed {
                reason: ExitReason::TrailingStop,
                ..
            }
        ));
    }

    #[test]
    fn test_initial_stop_and_target_exits() {
        let mut stop = long();
        assert_eq!(
            stop.on_price(97.5),
            StopEvent::Closed {
                reason: ExitReason::StopLoss,
                price: 97.5
            }
        );

        let mut stop = long();
        assert_eq!(
            stop.on_price(110.0),
            StopEvent::Closed {
                reason: ExitReason::TakeProfit,
                price: 110.0
            }
        );
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut stop = long();
        stop.close_external(100.2);
        assert_eq!(stop.phase(), TrailingPhase::Closed(ExitReason::External));
        assert_eq!(stop.on_price(105.0), StopEvent::Unchanged);
        assert_eq!(stop.close_external(99.0), StopEvent::Unchanged);
        assert_eq!(stop.current_stop(), 98.0);
    }

    #[test]
    fn test_disabled_trail_keeps_fixed_stop() {
        let config = TrailingConfig {
            enabled: false,
            ..Default::default()
        };
        let mut stop = TrailingStop::new(Direction::Long, 100.0, 98.0, 110.0, config).unwrap();
        stop.on_price(105.0);
        assert_eq!(stop.current_stop(), 98.0);
        assert_eq!(stop.phase(), TrailingPhase::Initial);
    }

    #[test]
    fn test_stop_is_monotonic_over_a_price_path() {
        let path: Vec<f64> = (0..400)
            .map(|i| {
                let t = i as f64;
                1.0 + 0.0004 * t + 0.006 * (t / 7.0).sin()
            })
            .collect();

        let mut long = TrailingStop::new(Direction::Long, 100.0, 97.0, 200.0, TrailingConfig::default()).unwrap();
        let mut short = TrailingStop::new(Direction::Short, 100.0, 103.0, 50.0, TrailingConfig::default()).unwrap();

        let mut last_long = long.current_stop();
        let mut last_short = short.current_stop();
        for factor in &path {
            long.on_price(100.0 * factor);
            short.on_price(100.0 / factor);
            assert!(long.current_stop() >= last_long);
            assert!(short.current_stop() <= last_short);
            last_long = long.current_stop();
            last_short = short.current_stop();
        }
        assert!(last_long > 97.0);
        assert!(last_short < 103.0);
    }

    #[test]
    fn test_rejects_inverted_levels() {
        assert!(TrailingStop::new(Direction::Long, 100.0, 101.0, 110.0, TrailingConfig::default()).is_err());
        assert!(TrailingStop::new(Direction::Short, 100.0, 102.0, 105.0, TrailingConfig::default()).is_err());
        assert!(TrailingStop::new(Direction::Neutral, 100.0, 98.0, 110.0, TrailingConfig::default()).is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(TrailingConfig::default().validate().is_ok());
        assert!(TrailingConfig {
            distance_percent: 0.0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
