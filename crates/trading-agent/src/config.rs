use std::env;
use std::path::PathBuf;
use std::time::Duration;

use analysis_core::{PipelineError, PipelineResult, Timeframe};
use analysis_orchestrator::{parse_stage_weights, AiMode, LevelParams, PipelineConfig};
use anyhow::{Context, Result};
use ml_client::{FailurePolicy, MlParams, RetryPolicy};
use multi_timeframe::HtfParams;
use position_sizer::SizingConfig;
use risk_manager::{CooldownConfig, CooldownScope, TrailingConfig};
use technical_analysis::{IndicatorParams, PriceActionParams, TrendAverage};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    // Entry pipeline
    pub pipeline: PipelineConfig,
    pub indicators: IndicatorParams,
    pub ml_models_file: Option<PathBuf>,
    pub ai_validator_url: Option<String>,
    pub ai_validator_api_key: Option<String>,

    // Post-decision controls
    pub cooldown: CooldownConfig,
    pub sizing: SizingConfig,
    pub leverage: f64,
    pub trailing: TrailingConfig,

    // Runtime
    pub scan_interval_seconds: u64,
    pub watchlist: Vec<String>,
    pub database_url: String,
    pub primary_timeframe: Timeframe,
    pub higher_timeframe: Timeframe,
    pub replay_dir: PathBuf,
    pub replay_window: usize,
    pub replay_warmup: usize,
    pub exchange_info_file: Option<PathBuf>,
    pub paper_balance: f64,
    pub metrics_log_interval_cycles: u64,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let parse = |key: &str, default: &str| -> Result<f64> {
            var(key, default)
                .trim()
                .parse::<f64>()
                .with_context(|| format!("{} is not a number", key))
        };
        let flag = |key: &str, default: &str| -> Result<bool> {
            var(key, default)
                .trim()
                .parse::<bool>()
                .with_context(|| format!("{} must be true or false", key))
        };
        let count = |key: &str, default: &str| -> Result<u64> {
            var(key, default)
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{} is not a whole number", key))
        };

        let small = |key: &str, default: &str| -> Result<u32> {
            let value = count(key, default)?;
            u32::try_from(value).map_err(|_| {
                PipelineError::config(format!("{} {} is out of range", key, value)).into()
            })
        };
        let size = |key: &str, default: &str| -> Result<usize> {
            let value = count(key, default)?;
            usize::try_from(value).map_err(|_| {
                PipelineError::config(format!("{} {} is out of range", key, value)).into()
            })
        };

        let ai_enabled = flag("AI_VALIDATOR_ENABLED", "false")?;
        let ai_mode = AiMode::parse(&var("AI_VALIDATOR_MODE", "borderline")).ok_or_else(|| {
            PipelineError::config("AI_VALIDATOR_MODE must be 'all' or 'borderline'")
        })?;
        let ai_failure_policy = FailurePolicy::parse(&var("AI_FAILURE_POLICY", "fail_closed"))
            .ok_or_else(|| {
                PipelineError::config("AI_FAILURE_POLICY must be 'fail_open' or 'fail_closed'")
            })?;

        let pipeline = PipelineConfig {
            ml_enabled: flag("ML_ENABLED", "true")?,
            ml: MlParams {
                neutral_zone: parse("ML_NEUTRAL_ZONE", "0.05")?,
                confidence_threshold: parse("ML_CONFIDENCE_THRESHOLD", "0.55")?,
            },
            price_action_enabled: flag("PRICE_ACTION_ENABLED", "true")?,
            price_action: PriceActionParams {
                min_score: small("MIN_PRICE_ACTION_SCORE", "5")?,
                ..Default::default()
            },
            htf_enabled: flag("HTF_ENABLED", "true")?,
            htf: HtfParams {
                require_alignment: flag("REQUIRE_HTF_ALIGNMENT", "true")?,
                ..Default::default()
            },
            ai_enabled,
            ai_mode,
            ai_borderline_band: parse("AI_BORDERLINE_BAND", "0.10")?,
            ai_retry: RetryPolicy {
                timeout: Duration::from_millis(count("AI_TIMEOUT_MS", "8000")?),
                max_retries: small("AI_MAX_RETRIES", "2")?,
                backoff: Duration::from_millis(count("AI_RETRY_BACKOFF_MS", "500")?),
            },
            ai_failure_policy,
            min_confidence: parse("MIN_CONFIDENCE", "0.55")?,
            min_risk_reward: parse("MIN_RISK_REWARD", "1.5")?,
            stage_weights: parse_stage_weights(&var(
                "STAGE_WEIGHTS",
                "ml_ensemble=0.4,price_action=0.35,htf_alignment=0.25",
            ))?,
            levels: LevelParams {
                stop_atr_multiple: parse("STOP_ATR_MULTIPLE", "1.5")?,
                take_profit_atr_multiple: parse("TAKE_PROFIT_ATR_MULTIPLE", "3.0")?,
                stop_loss_percent: parse("STOP_LOSS_PERCENT", "2.0")?,
                take_profit_percent: parse("TAKE_PROFIT_PERCENT", "4.0")?,
            },
        };

        let (ai_validator_url, ai_validator_api_key) = if ai_enabled {
            (
                Some(lookup("AI_VALIDATOR_URL").context("AI_VALIDATOR_URL not set")?),
                Some(lookup("AI_VALIDATOR_API_KEY").context("AI_VALIDATOR_API_KEY not set")?),
            )
        } else {
            (lookup("AI_VALIDATOR_URL"), lookup("AI_VALIDATOR_API_KEY"))
        };

        let cooldown_minutes = count("COOLDOWN_MINUTES", "60")?;
        let window = i64::try_from(cooldown_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .ok_or_else(|| {
                PipelineError::config(format!("COOLDOWN_MINUTES {} is out of range", cooldown_minutes))
            })?;
        let cooldown = CooldownConfig {
            window,
            scope: CooldownScope::parse(&var("COOLDOWN_SCOPE", "same_direction")).ok_or_else(
                || PipelineError::config("COOLDOWN_SCOPE must be 'same_direction' or 'any_direction'"),
            )?,
        };

        let sizing = match var("SIZING_MODE", "percent").trim().to_ascii_lowercase().as_str() {
            "percent" => SizingConfig::percent(parse("POSITION_PERCENT", "10.0")?),
            "fixed" => SizingConfig::fixed(parse("FIXED_NOTIONAL", "100.0")?),
            other => {
                return Err(PipelineError::config(format!(
                    "SIZING_MODE must be 'percent' or 'fixed', got '{}'",
                    other
                ))
                .into())
            }
        };

        let timeframe = |key: &str, default: &str| -> Result<Timeframe> {
            let value = var(key, default);
            Timeframe::parse(&value)
                .ok_or_else(|| PipelineError::config(format!("{} '{}' is not a timeframe", key, value)))
                .map_err(Into::into)
        };

        let trend_average = TrendAverage::parse(&var("TREND_AVERAGE", "sma"))
            .ok_or_else(|| PipelineError::config("TREND_AVERAGE must be 'sma' or 'ema'"))?;

        let config = Self {
            pipeline,
            indicators: IndicatorParams {
                trend_average,
                ..Default::default()
            },
            ml_models_file: lookup("ML_MODELS_FILE").map(PathBuf::from),
            ai_validator_url,
            ai_validator_api_key,

            cooldown,
            sizing,
            leverage: parse("LEVERAGE", "1.0")?,
            trailing: TrailingConfig {
                enabled: flag("TRAILING_ENABLED", "true")?,
                activation_percent: parse("TRAILING_ACTIVATION_PERCENT", "1.0")?,
                distance_percent: parse("TRAILING_DISTANCE_PERCENT", "0.5")?,
            },

            scan_interval_seconds: count("SCAN_INTERVAL", "60")?,
            watchlist: var("WATCHLIST", "BTCUSDT,ETHUSDT")
                .split(',')
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            database_url: var("DATABASE_URL", "sqlite:trading_agent.db?mode=rwc"),
            primary_timeframe: timeframe("PRIMARY_TIMEFRAME", "15m")?,
            higher_timeframe: timeframe("HTF_TIMEFRAME", "4h")?,
            replay_dir: PathBuf::from(var("REPLAY_DIR", "./replay")),
            replay_window: size("REPLAY_WINDOW", "100")?,
            replay_warmup: size("REPLAY_WARMUP", "30")?,
            exchange_info_file: lookup("EXCHANGE_INFO_FILE").map(PathBuf::from),
            paper_balance: parse("PAPER_BALANCE", "1000.0")?,
            metrics_log_interval_cycles: count("METRICS_LOG_INTERVAL_CYCLES", "10")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> PipelineResult<()> {
        self.pipeline.validate()?;
        self.sizing.validate()?;
        self.trailing.validate()?;

        if !(self.leverage.is_finite() && self.leverage >= 1.0) {
            return Err(PipelineError::config(format!(
                "LEVERAGE must be at least 1, got {}",
                self.leverage
            )));
        }
        if self.scan_interval_seconds == 0 {
            return Err(PipelineError::config("SCAN_INTERVAL must be at least 1 second"));
        }
        if self.watchlist.is_empty() {
            return Err(PipelineError::config("WATCHLIST is empty"));
        }
        if self.higher_timeframe.to_minutes() <= self.primary_timeframe.to_minutes() {
            return Err(PipelineError::config(format!(
                "HTF_TIMEFRAME {} must be longer than PRIMARY_TIMEFRAME {}",
                self.higher_timeframe.name(),
                self.primary_timeframe.name()
            )));
        }
        if self.replay_window < 2 {
            return Err(PipelineError::config("REPLAY_WINDOW must be at least 2 bars"));
        }
        if !(self.paper_balance.is_finite() && self.paper_balance > 0.0) {
            return Err(PipelineError::config(format!(
                "PAPER_BALANCE must be positive, got {}",
                self.paper_balance
            )));
        }
        if self.pipeline.ml_enabled && self.ml_models_file.is_none() {
            tracing::warn!("ML_ENABLED without ML_MODELS_FILE: the ML stage will fail every symbol");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::StageName;
    use position_sizer::SizingMode;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AgentConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert!(config.pipeline.ml_enabled);
        assert!(!config.pipeline.ai_enabled);
        assert_eq!(config.pipeline.ai_mode, AiMode::Borderline);
        assert_eq!(config.pipeline.ai_failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.pipeline.ai_retry.timeout, Duration::from_millis(8000));
        assert_eq!(config.pipeline.stage_weights.get(&StageName::PriceAction), Some(&0.35));
        assert_eq!(config.cooldown.window, chrono::Duration::minutes(60));
        assert_eq!(config.cooldown.scope, CooldownScope::SameDirection);
        assert_eq!(config.sizing.mode, SizingMode::PercentOfBalance(10.0));
        assert_eq!(config.watchlist, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.primary_timeframe, Timeframe::Minute15);
        assert_eq!(config.higher_timeframe, Timeframe::Hour4);
        assert_eq!(config.scan_interval_seconds, 60);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("SIZING_MODE", "fixed"),
            ("FIXED_NOTIONAL", "250"),
            ("LEVERAGE", "5"),
            ("COOLDOWN_SCOPE", "any_direction"),
            ("COOLDOWN_MINUTES", "15"),
            ("WATCHLIST", " solusdt , BTCUSDT ,"),
            ("STAGE_WEIGHTS", "price_action=1,htf_alignment=1"),
            ("ML_ENABLED", "false"),
        ])
        .unwrap();

        assert_eq!(config.sizing.mode, SizingMode::FixedNotional(250.0));
        assert_eq!(config.leverage, 5.0);
        assert_eq!(config.cooldown.scope, CooldownScope::AnyDirection);
        assert_eq!(config.cooldown.window, chrono::Duration::minutes(15));
        assert_eq!(config.watchlist, vec!["SOLUSDT", "BTCUSDT"]);
        assert!(!config.pipeline.stage_weights.contains_key(&StageName::MlEnsemble));
    }

    #[test]
    fn test_ai_validator_requires_endpoint() {
        let err = load(&[("AI_VALIDATOR_ENABLED", "true")]).unwrap_err();
        assert!(err.to_string().contains("AI_VALIDATOR_URL"));

        let config = load(&[
            ("AI_VALIDATOR_ENABLED", "true"),
            ("AI_VALIDATOR_URL", "http://localhost:8010"),
            ("AI_VALIDATOR_API_KEY", "k"),
            ("AI_VALIDATOR_MODE", "all"),
            ("AI_FAILURE_POLICY", "fail_open"),
        ])
        .unwrap();
        assert_eq!(config.pipeline.ai_mode, AiMode::All);
        assert_eq!(config.pipeline.ai_failure_policy, FailurePolicy::FailOpen);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(load(&[("MIN_CONFIDENCE", "abc")]).is_err());
        assert!(load(&[("MIN_CONFIDENCE", "1.5")]).is_err());
        assert!(load(&[("ML_NEUTRAL_ZONE", "0.5")]).is_err());
        assert!(load(&[("LEVERAGE", "0.5")]).is_err());
        assert!(load(&[("SIZING_MODE", "kelly")]).is_err());
        assert!(load(&[("COOLDOWN_SCOPE", "forever")]).is_err());
        assert!(load(&[("STAGE_WEIGHTS", "ml_ensemble=-1")]).is_err());
        assert!(load(&[("PRIMARY_TIMEFRAME", "4h")]).is_err());
        assert!(load(&[("WATCHLIST", " , ")]).is_err());
    }

    #[test]
    fn test_out_of_range_integers_are_configuration_errors() {
        for (key, value) in [
            ("COOLDOWN_MINUTES", "9223372036854775808"),
            ("COOLDOWN_MINUTES", "9223372036854775807"),
            ("AI_MAX_RETRIES", "4294967296"),
            ("MIN_PRICE_ACTION_SCORE", "4294967301"),
        ] {
            let err = load(&[(key, value)]).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<PipelineError>(),
                    Some(PipelineError::Configuration(_))
                ),
                "{}={} gave {}",
                key,
                value,
                err
            );
        }
    }

    #[test]
    fn test_trend_average_selection() {
        assert_eq!(load(&[]).unwrap().indicators.trend_average, TrendAverage::Sma);
        let config = load(&[("TREND_AVERAGE", "EMA")]).unwrap();
        assert_eq!(config.indicators.trend_average, TrendAverage::Ema);
        assert!(load(&[("TREND_AVERAGE", "wma")]).is_err());
    }

    #[test]
    fn test_configuration_errors_keep_their_category() {
        let err = load(&[("POSITION_PERCENT", "0")]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(_))
        ));
    }
}
