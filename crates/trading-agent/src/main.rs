use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use analysis_orchestrator::EntryPipeline;
use anyhow::{Context, Result};
use dashmap::DashMap;
use ml_client::{Adjudicator, HttpAdjudicator, WeightedModel};
use risk_manager::{CooldownTracker, PositionBook, StateStore};
use technical_analysis::SnapshotBuilder;
use tokio::signal::unix::SignalKind;
use tokio::sync::Mutex;
use tokio::time;

mod config;
mod cycle;
mod exchange;
mod feed;
mod metrics;

use config::AgentConfig;
use cycle::Agent;
use exchange::{MarkBoard, PaperExecutor, StaticExchangeInfo};
use feed::ReplayFeed;
use metrics::AgentMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting entry pipeline agent (paper mode)");

    // 2. Load configuration (validation errors are fatal)
    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Watchlist: {}", config.watchlist.join(", "));
    tracing::info!("  Scan interval: {} seconds", config.scan_interval_seconds);
    tracing::info!("  Min confidence: {:.0}%", config.pipeline.min_confidence * 100.0);
    tracing::info!("  Min risk/reward: {:.2}", config.pipeline.min_risk_reward);
    tracing::info!(
        "  Stages: ml={} price_action={} htf={} ai={} ({:?})",
        config.pipeline.ml_enabled,
        config.pipeline.price_action_enabled,
        config.pipeline.htf_enabled,
        config.pipeline.ai_enabled,
        config.pipeline.ai_mode
    );
    tracing::info!(
        "  Cooldown: {} minutes ({:?})",
        config.cooldown.window.num_minutes(),
        config.cooldown.scope
    );
    tracing::info!("  Sizing: {:?} at {}x leverage", config.sizing.mode, config.leverage);

    // 3. Initialize DB state store
    sqlx::any::install_default_drivers();
    let db_pool = sqlx::AnyPool::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    let store = StateStore::new(db_pool.clone());
    store.init_tables().await?;
    sqlx::query("SELECT 1")
        .execute(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Database connectivity check failed: {}", e))?;
    tracing::info!("Startup check: database OK");

    // 4. Build the pipeline
    let models = load_models(&config).await?;
    let adjudicator = build_adjudicator(&config).await?;
    let pipeline = EntryPipeline::new(config.pipeline.clone(), models, adjudicator)?;
    let enabled: Vec<String> = pipeline
        .stages()
        .iter()
        .filter(|s| s.is_enabled())
        .map(|s| s.name().to_string())
        .collect();
    tracing::info!("Entry pipeline ready (gating stages: {})", enabled.join(", "));

    // 5. Restore durable state
    let cooldown = CooldownTracker::new(config.cooldown.clone(), Some(store.clone()));
    cooldown.restore().await;
    let positions = PositionBook::new(config.trailing, Some(store.clone()));
    positions.restore().await;

    let mut agent_metrics = AgentMetrics::new(config.metrics_log_interval_cycles);
    match store.load_metrics().await {
        Ok(Some(saved)) => agent_metrics.restore_from_json(&saved),
        Ok(None) => {}
        Err(e) => tracing::warn!("Failed to load persisted metrics: {}", e),
    }

    // 6. Paper collaborators
    let marks: MarkBoard = Arc::new(DashMap::new());
    let exchange = match &config.exchange_info_file {
        Some(path) => StaticExchangeInfo::load(path, config.paper_balance, marks.clone()).await?,
        None => StaticExchangeInfo::new(HashMap::new(), config.paper_balance, marks.clone()),
    };
    let feed = ReplayFeed::new(
        SnapshotBuilder::new(config.indicators.clone()),
        config.primary_timeframe,
        config.higher_timeframe,
        config.replay_window,
        marks,
    );
    let loaded = feed
        .load(&config.replay_dir, &config.watchlist, config.replay_warmup)
        .await?;
    tracing::info!(
        "Replay feed loaded {} of {} symbols from {}",
        loaded,
        config.watchlist.len(),
        config.replay_dir.display()
    );
    for symbol in &config.watchlist {
        tracing::debug!("  {}: {} bars to replay", symbol, feed.remaining(symbol).await);
    }

    let agent = Agent {
        pipeline,
        cooldown,
        positions,
        feed: Arc::new(feed),
        exchange: Arc::new(exchange),
        executor: Arc::new(PaperExecutor),
        sizing: config.sizing.clone(),
        leverage: config.leverage,
        watchlist: config.watchlist.clone(),
        metrics: Mutex::new(agent_metrics),
        store: Some(store),
    };

    tracing::info!(
        "Agent is now running. Scanning every {}s. Press Ctrl+C to stop.",
        config.scan_interval_seconds
    );

    // Main loop with graceful shutdown (SIGINT + SIGTERM)
    let mut interval = time::interval(Duration::from_secs(config.scan_interval_seconds));
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut shutdown => break,
        }

        // A signal mid-cycle drops the cycle; steps it already committed stay committed.
        tokio::select! {
            _ = agent.run_cycle() => {}
            _ = &mut shutdown => {
                tracing::warn!("Shutdown signal received mid-cycle, abandoning it");
                break;
            }
        }

        // Persist metrics after each cycle
        agent.persist_metrics().await;
    }

    tracing::info!("Shutdown signal received, exiting gracefully...");
    agent.persist_metrics().await;
    agent.log_summary().await;
    if agent.cooldown.is_degraded() || agent.positions.is_degraded() {
        tracing::warn!("State store was degraded during this run; some state was kept in memory only");
    }

    tracing::info!("Trading agent shut down.");
    Ok(())
}

async fn load_models(config: &AgentConfig) -> Result<Vec<WeightedModel>> {
    let Some(path) = &config.ml_models_file else {
        return Ok(Vec::new());
    };
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading ML models {}", path.display()))?;
    let models = ml_client::load_models(&json)
        .with_context(|| format!("parsing ML models {}", path.display()))?;
    tracing::info!("Loaded {} ML models from {}", models.len(), path.display());
    Ok(models)
}

async fn build_adjudicator(config: &AgentConfig) -> Result<Option<Arc<dyn Adjudicator>>> {
    if !config.pipeline.ai_enabled {
        return Ok(None);
    }
    let (Some(url), Some(api_key)) = (&config.ai_validator_url, &config.ai_validator_api_key) else {
        anyhow::bail!("AI validator enabled without AI_VALIDATOR_URL / AI_VALIDATOR_API_KEY");
    };
    let client = HttpAdjudicator::new(url.clone(), api_key.clone(), config.pipeline.ai_retry.timeout)?;

    // warn-only: the failure policy decides what an unreachable service means
    match client.health_check().await {
        Ok(()) => tracing::info!("Startup check: AI adjudicator OK ({})", url),
        Err(e) => tracing::warn!(
            "Startup check: AI adjudicator unreachable ({}), {} applies",
            e,
            config.pipeline.ai_failure_policy.as_str()
        ),
    }
    Ok(Some(Arc::new(client)))
}
