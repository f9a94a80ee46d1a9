use crate::replay::CsvReplay;
use anyhow::{Context, Result};
use chrono::Utc;
use cryptobot_core::{
    AppConfig, DataProvider, ManualClock, StateSnapshot, Store, TradingMode, TradingState,
};
use cryptobot_engine::{
    EventLoop, ExecutionMode, OrderExecutor, Pipeline, PositionMonitor, RiskEngine,
    SharedStrategy, SqliteStore, StatePersistence, StrategyAllocator, DEFAULT_KEEP_LAST,
};
use cryptobot_exchange::RetryPolicy;
use cryptobot_strategy::{MaCrossoverConfig, MaCrossoverStrategy};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a replay run.
#[derive(Debug)]
pub struct ReplaySummary {
    pub ticks: usize,
    pub events_processed: usize,
    pub exits: usize,
    pub snapshot: StateSnapshot,
}

struct Persistence {
    store: Arc<SqliteStore>,
    state: StatePersistence,
}

impl Persistence {
    async fn open(config: &AppConfig) -> Result<Option<Self>> {
        if !config.database.enabled {
            return Ok(None);
        }
        let store = Arc::new(
            SqliteStore::connect(&config.database)
                .await
                .context("Failed to open state database")?,
        );
        let state = StatePersistence::new(Arc::clone(&store) as Arc<dyn Store>).await?;
        Ok(Some(Self { store, state }))
    }

    async fn close(self, state: &TradingState) -> Result<()> {
        let id = self.state.save_state(state).await?;
        self.state.cleanup_old_snapshots(DEFAULT_KEEP_LAST).await?;
        self.state.flush(FLUSH_TIMEOUT).await?;
        self.store.close(FLUSH_TIMEOUT).await?;
        info!(snapshot_id = %id, "Final state snapshot saved");
        Ok(())
    }
}

/// Wires the paper pipeline and replays every bar through it.
///
/// Each tick is fully drained before the position monitor checks exits, so
/// a run is deterministic for a given file and configuration.
pub async fn run_replay(config: AppConfig, mut replay: CsvReplay) -> Result<ReplaySummary> {
    anyhow::ensure!(!replay.is_empty(), "Replay file contains no bars");
    if config.trading.mode == TradingMode::Live {
        warn!("Replays never reach the exchange; running in paper mode");
    }

    let clock = Arc::new(ManualClock::new(replay.start().unwrap_or_else(Utc::now)));
    let state = Arc::new(TradingState::new(
        config.trading.initial_cash,
        Arc::clone(&clock) as _,
    ));

    let persistence = Persistence::open(&config).await?;
    if let Some(p) = &persistence {
        if p.state.restore_latest_state(&state).await? {
            info!(cash = %state.cash(), "Resumed from saved state");
        }
    }

    let strategies = build_strategies(&config, &replay.symbols())?;
    info!(
        strategies = strategies.len(),
        bars = replay.len(),
        "Starting paper replay"
    );

    let pipeline = Pipeline {
        state: Arc::clone(&state),
        strategies,
        allocator: Arc::new(StrategyAllocator::new(
            Arc::clone(&state),
            config.allocator.clone(),
            &config.risk,
            config.trading.taker_fee,
            config.strategies.clone(),
        )),
        risk: Arc::new(RiskEngine::new(
            Arc::clone(&state),
            config.risk.clone(),
            &config.circuit_breaker,
            &config.allocator,
        )),
        executor: Arc::new(OrderExecutor::new(
            Arc::clone(&state),
            ExecutionMode::Paper,
            &config.trading,
            RetryPolicy::from_config(&config.retry),
        )),
    };
    let event_loop = EventLoop::new(config.event_loop.clone(), pipeline);
    let monitor = PositionMonitor::new(Arc::clone(&state), config.trading.taker_fee);

    let mut prices: HashMap<String, Decimal> = HashMap::new();
    let mut summary_ticks = 0;
    let mut events_processed = 0;
    let mut exits = 0;

    while let Some(tick) = replay.next_event().await? {
        clock.set(tick.meta.timestamp);
        prices.insert(tick.symbol.clone(), tick.price);
        summary_ticks += 1;

        if !event_loop.publish(tick) {
            warn!("Tick dropped by a full queue");
        }
        events_processed += event_loop.drain().await;

        for exit in monitor.check_positions(&prices) {
            info!(
                symbol = %exit.symbol,
                reason = %exit.exit_reason,
                pnl = %exit.realized_pnl,
                "Position closed"
            );
            exits += 1;
            event_loop.publish(exit.update);
        }
        events_processed += event_loop.drain().await;
    }

    if let Some(p) = persistence {
        p.close(&state).await?;
    }

    Ok(ReplaySummary {
        ticks: summary_ticks,
        events_processed,
        exits,
        snapshot: state.snapshot(),
    })
}

/// One crossover instance per replayed symbol, all sharing the configured
/// `ma_crossover` entry.
fn build_strategies(config: &AppConfig, symbols: &[String]) -> Result<Vec<SharedStrategy>> {
    let base = MaCrossoverConfig::default();
    let enabled = config
        .strategies
        .get(&base.name)
        .map_or(true, |s| s.enabled);

    symbols
        .iter()
        .map(|symbol| {
            let strategy = MaCrossoverStrategy::new(
                symbol.clone(),
                MaCrossoverConfig {
                    enabled,
                    ..base.clone()
                },
            )?;
            Ok(Arc::new(tokio::sync::Mutex::new(strategy)) as SharedStrategy)
        })
        .collect()
}
