//! Single-worker event loop wiring the pipeline stages together.
//!
//! Each stage is a handler that publishes the next stage's event instead of
//! calling it, so the loop never recurses and work is processed strictly in
//! arrival order:
//!
//! ```text
//! Market ─► Signal ─► OrderIntent ─► RiskApproval ─► OrderSubmission
//!                                                  └► Fill ─► PositionUpdate
//! ```
//!
//! Fills are booked into the ledger before strategies see them.
//!
//! Handlers publish with [`EventQueue::try_put`]: a full queue drops the
//! event rather than blocking the only consumer.

use crate::allocator::StrategyAllocator;
use crate::dispatcher::{Dispatcher, EventHandler};
use crate::executor::OrderExecutor;
use crate::queue::EventQueue;
use crate::risk::RiskEngine;
use anyhow::Result;
use async_trait::async_trait;
use cryptobot_core::{Event, EventKind, EventLoopConfig, Strategy, TradingState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const MARKET_PRIORITY: i32 = 100;
pub const SIGNAL_PRIORITY: i32 = 90;
pub const ORDER_INTENT_PRIORITY: i32 = 80;
pub const RISK_APPROVAL_PRIORITY: i32 = 70;
pub const FILL_PRIORITY: i32 = 60;
pub const FILL_BOOKING_PRIORITY: i32 = 65;
pub const POSITION_UPDATE_PRIORITY: i32 = 50;
pub const KILL_SWITCH_PRIORITY: i32 = 200;

pub type SharedStrategy = Arc<tokio::sync::Mutex<dyn Strategy>>;

/// Components the loop routes events between.
pub struct Pipeline {
    pub state: Arc<TradingState>,
    pub strategies: Vec<SharedStrategy>,
    pub allocator: Arc<StrategyAllocator>,
    pub risk: Arc<RiskEngine>,
    pub executor: Arc<OrderExecutor>,
}

pub struct EventLoop {
    queue: Arc<EventQueue>,
    dispatcher: Arc<Dispatcher>,
    config: EventLoopConfig,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Builds the queue and dispatcher and registers the pipeline handlers.
    #[must_use]
    pub fn new(config: EventLoopConfig, pipeline: Pipeline) -> Self {
        let queue = Arc::new(EventQueue::new(config.queue_capacity));
        let dispatcher = Arc::new(Dispatcher::new());
        register_pipeline(&dispatcher, &queue, pipeline);
        Self {
            queue,
            dispatcher,
            config,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Enqueues without blocking. Returns `false` if the event was dropped.
    pub fn publish(&self, event: impl Into<Event>) -> bool {
        self.queue.try_put(event.into())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns the worker. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("Event loop already running");
            return false;
        }
        let worker = tokio::spawn(run(
            Arc::clone(&self.queue),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.running),
            self.config.clone(),
        ));
        *self.worker.lock() = Some(worker);
        info!("Event loop started");
        true
    }

    /// Clears the running flag and waits for the worker, aborting it after
    /// the shutdown timeout. Events still queued are discarded.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let abort = worker.abort_handle();
            if tokio::time::timeout(self.config.shutdown_timeout(), worker)
                .await
                .is_err()
            {
                warn!("Event loop did not stop in time, aborting worker");
                abort.abort();
            }
        }
        let stats = self.queue.stats();
        info!(
            enqueued = stats.enqueued,
            dequeued = stats.dequeued,
            dropped = stats.dropped,
            discarded = stats.len,
            "Event loop stopped"
        );
    }

    /// Dispatches queued events on the caller's task until the queue is
    /// empty. For replays and tests that drive the loop without a worker.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        while let Some(event) = self.queue.try_get() {
            self.dispatcher.dispatch(&event).await;
            processed += 1;
        }
        processed
    }
}

async fn run(
    queue: Arc<EventQueue>,
    dispatcher: Arc<Dispatcher>,
    running: Arc<AtomicBool>,
    config: EventLoopConfig,
) {
    while running.load(Ordering::Acquire) {
        match queue.get(config.poll_interval()).await {
            Some(event) => {
                let report = dispatcher.dispatch(&event).await;
                if report.errors > 0 {
                    debug!(kind = %event.kind(), errors = report.errors, "Dispatch finished with errors");
                }
            }
            None => tokio::time::sleep(config.idle_sleep()).await,
        }
    }
    debug!("Event loop worker exiting");
}

fn register_pipeline(dispatcher: &Dispatcher, queue: &Arc<EventQueue>, pipeline: Pipeline) {
    let Pipeline {
        state,
        strategies,
        allocator,
        risk,
        executor,
    } = pipeline;

    dispatcher.register(
        EventKind::Market,
        MARKET_PRIORITY,
        Arc::new(MarketHandler {
            state: Arc::clone(&state),
            strategies: strategies.clone(),
            queue: Arc::clone(queue),
        }),
    );
    dispatcher.register(
        EventKind::Signal,
        SIGNAL_PRIORITY,
        Arc::new(SignalHandler {
            allocator,
            queue: Arc::clone(queue),
        }),
    );
    dispatcher.register(
        EventKind::OrderIntent,
        ORDER_INTENT_PRIORITY,
        Arc::new(OrderIntentHandler {
            risk,
            queue: Arc::clone(queue),
        }),
    );
    dispatcher.register(
        EventKind::RiskApproval,
        RISK_APPROVAL_PRIORITY,
        Arc::new(RiskApprovalHandler {
            executor: Arc::clone(&executor),
            queue: Arc::clone(queue),
        }),
    );
    dispatcher.register(
        EventKind::Fill,
        FILL_BOOKING_PRIORITY,
        Arc::new(FillHandler {
            executor,
            queue: Arc::clone(queue),
        }),
    );
    dispatcher.register(
        EventKind::Fill,
        FILL_PRIORITY,
        Arc::new(StrategyFeedback {
            strategies: strategies.clone(),
        }),
    );
    dispatcher.register(
        EventKind::PositionUpdate,
        POSITION_UPDATE_PRIORITY,
        Arc::new(StrategyFeedback { strategies }),
    );
    dispatcher.register(
        EventKind::KillSwitch,
        KILL_SWITCH_PRIORITY,
        Arc::new(KillSwitchHandler { state }),
    );
}

fn publish_all(queue: &EventQueue, events: impl IntoIterator<Item = Event>) -> usize {
    events
        .into_iter()
        .map(|event| queue.try_put(event))
        .filter(|queued| *queued)
        .count()
}

struct MarketHandler {
    state: Arc<TradingState>,
    strategies: Vec<SharedStrategy>,
    queue: Arc<EventQueue>,
}

#[async_trait]
impl EventHandler for MarketHandler {
    fn name(&self) -> &str {
        "market"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let Event::Market(market) = event else {
            return Ok(());
        };
        if !self.state.is_trading_enabled() {
            debug!(symbol = %market.symbol, "Trading disabled, skipping market event");
            return Ok(());
        }
        for strategy in &self.strategies {
            let mut strategy = strategy.lock().await;
            if !strategy.is_enabled() {
                continue;
            }
            match strategy.generate_signals(market).await {
                Ok(signals) => {
                    publish_all(&self.queue, signals.into_iter().map(Event::from));
                }
                Err(err) => {
                    // one failing strategy does not starve the others
                    error!(
                        strategy = strategy.name(),
                        symbol = %market.symbol,
                        error = format!("{err:#}"),
                        "Signal generation failed"
                    );
                }
            }
        }
        Ok(())
    }
}

struct SignalHandler {
    allocator: Arc<StrategyAllocator>,
    queue: Arc<EventQueue>,
}

#[async_trait]
impl EventHandler for SignalHandler {
    fn name(&self) -> &str {
        "signal"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let Event::Signal(signal) = event else {
            return Ok(());
        };
        let intents = self.allocator.process_signals(std::slice::from_ref(signal));
        publish_all(&self.queue, intents.into_iter().map(Event::from));
        Ok(())
    }
}

struct OrderIntentHandler {
    risk: Arc<RiskEngine>,
    queue: Arc<EventQueue>,
}

#[async_trait]
impl EventHandler for OrderIntentHandler {
    fn name(&self) -> &str {
        "order_intent"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let Event::OrderIntent(intent) = event else {
            return Ok(());
        };
        let assessment = self.risk.assess(intent);
        let kill_switch = assessment.kill_switch.map(Event::from);
        publish_all(
            &self.queue,
            std::iter::once(Event::from(assessment.approval)).chain(kill_switch),
        );
        Ok(())
    }
}

struct RiskApprovalHandler {
    executor: Arc<OrderExecutor>,
    queue: Arc<EventQueue>,
}

#[async_trait]
impl EventHandler for RiskApprovalHandler {
    fn name(&self) -> &str {
        "risk_approval"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let Event::RiskApproval(approval) = event else {
            return Ok(());
        };
        if !approval.approved {
            return Ok(());
        }
        if let Some(report) = self.executor.execute_approved_order(approval).await {
            publish_all(&self.queue, report.into_events());
        }
        Ok(())
    }
}

/// Books fills the executor has not already turned into positions.
struct FillHandler {
    executor: Arc<OrderExecutor>,
    queue: Arc<EventQueue>,
}

#[async_trait]
impl EventHandler for FillHandler {
    fn name(&self) -> &str {
        "fill"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let Event::Fill(fill) = event else {
            return Ok(());
        };
        if let Some(update) = self.executor.apply_fill(fill) {
            publish_all(&self.queue, std::iter::once(Event::from(update)));
        }
        Ok(())
    }
}

/// Forwards fills and position updates to strategies that track them.
struct StrategyFeedback {
    strategies: Vec<SharedStrategy>,
}

#[async_trait]
impl EventHandler for StrategyFeedback {
    fn name(&self) -> &str {
        "strategy_feedback"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        for strategy in &self.strategies {
            let mut strategy = strategy.lock().await;
            let outcome = match event {
                Event::Fill(fill) => strategy.on_fill(fill).await,
                Event::PositionUpdate(update) => strategy.on_position_update(update).await,
                _ => Ok(()),
            };
            if let Err(err) = outcome {
                warn!(
                    strategy = strategy.name(),
                    kind = %event.kind(),
                    error = format!("{err:#}"),
                    "Strategy callback failed"
                );
            }
        }
        Ok(())
    }
}

struct KillSwitchHandler {
    state: Arc<TradingState>,
}

#[async_trait]
impl EventHandler for KillSwitchHandler {
    fn name(&self) -> &str {
        "kill_switch"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let Event::KillSwitch(kill) = event else {
            return Ok(());
        };
        self.state.set_trading_enabled(false);
        error!(
            reason = %kill.reason,
            triggered_by = %kill.triggered_by,
            severity = ?kill.severity,
            "KILL SWITCH: trading disabled"
        );
        Ok(())
    }
}
