//! The event-driven trading pipeline.
//!
//! Market ticks enter through [`EventLoop::publish`] and flow through the
//! [`StrategyAllocator`], [`RiskEngine`] and [`OrderExecutor`] as events.
//! The [`PositionMonitor`] runs alongside, closing positions whose stops or
//! targets are crossed. [`StatePersistence`] snapshots the ledger into any
//! [`cryptobot_core::Store`], with [`SqliteStore`] as the bundled backend.

pub mod allocator;
pub mod dispatcher;
pub mod event_loop;
pub mod executor;
pub mod monitor;
pub mod persistence;
pub mod queue;
pub mod risk;
pub mod sqlite_store;

pub use allocator::StrategyAllocator;
pub use dispatcher::{
    DispatchReport, Dispatcher, DispatcherStats, EventHandler, FnHandler, HandlerId,
};
pub use event_loop::{EventLoop, Pipeline, SharedStrategy};
pub use executor::{client_order_id, ExecutionMode, ExecutionReport, OrderExecutor};
pub use monitor::{ExitReason, ExitReport, PositionMonitor};
pub use persistence::{StatePersistence, DEFAULT_KEEP_LAST};
pub use queue::{EventQueue, QueueStats};
pub use risk::{RiskAssessment, RiskEngine};
pub use sqlite_store::SqliteStore;
