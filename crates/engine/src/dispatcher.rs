//! Priority-ordered handler registry.
//!
//! Handlers are registered per [`EventKind`] and invoked highest priority
//! first; equal priorities keep registration order. A failing or panicking
//! handler is logged and counted, and dispatch moves on to the next one.

use anyhow::Result;
use async_trait::async_trait;
use cryptobot_core::{Event, EventKind};
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Adapts a synchronous closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Event) -> Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        (self.f)(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    priority: i32,
    handler: Arc<dyn EventHandler>,
}

/// Outcome of a single [`Dispatcher::dispatch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub handled: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub dispatched: u64,
    pub handled: u64,
    pub errors: u64,
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<EventKind, Vec<Registration>>>,
    next_id: AtomicU64,
    dispatched: AtomicU64,
    handled: AtomicU64,
    errors: AtomicU64,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        kind: EventKind,
        priority: i32,
        handler: Arc<dyn EventHandler>,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(%kind, priority, handler = handler.name(), "Handler registered");
        let mut handlers = self.handlers.write();
        let list = handlers.entry(kind).or_default();
        list.push(Registration {
            id,
            priority,
            handler,
        });
        // stable: equal priorities keep registration order
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
        id
    }

    /// Returns `true` if a handler with `id` was registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        for (kind, list) in handlers.iter_mut() {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                let removed = list.remove(pos);
                info!(%kind, handler = removed.handler.name(), "Handler unregistered");
                return true;
            }
        }
        false
    }

    #[must_use]
    pub fn has_handlers(&self, kind: EventKind) -> bool {
        self.handlers
            .read()
            .get(&kind)
            .is_some_and(|list| !list.is_empty())
    }

    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Invokes every handler registered for the event's kind.
    ///
    /// The registry is copied before any handler runs, so handlers may
    /// register or unregister without deadlocking.
    pub async fn dispatch(&self, event: &Event) -> DispatchReport {
        let kind = event.kind();
        let snapshot: Vec<(i32, Arc<dyn EventHandler>)> = self
            .handlers
            .read()
            .get(&kind)
            .map(|list| {
                list.iter()
                    .map(|r| (r.priority, Arc::clone(&r.handler)))
                    .collect()
            })
            .unwrap_or_default();

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let mut report = DispatchReport::default();
        if snapshot.is_empty() {
            debug!(%kind, "No handlers registered");
            return report;
        }

        for (priority, handler) in snapshot {
            match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => report.handled += 1,
                Ok(Err(err)) => {
                    report.errors += 1;
                    error!(
                        %kind,
                        priority,
                        handler = handler.name(),
                        event_id = %event.id(),
                        error = format!("{err:#}"),
                        "Event handler failed"
                    );
                }
                Err(_) => {
                    report.errors += 1;
                    error!(
                        %kind,
                        priority,
                        handler = handler.name(),
                        event_id = %event.id(),
                        "Event handler panicked"
                    );
                }
            }
        }

        self.handled.fetch_add(report.handled as u64, Ordering::Relaxed);
        self.errors.fetch_add(report.errors as u64, Ordering::Relaxed);
        report
    }

    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cryptobot_core::{EventMeta, KillSwitchEvent, MarketEvent, Severity};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn tick() -> Event {
        MarketEvent::tick(
            EventMeta::new(Uuid::new_v4(), Utc::now(), "test"),
            "BTCUSDT",
            dec!(100),
            dec!(1),
        )
        .into()
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &str) -> Arc<dyn EventHandler> {
        let log = Arc::clone(log);
        let label = label.to_string();
        Arc::new(FnHandler::new(label.clone(), move |_| {
            log.lock().push(label.clone());
            Ok(())
        }))
    }

    #[tokio::test]
    async fn test_handlers_run_in_priority_order() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register(EventKind::Market, 10, recorder(&log, "low"));
        dispatcher.register(EventKind::Market, 100, recorder(&log, "high"));
        dispatcher.register(EventKind::Market, 50, recorder(&log, "mid-1"));
        dispatcher.register(EventKind::Market, 50, recorder(&log, "mid-2"));

        let report = dispatcher.dispatch(&tick()).await;

        assert_eq!(report.handled, 4);
        assert_eq!(*log.lock(), vec!["high", "mid-1", "mid-2", "low"]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_siblings() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register(
            EventKind::Market,
            100,
            Arc::new(FnHandler::new("boom", |_| anyhow::bail!("handler exploded"))),
        );
        dispatcher.register(EventKind::Market, 10, recorder(&log, "after"));

        let report = dispatcher.dispatch(&tick()).await;

        assert_eq!(report, DispatchReport { handled: 1, errors: 1 });
        assert_eq!(*log.lock(), vec!["after"]);
        assert_eq!(dispatcher.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register(
            EventKind::Market,
            100,
            Arc::new(FnHandler::new("panics", |_| panic!("bad handler"))),
        );
        dispatcher.register(EventKind::Market, 10, recorder(&log, "after"));

        let report = dispatcher.dispatch(&tick()).await;

        assert_eq!(report.errors, 1);
        assert_eq!(report.handled, 1);
    }

    #[tokio::test]
    async fn test_no_handlers_is_not_an_error() {
        let dispatcher = Dispatcher::new();
        let event: Event = KillSwitchEvent {
            meta: EventMeta::new(Uuid::new_v4(), Utc::now(), "test"),
            reason: "manual".to_string(),
            triggered_by: "operator".to_string(),
            severity: Severity::Critical,
            auto_recovery: false,
        }
        .into();

        let report = dispatcher.dispatch(&event).await;

        assert_eq!(report, DispatchReport::default());
        assert!(!dispatcher.has_handlers(EventKind::KillSwitch));
        assert_eq!(dispatcher.stats().dispatched, 1);
    }

    #[tokio::test]
    async fn test_unregister_removes_only_that_handler() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = dispatcher.register(EventKind::Market, 10, recorder(&log, "first"));
        dispatcher.register(EventKind::Market, 10, recorder(&log, "second"));

        assert!(dispatcher.unregister(first));
        assert!(!dispatcher.unregister(first));
        dispatcher.dispatch(&tick()).await;

        assert_eq!(*log.lock(), vec!["second"]);
        assert_eq!(dispatcher.handler_count(EventKind::Market), 1);
    }
}
