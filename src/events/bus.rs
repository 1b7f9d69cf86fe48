//! # Ordered event bus.
//!
//! [`Bus`] is the producer-side handle; [`Dispatcher`] is the single consumer
//! that invokes handlers. Both share one unbounded FIFO
//! ([`tokio::sync::mpsc::unbounded_channel`]).
//!
//! ## Architecture
//! ```text
//! Producers (many):                               Dispatcher (one task):
//!   Orchestrator ──┐
//!   Agent 1 ───────┼─► validate ─► [ FIFO ] ─► for each event, in order:
//!   Agent N ───────┘      │                       for each handler of event.name
//!                         ▼                         (subscription order)
//!                   Diagnostics                       handler.handle(&event, &bus)
//!                  (rejected, dropped)
//! ```
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` validates and enqueues, it never waits for handlers.
//! - **Strict order**: one event at a time; every handler of event N returns before event N+1.
//! - **Per-producer order**: events from one producer are dispatched in publish order.
//! - **Isolation**: an `Err` or panic in one handler is logged and recorded; the loop goes on.
//! - **Registration is ordered**: `register`/`subscribe` travel through the same FIFO,
//!   so they take effect exactly between the events published before and after them.
//!
//! ## Shutdown
//! [`Bus::shutdown`] enqueues a stop marker. When the dispatcher reaches it, it
//! keeps dispatching until the FIFO is empty, so follow-ups published by
//! handlers during the drain are still delivered. Only then is the bus closed;
//! later publishes are dropped with a warning.
//!
//! ## Rejected events
//! `publish` is fire-and-forget: an event failing validation is dropped, logged
//! at `warn` and recorded once in [`Diagnostics`]. [`Bus::try_publish`] does the
//! same and also hands the [`ValidationError`] back to the caller.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::diagnostics::{Diagnostic, Diagnostics};
use super::event::Event;
use super::schema::Validator;
use crate::error::ValidationError;
use crate::handlers::{FnHandler, Handler};

/// Identifier of a handler registered on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

enum Command {
    Register(HandlerId, Box<dyn Handler>),
    Subscribe(String, HandlerId),
    Deliver(Event),
    Stop,
}

struct Shared {
    tx: mpsc::UnboundedSender<Command>,
    validator: Validator,
    diagnostics: Diagnostics,
    next_handler: AtomicU64,
    stop_requested: AtomicBool,
    closed: AtomicBool,
}

/// Producer-side handle of the bus. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    shared: Arc<Shared>,
}

impl Bus {
    /// Creates a bus gated by `validator` and its dispatcher.
    ///
    /// Events published before the dispatcher runs wait in the FIFO.
    pub fn new(validator: Validator) -> (Self, Dispatcher) {
        Self::with_diagnostics(validator, Diagnostics::new())
    }

    /// Like [`new`](Self::new), recording failures into `diagnostics`.
    pub fn with_diagnostics(validator: Validator, diagnostics: Diagnostics) -> (Self, Dispatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Self {
            shared: Arc::new(Shared {
                tx,
                validator,
                diagnostics,
                next_handler: AtomicU64::new(0),
                stop_requested: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        };
        let dispatcher = Dispatcher {
            rx,
            bus: bus.clone(),
            table: HashMap::new(),
            handlers: HashMap::new(),
            watchdog: None,
            dispatched: 0,
        };
        (bus, dispatcher)
    }

    /// Validator gating this bus.
    pub fn validator(&self) -> &Validator {
        &self.shared.validator
    }

    /// Out-of-band failure log.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.shared.diagnostics
    }

    /// Hands `handler` over to the dispatch loop and returns its id.
    ///
    /// The handler receives nothing until it is [`subscribe`](Self::subscribe)d.
    pub fn register(&self, handler: impl Handler) -> HandlerId {
        let id = HandlerId(self.shared.next_handler.fetch_add(1, Ordering::Relaxed));
        self.send(Command::Register(id, Box::new(handler)));
        id
    }

    /// Appends handler `id` to the subscribers of `event`.
    ///
    /// Subscribing the same handler twice makes it run twice per event.
    pub fn subscribe(&self, event: &str, id: HandlerId) -> Result<(), ValidationError> {
        if !self.shared.validator.is_registered(event) {
            return Err(ValidationError::UnknownEventName {
                event: event.to_string(),
            });
        }
        self.send(Command::Subscribe(event.to_string(), id));
        Ok(())
    }

    /// Subscribes `handler` to several events at once.
    pub fn subscribe_many(
        &self,
        events: &[&str],
        handler: impl Handler,
    ) -> Result<HandlerId, ValidationError> {
        if let Some(unknown) = events.iter().find(|e| !self.shared.validator.is_registered(e)) {
            return Err(ValidationError::UnknownEventName {
                event: (*unknown).to_string(),
            });
        }
        let id = self.register(handler);
        for event in events {
            self.send(Command::Subscribe((*event).to_string(), id));
        }
        Ok(id)
    }

    /// Registers a closure and subscribes it to `event`.
    pub fn subscribe_fn<F>(&self, event: &str, name: &'static str, f: F) -> Result<HandlerId, ValidationError>
    where
        F: FnMut(&Event, &Bus) -> anyhow::Result<()> + Send + 'static,
    {
        self.subscribe_many(&[event], FnHandler::new(name, f))
    }

    /// Validates and enqueues `event` (fire-and-forget).
    ///
    /// On validation failure the event is dropped, logged and recorded in [`Diagnostics`].
    pub fn publish(&self, event: Event) {
        let _ = self.try_publish(event);
    }

    /// Like [`publish`](Self::publish), but also returns the validation outcome.
    pub fn try_publish(&self, event: Event) -> Result<(), ValidationError> {
        if let Err(err) =
            self.shared
                .validator
                .validate(event.name(), event.payload(), event.correlation_key())
        {
            warn!(
                event = %event.name(),
                producer = %event.producer(),
                reason = err.as_label(),
                "dropping invalid event: {err}"
            );
            self.shared.diagnostics.record(Diagnostic::Rejected {
                producer: event.producer().to_string(),
                error: err.clone(),
            });
            return Err(err);
        }
        debug!(event = %event.name(), producer = %event.producer(), seq = event.seq(), "publish");
        self.send(Command::Deliver(event));
        Ok(())
    }

    /// Asks the dispatch loop to stop once the FIFO is drained.
    ///
    /// Commands queued before the call, and follow-ups published while the
    /// dispatcher drains, are still delivered.
    pub fn shutdown(&self) {
        if !self.shared.stop_requested.swap(true, Ordering::AcqRel) && !self.is_closed() {
            let _ = self.shared.tx.send(Command::Stop);
        }
    }

    /// True once the dispatcher has drained and stopped accepting events.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn send(&self, cmd: Command) {
        if self.is_closed() {
            if let Command::Deliver(ev) = &cmd {
                warn!(event = %ev.name(), producer = %ev.producer(), "bus closed; event dropped");
            }
            return;
        }
        if self.shared.tx.send(cmd).is_err() {
            warn!("bus dispatcher gone; command dropped");
        }
    }
}

/// Single consumer of the bus FIFO; owns the subscription table and every handler.
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<Command>,
    bus: Bus,
    table: HashMap<String, Vec<HandlerId>>,
    handlers: HashMap<HandlerId, Box<dyn Handler>>,
    watchdog: Option<Duration>,
    dispatched: u64,
}

impl Dispatcher {
    /// Logs (and records) handlers running longer than `threshold`.
    ///
    /// `Duration::ZERO` disables the watchdog.
    pub fn with_watchdog(mut self, threshold: Duration) -> Self {
        self.watchdog = (threshold > Duration::ZERO).then_some(threshold);
        self
    }

    /// Spawns the dispatch loop on its own task.
    pub fn spawn(self) -> JoinHandle<u64> {
        tokio::spawn(self.run())
    }

    /// Runs the dispatch loop until [`Bus::shutdown`]; returns the number of events dispatched.
    pub async fn run(mut self) -> u64 {
        info!("bus dispatch loop started");
        while let Some(cmd) = self.rx.recv().await {
            if matches!(cmd, Command::Stop) {
                break;
            }
            self.apply(cmd);
        }

        // Drain: deliver everything already queued, including follow-ups
        // published by handlers while draining, then refuse new commands.
        self.drain();
        self.bus.shared.closed.store(true, Ordering::Release);
        self.rx.close();
        self.drain();

        info!(dispatched = self.dispatched, "bus dispatch loop stopped");
        self.dispatched
    }

    fn drain(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            self.apply(cmd);
        }
    }

    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::Register(id, handler) => {
                debug!(handler = %handler.name(), "handler registered");
                self.handlers.insert(id, handler);
            }
            Command::Subscribe(event, id) => {
                self.table.entry(event).or_default().push(id);
            }
            Command::Deliver(event) => {
                self.dispatch(&event);
                self.dispatched += 1;
            }
            Command::Stop => {}
        }
    }

    fn dispatch(&mut self, event: &Event) {
        let Some(ids) = self.table.get(event.name()) else {
            debug!(event = %event.name(), "no subscriber");
            return;
        };
        let diagnostics = &self.bus.shared.diagnostics;

        for id in ids {
            let Some(handler) = self.handlers.get_mut(id) else {
                continue;
            };
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(event, &self.bus)));
            let elapsed = started.elapsed();

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(handler = %handler.name(), event = %event.name(), "handler failed: {err:#}");
                    diagnostics.record(Diagnostic::HandlerFailed {
                        handler: handler.name().to_string(),
                        event: event.name().to_string(),
                        error: format!("{err:#}"),
                    });
                }
                Err(panic_err) => {
                    let info = if let Some(msg) = panic_err.downcast_ref::<&'static str>() {
                        (*msg).to_string()
                    } else if let Some(msg) = panic_err.downcast_ref::<String>() {
                        msg.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    error!(handler = %handler.name(), event = %event.name(), "handler panicked: {info}");
                    diagnostics.record(Diagnostic::HandlerPanicked {
                        handler: handler.name().to_string(),
                        event: event.name().to_string(),
                        info,
                    });
                }
            }

            if self.watchdog.is_some_and(|threshold| elapsed > threshold) {
                warn!(
                    handler = %handler.name(),
                    event = %event.name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow handler stalls the bus"
                );
                diagnostics.record(Diagnostic::SlowHandler {
                    handler: handler.name().to_string(),
                    event: event.name().to_string(),
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{FieldShape, Schema};
    use serde_json::json;
    use std::sync::Mutex;

    fn validator() -> Validator {
        let mut v = Validator::new();
        v.register("Tick", Schema::new().field("n", FieldShape::Integer))
            .unwrap();
        v.register("Other", Schema::new()).unwrap();
        v
    }

    fn tick(n: i64, producer: &str) -> Event {
        Event::new("Tick", producer.to_string()).with_field("n", json!(n))
    }

    #[tokio::test]
    async fn single_producer_order_is_preserved() {
        let (bus, dispatcher) = Bus::new(validator());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe_fn("Tick", "recorder", move |ev, _| {
            sink.lock().unwrap().push(ev.field("n").and_then(|v| v.as_i64()).unwrap());
            Ok(())
        })
        .unwrap();

        for n in 0..200 {
            bus.publish(tick(n, "producer"));
        }
        bus.shutdown();
        dispatcher.run().await;

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn handlers_run_in_subscription_order_and_duplicates_repeat() {
        let (bus, dispatcher) = Bus::new(validator());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c1 = Arc::clone(&calls);
        let first = bus
            .subscribe_fn("Tick", "first", move |_, _| {
                c1.lock().unwrap().push("first");
                Ok(())
            })
            .unwrap();
        let c2 = Arc::clone(&calls);
        bus.subscribe_fn("Tick", "second", move |_, _| {
            c2.lock().unwrap().push("second");
            Ok(())
        })
        .unwrap();
        bus.subscribe("Tick", first).unwrap();

        bus.publish(tick(1, "p"));
        bus.shutdown();
        dispatcher.run().await;

        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "first"]);
    }

    #[tokio::test]
    async fn malformed_event_is_never_delivered() {
        let (bus, dispatcher) = Bus::new(validator());
        let delivered = Arc::new(Mutex::new(0usize));
        let d = Arc::clone(&delivered);
        bus.subscribe_fn("Tick", "counter", move |_, _| {
            *d.lock().unwrap() += 1;
            Ok(())
        })
        .unwrap();

        bus.publish(Event::new("Tick", "p"));
        bus.publish(Event::new("Tick", "p").with_field("n", json!("x")));
        bus.shutdown();
        dispatcher.run().await;

        assert_eq!(*delivered.lock().unwrap(), 0);
        assert_eq!(bus.diagnostics().count("event_rejected"), 2);
    }

    #[tokio::test]
    async fn try_publish_reports_synchronously() {
        let (bus, _dispatcher) = Bus::new(validator());
        let err = bus.try_publish(Event::new("Missing", "p")).unwrap_err();
        assert_eq!(err.as_label(), "unknown_event_name");
        assert_eq!(bus.diagnostics().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn failing_handler_does_not_affect_others() {
        let (bus, dispatcher) = Bus::new(validator());
        let after = Arc::new(Mutex::new(0usize));

        bus.subscribe_fn("Tick", "failing", |_, _| anyhow::bail!("boom"))
            .unwrap();
        bus.subscribe_fn("Tick", "panicking", |_, _| panic!("kaboom"))
            .unwrap();
        let a = Arc::clone(&after);
        bus.subscribe_fn("Tick", "healthy", move |_, _| {
            *a.lock().unwrap() += 1;
            Ok(())
        })
        .unwrap();

        bus.publish(tick(1, "p"));
        bus.publish(tick(2, "p"));
        bus.shutdown();
        let dispatched = dispatcher.run().await;

        assert_eq!(dispatched, 2);
        assert_eq!(*after.lock().unwrap(), 2);
        assert_eq!(bus.diagnostics().count("handler_failed"), 2);
        assert_eq!(bus.diagnostics().count("handler_panicked"), 2);
    }

    #[tokio::test]
    async fn subscribing_to_unknown_event_fails() {
        let (bus, _dispatcher) = Bus::new(validator());
        let err = bus
            .subscribe_fn("Nope", "x", |_, _| Ok(()))
            .unwrap_err();
        assert_eq!(err.as_label(), "unknown_event_name");
    }

    #[tokio::test]
    async fn handlers_can_publish_follow_ups() {
        let (bus, dispatcher) = Bus::new(validator());
        let other = Arc::new(Mutex::new(0usize));

        bus.subscribe_fn("Tick", "relay", |_, bus| {
            bus.publish(Event::new("Other", "relay"));
            Ok(())
        })
        .unwrap();
        let o = Arc::clone(&other);
        bus.subscribe_fn("Other", "sink", move |_, bus| {
            *o.lock().unwrap() += 1;
            bus.shutdown();
            Ok(())
        })
        .unwrap();

        bus.publish(tick(1, "p"));
        dispatcher.run().await;
        assert_eq!(*other.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn watchdog_flags_slow_handlers() {
        let (bus, dispatcher) = Bus::new(validator());
        bus.subscribe_fn("Tick", "sleepy", |_, _| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(())
        })
        .unwrap();

        bus.publish(tick(1, "p"));
        bus.shutdown();
        dispatcher
            .with_watchdog(Duration::from_millis(5))
            .run()
            .await;
        assert_eq!(bus.diagnostics().count("handler_slow"), 1);
    }

    #[tokio::test]
    async fn shutdown_delivers_follow_ups_then_closes() {
        let (bus, dispatcher) = Bus::new(validator());
        let other = Arc::new(Mutex::new(0usize));

        bus.subscribe_fn("Tick", "relay", |_, bus| {
            bus.publish(Event::new("Other", "relay"));
            Ok(())
        })
        .unwrap();
        let o = Arc::clone(&other);
        bus.subscribe_fn("Other", "sink", move |_, _| {
            *o.lock().unwrap() += 1;
            Ok(())
        })
        .unwrap();

        bus.publish(tick(1, "p"));
        bus.shutdown();
        assert!(!bus.is_closed(), "closing waits for the drain");

        let dispatched = dispatcher.run().await;
        assert_eq!(dispatched, 2);
        assert_eq!(*other.lock().unwrap(), 1);
        assert!(bus.is_closed());

        bus.publish(tick(2, "p"));
        assert_eq!(*other.lock().unwrap(), 1);
        assert!(bus.diagnostics().snapshot().is_empty());
    }
}
