//! # Agent: a worker behind a FIFO work queue.
//!
//! An [`Agent`] owns one [`Worker`] and runs it on a dedicated task. Operations
//! are [`submit`](Agent::submit)ted from anywhere (typically from a bus handler)
//! without blocking, and executed one at a time in submission order.
//!
//! ## Architecture
//! ```text
//! submit(op) ──► [ FIFO ] ──► loop {
//!                               recv (bounded poll)
//!                               ├─► degraded?  → on_failed(op, Fatal)
//!                               ├─► run_once() ─► Ok            → next
//!                               │               ├─ Transient/Timeout, attempts left
//!                               │               │    → sleep(backoff.next(n)) → retry
//!                               │               ├─ Permanent / exhausted
//!                               │               │    → on_failed(op, err)
//!                               │               └─ Fatal
//!                               │                    → publish AgentDegraded, on_failed(op, err)
//!                               └─► Stop / force token → exit, count dropped ops
//!                             }
//! ```
//!
//! ## Rules
//! - Operations of one agent never run concurrently.
//! - A failing operation reaches [`Worker::on_failed`] exactly once, after its last attempt.
//! - After a fatal error every queued or later operation is failed through the
//!   same hook, so nothing waits forever on a broken dependency.
//! - [`Agent::stop`] drains first; past its timeout the running attempt is
//!   cancelled and queued operations are dropped (and counted).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::runner::run_once;
use crate::error::{ValidationError, WorkError};
use crate::events::{Bus, Event, HandlerId, contract};
use crate::handlers::FnHandler;

/// Context handed to every attempt of an operation.
pub struct WorkContext {
    /// Bus for publishing results.
    pub bus: Bus,
    /// Cancelled on attempt timeout or when the agent is force-stopped.
    pub cancel: CancellationToken,
    /// Attempt number, starting at 1.
    pub attempt: u32,
}

/// The unit of work behind an [`Agent`].
///
/// `execute` does the slow part (I/O, computation) and publishes its results on
/// `ctx.bus`. `on_failed` reports an operation that will not be retried; it is
/// required so that no failure goes unreported (typically it publishes
/// `WorkFailed` for the operation's correlation key).
#[async_trait]
pub trait Worker: Send + 'static {
    /// Operation queued on the agent.
    type Op: Clone + Send + Sync + fmt::Debug + 'static;

    /// Agent name used in logs, diagnostics and `AgentDegraded`.
    fn name(&self) -> &str;

    /// Work kinds served by this agent; reported in `AgentDegraded`.
    fn kinds(&self) -> Vec<String> {
        Vec::new()
    }

    /// Runs one attempt of `op`.
    async fn execute(&mut self, op: Self::Op, ctx: &WorkContext) -> Result<(), WorkError>;

    /// Called once for an operation that failed for good.
    fn on_failed(&mut self, op: &Self::Op, err: &WorkError, bus: &Bus);
}

/// Outcome of [`Agent::stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Agent name.
    pub agent: String,
    /// True when the queue drained before the timeout.
    pub drained: bool,
    /// Operations cancelled mid-run or never started.
    pub dropped: usize,
    /// Operations that ran to an outcome (success or final failure).
    pub processed: u64,
}

enum Message<Op> {
    Work(Op),
    Stop,
}

struct AgentState {
    queued: watch::Sender<usize>,
    stopping: AtomicBool,
    stopped: AtomicBool,
    processed: AtomicU64,
    force: CancellationToken,
}

impl AgentState {
    fn finish_one(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.queued.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Cloneable submit-side handle of an [`Agent`].
pub struct AgentHandle<Op> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Message<Op>>,
    state: Arc<AgentState>,
}

impl<Op> Clone for AgentHandle<Op> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<Op: Send + fmt::Debug + 'static> AgentHandle<Op> {
    /// Agent name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues `op` without waiting. Returns `false` if the agent has stopped.
    pub fn submit(&self, op: Op) -> bool {
        if self.state.stopped.load(Ordering::Acquire) {
            warn!(agent = %self.name, ?op, "agent stopped; operation dropped");
            return false;
        }
        self.state.queued.send_modify(|n| *n += 1);
        if let Err(mpsc::error::SendError(msg)) = self.tx.send(Message::Work(op)) {
            self.state.queued.send_modify(|n| *n = n.saturating_sub(1));
            if let Message::Work(op) = msg {
                warn!(agent = %self.name, ?op, "agent loop gone; operation dropped");
            }
            return false;
        }
        true
    }

    /// Operations submitted and not yet finished.
    pub fn pending(&self) -> usize {
        *self.state.queued.borrow()
    }
}

/// A [`Worker`] plus its queue and lifecycle.
pub struct Agent<W: Worker> {
    handle: AgentHandle<W::Op>,
    bus: Bus,
    cfg: Config,
    idle: Option<(W, mpsc::UnboundedReceiver<Message<W::Op>>)>,
    join: Option<JoinHandle<usize>>,
}

impl<W: Worker> Agent<W> {
    /// Creates an agent publishing on `bus`. Nothing runs until [`start`](Self::start).
    pub fn new(worker: W, bus: Bus, cfg: Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (queued, _) = watch::channel(0usize);
        let handle = AgentHandle {
            name: Arc::from(worker.name()),
            tx,
            state: Arc::new(AgentState {
                queued,
                stopping: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                force: CancellationToken::new(),
            }),
        };
        Self {
            handle,
            bus,
            cfg,
            idle: Some((worker, rx)),
            join: None,
        }
    }

    /// Agent name.
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Cloneable submit handle.
    pub fn handle(&self) -> AgentHandle<W::Op> {
        self.handle.clone()
    }

    /// Enqueues `op`; see [`AgentHandle::submit`].
    pub fn submit(&self, op: W::Op) -> bool {
        self.handle.submit(op)
    }

    /// True while the worker loop is running.
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Subscribes a bus handler that turns `event`s into operations.
    ///
    /// `map` returning `None` ignores the event.
    pub fn listen<F>(&self, event: &str, mut map: F) -> Result<HandlerId, ValidationError>
    where
        F: FnMut(&Event) -> Option<W::Op> + Send + 'static,
    {
        let handle = self.handle();
        let name = format!("{}-inbox", handle.name());
        self.bus.subscribe_many(
            &[event],
            FnHandler::new(name, move |ev: &Event, _bus: &Bus| {
                if let Some(op) = map(ev) {
                    handle.submit(op);
                }
                Ok(())
            }),
        )
    }

    /// Spawns the worker loop. Calling it twice is a no-op.
    pub fn start(&mut self) {
        let Some((worker, rx)) = self.idle.take() else {
            return;
        };
        let ctx = LoopContext {
            name: Arc::clone(&self.handle.name),
            state: Arc::clone(&self.handle.state),
            bus: self.bus.clone(),
            cfg: self.cfg.clone(),
        };
        self.join = Some(tokio::spawn(ctx.run(worker, rx)));
    }

    /// Stops the agent.
    ///
    /// Waits up to `timeout` for the queue to drain. Past it, the running
    /// attempt is cancelled and remaining operations are dropped; the call then
    /// returns promptly. Stopping twice returns an empty report.
    pub async fn stop(&mut self, timeout: Duration) -> StopReport {
        let state = Arc::clone(&self.handle.state);
        state.stopping.store(true, Ordering::Release);

        let drained = if self.join.is_some() {
            let mut queued = state.queued.subscribe();
            let drained = time::timeout(timeout, async move {
                queued.wait_for(|n| *n == 0).await.is_ok()
            })
            .await
            .unwrap_or(false);

            if !drained {
                warn!(
                    agent = %self.handle.name,
                    pending = *state.queued.borrow(),
                    timeout_ms = timeout.as_millis() as u64,
                    "drain timeout; forcing stop"
                );
                state.force.cancel();
            }
            drained
        } else {
            *state.queued.borrow() == 0
        };

        let _ = self.handle.tx.send(Message::Stop);
        let dropped = match self.join.take() {
            Some(join) => join.await.unwrap_or_else(|e| {
                error!(agent = %self.handle.name, "agent loop crashed: {e}");
                0
            }),
            None => self.idle.take().map_or(0, |(_, mut rx)| drop_remaining(&mut rx)),
        };
        state.stopped.store(true, Ordering::Release);

        let report = StopReport {
            agent: self.handle.name.to_string(),
            drained,
            dropped,
            processed: state.processed.load(Ordering::Relaxed),
        };
        if report.dropped > 0 {
            warn!(agent = %report.agent, dropped = report.dropped, "agent stopped with dropped operations");
        } else {
            info!(agent = %report.agent, processed = report.processed, "agent stopped");
        }
        report
    }
}

/// Type-erased lifecycle used by the orchestrator.
#[async_trait]
pub trait ManagedAgent: Send {
    /// Agent name.
    fn name(&self) -> &str;
    /// Spawns the worker loop.
    fn start(&mut self);
    /// Drains then stops; see [`Agent::stop`].
    async fn stop(&mut self, timeout: Duration) -> StopReport;
}

#[async_trait]
impl<W: Worker> ManagedAgent for Agent<W> {
    fn name(&self) -> &str {
        Agent::name(self)
    }

    fn start(&mut self) {
        Agent::start(self);
    }

    async fn stop(&mut self, timeout: Duration) -> StopReport {
        Agent::stop(self, timeout).await
    }
}

fn drop_remaining<Op>(rx: &mut mpsc::UnboundedReceiver<Message<Op>>) -> usize {
    let mut dropped = 0;
    while let Ok(msg) = rx.try_recv() {
        if matches!(msg, Message::Work(_)) {
            dropped += 1;
        }
    }
    dropped
}

enum Outcome {
    Done,
    Failed(WorkError),
    Interrupted,
}

struct LoopContext {
    name: Arc<str>,
    state: Arc<AgentState>,
    bus: Bus,
    cfg: Config,
}

impl LoopContext {
    /// Worker loop; returns the number of dropped operations.
    async fn run<W: Worker>(self, mut worker: W, mut rx: mpsc::UnboundedReceiver<Message<W::Op>>) -> usize {
        info!(agent = %self.name, "agent started");
        let poll = self.cfg.poll_interval_clamped();
        let mut degraded: Option<String> = None;
        let mut dropped = 0usize;

        loop {
            let received = select! {
                biased;
                _ = self.state.force.cancelled() => break,
                r = time::timeout(poll, rx.recv()) => r,
            };
            let op = match received {
                Ok(Some(Message::Work(op))) => op,
                Ok(Some(Message::Stop)) | Ok(None) => break,
                Err(_idle) => {
                    if self.state.stopping.load(Ordering::Acquire) && *self.state.queued.borrow() == 0 {
                        break;
                    }
                    continue;
                }
            };

            if let Some(cause) = &degraded {
                let err = WorkError::fatal(cause.clone());
                debug!(agent = %self.name, ?op, "agent degraded; failing operation");
                worker.on_failed(&op, &err, &self.bus);
                self.state.finish_one();
                continue;
            }

            match self.execute(&mut worker, &op).await {
                Outcome::Done => {}
                Outcome::Failed(err) if err.is_fatal() => {
                    error!(agent = %self.name, ?op, "fatal error; agent degraded: {err}");
                    let kinds = worker.kinds();
                    let kinds: Vec<&str> = kinds.iter().map(String::as_str).collect();
                    let cause = err.to_string();
                    self.bus.publish(contract::agent_degraded(&self.name, &kinds, &cause));
                    worker.on_failed(&op, &err, &self.bus);
                    degraded = Some(cause);
                }
                Outcome::Failed(err) => {
                    warn!(agent = %self.name, ?op, reason = err.as_label(), "operation failed: {err}");
                    worker.on_failed(&op, &err, &self.bus);
                }
                Outcome::Interrupted => {
                    debug!(agent = %self.name, ?op, "operation interrupted by forced stop");
                    dropped += 1;
                    break;
                }
            }
            self.state.finish_one();
        }

        dropped += drop_remaining(&mut rx);
        if dropped > 0 {
            warn!(agent = %self.name, dropped, "agent loop exited with unfinished operations");
        }
        info!(agent = %self.name, "agent loop exited");
        dropped
    }

    /// Runs `op` until success, final failure or forced stop.
    async fn execute<W: Worker>(&self, worker: &mut W, op: &W::Op) -> Outcome {
        let retry = self.cfg.retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let res = run_once(
                worker,
                op.clone(),
                &self.bus,
                &self.state.force,
                self.cfg.operation_timeout(),
                attempt,
            )
            .await;

            let err = match res {
                Ok(()) => return Outcome::Done,
                Err(WorkError::Canceled) => return Outcome::Interrupted,
                Err(err) => err,
            };
            if !retry.should_retry(attempt, &err) {
                return Outcome::Failed(err);
            }

            let delay = retry.backoff.next(attempt - 1);
            debug!(
                agent = %self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after: {err}"
            );
            select! {
                _ = time::sleep(delay) => {}
                _ = self.state.force.cancelled() => return Outcome::Interrupted,
            }
        }
    }
}
