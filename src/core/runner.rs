//! # Run a single attempt of an agent operation.
//!
//! Executes one attempt of [`Worker::execute`] with an optional timeout and
//! cooperative cancellation.
//!
//! ```text
//! Success:      execute() → Ok(())                        → Ok(())
//! Failure:      execute() → Err(e)                        → Err(e)
//! Timeout:      timeout exceeded → cancel attempt token   → Err(Timeout)
//! Force stop:   agent token cancelled → future dropped    → Err(Canceled)
//! ```
//!
//! ## Rules
//! - Each attempt gets a **child token**; cancelling it never affects the agent.
//! - A forced stop wins over a running attempt: the future is dropped at its next
//!   await point.

use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::core::agent::{WorkContext, Worker};
use crate::error::WorkError;
use crate::events::Bus;

/// Executes one attempt of `op` on `worker`.
pub(crate) async fn run_once<W: Worker>(
    worker: &mut W,
    op: W::Op,
    bus: &Bus,
    agent_token: &CancellationToken,
    timeout: Option<Duration>,
    attempt: u32,
) -> Result<(), WorkError> {
    let ctx = WorkContext {
        bus: bus.clone(),
        cancel: agent_token.child_token(),
        attempt,
    };

    let attempt_fut = async {
        match timeout.filter(|d| *d > Duration::ZERO) {
            Some(dur) => match time::timeout(dur, worker.execute(op, &ctx)).await {
                Ok(res) => res,
                Err(_elapsed) => {
                    ctx.cancel.cancel();
                    Err(WorkError::Timeout { timeout: dur })
                }
            },
            None => worker.execute(op, &ctx).await,
        }
    };

    tokio::select! {
        biased;
        _ = agent_token.cancelled() => Err(WorkError::Canceled),
        res = attempt_fut => res,
    }
}
