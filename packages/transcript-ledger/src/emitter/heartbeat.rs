//! Background heartbeat task.
//!
//! One task per job. It sleeps on a timer between ticks and exits when its
//! cancellation token fires or when the tick callback asks it to. Stopping
//! is cooperative: cancel, then wait a bounded time for the task to notice.
//! A task that overruns the wait is detached, never aborted.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle on a running heartbeat task.
#[derive(Debug)]
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Spawn a heartbeat on the current Tokio runtime.
    ///
    /// `tick` runs once per `interval` (not immediately); returning `false`
    /// ends the task. Returns `None` outside a runtime.
    pub fn spawn<F>(interval: Duration, mut tick: F) -> Option<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(error = %e, "no async runtime, heartbeat not started");
                return None;
            }
        };

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let join = runtime.spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = timer.tick() => {
                        if !tick() {
                            break;
                        }
                    }
                }
            }
            debug!("heartbeat task exited");
        });

        Some(Self { cancel, join })
    }

    /// Signal the task to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the task and wait up to `timeout` for it to exit.
    ///
    /// Returns `true` if the task exited in time.
    pub async fn stop(self, timeout: Duration) -> bool {
        self.cancel.cancel();
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "heartbeat task ended abnormally");
                true
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "heartbeat did not stop in time, detaching"
                );
                false
            }
        }
    }
}
