// src/monitor.rs

//! Per-execution command monitors.
//!
//! Every triggered execution gets one `CommandMonitor` (held by the caller)
//! and one [`CompletionHandle`] (held by the completion driver). They share a
//! single completion future, a `watch` channel that goes from `None` to
//! `Some(outcome)` exactly once. Blocking waits and listener registration are
//! both consumers of that one future.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::error;

use crate::errors::{CommandError, CommandFailure, Result};

/// Observable state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Pending,
    Success,
    Failure,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CommandState::Pending)
    }
}

/// Terminal result of one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    Failure(CommandFailure),
}

impl Outcome {
    pub fn state(&self) -> CommandState {
        match self {
            Outcome::Success => CommandState::Success,
            Outcome::Failure(_) => CommandState::Failure,
        }
    }
}

fn state_of(slot: &Option<Outcome>) -> CommandState {
    slot.as_ref().map_or(CommandState::Pending, Outcome::state)
}

struct MonitorShared {
    id: u64,
    sender: String,
    created_at: Instant,
    completion: watch::Receiver<Option<Outcome>>,
}

/// Outcome tracker for exactly one triggered execution.
#[derive(Clone)]
pub struct CommandMonitor {
    shared: Arc<MonitorShared>,
}

impl fmt::Debug for CommandMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandMonitor")
            .field("sender", &self.shared.sender)
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl CommandMonitor {
    /// Execution id, unique per sender.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Name of the sender that triggered this execution.
    pub fn sender(&self) -> &str {
        &self.shared.sender
    }

    pub fn created_at(&self) -> Instant {
        self.shared.created_at
    }

    pub fn state(&self) -> CommandState {
        state_of(&self.shared.completion.borrow())
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// The failure reason, only present in `Failure`.
    pub fn error(&self) -> Option<CommandFailure> {
        match &*self.shared.completion.borrow() {
            Some(Outcome::Failure(failure)) => Some(failure.clone()),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.shared.completion.borrow().clone()
    }

    /// Wait until the execution is terminal.
    ///
    /// Fails with `Interrupted` only if the completion driver went away
    /// without reporting (e.g. the runtime is shutting down).
    pub async fn wait(&self) -> Result<CommandState> {
        let mut rx = self.shared.completion.clone();
        let state = {
            let slot = rx
                .wait_for(|slot| slot.is_some())
                .await
                .map_err(|_| CommandError::Interrupted)?;
            state_of(&slot)
        };
        Ok(state)
    }

    /// Wait at most `timeout`. Expiry leaves the monitor untouched.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<CommandState> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| CommandError::WaitTimeout { after: timeout })?
    }

    /// Wait until terminal or until `cancel` fires.
    ///
    /// Cancellation only abandons this wait; the execution carries on and
    /// the monitor still reaches its terminal state. A dropped cancel sender
    /// is not a cancellation.
    pub async fn wait_until(&self, mut cancel: oneshot::Receiver<()>) -> Result<CommandState> {
        tokio::select! {
            res = self.wait() => res,
            cancelled = &mut cancel => match cancelled {
                Ok(()) => Err(CommandError::Interrupted),
                Err(_) => self.wait().await,
            },
        }
    }

    pub(crate) fn downgrade(&self) -> WeakMonitor {
        WeakMonitor(Arc::downgrade(&self.shared))
    }
}

/// Back reference kept by the sender; never extends the monitor's lifetime.
#[derive(Clone)]
pub(crate) struct WeakMonitor(Weak<MonitorShared>);

impl WeakMonitor {
    pub(crate) fn upgrade(&self) -> Option<CommandMonitor> {
        self.0.upgrade().map(|shared| CommandMonitor { shared })
    }
}

/// Write side of a monitor's completion future.
pub(crate) struct CompletionHandle {
    id: u64,
    sender: String,
    tx: watch::Sender<Option<Outcome>>,
}

impl CompletionHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Publish the terminal outcome. Must be called at most once.
    pub(crate) fn complete(&self, outcome: Outcome) -> bool {
        let mut outcome = Some(outcome);
        let applied = self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        });

        if !applied {
            error!(
                sender = %self.sender,
                execution = self.id,
                "completion reported for a monitor that is already terminal"
            );
        }
        debug_assert!(applied, "monitor {} is already terminal", self.id);
        applied
    }
}

/// Create a Pending monitor and the handle that completes it.
pub(crate) fn monitor_pair(id: u64, sender: &str) -> (CommandMonitor, CompletionHandle) {
    let (tx, rx) = watch::channel(None);
    let monitor = CommandMonitor {
        shared: Arc::new(MonitorShared {
            id,
            sender: sender.to_string(),
            created_at: Instant::now(),
            completion: rx,
        }),
    };
    let handle = CompletionHandle {
        id,
        sender: sender.to_string(),
        tx,
    };
    (monitor, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn monitor_starts_pending_and_becomes_terminal_once() {
        let (monitor, handle) = monitor_pair(1, "applyTest");
        assert_eq!(monitor.state(), CommandState::Pending);
        assert!(monitor.error().is_none());

        assert!(handle.complete(Outcome::Success));
        assert_eq!(monitor.wait().await.unwrap(), CommandState::Success);
        assert_eq!(monitor.state(), CommandState::Success);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "already terminal")]
    fn second_completion_is_a_programming_error() {
        let (_monitor, handle) = monitor_pair(7, "applyTest");
        handle.complete(Outcome::Success);
        handle.complete(Outcome::Failure(CommandFailure::Remote {
            message: "late".into(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_leaves_monitor_pending() {
        let (monitor, _handle) = monitor_pair(2, "applyTest");

        let err = monitor
            .wait_for_completion(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::WaitTimeout { .. }));
        assert_eq!(monitor.state(), CommandState::Pending);
    }

    #[tokio::test]
    async fn dropped_driver_interrupts_waiters() {
        let (monitor, handle) = monitor_pair(3, "applyTest");
        drop(handle);

        let err = monitor.wait().await.unwrap_err();
        assert!(matches!(err, CommandError::Interrupted));
    }

    #[tokio::test]
    async fn cancel_interrupts_only_the_wait() {
        let (monitor, handle) = monitor_pair(4, "applyTest");
        let (cancel_tx, cancel_rx) = oneshot::channel();
        cancel_tx.send(()).unwrap();

        let err = monitor.wait_until(cancel_rx).await.unwrap_err();
        assert!(matches!(err, CommandError::Interrupted));

        handle.complete(Outcome::Success);
        assert_eq!(monitor.state(), CommandState::Success);
    }

    #[tokio::test]
    async fn weak_reference_does_not_keep_monitor_alive() {
        let (monitor, _handle) = monitor_pair(5, "applyTest");
        let weak = monitor.downgrade();
        assert!(weak.upgrade().is_some());

        drop(monitor);
        assert!(weak.upgrade().is_none());
    }
}
