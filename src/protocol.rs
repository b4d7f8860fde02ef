// src/protocol.rs

//! Pure apply-record protocol state machines.
//!
//! - [`SenderState`] is the per-sender mark/clear/trigger machine.
//! - [`CompletionTracker`] interprets CAR status updates for one execution.
//!
//! Neither type touches channels or Tokio; the command sender feeds them
//! events and acts on the results.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::channel::ChannelUpdate;
use crate::errors::CommandFailure;
use crate::monitor::Outcome;
use crate::types::{CarState, Value};

/// Per-sender protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Marked,
    /// An execution has been triggered and has not completed yet.
    Busy { execution: u64 },
}

impl SenderState {
    pub fn is_busy(self) -> bool {
        matches!(self, SenderState::Busy { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderEvent {
    Mark,
    Clear,
    Trigger { execution: u64 },
    Completed { execution: u64 },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    #[error("execution {execution} is still outstanding")]
    Busy { execution: u64 },

    #[error("completion of execution {execution} does not match state {state:?}")]
    Stale { state: SenderState, execution: u64 },
}

impl SenderState {
    /// Guarded transition function.
    ///
    /// | state       | Mark   | Clear | Trigger | Completed(same id) |
    /// |-------------|--------|-------|---------|--------------------|
    /// | Idle        | Marked | Idle  | Busy    | Stale              |
    /// | Marked      | Marked | Idle  | Busy    | Stale              |
    /// | Busy        | Busy!  | Busy! | Busy!   | Idle               |
    pub fn transition(self, event: SenderEvent) -> Result<SenderState, TransitionError> {
        use SenderEvent as E;
        use SenderState as S;

        match (self, event) {
            (S::Busy { execution: current }, E::Completed { execution }) if current == execution => {
                Ok(S::Idle)
            }
            (state, E::Completed { execution }) => Err(TransitionError::Stale { state, execution }),
            (S::Busy { execution }, _) => Err(TransitionError::Busy { execution }),
            (S::Idle | S::Marked, E::Mark) => Ok(S::Marked),
            (S::Idle | S::Marked, E::Clear) => Ok(S::Idle),
            (S::Idle | S::Marked, E::Trigger { execution }) => Ok(S::Busy { execution }),
        }
    }
}

/// How the status stream of one execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// `BUSY` was observed and then `IDLE`.
    Completed,
    /// The CAR record reported `ERROR`.
    Rejected,
    /// The status channel was lost.
    Lost { reason: String },
    /// The status channel stayed silent for `after`.
    TimedOut { after: Duration },
}

/// Interprets CAR status updates for a single execution.
#[derive(Debug)]
pub struct CompletionTracker {
    status_channel: String,
    seen_busy: bool,
    seen_value: bool,
    message: Option<String>,
}

impl CompletionTracker {
    pub fn new(status_channel: &str) -> Self {
        Self {
            status_channel: status_channel.to_string(),
            seen_busy: false,
            seen_value: false,
            message: None,
        }
    }

    /// Feed one status update; returns a verdict once the execution ended.
    ///
    /// `IDLE` before any `BUSY` is the value the record held before the
    /// trigger and is ignored. So is an `ERROR` delivered as the first
    /// value: a CAR record keeps `ERROR` until its next `BUSY`. A later
    /// `ERROR` rejects the execution even without `BUSY`. `PAUSED` keeps
    /// the execution running.
    ///
    /// The first `BUSY` drops any message received so far.
    pub fn on_status(&mut self, update: ChannelUpdate) -> Option<Verdict> {
        let value = match update {
            ChannelUpdate::Value(value) => value,
            ChannelUpdate::Disconnected => {
                return Some(Verdict::Lost {
                    reason: "status channel disconnected".to_string(),
                });
            }
        };
        let first = !std::mem::replace(&mut self.seen_value, true);

        match CarState::from_value(&value) {
            Some(CarState::Busy) => {
                if !self.seen_busy {
                    self.message = None;
                }
                self.seen_busy = true;
                None
            }
            Some(CarState::Idle) if self.seen_busy => Some(Verdict::Completed),
            Some(CarState::Idle) => {
                debug!(channel = %self.status_channel, "ignoring IDLE before BUSY");
                None
            }
            Some(CarState::Paused) => None,
            Some(CarState::Error) if first => {
                debug!(channel = %self.status_channel, "ignoring ERROR left from a previous execution");
                None
            }
            Some(CarState::Error) => Some(Verdict::Rejected),
            None => {
                warn!(channel = %self.status_channel, ?value, "undecodable CAR status");
                None
            }
        }
    }

    /// The status subscription ended without a `Disconnected` marker.
    pub fn on_status_closed(&self) -> Verdict {
        Verdict::Lost {
            reason: "status subscription closed".to_string(),
        }
    }

    /// Record the latest CAR error message.
    pub fn on_message(&mut self, update: ChannelUpdate) {
        match update {
            ChannelUpdate::Value(Value::String(text)) => {
                let text = text.trim();
                self.message = (!text.is_empty()).then(|| text.to_string());
            }
            ChannelUpdate::Value(other) => {
                warn!(?other, "non-string CAR message ignored");
            }
            ChannelUpdate::Disconnected => {
                debug!(channel = %self.status_channel, "CAR message channel disconnected");
            }
        }
    }

    pub fn resolve(&self, verdict: Verdict) -> Outcome {
        match verdict {
            Verdict::Completed => Outcome::Success,
            Verdict::Rejected => Outcome::Failure(CommandFailure::Remote {
                message: self
                    .message
                    .clone()
                    .unwrap_or_else(|| "apply record reported ERROR".to_string()),
            }),
            Verdict::Lost { reason } => Outcome::Failure(CommandFailure::Channel {
                channel: self.status_channel.clone(),
                reason,
            }),
            Verdict::TimedOut { after } => Outcome::Failure(CommandFailure::Timeout { after }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: CarState) -> ChannelUpdate {
        ChannelUpdate::Value(state.value())
    }

    #[test]
    fn mark_clear_and_trigger_from_idle() {
        let s = SenderState::Idle;
        assert_eq!(s.transition(SenderEvent::Mark), Ok(SenderState::Marked));
        assert_eq!(s.transition(SenderEvent::Clear), Ok(SenderState::Idle));
        assert_eq!(
            SenderState::Marked.transition(SenderEvent::Clear),
            Ok(SenderState::Idle)
        );
        assert_eq!(
            SenderState::Marked.transition(SenderEvent::Trigger { execution: 3 }),
            Ok(SenderState::Busy { execution: 3 })
        );
    }

    #[test]
    fn busy_rejects_everything_but_its_own_completion() {
        let busy = SenderState::Busy { execution: 1 };
        for event in [
            SenderEvent::Mark,
            SenderEvent::Clear,
            SenderEvent::Trigger { execution: 2 },
        ] {
            assert_eq!(busy.transition(event), Err(TransitionError::Busy { execution: 1 }));
        }

        assert!(matches!(
            busy.transition(SenderEvent::Completed { execution: 9 }),
            Err(TransitionError::Stale { .. })
        ));
        assert_eq!(
            busy.transition(SenderEvent::Completed { execution: 1 }),
            Ok(SenderState::Idle)
        );
    }

    #[test]
    fn tracker_needs_busy_before_idle() {
        let mut t = CompletionTracker::new("car.VAL");
        assert_eq!(t.on_status(status(CarState::Idle)), None);
        assert_eq!(t.on_status(status(CarState::Busy)), None);
        assert_eq!(t.on_status(status(CarState::Paused)), None);
        assert_eq!(t.on_status(status(CarState::Idle)), Some(Verdict::Completed));
    }

    #[test]
    fn tracker_reports_error_with_message() {
        let mut t = CompletionTracker::new("car.VAL");
        assert_eq!(t.on_status(status(CarState::Idle)), None);
        assert_eq!(t.on_status(status(CarState::Busy)), None);
        t.on_message(ChannelUpdate::Value(Value::String("filter wheel stuck".into())));
        let verdict = t.on_status(status(CarState::Error)).unwrap();

        assert_eq!(
            t.resolve(verdict),
            Outcome::Failure(CommandFailure::Remote {
                message: "filter wheel stuck".into()
            })
        );
    }

    #[test]
    fn tracker_ignores_error_left_by_a_previous_execution() {
        let mut t = CompletionTracker::new("car.VAL");
        t.on_message(ChannelUpdate::Value(Value::String("old cause".into())));
        assert_eq!(t.on_status(status(CarState::Error)), None);
        assert_eq!(t.on_status(status(CarState::Busy)), None);
        assert_eq!(t.on_status(status(CarState::Idle)), Some(Verdict::Completed));

        // The old message does not attach to a new failure.
        let mut t = CompletionTracker::new("car.VAL");
        t.on_message(ChannelUpdate::Value(Value::String("old cause".into())));
        assert_eq!(t.on_status(status(CarState::Error)), None);
        assert_eq!(t.on_status(status(CarState::Busy)), None);
        let verdict = t.on_status(status(CarState::Error)).unwrap();
        assert_eq!(
            t.resolve(verdict),
            Outcome::Failure(CommandFailure::Remote {
                message: "apply record reported ERROR".into()
            })
        );
    }

    #[test]
    fn tracker_rejects_error_after_an_idle_snapshot() {
        let mut t = CompletionTracker::new("car.VAL");
        assert_eq!(t.on_status(status(CarState::Idle)), None);
        assert_eq!(t.on_status(status(CarState::Error)), Some(Verdict::Rejected));
    }

    #[test]
    fn tracker_treats_disconnect_as_channel_failure() {
        let mut t = CompletionTracker::new("car.VAL");
        let verdict = t.on_status(ChannelUpdate::Disconnected).unwrap();
        assert!(matches!(
            t.resolve(verdict),
            Outcome::Failure(CommandFailure::Channel { .. })
        ));
    }
}
