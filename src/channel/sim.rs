// src/channel/sim.rs

//! In-process simulated Channel Service.
//!
//! Channels are created on first connect and hold their last written value.
//! Directive channels can be paired with a simulated apply/CAR record that
//! reacts to `START` by driving the status channel through `BUSY` and then
//! `IDLE` or `ERROR`, according to its configured [`ApplyResponse`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{BoxFuture, ChannelHandle, ChannelResult, ChannelService, ChannelSubscription, ChannelUpdate};
use crate::errors::ChannelError;
use crate::types::{CarState, Directive, Value, ValueKind};

const SUBSCRIPTION_CAPACITY: usize = 64;

/// How a simulated apply record answers a `START` directive.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResponse {
    /// Report `BUSY`, then `IDLE` after the delay.
    Succeed { after: Duration },
    /// Report `BUSY`, then the message and `ERROR` after the delay.
    Fail { after: Duration, message: String },
    /// Report `BUSY` and never complete.
    Silent,
    /// Report `BUSY`, then drop the status channel connection.
    Disconnect { after: Duration },
}

#[derive(Debug, Clone)]
struct ApplyRecordSim {
    status: String,
    message: Option<String>,
    response: ApplyResponse,
}

#[derive(Debug, Default)]
struct SimChannel {
    value: Option<Value>,
    subscribers: Vec<mpsc::Sender<ChannelUpdate>>,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    channels: HashMap<String, SimChannel>,
    /// Live handle id -> channel name.
    live: HashMap<u64, String>,
    unreachable: HashSet<String>,
    stalled: HashSet<String>,
    writes: Vec<(String, Value)>,
    apply_records: HashMap<String, ApplyRecordSim>,
}

impl SimState {
    fn publish(&mut self, channel: &str, value: Value) {
        let entry = self.channels.entry(channel.to_string()).or_default();
        entry.value = Some(value.clone());
        entry.subscribers.retain(|tx| {
            match tx.try_send(ChannelUpdate::Value(value.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(channel, "subscriber queue full; dropping update");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn drop_connection(&mut self, channel: &str) {
        if let Some(entry) = self.channels.get_mut(channel) {
            for tx in entry.subscribers.drain(..) {
                let _ = tx.try_send(ChannelUpdate::Disconnected);
            }
        }
        self.live.retain(|_, name| name != channel);
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedChannelService {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedChannelService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a simulated apply record to `directive`, reporting on `status`
    /// (and `message`, when given). The status channel starts out `IDLE`.
    pub fn install_apply_record(
        &self,
        directive: &str,
        status: &str,
        message: Option<&str>,
        response: ApplyResponse,
    ) {
        let mut state = self.lock();
        state.apply_records.insert(
            directive.to_string(),
            ApplyRecordSim {
                status: status.to_string(),
                message: message.map(str::to_string),
                response,
            },
        );
        state.publish(status, CarState::Idle.value());
        if let Some(message) = message {
            state.publish(message, Value::String(String::new()));
        }
    }

    /// Change how the apply record on `directive` answers future `START`s.
    pub fn set_apply_response(&self, directive: &str, response: ApplyResponse) {
        let mut state = self.lock();
        match state.apply_records.get_mut(directive) {
            Some(record) => record.response = response,
            None => warn!(directive, "no simulated apply record installed"),
        }
    }

    /// Make `connect` fail for this channel.
    pub fn set_unreachable(&self, channel: &str) {
        self.lock().unreachable.insert(channel.to_string());
    }

    /// Make `connect` and `write` on this channel hang forever.
    pub fn stall(&self, channel: &str) {
        self.lock().stalled.insert(channel.to_string());
    }

    pub fn resume(&self, channel: &str) {
        self.lock().stalled.remove(channel);
    }

    /// Publish a value on a channel as if the remote side changed it.
    pub fn publish(&self, channel: &str, value: Value) {
        self.lock().publish(channel, value);
    }

    /// Simulate loss of the connection to `channel`.
    pub fn disconnect_channel(&self, channel: &str) {
        self.lock().drop_connection(channel);
    }

    pub fn value_of(&self, channel: &str) -> Option<Value> {
        self.lock()
            .channels
            .get(channel)
            .and_then(|c| c.value.clone())
    }

    /// Every acknowledged write, in order.
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.lock().writes.clone()
    }

    pub fn writes_to(&self, channel: &str) -> Vec<Value> {
        self.lock()
            .writes
            .iter()
            .filter(|(name, _)| name == channel)
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn is_connected(&self, channel: &str) -> bool {
        self.lock().live.values().any(|name| name == channel)
    }

    /// Number of live handles.
    pub fn connection_count(&self) -> usize {
        self.lock().live.len()
    }

    fn is_stalled(&self, channel: &str) -> bool {
        self.lock().stalled.contains(channel)
    }

    fn run_apply_record(&self, record: ApplyRecordSim) {
        self.publish(&record.status, CarState::Busy.value());

        let sim = self.clone();
        match record.response {
            ApplyResponse::Silent => {
                debug!(status = %record.status, "simulated apply record stays busy");
            }
            ApplyResponse::Succeed { after } => {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    sim.publish(&record.status, CarState::Idle.value());
                });
            }
            ApplyResponse::Fail { after, message } => {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let mut state = sim.lock();
                    if let Some(channel) = &record.message {
                        state.publish(channel, Value::String(message));
                    }
                    state.publish(&record.status, CarState::Error.value());
                });
            }
            ApplyResponse::Disconnect { after } => {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    sim.disconnect_channel(&record.status);
                });
            }
        }
    }
}

impl ChannelService for SimulatedChannelService {
    fn connect<'a>(
        &'a self,
        name: &'a str,
        kind: ValueKind,
    ) -> BoxFuture<'a, ChannelResult<ChannelHandle>> {
        Box::pin(async move {
            if self.is_stalled(name) {
                std::future::pending::<()>().await;
            }

            let mut state = self.lock();
            if state.unreachable.contains(name) {
                return Err(ChannelError::Unreachable {
                    channel: name.to_string(),
                    reason: "no server answered the search request".to_string(),
                });
            }

            state.next_id += 1;
            let id = state.next_id;
            state.live.insert(id, name.to_string());
            state.channels.entry(name.to_string()).or_default();
            debug!(channel = name, id, %kind, "simulated channel connected");

            Ok(ChannelHandle::new(id, name, kind))
        })
    }

    fn write<'a>(
        &'a self,
        handle: &'a ChannelHandle,
        value: Value,
    ) -> BoxFuture<'a, ChannelResult<()>> {
        Box::pin(async move {
            if self.is_stalled(handle.name()) {
                std::future::pending::<()>().await;
            }

            if value.kind() != handle.kind() {
                return Err(ChannelError::TypeMismatch {
                    channel: handle.name().to_string(),
                    expected: handle.kind(),
                    actual: value.kind(),
                });
            }

            let record = {
                let mut state = self.lock();
                if !state.live.contains_key(&handle.id()) {
                    return Err(ChannelError::Disconnected {
                        channel: handle.name().to_string(),
                    });
                }

                state.writes.push((handle.name().to_string(), value.clone()));
                state.publish(handle.name(), value.clone());

                match Directive::from_value(&value) {
                    Some(Directive::Start) => state.apply_records.get(handle.name()).cloned(),
                    _ => None,
                }
            };

            if let Some(record) = record {
                self.run_apply_record(record);
            }

            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        handle: &'a ChannelHandle,
    ) -> BoxFuture<'a, ChannelResult<ChannelSubscription>> {
        Box::pin(async move {
            let mut state = self.lock();
            if !state.live.contains_key(&handle.id()) {
                return Err(ChannelError::Disconnected {
                    channel: handle.name().to_string(),
                });
            }

            let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
            let entry = state.channels.entry(handle.name().to_string()).or_default();
            if let Some(current) = &entry.value {
                let _ = tx.try_send(ChannelUpdate::Value(current.clone()));
            }
            entry.subscribers.push(tx);

            Ok(rx)
        })
    }

    fn disconnect(&self, handle: ChannelHandle) -> BoxFuture<'_, ChannelResult<()>> {
        Box::pin(async move {
            self.lock().live.remove(&handle.id());
            debug!(channel = handle.name(), id = handle.id(), "simulated channel disconnected");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_delivers_current_value_first() {
        let sim = SimulatedChannelService::new();
        sim.publish("x:status", Value::Integer(2));

        let handle = sim.connect("x:status", ValueKind::Integer).await.unwrap();
        let mut sub = sim.subscribe(&handle).await.unwrap();

        assert_eq!(sub.recv().await, Some(ChannelUpdate::Value(Value::Integer(2))));
    }

    #[tokio::test]
    async fn write_checks_kind_and_liveness() {
        let sim = SimulatedChannelService::new();
        let handle = sim.connect("x:a", ValueKind::Double).await.unwrap();

        let err = sim.write(&handle, Value::Integer(1)).await.unwrap_err();
        assert!(matches!(err, ChannelError::TypeMismatch { .. }));

        sim.disconnect(handle.clone()).await.unwrap();
        let err = sim.write(&handle, Value::Double(1.0)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Disconnected { .. }));
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn unreachable_channel_fails_connect() {
        let sim = SimulatedChannelService::new();
        sim.set_unreachable("x:gone");

        let err = sim.connect("x:gone", ValueKind::String).await.unwrap_err();
        assert!(matches!(err, ChannelError::Unreachable { .. }));
        assert_eq!(sim.connection_count(), 0);
    }
}
