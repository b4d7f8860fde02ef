// src/channel/mod.rs

//! Channel Service abstraction.
//!
//! The command sender never talks to the PV wire protocol directly. It goes
//! through a `ChannelService`, which can be backed by a real Channel Access
//! client or by the in-process [`sim::SimulatedChannelService`].
//!
//! - `connect` binds a named channel and returns a [`ChannelHandle`].
//! - `write` puts a value and resolves once the put is acknowledged.
//! - `subscribe` returns a [`ChannelSubscription`] of change notifications.
//!   Implementations deliver the current value first when one is known.
//! - `disconnect` releases a handle.

pub mod sim;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::errors::ChannelError;
use crate::types::{Value, ValueKind};

pub use sim::{ApplyResponse, SimulatedChannelService};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// A change notification delivered on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelUpdate {
    Value(Value),
    /// The underlying connection was lost. No further values follow.
    Disconnected,
}

pub type ChannelSubscription = mpsc::Receiver<ChannelUpdate>;

/// Non-owning reference to a connected channel.
///
/// The Channel Service owns the connection; dropping a handle does not
/// disconnect it, [`ChannelService::disconnect`] does.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    id: u64,
    name: Arc<str>,
    kind: ValueKind,
}

impl ChannelHandle {
    pub fn new(id: u64, name: &str, kind: ValueKind) -> Self {
        Self {
            id,
            name: Arc::from(name),
            kind,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelHandle({}#{} {})", self.name, self.id, self.kind)
    }
}

/// The primitives the command sender is built on.
pub trait ChannelService: Send + Sync {
    fn connect<'a>(
        &'a self,
        name: &'a str,
        kind: ValueKind,
    ) -> BoxFuture<'a, ChannelResult<ChannelHandle>>;

    fn write<'a>(
        &'a self,
        handle: &'a ChannelHandle,
        value: Value,
    ) -> BoxFuture<'a, ChannelResult<()>>;

    fn subscribe<'a>(
        &'a self,
        handle: &'a ChannelHandle,
    ) -> BoxFuture<'a, ChannelResult<ChannelSubscription>>;

    fn disconnect(&self, handle: ChannelHandle) -> BoxFuture<'_, ChannelResult<()>>;
}
