// src/params.rs

//! Typed parameters and the per-sender parameter registry.
//!
//! A parameter binds a name to a channel and a [`ValueKind`]. The registry
//! enforces that a name is only ever reused with the same kind and channel;
//! connecting and disconnecting channels is left to the command sender, so
//! everything here is synchronous.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use crate::channel::ChannelHandle;
use crate::errors::{CommandError, Result};
use crate::types::{ParameterValue, Value, ValueKind};

/// Shared state behind every handle of one registered parameter.
#[derive(Debug)]
pub(crate) struct ParameterCell {
    name: String,
    channel: String,
    description: Option<String>,
    kind: ValueKind,
    handle: ChannelHandle,
    value: Mutex<Option<Value>>,
}

impl ParameterCell {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn kind(&self) -> ValueKind {
        self.kind
    }

    pub(crate) fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    pub(crate) fn value(&self) -> Option<Value> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_value(&self, value: Option<Value>) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

/// A typed handle to a parameter registered on a command sender.
///
/// Handles are cheap to clone; all clones refer to the same parameter.
pub struct Parameter<T> {
    cell: Arc<ParameterCell>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Clone for Parameter<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _kind: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Parameter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.cell.name)
            .field("channel", &self.cell.channel)
            .field("kind", &self.cell.kind)
            .field("value", &self.cell.value())
            .finish()
    }
}

impl<T: ParameterValue> Parameter<T> {
    pub(crate) fn new(cell: Arc<ParameterCell>) -> Self {
        debug_assert_eq!(cell.kind, T::KIND);
        Self {
            cell,
            _kind: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn channel(&self) -> &str {
        &self.cell.channel
    }

    pub fn description(&self) -> Option<&str> {
        self.cell.description.as_deref()
    }

    pub fn kind(&self) -> ValueKind {
        T::KIND
    }

    /// The value that will be written on the next post, if any.
    pub fn value(&self) -> Option<T> {
        self.cell.value().as_ref().and_then(T::from_value)
    }

    pub fn set(&self, value: T) {
        self.cell.set_value(Some(value.into_value()));
    }

    /// Forget the local value; the channel is left untouched on post.
    pub fn unset(&self) {
        self.cell.set_value(None);
    }

    /// True if both handles refer to the same registered parameter.
    pub fn same_as(&self, other: &Parameter<T>) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

/// Name -> parameter map of one command sender.
#[derive(Default)]
pub(crate) struct ParameterRegistry {
    entries: HashMap<String, Arc<ParameterCell>>,
}

impl fmt::Debug for ParameterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

impl ParameterRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Check whether `name` can be registered as `kind` on `channel`.
    ///
    /// - `Ok(Some(cell))`: already registered compatibly; reuse it.
    /// - `Ok(None)`: unknown name; the caller should connect and insert.
    /// - `Err(ParameterConflict)`: registered with another kind or channel.
    pub(crate) fn find_compatible(
        &self,
        name: &str,
        kind: ValueKind,
        channel: &str,
    ) -> Result<Option<Arc<ParameterCell>>> {
        let Some(existing) = self.entries.get(name) else {
            return Ok(None);
        };

        if existing.kind == kind && existing.channel == channel {
            return Ok(Some(Arc::clone(existing)));
        }

        Err(CommandError::ParameterConflict {
            name: name.to_string(),
            existing_kind: existing.kind,
            existing_channel: existing.channel.clone(),
            requested_kind: kind,
            requested_channel: channel.to_string(),
        })
    }

    pub(crate) fn insert(
        &mut self,
        name: &str,
        channel: &str,
        description: Option<&str>,
        handle: ChannelHandle,
    ) -> Arc<ParameterCell> {
        let cell = Arc::new(ParameterCell {
            name: name.to_string(),
            channel: channel.to_string(),
            description: description.map(str::to_string),
            kind: handle.kind(),
            handle,
            value: Mutex::new(None),
        });
        self.entries.insert(name.to_string(), Arc::clone(&cell));
        cell
    }

    pub(crate) fn get<T: ParameterValue>(&self, name: &str) -> Option<Parameter<T>> {
        self.entries
            .get(name)
            .filter(|cell| cell.kind == T::KIND)
            .map(|cell| Parameter::new(Arc::clone(cell)))
    }

    pub(crate) fn cell(&self, name: &str) -> Option<&Arc<ParameterCell>> {
        self.entries.get(name)
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Arc<ParameterCell>> {
        self.entries.remove(name)
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<ParameterCell>> {
        self.entries.drain().map(|(_, cell)| cell).collect()
    }

    pub(crate) fn names(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    /// Channel writes needed before a trigger: every parameter holding a
    /// value, ordered by name.
    pub(crate) fn pending_writes(&self) -> Vec<(ChannelHandle, Value)> {
        let mut cells: Vec<_> = self.entries.values().collect();
        cells.sort_by(|a, b| a.name.cmp(&b.name));
        cells
            .into_iter()
            .filter_map(|cell| cell.value().map(|v| (cell.handle.clone(), v)))
            .collect()
    }
}
