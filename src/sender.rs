// src/sender.rs

//! Command sender: the façade over one apply record.
//!
//! A `CommandSender` owns the parameter registry of one command and runs the
//! mark/clear/trigger protocol against the apply record's channels:
//!
//! - `mark` / `clear` write the `MARK` / `CLEAR` directive.
//! - `post` writes every parameter value, subscribes the CAR status channel,
//!   writes `START`, and hands the subscription to a completion driver task
//!   that publishes exactly one outcome on the new monitor.
//! - `post_wait`, `post_wait_until` and `post_callback` are consumers of that
//!   monitor's completion future.
//!
//! Trigger operations and parameter mutation are serialized by one async
//! mutex. The protocol state itself lives behind a short synchronous lock so
//! the completion driver can release the sender and publish the outcome in
//! one step, without waiting for a long-running `add` to finish.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{ChannelHandle, ChannelService, ChannelSubscription, ChannelUpdate};
use crate::config::SenderDefinition;
use crate::errors::{ChannelError, CommandError, Result};
use crate::listener::{CompletionListener, ListenerDispatcher};
use crate::monitor::{monitor_pair, CommandMonitor, CompletionHandle, Outcome, WeakMonitor};
use crate::params::{Parameter, ParameterCell, ParameterRegistry};
use crate::protocol::{CompletionTracker, SenderEvent, SenderState, TransitionError, Verdict};
use crate::types::{Directive, ParameterValue, Value, ValueKind};

const DISPATCH_THREAD_NAME: &str = "acm-dispatch";

/// Channel names of the apply record (and its CAR record) a sender drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyChannels {
    /// Receives `START`.
    pub directive: String,
    /// Receives `MARK` and `CLEAR`. Usually the same as `directive`.
    pub mark: String,
    /// CAR state: `IDLE`, `PAUSED`, `BUSY`, `ERROR`.
    pub status: String,
    /// CAR error text, read when the status turns `ERROR`.
    pub message: Option<String>,
}

impl ApplyChannels {
    pub fn new(directive: &str, status: &str) -> Self {
        Self {
            directive: directive.to_string(),
            mark: directive.to_string(),
            status: status.to_string(),
            message: None,
        }
    }

    /// Standard field layout: `<apply>.DIR`, `<car>.VAL`, `<car>.OMSS`.
    pub fn from_records(apply: &str, car: &str) -> Self {
        Self {
            directive: format!("{apply}.DIR"),
            mark: format!("{apply}.DIR"),
            status: format!("{car}.VAL"),
            message: Some(format!("{car}.OMSS")),
        }
    }

    pub fn with_mark_channel(mut self, mark: &str) -> Self {
        self.mark = mark.to_string();
        self
    }

    pub fn with_message_channel(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }
}

/// Bounded timeouts applied by a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderConfig {
    /// Per channel connection, in `connect` and `add`.
    pub connect_timeout: Duration,
    /// Per acknowledged channel write.
    pub write_timeout: Duration,
    /// Longest silence on the status channel before the execution is
    /// forced to `Failure`.
    pub command_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct ApplyHandles {
    directive: ChannelHandle,
    mark: ChannelHandle,
    status: ChannelHandle,
    message: Option<ChannelHandle>,
}

impl ApplyHandles {
    async fn connect(
        service: &dyn ChannelService,
        apply: &ApplyChannels,
        timeout: Duration,
    ) -> Result<Self> {
        let mut connected = Vec::new();
        match Self::connect_all(service, apply, timeout, &mut connected).await {
            Ok(handles) => Ok(handles),
            Err(e) => {
                for handle in connected {
                    let _ = service.disconnect(handle).await;
                }
                Err(e)
            }
        }
    }

    async fn connect_all(
        service: &dyn ChannelService,
        apply: &ApplyChannels,
        timeout: Duration,
        connected: &mut Vec<ChannelHandle>,
    ) -> Result<Self> {
        let directive = connect_channel(service, &apply.directive, ValueKind::Integer, timeout).await?;
        connected.push(directive.clone());

        let mark = if apply.mark == apply.directive {
            directive.clone()
        } else {
            let handle = connect_channel(service, &apply.mark, ValueKind::Integer, timeout).await?;
            connected.push(handle.clone());
            handle
        };

        let status = connect_channel(service, &apply.status, ValueKind::Integer, timeout).await?;
        connected.push(status.clone());

        let message = match &apply.message {
            Some(name) => {
                let handle = connect_channel(service, name, ValueKind::String, timeout).await?;
                connected.push(handle.clone());
                Some(handle)
            }
            None => None,
        };

        Ok(Self {
            directive,
            mark,
            status,
            message,
        })
    }

    /// Every distinct handle, for disconnecting.
    fn into_distinct(self) -> Vec<ChannelHandle> {
        let mut handles = vec![self.directive];
        if self.mark.id() != handles[0].id() {
            handles.push(self.mark);
        }
        handles.push(self.status);
        handles.extend(self.message);
        handles
    }
}

async fn connect_channel(
    service: &dyn ChannelService,
    channel: &str,
    kind: ValueKind,
    after: Duration,
) -> Result<ChannelHandle> {
    match tokio::time::timeout(after, service.connect(channel, kind)).await {
        Ok(Ok(handle)) => {
            debug!(channel, %kind, "channel connected");
            Ok(handle)
        }
        Ok(Err(source)) => Err(CommandError::ChannelConnection {
            channel: channel.to_string(),
            source,
        }),
        Err(_) => Err(CommandError::ChannelConnection {
            channel: channel.to_string(),
            source: ChannelError::Timeout {
                channel: channel.to_string(),
                after,
            },
        }),
    }
}

/// Guarded by the async mutex: everything a trigger or a parameter
/// mutation touches.
struct SenderCore {
    registry: ParameterRegistry,
    /// `None` once the sender has been shut down.
    handles: Option<ApplyHandles>,
    next_execution: u64,
}

struct StateCell {
    state: SenderState,
    outstanding: Option<WeakMonitor>,
}

struct SenderShared {
    name: String,
    description: String,
    apply: ApplyChannels,
    config: SenderConfig,
    service: Arc<dyn ChannelService>,
    dispatcher: ListenerDispatcher,
    core: Mutex<SenderCore>,
    state: StdMutex<StateCell>,
}

impl SenderShared {
    fn state_cell(&self) -> MutexGuard<'_, StateCell> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release the sender from `Busy` and publish the outcome atomically.
    fn finish(&self, completion: &CompletionHandle, outcome: Outcome) {
        let execution = completion.id();
        let failure = match &outcome {
            Outcome::Success => None,
            Outcome::Failure(failure) => Some(failure.to_string()),
        };

        {
            let mut cell = self.state_cell();
            match cell.state.transition(SenderEvent::Completed { execution }) {
                Ok(next) => {
                    cell.state = next;
                    cell.outstanding = None;
                }
                Err(e) => {
                    warn!(sender = %self.name, error = %e, "completion did not match sender state");
                }
            }
            completion.complete(outcome);
        }

        match failure {
            None => info!(sender = %self.name, execution, "command completed successfully"),
            Some(reason) => warn!(sender = %self.name, execution, %reason, "command failed"),
        }
    }
}

/// Shared handle to one command sender. Clones drive the same apply record.
#[derive(Clone)]
pub struct CommandSender {
    shared: Arc<SenderShared>,
}

impl fmt::Debug for CommandSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSender")
            .field("name", &self.shared.name)
            .field("apply", &self.shared.apply)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CommandSender {
    /// Connect the apply-record channels and create a sender with its own
    /// listener dispatch thread.
    pub async fn connect(
        name: &str,
        description: &str,
        apply: ApplyChannels,
        service: Arc<dyn ChannelService>,
        config: SenderConfig,
    ) -> Result<Self> {
        let dispatcher = ListenerDispatcher::spawn(DISPATCH_THREAD_NAME)?;
        Self::connect_with_dispatcher(name, description, apply, service, config, dispatcher).await
    }

    /// Like [`CommandSender::connect`], sharing an existing dispatcher.
    pub async fn connect_with_dispatcher(
        name: &str,
        description: &str,
        apply: ApplyChannels,
        service: Arc<dyn ChannelService>,
        config: SenderConfig,
        dispatcher: ListenerDispatcher,
    ) -> Result<Self> {
        let handles = ApplyHandles::connect(service.as_ref(), &apply, config.connect_timeout).await?;

        info!(
            sender = name,
            directive = %apply.directive,
            status = %apply.status,
            "command sender connected"
        );

        Ok(Self {
            shared: Arc::new(SenderShared {
                name: name.to_string(),
                description: description.to_string(),
                apply,
                config,
                service,
                dispatcher,
                core: Mutex::new(SenderCore {
                    registry: ParameterRegistry::new(),
                    handles: Some(handles),
                    next_execution: 1,
                }),
                state: StdMutex::new(StateCell {
                    state: SenderState::Idle,
                    outstanding: None,
                }),
            }),
        })
    }

    /// Build a sender and register every parameter of a configured definition.
    pub async fn from_definition(
        definition: &SenderDefinition,
        service: Arc<dyn ChannelService>,
        dispatcher: ListenerDispatcher,
    ) -> Result<Self> {
        let sender = Self::connect_with_dispatcher(
            &definition.name,
            &definition.description,
            definition.apply.clone(),
            service,
            definition.config,
            dispatcher,
        )
        .await?;

        for (name, param) in &definition.parameters {
            let mut core = sender.shared.core.lock().await;
            sender
                .add_cell(&mut core, name, &param.channel, param.kind, param.description.as_deref())
                .await?;
        }

        Ok(sender)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn description(&self) -> &str {
        &self.shared.description
    }

    pub fn apply_channels(&self) -> &ApplyChannels {
        &self.shared.apply
    }

    pub fn config(&self) -> SenderConfig {
        self.shared.config
    }

    pub fn state(&self) -> SenderState {
        self.shared.state_cell().state
    }

    /// The monitor of the execution in flight, if the caller still holds it.
    pub fn outstanding(&self) -> Option<CommandMonitor> {
        self.shared
            .state_cell()
            .outstanding
            .as_ref()
            .and_then(WeakMonitor::upgrade)
    }

    pub async fn parameter_names(&self) -> BTreeSet<String> {
        self.shared.core.lock().await.registry.names()
    }

    // ---------------------------------------------------------------------
    // Parameters
    // ---------------------------------------------------------------------

    /// Register a parameter, or return the existing one if it was already
    /// registered with the same type and channel.
    pub async fn add<T: ParameterValue>(
        &self,
        name: &str,
        channel: &str,
        description: Option<&str>,
    ) -> Result<Parameter<T>> {
        let mut core = self.shared.core.lock().await;
        let cell = self.add_cell(&mut core, name, channel, T::KIND, description).await?;
        Ok(Parameter::new(cell))
    }

    pub async fn add_integer(
        &self,
        name: &str,
        channel: &str,
        description: Option<&str>,
    ) -> Result<Parameter<i32>> {
        self.add(name, channel, description).await
    }

    pub async fn add_double(
        &self,
        name: &str,
        channel: &str,
        description: Option<&str>,
    ) -> Result<Parameter<f64>> {
        self.add(name, channel, description).await
    }

    pub async fn add_float(
        &self,
        name: &str,
        channel: &str,
        description: Option<&str>,
    ) -> Result<Parameter<f32>> {
        self.add(name, channel, description).await
    }

    pub async fn add_string(
        &self,
        name: &str,
        channel: &str,
        description: Option<&str>,
    ) -> Result<Parameter<String>> {
        self.add(name, channel, description).await
    }

    async fn add_cell(
        &self,
        core: &mut SenderCore,
        name: &str,
        channel: &str,
        kind: ValueKind,
        description: Option<&str>,
    ) -> Result<Arc<ParameterCell>> {
        self.ensure_open(core)?;

        if let Some(cell) = core.registry.find_compatible(name, kind, channel)? {
            debug!(sender = %self.shared.name, parameter = name, "parameter already registered");
            return Ok(cell);
        }

        let handle = connect_channel(
            self.shared.service.as_ref(),
            channel,
            kind,
            self.shared.config.connect_timeout,
        )
        .await?;
        let cell = core.registry.insert(name, channel, description, handle);

        info!(
            sender = %self.shared.name,
            parameter = name,
            channel,
            %kind,
            "parameter added"
        );
        Ok(cell)
    }

    /// Typed lookup; a parameter of another type is reported as absent.
    pub async fn get<T: ParameterValue>(&self, name: &str) -> Option<Parameter<T>> {
        self.shared.core.lock().await.registry.get(name)
    }

    pub async fn get_integer(&self, name: &str) -> Option<Parameter<i32>> {
        self.get(name).await
    }

    pub async fn get_double(&self, name: &str) -> Option<Parameter<f64>> {
        self.get(name).await
    }

    pub async fn get_float(&self, name: &str) -> Option<Parameter<f32>> {
        self.get(name).await
    }

    pub async fn get_string(&self, name: &str) -> Option<Parameter<String>> {
        self.get(name).await
    }

    /// Set a parameter from an untyped value, checking its kind.
    pub async fn set_value(&self, name: &str, value: Value) -> Result<()> {
        let core = self.shared.core.lock().await;
        let cell = core
            .registry
            .cell(name)
            .ok_or_else(|| CommandError::ParameterNotFound(name.to_string()))?;

        if cell.kind() != value.kind() {
            return Err(CommandError::InvalidValue {
                name: name.to_string(),
                expected: cell.kind(),
                actual: value.kind(),
            });
        }

        cell.set_value(Some(value));
        Ok(())
    }

    /// Remove a parameter and release its channel. Unknown names are ignored.
    pub async fn remove(&self, name: &str) {
        let mut core = self.shared.core.lock().await;
        let Some(cell) = core.registry.remove(name) else {
            debug!(sender = %self.shared.name, parameter = name, "remove: no such parameter");
            return;
        };

        self.release(cell.handle().clone()).await;
        info!(sender = %self.shared.name, parameter = cell.name(), "parameter removed");
    }

    /// Release every channel binding. Later calls fail with `SenderClosed`.
    pub async fn shutdown(&self) {
        let mut core = self.shared.core.lock().await;
        let Some(handles) = core.handles.take() else {
            return;
        };

        for cell in core.registry.drain() {
            self.release(cell.handle().clone()).await;
        }
        for handle in handles.into_distinct() {
            self.release(handle).await;
        }

        info!(sender = %self.shared.name, "command sender shut down");
    }

    // ---------------------------------------------------------------------
    // Protocol
    // ---------------------------------------------------------------------

    /// Flag the command for execution without triggering it.
    pub async fn mark(&self) -> Result<()> {
        self.write_directive(SenderEvent::Mark, Directive::Mark).await
    }

    /// Drop the mark flag of a staged command.
    pub async fn clear(&self) -> Result<()> {
        self.write_directive(SenderEvent::Clear, Directive::Clear).await
    }

    async fn write_directive(&self, event: SenderEvent, directive: Directive) -> Result<()> {
        let core = self.shared.core.lock().await;
        let handles = self.ensure_open(&core)?.clone();
        let next = self.guard(event)?;

        self.write_channel(&handles.mark, directive.value()).await?;

        // Only a Busy sender can change state without holding `core`.
        self.shared.state_cell().state = next;
        debug!(sender = %self.shared.name, ?directive, state = ?next, "directive written");
        Ok(())
    }

    /// Trigger the apply record and return immediately.
    pub async fn post(&self) -> Result<CommandMonitor> {
        let mut core = self.shared.core.lock().await;
        let handles = self.ensure_open(&core)?.clone();
        let execution = core.next_execution;
        let next = self.guard(SenderEvent::Trigger { execution })?;

        for (handle, value) in core.registry.pending_writes() {
            debug!(sender = %self.shared.name, channel = handle.name(), %value, "writing parameter");
            self.write_channel(&handle, value).await?;
        }

        // Subscribe before START so no status transition is missed.
        let status = self.subscribe_channel(&handles.status).await?;
        let message = match &handles.message {
            Some(handle) => Some(self.subscribe_channel(handle).await?),
            None => None,
        };

        self.write_channel(&handles.directive, Directive::Start.value()).await?;

        core.next_execution += 1;
        let (monitor, completion) = monitor_pair(execution, &self.shared.name);
        {
            let mut cell = self.shared.state_cell();
            cell.state = next;
            cell.outstanding = Some(monitor.downgrade());
        }
        drop(core);

        info!(sender = %self.shared.name, execution, "command triggered");

        tokio::spawn(drive_completion(
            Arc::downgrade(&self.shared),
            completion,
            handles.status.name().to_string(),
            status,
            message,
            self.shared.config.command_timeout,
        ));

        Ok(monitor)
    }

    /// Trigger and wait until the execution is terminal.
    ///
    /// Remote failures and timeouts are reported through the returned
    /// monitor, not as an error.
    pub async fn post_wait(&self) -> Result<CommandMonitor> {
        let monitor = self.post().await?;
        monitor.wait().await?;
        Ok(monitor)
    }

    /// Trigger and wait, giving up locally when `cancel` fires.
    ///
    /// On cancellation `Interrupted` is returned and the execution carries
    /// on; the sender stays `Busy` until its outcome arrives.
    pub async fn post_wait_until(&self, cancel: oneshot::Receiver<()>) -> Result<CommandMonitor> {
        let monitor = self.post().await?;
        monitor.wait_until(cancel).await?;
        Ok(monitor)
    }

    /// Trigger and run `listener` once on the dispatch thread when the
    /// execution is terminal.
    pub async fn post_callback<L: CompletionListener>(&self, listener: L) -> Result<CommandMonitor> {
        let monitor = self.post().await?;
        self.shared
            .dispatcher
            .register(monitor.clone(), Box::new(listener));
        Ok(monitor)
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn ensure_open<'c>(&self, core: &'c SenderCore) -> Result<&'c ApplyHandles> {
        core.handles.as_ref().ok_or_else(|| CommandError::SenderClosed {
            sender: self.shared.name.clone(),
        })
    }

    /// Check `event` against the current state without applying it.
    fn guard(&self, event: SenderEvent) -> Result<SenderState> {
        self.shared
            .state_cell()
            .state
            .transition(event)
            .map_err(|e| match e {
                TransitionError::Busy { execution } => CommandError::CommandBusy {
                    sender: self.shared.name.clone(),
                    execution,
                },
                stale @ TransitionError::Stale { .. } => CommandError::Other(anyhow!(stale)),
            })
    }

    async fn write_channel(&self, handle: &ChannelHandle, value: Value) -> Result<()> {
        let after = self.shared.config.write_timeout;
        match tokio::time::timeout(after, self.shared.service.write(handle, value)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(ChannelError::Timeout { .. })) | Err(_) => {
                warn!(sender = %self.shared.name, channel = handle.name(), ?after, "channel write timed out");
                Err(CommandError::ChannelTimeout {
                    channel: handle.name().to_string(),
                    after,
                })
            }
            Ok(Err(e)) => Err(CommandError::Channel(e)),
        }
    }

    async fn subscribe_channel(&self, handle: &ChannelHandle) -> Result<ChannelSubscription> {
        let after = self.shared.config.write_timeout;
        match tokio::time::timeout(after, self.shared.service.subscribe(handle)).await {
            Ok(res) => res.map_err(CommandError::from),
            Err(_) => Err(CommandError::ChannelTimeout {
                channel: handle.name().to_string(),
                after,
            }),
        }
    }

    async fn release(&self, handle: ChannelHandle) {
        let channel = handle.name().to_string();
        if let Err(e) = self.shared.service.disconnect(handle).await {
            warn!(sender = %self.shared.name, %channel, error = %e, "failed to disconnect channel");
        }
    }
}

/// Follow one execution's status channel until it ends, then release the
/// sender and publish the outcome.
async fn drive_completion(
    sender: Weak<SenderShared>,
    completion: CompletionHandle,
    status_channel: String,
    mut status: ChannelSubscription,
    mut message: Option<ChannelSubscription>,
    timeout: Duration,
) {
    let execution = completion.id();
    let mut tracker = CompletionTracker::new(&status_channel);
    let mut message_open = message.is_some();

    // Restarted by every status update.
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let verdict = loop {
        tokio::select! {
            biased;

            update = next_update(&mut message), if message_open => match update {
                Some(update) => tracker.on_message(update),
                None => message_open = false,
            },

            update = status.recv() => match update {
                Some(update) => {
                    deadline.as_mut().reset(Instant::now() + timeout);
                    if let Some(verdict) = tracker.on_status(update) {
                        break verdict;
                    }
                }
                None => break tracker.on_status_closed(),
            },

            _ = &mut deadline => break Verdict::TimedOut { after: timeout },
        }
    };

    // Pick up a message published together with the final status.
    if let Some(rx) = message.as_mut() {
        while let Ok(update) = rx.try_recv() {
            tracker.on_message(update);
        }
    }

    debug!(execution, ?verdict, channel = %status_channel, "status stream ended");
    let outcome = tracker.resolve(verdict);

    match sender.upgrade() {
        Some(shared) => shared.finish(&completion, outcome),
        None => {
            completion.complete(outcome);
        }
    }
}

async fn next_update(sub: &mut Option<ChannelSubscription>) -> Option<ChannelUpdate> {
    match sub {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
