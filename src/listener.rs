// src/listener.rs

//! Completion listeners and the thread that runs them.
//!
//! Listeners are never called from the channel notification path. Once a
//! monitor is terminal, a delivery is queued to the dispatcher, which runs
//! each listener on its own OS thread. A slow listener delays only the
//! listeners queued behind it; a panicking one is caught and logged.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::monitor::CommandMonitor;

/// One-shot callback for a single execution.
pub trait CompletionListener: Send + 'static {
    fn on_completion(self: Box<Self>, monitor: &CommandMonitor);
}

impl<F> CompletionListener for F
where
    F: FnOnce(&CommandMonitor) + Send + 'static,
{
    fn on_completion(self: Box<Self>, monitor: &CommandMonitor) {
        (*self)(monitor)
    }
}

struct Delivery {
    listener: Box<dyn CompletionListener>,
    monitor: CommandMonitor,
}

/// Queue feeding the dispatch thread. Cloning shares the same thread.
#[derive(Clone)]
pub struct ListenerDispatcher {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl std::fmt::Debug for ListenerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerDispatcher")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl ListenerDispatcher {
    /// Start the dispatch thread. It exits once every clone is dropped.
    pub fn spawn(thread_name: &str) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
        let name = thread_name.to_string();

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || dispatch_loop(&name, rx))?;

        Ok(Self { tx })
    }

    /// Deliver `listener` once `monitor` is terminal.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(&self, monitor: CommandMonitor, listener: Box<dyn CompletionListener>) {
        let tx = self.tx.clone();

        tokio::spawn(async move {
            match monitor.wait().await {
                Ok(state) => {
                    debug!(
                        sender = %monitor.sender(),
                        execution = monitor.id(),
                        ?state,
                        "queueing completion listener"
                    );
                    if tx.send(Delivery { listener, monitor }).is_err() {
                        warn!("listener dispatcher is gone; dropping listener");
                    }
                }
                Err(e) => {
                    warn!(
                        sender = %monitor.sender(),
                        execution = monitor.id(),
                        error = %e,
                        "execution never completed; listener dropped"
                    );
                }
            }
        });
    }
}

fn dispatch_loop(name: &str, mut rx: mpsc::UnboundedReceiver<Delivery>) {
    info!(thread = name, "listener dispatcher started");

    while let Some(Delivery { listener, monitor }) = rx.blocking_recv() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| listener.on_completion(&monitor)));
        if result.is_err() {
            error!(
                sender = %monitor.sender(),
                execution = monitor.id(),
                "completion listener panicked"
            );
        }
    }

    info!(thread = name, "listener dispatcher finished (queue closed)");
}
