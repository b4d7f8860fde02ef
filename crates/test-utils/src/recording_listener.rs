use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use epics_acm::{CommandMonitor, CommandState, CompletionListener};
use tokio::sync::mpsc;

/// One observed listener invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub execution: u64,
    pub state: CommandState,
    pub thread: ThreadId,
    pub thread_name: Option<String>,
}

/// A completion listener that:
/// - records every invocation (execution id, observed state, thread)
/// - notifies the test through an mpsc channel.
pub struct RecordingListener {
    invocations: Arc<Mutex<Vec<Invocation>>>,
    notify: mpsc::UnboundedSender<Invocation>,
}

/// Test-side view of the listeners created by [`Recorder::listener`].
pub struct Recorder {
    invocations: Arc<Mutex<Vec<Invocation>>>,
    notify_tx: mpsc::UnboundedSender<Invocation>,
    notify_rx: mpsc::UnboundedReceiver<Invocation>,
}

impl Recorder {
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            invocations: Arc::new(Mutex::new(Vec::new())),
            notify_tx,
            notify_rx,
        }
    }

    pub fn listener(&self) -> RecordingListener {
        RecordingListener {
            invocations: Arc::clone(&self.invocations),
            notify: self.notify_tx.clone(),
        }
    }

    /// Wait for the next invocation.
    pub async fn next(&mut self) -> Invocation {
        self.notify_rx
            .recv()
            .await
            .expect("recorder keeps a sender alive")
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionListener for RecordingListener {
    fn on_completion(self: Box<Self>, monitor: &CommandMonitor) {
        let current = thread::current();
        let invocation = Invocation {
            execution: monitor.id(),
            state: monitor.state(),
            thread: current.id(),
            thread_name: current.name().map(str::to_string),
        };

        self.invocations.lock().unwrap().push(invocation.clone());
        let _ = self.notify.send(invocation);
    }
}
