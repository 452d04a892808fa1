use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const COMPLETE_WRITE_EVENT: &str = "complete_write";

/// Events the file monitor publishes. Payloads are snapshots captured at
/// emission time, not live buffer references.
#[derive(Debug, Clone)]
pub enum FsEvent {
    CompleteWrite { path: String, content: Vec<u8> },
}

impl FsEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FsEvent::CompleteWrite { .. } => COMPLETE_WRITE_EVENT,
        }
    }
}

/// A listener declares the event name it handles; the bus routes by name.
#[async_trait]
pub trait FsEventListener: Send + Sync {
    fn event_name(&self) -> &'static str;
    async fn handle_event(&self, event: &FsEvent);
}

/// Minimal publish-subscribe between the monitor and its listeners.
///
/// `publish` pushes onto an unbounded channel and returns immediately, so
/// the monitor tick never waits on DHT round-trips. A single dispatcher
/// task drains the channel and runs matching listeners in registration
/// order, which preserves the per-path emission order end to end.
pub struct EventBus {
    listeners: Vec<std::sync::Arc<dyn FsEventListener>>,
}

#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::UnboundedSender<FsEvent>,
}

impl BusHandle {
    pub fn publish(&self, event: FsEvent) {
        // Send only fails after the dispatcher has gone away, i.e. during
        // teardown; the event is dropped with the rest of the session.
        let _ = self.tx.send(event);
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn register(&mut self, listener: std::sync::Arc<dyn FsEventListener>) {
        self.listeners.push(listener);
    }

    /// Start the dispatcher. The task ends once every `BusHandle` clone has
    /// been dropped and the channel drained.
    pub fn spawn(self) -> (BusHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<FsEvent>();
        let listeners = self.listeners;
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                debug!("dispatching event {}", event.name());
                for listener in &listeners {
                    if listener.event_name() == event.name() {
                        listener.handle_event(&event).await;
                    }
                }
            }
        });
        (BusHandle { tx }, task)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
