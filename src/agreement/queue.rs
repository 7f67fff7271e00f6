//! Inbound event queue and the single dispatcher that drains it
//!
//! The network layer only enqueues raw bytes; decoding and every state
//! transition happen on the dispatcher task, one event at a time and in
//! arrival order.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agreement::timer::TimerFired;
use crate::agreement::types::NodeId;
use crate::error::{AgreementError, Result};

#[derive(Debug)]
pub enum Event {
    /// Compressed bytes received from a peer, decoded lazily.
    Inbound { from: NodeId, payload: Vec<u8> },
    Timer(TimerFired),
    /// Start a proposal; `committed` runs a commit-reveal session.
    Propose { value: String, committed: bool },
    Shutdown,
}

/// Whatever drives the protocol on the dispatcher task.
pub trait EventHandler: Send {
    fn handle_event(&mut self, event: Event) -> Result<()>;
}

/// Cloneable producer side of a node's queue.
#[derive(Clone, Debug)]
pub struct Ingress {
    tx: mpsc::UnboundedSender<Event>,
}

impl Ingress {
    /// Queue raw bytes from a peer. Never blocks.
    pub fn enqueue(&self, from: NodeId, payload: Vec<u8>) -> Result<()> {
        self.send(Event::Inbound { from, payload })
    }

    pub fn propose(&self, value: impl Into<String>, committed: bool) -> Result<()> {
        self.send(Event::Propose {
            value: value.into(),
            committed,
        })
    }

    pub fn fire(&self, fired: TimerFired) -> Result<()> {
        self.send(Event::Timer(fired))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Event::Shutdown)
    }

    fn send(&self, event: Event) -> Result<()> {
        self.tx.send(event).map_err(|_| AgreementError::Closed)
    }
}

/// Consumer side, owned by the dispatcher.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

pub fn channel() -> (Ingress, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Ingress { tx }, Inbox { rx })
}

pub struct Dispatcher<H: EventHandler> {
    handler: H,
    inbox: Inbox,
}

impl<H: EventHandler> Dispatcher<H> {
    pub fn new(handler: H, inbox: Inbox) -> Self {
        Dispatcher { handler, inbox }
    }

    /// Wait for events, then drain everything queued in arrival order.
    /// Returns the handler on shutdown or once every producer is gone.
    pub async fn run(mut self) -> H {
        info!("Dispatcher: started");
        while let Some(first) = self.inbox.recv().await {
            let mut batch = vec![first];
            while let Some(event) = self.inbox.try_recv() {
                batch.push(event);
            }
            debug!(events = batch.len(), "Dispatcher: draining queue");

            for event in batch {
                if matches!(event, Event::Shutdown) {
                    info!("Dispatcher: shutdown requested");
                    return self.handler;
                }
                if let Err(e) = self.handler.handle_event(event) {
                    if e.is_benign() {
                        debug!(error = %e, "Dispatcher: ignored event");
                    } else {
                        warn!(error = %e, "Dispatcher: event failed");
                    }
                }
            }
        }
        info!("Dispatcher: all producers gone");
        self.handler
    }
}
