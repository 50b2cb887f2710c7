//! Events published by a client.
//!
//! The client never renders anything. Connection progress, per-eval lifecycle
//! transitions and one-off notices are broadcast as typed events; a UI
//! subscribes and decides how to show them.

use crate::eval::{EvalFailure, LookupInfo};
use crate::session::SessionPhase;
use std::time::Duration;
use tokio::sync::broadcast;

/// Connection state change, with the text a status bar would show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub phase: SessionPhase,
    /// `None` clears the status.
    pub label: Option<String>,
}

/// What happened to an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalEventKind {
    /// Registered and sent; `phase` is the current progress label.
    Pending { phase: String },
    /// Still running; show the next progress label in place.
    Progress { phase: String },
    /// An interrupt was sent on the caller's behalf.
    Interrupting,
    Succeeded {
        value: String,
        elapsed: Option<Duration>,
    },
    Failed(EvalFailure),
    /// `None` when the symbol was not found.
    LookupComplete(Option<LookupInfo>),
    /// The server finished without producing a result.
    Canceled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalEvent {
    pub id: u64,
    pub kind: EvalEventKind,
}

impl EvalEvent {
    pub fn new(id: u64, kind: EvalEventKind) -> Self {
        Self { id, kind }
    }

    /// Whether the eval will not produce further events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EvalEventKind::Succeeded { .. }
                | EvalEventKind::Failed(_)
                | EvalEventKind::LookupComplete(_)
                | EvalEventKind::Canceled
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connection(ConnectionStatus),
    Eval(EvalEvent),
    /// A one-off message for the user, e.g. a failed connect or a lost connection.
    Notice(String),
}

/// Publishing side of the event channel. Sends never block and are dropped
/// when nobody is subscribed.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }

    pub fn eval(&self, id: u64, kind: EvalEventKind) {
        self.publish(ClientEvent::Eval(EvalEvent::new(id, kind)));
    }

    pub fn connection(&self, phase: SessionPhase, label: Option<String>) {
        self.publish(ClientEvent::Connection(ConnectionStatus { phase, label }));
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.publish(ClientEvent::Notice(message.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.eval(10, EvalEventKind::Canceled);
        bus.notice("Connection lost");

        assert_eq!(
            rx.recv().await.unwrap(),
            ClientEvent::Eval(EvalEvent::new(10, EvalEventKind::Canceled))
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ClientEvent::Notice("Connection lost".to_string())
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.connection(SessionPhase::Cloning, Some("🌒 Cloning session".into()));
    }

    #[test]
    fn test_terminal_events() {
        assert!(EvalEvent::new(1, EvalEventKind::Canceled).is_terminal());
        assert!(!EvalEvent::new(1, EvalEventKind::Interrupting).is_terminal());
        assert!(!EvalEvent::new(
            1,
            EvalEventKind::Progress {
                phase: "🌑".into()
            }
        )
        .is_terminal());
    }
}
