use log::{debug, warn};
use tokio::sync::mpsc;
use tonic::Status;

use crate::error::RelayError;
use crate::service::{ErrorKind, EventType, SessionState, StreamSessionData, StreamSessionEvent};
use crate::supervisor::SupervisorState;

/// Inbound event on a session's transport, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Start,
    Chunk(Vec<u8>),
    Stop,
}

impl TransportEvent {
    /// `None` for frames without a recognised event type.
    pub fn from_wire(data: StreamSessionData) -> Option<Self> {
        match data.r#type() {
            EventType::StartStream => Some(TransportEvent::Start),
            EventType::StreamData => Some(TransportEvent::Chunk(data.payload)),
            EventType::StopStream => Some(TransportEvent::Stop),
            EventType::Unspecified => None,
        }
    }
}

/// Outbound half of a session's transport. Sends never wait: a client that
/// stops reading its events loses them instead of stalling the session.
#[derive(Clone)]
pub struct EventSink {
    session_id: usize,
    tx: mpsc::Sender<Result<StreamSessionEvent, Status>>,
}

impl EventSink {
    pub fn new(session_id: usize, tx: mpsc::Sender<Result<StreamSessionEvent, Status>>) -> Self {
        EventSink { session_id, tx }
    }

    pub fn state(&self, state: SupervisorState) {
        self.send(StreamSessionEvent {
            session_id: self.session_id as u64,
            state: SessionState::from(state) as i32,
            error: ErrorKind::Unspecified as i32,
            message: String::new(),
        });
    }

    pub fn error(&self, state: SupervisorState, err: &RelayError) {
        self.send(StreamSessionEvent {
            session_id: self.session_id as u64,
            state: SessionState::from(state) as i32,
            error: err.kind() as i32,
            message: err.to_string(),
        });
    }

    fn send(&self, event: StreamSessionEvent) {
        match self.tx.try_send(Ok(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("session {} client not reading events, dropping one", self.session_id)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("session {} event stream closed", self.session_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wire_events() {
        let start = StreamSessionData {
            r#type: EventType::StartStream as i32,
            payload: Vec::new(),
        };
        assert_eq!(TransportEvent::from_wire(start), Some(TransportEvent::Start));

        let data = StreamSessionData {
            r#type: EventType::StreamData as i32,
            payload: b"frame".to_vec(),
        };
        assert_eq!(
            TransportEvent::from_wire(data),
            Some(TransportEvent::Chunk(b"frame".to_vec()))
        );

        let unknown = StreamSessionData {
            r#type: 42,
            payload: Vec::new(),
        };
        assert_eq!(TransportEvent::from_wire(unknown), None);
    }

    #[tokio::test]
    async fn full_sink_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = EventSink::new(3, tx);
        sink.state(SupervisorState::Starting);
        sink.state(SupervisorState::Running);

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.session_id, 3);
        assert_eq!(first.state(), SessionState::Starting);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn errors_carry_kind_and_message() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = EventSink::new(0, tx);
        sink.error(
            SupervisorState::Terminated,
            &RelayError::UnexpectedProcessExit { code: Some(1) },
        );

        let event = rx.recv().await.unwrap().unwrap();
        assert_eq!(event.error(), ErrorKind::UnexpectedProcessExit);
        assert!(event.message.contains("code 1"));
    }
}
