//! # Client Socket Boundary
//!
//! Transport-neutral view of the one WebSocket connection that belongs to a
//! conversation. The relay never talks to actix directly; it talks to the two
//! halves defined here:
//!
//! - **SocketReceiver**: inbound frames, consumed only by the audio source's
//!   receive loop
//! - **SocketSender**: outbound frames, written by the dispatcher (audio, control
//!   signals, final close) and by the receive loop when it echoes a peer close
//!
//! Both halves share a [`SocketStatus`], the observable connection state:
//!
//! ```text
//! Open ──► CloseSent ─────┐
//!   │                     ├──► Closed
//!   └────► CloseReceived ─┘
//! ```

#[cfg(test)]
pub mod memory;

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Close code for a normal, intentional shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code used when the server cannot carry on with the conversation.
pub const INTERNAL_ERROR: u16 = 1011;

/// Observable state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Open,
    CloseSent,
    CloseReceived,
    Closed,
}

impl SocketState {
    /// Only an open socket can still deliver new audio.
    pub fn is_open(self) -> bool {
        matches!(self, SocketState::Open)
    }

    /// Frames may still be written: nothing has been sent to end the connection.
    pub fn can_send(self) -> bool {
        matches!(self, SocketState::Open | SocketState::CloseReceived)
    }

    /// Our side has not issued its close frame yet.
    pub fn needs_close(self) -> bool {
        self.can_send()
    }
}

/// Shared, watchable socket state.
///
/// ## Thread Safety:
/// Backed by a `tokio::sync::watch` channel so that async tasks can wait for a
/// transition while the blocking audio reader can still take a cheap snapshot.
#[derive(Debug, Clone)]
pub struct SocketStatus {
    state: Arc<watch::Sender<SocketState>>,
}

impl Default for SocketStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketStatus {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SocketState::Open);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn get(&self) -> SocketState {
        *self.state.borrow()
    }

    /// The peer's close frame arrived.
    pub fn mark_close_received(&self) {
        self.state.send_if_modified(|state| match *state {
            SocketState::Open => {
                *state = SocketState::CloseReceived;
                true
            }
            SocketState::CloseSent => {
                *state = SocketState::Closed;
                true
            }
            _ => false,
        });
    }

    /// Our close frame went out.
    pub fn mark_close_sent(&self) {
        self.state.send_if_modified(|state| match *state {
            SocketState::Open => {
                *state = SocketState::CloseSent;
                true
            }
            SocketState::CloseReceived => {
                *state = SocketState::Closed;
                true
            }
            _ => false,
        });
    }

    /// The transport is gone, whatever the handshake got to.
    pub fn mark_closed(&self) {
        self.state.send_if_modified(|state| {
            if *state == SocketState::Closed {
                false
            } else {
                *state = SocketState::Closed;
                true
            }
        });
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_until(&self, predicate: impl Fn(SocketState) -> bool) {
        let mut updates = self.state.subscribe();
        loop {
            let current = *updates.borrow_and_update();
            if predicate(current) {
                return;
            }
            // The sender lives in `self`, so this only fails if that changes.
            if updates.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until the connection is fully closed.
    #[cfg(test)]
    pub async fn closed(&self) {
        self.wait_until(|state| state == SocketState::Closed).await
    }
}

/// Close status and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub description: Option<String>,
}

impl CloseReason {
    pub fn normal(description: impl Into<String>) -> Self {
        Self {
            code: NORMAL_CLOSURE,
            description: Some(description.into()),
        }
    }
}

/// Frames the relay cares about on the way in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Raw PCM audio from the client
    Binary(Vec<u8>),
    /// Peer-initiated close, with whatever status it supplied
    Close(Option<CloseReason>),
}

/// Frames the relay writes on the way out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Synthesized PCM audio for the client
    Binary(Vec<u8>),
    /// JSON control signal, see [`ControlSignal`]
    Text(String),
    Close(Option<CloseReason>),
}

/// Short JSON messages sent downlink alongside the audio.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ControlSignal {
    /// The user started talking; the client should cut local playback.
    #[serde(rename = "speech_started")]
    SpeechStarted,
}

impl ControlSignal {
    pub fn to_frame(&self) -> OutboundFrame {
        // A fieldless tagged enum always serializes.
        let json = serde_json::to_string(self).unwrap_or_default();
        OutboundFrame::Text(json)
    }
}

/// Why a frame could not be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// Our close frame already went out, or the transport is gone.
    Closed,
    /// The underlying connection refused the frame.
    Transport(String),
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketError::Closed => write!(f, "socket is closed"),
            SocketError::Transport(msg) => write!(f, "socket transport error: {}", msg),
        }
    }
}

impl std::error::Error for SocketError {}

/// Inbound half of the client connection.
pub trait SocketReceiver: Send + 'static {
    /// Next inbound frame, or `None` once the transport has gone away.
    fn receive(&mut self) -> impl Future<Output = Option<InboundFrame>> + Send;
}

/// Outbound half of the client connection.
///
/// Implementations move the shared [`SocketStatus`] forward when a close frame
/// is written, and refuse every frame once it can no longer be sent.
pub trait SocketSender: Clone + Send + Sync + 'static {
    fn send(&self, frame: OutboundFrame) -> impl Future<Output = Result<(), SocketError>> + Send;

    fn status(&self) -> &SocketStatus;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_close_handshake_from_either_side() {
        let status = SocketStatus::new();
        status.mark_close_sent();
        assert_eq!(status.get(), SocketState::CloseSent);
        status.mark_close_received();
        assert_eq!(status.get(), SocketState::Closed);

        let status = SocketStatus::new();
        status.mark_close_received();
        assert_eq!(status.get(), SocketState::CloseReceived);
        assert!(status.get().needs_close());
        status.mark_close_sent();
        assert_eq!(status.get(), SocketState::Closed);
    }

    #[test]
    fn test_closed_is_final() {
        let status = SocketStatus::new();
        status.mark_closed();
        status.mark_close_received();
        status.mark_close_sent();
        assert_eq!(status.get(), SocketState::Closed);
        assert!(!status.get().can_send());
    }

    #[tokio::test]
    async fn test_closed_wakes_waiters() {
        let status = SocketStatus::new();
        let watcher = status.clone();
        let waiter = tokio::spawn(async move { watcher.closed().await });

        status.mark_close_received();
        status.mark_close_sent();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should observe the close")
            .unwrap();
    }

    #[test]
    fn test_speech_started_signal() {
        assert_eq!(
            ControlSignal::SpeechStarted.to_frame(),
            OutboundFrame::Text(r#"{"type":"speech_started"}"#.to_string())
        );
    }
}
