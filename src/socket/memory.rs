//! In-memory client connection used by the relay's tests.

use super::{
    CloseReason, InboundFrame, OutboundFrame, SocketError, SocketReceiver, SocketSender,
    SocketStatus,
};
use tokio::sync::mpsc;

/// Build a connected socket: the relay-side halves plus a handle playing the client.
pub fn pair() -> (MemoryPeer, MemoryReceiver, MemorySender) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let status = SocketStatus::new();

    let peer = MemoryPeer {
        inbound: Some(inbound_tx),
        outbound: outbound_rx,
        status: status.clone(),
    };
    let receiver = MemoryReceiver { inbound: inbound_rx };
    let sender = MemorySender {
        outbound: outbound_tx,
        status,
    };
    (peer, receiver, sender)
}

/// The client end of the connection.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<InboundFrame>>,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    pub status: SocketStatus,
}

impl MemoryPeer {
    pub fn send_audio(&self, data: &[u8]) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(InboundFrame::Binary(data.to_vec()));
        }
    }

    pub fn close(&self, code: u16, description: &str) {
        self.status.mark_close_received();
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(InboundFrame::Close(Some(CloseReason {
                code,
                description: Some(description.to_string()),
            })));
        }
    }

    /// Drop the connection without a close handshake.
    pub fn disconnect(&mut self) {
        self.inbound = None;
        self.status.mark_closed();
    }

    /// Everything the relay has written so far.
    pub fn sent_frames(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

pub struct MemoryReceiver {
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

impl SocketReceiver for MemoryReceiver {
    async fn receive(&mut self) -> Option<InboundFrame> {
        self.inbound.recv().await
    }
}

#[derive(Clone)]
pub struct MemorySender {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    status: SocketStatus,
}

impl SocketSender for MemorySender {
    async fn send(&self, frame: OutboundFrame) -> Result<(), SocketError> {
        if !self.status.get().can_send() {
            return Err(SocketError::Closed);
        }
        if matches!(frame, OutboundFrame::Close(_)) {
            self.status.mark_close_sent();
        }
        self.outbound
            .send(frame)
            .map_err(|_| SocketError::Transport("peer dropped".to_string()))
    }

    fn status(&self) -> &SocketStatus {
        &self.status
    }
}
