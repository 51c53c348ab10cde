//! # Conversation WebSocket Handler
//!
//! Accepts client connections on `/ws/conversation`. Each connection carries one
//! conversation: the client streams raw PCM as binary frames and receives the
//! synthesized response audio as binary frames, plus a JSON
//! `{"type":"speech_started"}` text frame whenever the user barges in.
//!
//! ## Actor Bridge:
//! The connection is an actix actor, while the relay works against the
//! transport-neutral traits in [`crate::socket`]:
//! - **Inbound**: binary and close frames are forwarded over an unbounded
//!   channel to the audio source's receive loop ([`ChannelReceiver`])
//! - **Outbound**: the dispatcher sends [`Outbound`] messages to the actor
//!   through [`ActorSocketSender`], which writes them to the socket
//! - **Status**: the actor records every close transition in the shared
//!   [`SocketStatus`]
//!
//! ## Connection Lifecycle:
//! 1. **Upgrade**: a conversation slot is claimed, or the request gets a 503
//! 2. **Start**: the actor spawns the conversation relay task
//! 3. **Streaming**: audio flows both ways until the conversation ends
//! 4. **Close**: whichever side closes first, the other side's close is echoed
//!    and the actor stops; the slot is released with the relay task

use crate::conversation::dispatcher::relay;
use crate::conversation::{ConnectionContext, SessionOptions};
use crate::audio::SourceOptions;
use crate::error::AppError;
use crate::socket::{
    CloseReason, InboundFrame, OutboundFrame, SocketError, SocketReceiver, SocketSender,
    SocketState, SocketStatus,
};
use crate::state::{AppState, ConversationGuard};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Outbound frame request from the relay to the connection actor.
#[derive(Message)]
#[rtype(result = "Result<(), SocketError>")]
pub struct Outbound(pub OutboundFrame);

/// Relay side of the inbound channel.
pub struct ChannelReceiver {
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

impl SocketReceiver for ChannelReceiver {
    async fn receive(&mut self) -> Option<InboundFrame> {
        self.inbound.recv().await
    }
}

/// Writes frames by messaging the connection actor.
#[derive(Clone)]
pub struct ActorSocketSender {
    addr: Addr<ConversationSocket>,
    status: SocketStatus,
}

impl SocketSender for ActorSocketSender {
    async fn send(&self, frame: OutboundFrame) -> Result<(), SocketError> {
        if !self.status.get().can_send() {
            return Err(SocketError::Closed);
        }
        // `send` waits for mailbox space; it only fails once the actor has stopped.
        self.addr
            .send(Outbound(frame))
            .await
            .map_err(mailbox_error)?
    }

    fn status(&self) -> &SocketStatus {
        &self.status
    }
}

/// Everything the relay task needs, held until the actor has an address.
struct PendingConversation {
    receiver: ChannelReceiver,
    state: web::Data<AppState>,
    slot: ConversationGuard,
}

/// WebSocket actor for one client conversation.
pub struct ConversationSocket {
    connection_id: Uuid,

    /// Forwarding half of the inbound channel; dropped when the actor stops
    inbound: Option<mpsc::UnboundedSender<InboundFrame>>,

    status: SocketStatus,

    pending: Option<PendingConversation>,

    /// Last ping or pong from the client
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl ConversationSocket {
    pub fn new(connection_id: Uuid, state: web::Data<AppState>, slot: ConversationGuard) -> Self {
        let (inbound, receiver) = mpsc::unbounded_channel();
        let performance = &state.get_config().performance;
        let heartbeat_interval = Duration::from_secs(performance.heartbeat_interval_secs.max(1));
        let client_timeout = Duration::from_secs(performance.client_timeout_secs.max(1));

        Self {
            connection_id,
            inbound: Some(inbound),
            status: SocketStatus::new(),
            pending: Some(PendingConversation {
                receiver: ChannelReceiver { inbound: receiver },
                state,
                slot,
            }),
            last_heartbeat: Instant::now(),
            heartbeat_interval,
            client_timeout,
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(connection_id = %act.connection_id, "WebSocket heartbeat timeout, closing connection");
                act.status.mark_closed();
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Spawn the relay task that runs this connection's conversation.
    fn start_conversation(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let PendingConversation { receiver, state, slot } = pending;
        let config = state.get_config();

        let options = SessionOptions::from_config(config);
        let context = ConnectionContext {
            connection_id: self.connection_id,
            receiver,
            sender: ActorSocketSender {
                addr: ctx.address(),
                status: self.status.clone(),
            },
            cancel: CancellationToken::new(),
            source_options: SourceOptions::from_settings(&config.audio),
            close_reason: config.conversation.close_reason.clone(),
            uplink_grace: Duration::from_millis(config.conversation.uplink_grace_ms),
        };
        let connection_id = self.connection_id;

        tokio::spawn(async move {
            // The slot is released when the relay is done, not when the socket closes.
            let _slot = slot;
            match relay(&state.client, &options, context).await {
                Some(outcome) => {
                    info!(
                        %connection_id,
                        cause = outcome.cause.as_str(),
                        audio_frames = outcome.audio_frames_sent,
                        audio_bytes = outcome.audio_bytes_sent,
                        responses = outcome.responses.len(),
                        "Conversation ended"
                    );
                    state.record_outcome(&outcome.cause);
                }
                None => state.record_failed_start(),
            }
        });
    }

    fn forward(&self, frame: InboundFrame) -> bool {
        match &self.inbound {
            Some(inbound) => inbound.send(frame).is_ok(),
            None => false,
        }
    }

    fn handle_client_close(&mut self, reason: Option<ws::CloseReason>, ctx: &mut ws::WebsocketContext<Self>) {
        let reason = reason.map(from_ws_reason);
        info!(connection_id = %self.connection_id, ?reason, "Client closed the connection");
        self.status.mark_close_received();

        // Normally the receive loop echoes the close; without one we do it here.
        if !self.forward(InboundFrame::Close(reason.clone())) && self.status.get().needs_close() {
            self.status.mark_close_sent();
            ctx.close(reason.map(to_ws_reason));
        }
        if self.status.get() == SocketState::Closed {
            ctx.stop();
        }
    }
}

fn from_ws_reason(reason: ws::CloseReason) -> CloseReason {
    CloseReason {
        code: u16::from(reason.code),
        description: reason.description,
    }
}

fn to_ws_reason(reason: CloseReason) -> ws::CloseReason {
    ws::CloseReason {
        code: ws::CloseCode::from(reason.code),
        description: reason.description,
    }
}

fn mailbox_error(err: MailboxError) -> SocketError {
    match err {
        MailboxError::Closed => SocketError::Closed,
        other => SocketError::Transport(other.to_string()),
    }
}

impl Actor for ConversationSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "WebSocket connection started");
        self.start_heartbeat(ctx);
        self.start_conversation(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.status.mark_closed();
        // Ends the receive loop if it is still waiting for frames.
        self.inbound = None;
        info!(connection_id = %self.connection_id, "WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConversationSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                if !self.forward(InboundFrame::Binary(data.to_vec())) {
                    trace!(bytes = data.len(), "Dropping client audio, no receiver");
                }
            }
            Ok(ws::Message::Text(text)) => {
                debug!(connection_id = %self.connection_id, len = text.len(), "Ignoring text frame from client");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                self.handle_client_close(reason, ctx);
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.connection_id, error = %err, "WebSocket protocol error");
                self.status.mark_closed();
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for ConversationSocket {
    type Result = Result<(), SocketError>;

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) -> Self::Result {
        if !self.status.get().can_send() {
            return Err(SocketError::Closed);
        }
        match msg.0 {
            OutboundFrame::Binary(data) => ctx.binary(data),
            OutboundFrame::Text(text) => ctx.text(text),
            OutboundFrame::Close(reason) => {
                debug!(connection_id = %self.connection_id, ?reason, "Closing client connection");
                self.status.mark_close_sent();
                ctx.close(reason.map(to_ws_reason));
                ctx.stop();
            }
        }
        Ok(())
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Claims a conversation slot before upgrading, so a server at its limit answers
/// with a plain 503 instead of accepting a socket it cannot serve.
pub async fn conversation_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let Some(slot) = app_state.try_begin_conversation() else {
        warn!(
            limit = app_state.get_config().performance.max_concurrent_sessions,
            "Rejecting conversation, limit reached"
        );
        return Err(AppError::Unavailable("Conversation limit reached".to_string()));
    };

    let connection_id = Uuid::new_v4();
    info!(
        %connection_id,
        peer = ?req.connection_info().peer_addr(),
        "New conversation connection request"
    );

    let socket = ConversationSocket::new(connection_id, app_state.clone(), slot);
    ws::start(socket, &req, stream).map_err(|err| AppError::BadRequest(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::http::StatusCode;
    use actix_web::test as actix_test;
    use actix_web::App;

    fn app_state(limit: usize) -> web::Data<AppState> {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = limit;
        web::Data::new(AppState::new(config))
    }

    #[test]
    fn test_close_reason_conversion() {
        let reason = CloseReason::normal("Conversation finished");
        let ws_reason = to_ws_reason(reason.clone());
        assert_eq!(ws_reason.code, ws::CloseCode::Normal);
        assert_eq!(from_ws_reason(ws_reason), reason);

        let custom = from_ws_reason(ws::CloseReason {
            code: ws::CloseCode::Other(4000),
            description: None,
        });
        assert_eq!(custom.code, 4000);
    }

    #[test]
    fn test_mailbox_errors_map_to_socket_errors() {
        assert_eq!(mailbox_error(MailboxError::Closed), SocketError::Closed);
        assert!(matches!(
            mailbox_error(MailboxError::Timeout),
            SocketError::Transport(_)
        ));
    }

    #[actix_web::test]
    async fn test_upgrade_rejected_at_conversation_limit() {
        let state = app_state(1);
        let _busy = state.try_begin_conversation();
        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws/conversation", web::get().to(conversation_websocket)),
        )
        .await;

        let request = actix_test::TestRequest::get().uri("/ws/conversation").to_request();
        let response = actix_test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.get_metrics_snapshot().rejected, 1);
    }

    #[actix_web::test]
    async fn test_plain_request_is_not_upgraded() {
        let state = app_state(1);
        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws/conversation", web::get().to(conversation_websocket)),
        )
        .await;

        let request = actix_test::TestRequest::get().uri("/ws/conversation").to_request();
        let response = actix_test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        // The slot claimed for the failed upgrade is given back.
        assert_eq!(state.get_metrics_snapshot().active, 0);
    }
}
