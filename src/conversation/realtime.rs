//! # Realtime Service Client
//!
//! [`ConversationClient`] implementation over the realtime WebSocket event
//! protocol (see [`events`](super::events)).
//!
//! ## Connection Layout:
//! - **Reader**: the session itself, pulled by the dispatcher through
//!   `next_update`
//! - **Writer task**: owns the WebSocket sink and drains an mpsc queue, so the
//!   session and its uplink can both enqueue events without sharing the sink
//! - **Uplink**: blocking thread reading fixed-size chunks from the
//!   [`AudioSource`], forwarded as `input_audio_buffer.append` events
//!
//! ## Authentication:
//! Azure endpoints take the key in an `api-key` header; anything else gets
//! `Authorization: Bearer` plus the `openai-beta: realtime=v1` opt-in header.

use crate::audio::AudioSource;
use crate::config::AppConfig;
use crate::conversation::events::{ClientEvent, ServerEvent};
use crate::conversation::{
    AudioUplink, ConversationClient, ConversationSession, ConversationUpdate, SessionOptions,
};
use anyhow::{anyhow, Context};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn, Instrument, Span};

type ServiceStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outgoing events queued ahead of the writer task
const OUTGOING_QUEUE: usize = 64;

/// Audio chunks read ahead of the uplink's network writes
const UPLINK_QUEUE: usize = 8;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens sessions against one realtime endpoint.
#[derive(Debug, Clone)]
pub struct RealtimeClient {
    endpoint: String,
    deployment: Option<String>,
    api_key: Option<String>,
    connect_timeout: Duration,

    /// Bytes per `input_audio_buffer.append` event
    uplink_chunk_bytes: usize,
}

impl RealtimeClient {
    pub fn from_config(config: &AppConfig) -> Self {
        let conversation = &config.conversation;
        let uplink_chunk = Duration::from_millis(config.audio.uplink_chunk_ms);
        Self {
            endpoint: conversation.endpoint.clone(),
            deployment: conversation.deployment.clone(),
            api_key: conversation.api_key.clone(),
            connect_timeout: Duration::from_secs(conversation.connect_timeout_secs),
            uplink_chunk_bytes: config.audio.format().bytes_for(uplink_chunk),
        }
    }

    fn is_azure(&self) -> bool {
        self.endpoint.contains(".azure.com")
    }

    /// Handshake request: endpoint URL plus deployment query and auth headers.
    fn request(&self) -> anyhow::Result<Request> {
        let mut url = self.endpoint.clone();
        if let Some(deployment) = &self.deployment {
            let separator = if url.contains('?') { '&' } else { '?' };
            url.push(separator);
            url.push_str("deployment=");
            url.push_str(deployment);
        }

        let mut request = url
            .as_str()
            .into_client_request()
            .with_context(|| format!("Invalid realtime endpoint: {url}"))?;

        if let Some(key) = &self.api_key {
            let headers = request.headers_mut();
            if self.is_azure() {
                headers.insert("api-key", HeaderValue::from_str(key).context("Invalid API key")?);
            } else {
                let bearer = HeaderValue::from_str(&format!("Bearer {key}")).context("Invalid API key")?;
                headers.insert(AUTHORIZATION, bearer);
                headers.insert("openai-beta", HeaderValue::from_static("realtime=v1"));
            }
        }
        Ok(request)
    }
}

impl ConversationClient for RealtimeClient {
    type Session = RealtimeSession;

    async fn start_session(&self, options: &SessionOptions) -> anyhow::Result<RealtimeSession> {
        let request = self.request()?;
        debug!(endpoint = %self.endpoint, "Connecting to realtime service");

        let (stream, response) = timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", self.endpoint))?
            .context("Realtime service handshake failed")?;
        info!(status = %response.status(), "Connected to realtime service");

        let (sink, incoming) = stream.split();
        let (outgoing, queue) = mpsc::channel(OUTGOING_QUEUE);
        let writer = tokio::spawn(write_loop(sink, queue).instrument(Span::current()));

        let session = RealtimeSession {
            incoming,
            outgoing,
            writer: Some(writer),
            uplink_chunk_bytes: self.uplink_chunk_bytes,
            finished: false,
        };
        session
            .send_event(&ClientEvent::session_update(options))
            .await
            .context("Failed to configure realtime session")?;
        Ok(session)
    }
}

/// One live connection to the realtime service.
pub struct RealtimeSession {
    incoming: SplitStream<ServiceStream>,
    outgoing: mpsc::Sender<Message>,
    writer: Option<JoinHandle<()>>,
    uplink_chunk_bytes: usize,
    finished: bool,
}

impl RealtimeSession {
    async fn send_event(&self, event: &ClientEvent) -> anyhow::Result<()> {
        let text = serde_json::to_string(event)?;
        self.outgoing
            .send(Message::Text(text))
            .await
            .map_err(|_| anyhow!("Realtime connection writer has stopped"))
    }
}

impl ConversationSession for RealtimeSession {
    type Uplink = RealtimeUplink;

    async fn next_update(&mut self) -> Option<ConversationUpdate> {
        if self.finished {
            return None;
        }

        while let Some(message) = self.incoming.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => {
                        if let Some(update) = event.into_update() {
                            return Some(update);
                        }
                        trace!("Skipped realtime event");
                    }
                    Err(err) => warn!(error = %err, "Failed to parse realtime event"),
                },
                Ok(Message::Close(frame)) => {
                    info!(frame = ?frame, "Realtime service closed the session");
                    break;
                }
                Ok(other) => trace!(message = ?other, "Ignoring non-text realtime message"),
                Err(err) => {
                    error!(error = %err, "Realtime connection failed");
                    break;
                }
            }
        }

        self.finished = true;
        None
    }

    fn uplink(&self) -> RealtimeUplink {
        RealtimeUplink {
            outgoing: self.outgoing.clone(),
            chunk_bytes: self.uplink_chunk_bytes,
        }
    }

    async fn close(&mut self) {
        self.finished = true;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        // Fails only when the writer already stopped.
        let _ = self.outgoing.send(Message::Close(Some(frame))).await;

        if let Some(writer) = self.writer.take() {
            if timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                warn!("Realtime connection did not close in time");
            }
        }
    }
}

/// Streams client audio into a [`RealtimeSession`].
#[derive(Clone)]
pub struct RealtimeUplink {
    outgoing: mpsc::Sender<Message>,
    chunk_bytes: usize,
}

impl AudioUplink for RealtimeUplink {
    async fn send_input_audio(self, source: AudioSource) -> anyhow::Result<()> {
        let (chunks, mut pending) = mpsc::channel::<Vec<u8>>(UPLINK_QUEUE);
        let chunk_bytes = self.chunk_bytes;

        // `read` parks the calling thread, keep it off the runtime.
        let reader = tokio::task::spawn_blocking(move || loop {
            let chunk = source.read(chunk_bytes);
            if chunk.is_empty() || chunks.blocking_send(chunk).is_err() {
                break;
            }
        });

        let mut sent_bytes = 0usize;
        while let Some(chunk) = pending.recv().await {
            let text = serde_json::to_string(&ClientEvent::append_audio(&chunk))?;
            if self.outgoing.send(Message::Text(text)).await.is_err() {
                debug!("Realtime writer stopped, ending uplink");
                break;
            }
            sent_bytes += chunk.len();
        }
        drop(pending);

        reader.await.context("Uplink reader panicked")?;
        info!(sent_bytes, "Input audio uplink finished");
        Ok(())
    }
}

/// Drain queued messages into the service socket until a close goes out.
async fn write_loop(mut sink: SplitSink<ServiceStream, Message>, mut queue: mpsc::Receiver<Message>) {
    while let Some(message) = queue.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            warn!(error = %err, "Failed to write to realtime service");
            break;
        }
        if closing {
            break;
        }
    }
    if let Err(err) = sink.close().await {
        trace!(error = %err, "Realtime sink close");
    }
}
