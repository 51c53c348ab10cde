//! # Conversation Update Dispatcher
//!
//! Runs the receive side of one conversation: takes each [`ConversationUpdate`]
//! from the session, performs the side effect it calls for and decides when the
//! conversation is over.
//!
//! ## State Machine:
//! ```text
//! AwaitingStart ──Started──► Active ──finish tool / error / end of updates──► Terminating ──► Closed
//! ```
//!
//! | Update | Action |
//! |---|---|
//! | Started | spawn the uplink task (audio source → session) |
//! | SpeechStarted | send a `speech_started` control frame so the client cuts playback |
//! | SpeechStopped, InputTranscriptionCompleted | log only |
//! | OutputDelta | audio → one binary frame right away; text → accumulated |
//! | OutputItemFinished | ends the conversation if it is a call of the finish tool |
//! | Error | log, end the conversation |
//!
//! The dispatcher is the only writer of downlink frames. The uplink task never
//! writes to the socket, it reads from it through the audio source.
//!
//! ## Teardown:
//! Close the socket with a normal-closure status if our close has not gone out
//! yet, cancel the conversation token (which ends the audio source and with it
//! the uplink), close the session, then give the uplink a grace period to exit.

use crate::audio::{AudioSource, SourceOptions};
use crate::conversation::{
    AudioUplink, ConversationClient, ConversationSession, ConversationUpdate, SessionOptions,
};
use crate::socket::{
    CloseReason, ControlSignal, OutboundFrame, SocketError, SocketReceiver, SocketSender,
    SocketState, INTERNAL_ERROR,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};
use uuid::Uuid;

/// Lifecycle of one conversation, as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    AwaitingStart,
    Active,
    Terminating,
    Closed,
}

/// What ended a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    /// The model called the configured finish tool
    FinishToolInvoked,
    /// The session sent an error event
    SessionError(String),
    /// The session stopped producing updates
    UpdatesExhausted,
    /// The client went away first
    ClientDisconnected,
}

impl TerminationCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationCause::FinishToolInvoked => "finished",
            TerminationCause::SessionError(_) => "session_error",
            TerminationCause::UpdatesExhausted => "updates_exhausted",
            TerminationCause::ClientDisconnected => "client_disconnected",
        }
    }
}

/// Summary of a finished conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub cause: TerminationCause,
    pub audio_frames_sent: usize,
    pub audio_bytes_sent: usize,

    /// Text of each completed response item, in order
    pub responses: Vec<String>,
}

/// Per-connection state handed to the dispatcher.
///
/// Nothing here is shared with other conversations.
pub struct ConnectionContext<R, S> {
    pub connection_id: Uuid,
    pub receiver: R,
    pub sender: S,

    /// Cancelled during teardown; the audio source and uplink watch it
    pub cancel: CancellationToken,
    pub source_options: SourceOptions,

    /// Reason string sent with the final normal-closure frame
    pub close_reason: String,

    /// How long teardown waits for the uplink task to notice the shutdown
    pub uplink_grace: Duration,
}

enum Flow {
    Continue,
    Terminate(TerminationCause),
}

/// Drives one conversation session over one client socket.
pub struct Dispatcher<C, R, S> {
    connection_id: Uuid,
    session: C,
    receiver: Option<R>,
    sender: S,
    cancel: CancellationToken,
    source_options: SourceOptions,
    close_reason: String,
    uplink_grace: Duration,
    finish_tool: String,
    state: DispatchState,
    uplink: Option<JoinHandle<()>>,
    pending_text: String,
    responses: Vec<String>,
    audio_frames_sent: usize,
    audio_bytes_sent: usize,
}

impl<C, R, S> Dispatcher<C, R, S>
where
    C: ConversationSession,
    R: SocketReceiver,
    S: SocketSender,
{
    pub fn new(session: C, context: ConnectionContext<R, S>, finish_tool: impl Into<String>) -> Self {
        Self {
            connection_id: context.connection_id,
            session,
            receiver: Some(context.receiver),
            sender: context.sender,
            cancel: context.cancel,
            source_options: context.source_options,
            close_reason: context.close_reason,
            uplink_grace: context.uplink_grace,
            finish_tool: finish_tool.into(),
            state: DispatchState::AwaitingStart,
            uplink: None,
            pending_text: String::new(),
            responses: Vec::new(),
            audio_frames_sent: 0,
            audio_bytes_sent: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Consume session updates until the conversation ends, then tear it down.
    pub async fn run(mut self) -> DispatchOutcome {
        let span = info_span!("conversation", connection_id = %self.connection_id);
        async move {
            let cause = self.dispatch_updates().await;
            self.teardown(&cause).await;
            DispatchOutcome {
                cause,
                audio_frames_sent: self.audio_frames_sent,
                audio_bytes_sent: self.audio_bytes_sent,
                responses: self.responses,
            }
        }
        .instrument(span)
        .await
    }

    async fn dispatch_updates(&mut self) -> TerminationCause {
        let status = self.sender.status().clone();
        loop {
            // Until the uplink owns the receiver nobody echoes a peer close,
            // so a close request alone has to end the wait.
            let awaiting_start = self.receiver.is_some();
            // Updates the session already has are handled before a disconnect.
            let update = tokio::select! {
                biased;
                update = self.session.next_update() => update,
                _ = status.wait_until(move |state| {
                    state == SocketState::Closed
                        || (awaiting_start && state == SocketState::CloseReceived)
                }) => {
                    info!("Client disconnected");
                    return TerminationCause::ClientDisconnected;
                }
            };

            let Some(update) = update else {
                info!("Conversation session ran out of updates");
                return TerminationCause::UpdatesExhausted;
            };
            if let Flow::Terminate(cause) = self.handle(update).await {
                return cause;
            }
        }
    }

    async fn handle(&mut self, update: ConversationUpdate) -> Flow {
        match update {
            ConversationUpdate::Started { session_id } => {
                if self.state != DispatchState::AwaitingStart {
                    warn!(session_id = ?session_id, state = ?self.state, "Ignoring repeated session start");
                    return Flow::Continue;
                }
                info!(session_id = ?session_id, "Conversation session started");
                self.start_uplink();
                self.state = DispatchState::Active;
                Flow::Continue
            }
            ConversationUpdate::SpeechStarted => {
                debug!("Speech started");
                self.send(ControlSignal::SpeechStarted.to_frame()).await;
                Flow::Continue
            }
            ConversationUpdate::SpeechStopped => {
                debug!("Speech stopped");
                Flow::Continue
            }
            ConversationUpdate::InputTranscriptionCompleted { transcript } => {
                info!(transcript = %transcript, "User transcript");
                Flow::Continue
            }
            ConversationUpdate::OutputDelta { audio, text } => {
                if let Some(audio) = audio.filter(|audio| !audio.is_empty()) {
                    let len = audio.len();
                    if self.send(OutboundFrame::Binary(audio)).await {
                        self.audio_frames_sent += 1;
                        self.audio_bytes_sent += len;
                    }
                }
                if let Some(text) = text {
                    trace!(fragment = %text, "Response text");
                    self.pending_text.push_str(&text);
                }
                Flow::Continue
            }
            ConversationUpdate::OutputItemFinished { item_id, function_name } => {
                if !self.pending_text.is_empty() {
                    let text = std::mem::take(&mut self.pending_text);
                    info!(response = %text, "Assistant response");
                    self.responses.push(text);
                }
                if function_name.as_deref() == Some(self.finish_tool.as_str()) {
                    info!(item_id = ?item_id, tool = %self.finish_tool, "Finish tool invoked");
                    Flow::Terminate(TerminationCause::FinishToolInvoked)
                } else {
                    debug!(item_id = ?item_id, function_name = ?function_name, "Output item finished");
                    Flow::Continue
                }
            }
            ConversationUpdate::Error { message, code } => {
                error!(code = ?code, message = %message, "Conversation session error");
                Flow::Terminate(TerminationCause::SessionError(message))
            }
        }
    }

    fn start_uplink(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            warn!("Session started again; uplink already running");
            return;
        };
        let sender = self.sender.clone();
        let options = self.source_options.clone();
        let cancel = self.cancel.clone();
        let uplink = self.session.uplink();

        let task = async move {
            let source = AudioSource::start(receiver, sender, options, cancel);
            match uplink.send_input_audio(source).await {
                Ok(()) => debug!("Uplink finished"),
                Err(err) => warn!(error = %err, "Uplink stopped with an error"),
            }
        };
        self.uplink = Some(tokio::spawn(task.instrument(Span::current())));
    }

    /// Write one downlink frame; failures are logged, not propagated.
    async fn send(&self, frame: OutboundFrame) -> bool {
        match self.sender.send(frame).await {
            Ok(()) => true,
            Err(SocketError::Closed) => {
                debug!("Dropped downlink frame, socket is closing");
                false
            }
            Err(err) => {
                warn!(error = %err, "Failed to send downlink frame");
                false
            }
        }
    }

    async fn teardown(&mut self, cause: &TerminationCause) {
        self.state = DispatchState::Terminating;
        info!(cause = cause.as_str(), "Ending conversation");

        if self.sender.status().get().needs_close() {
            let reason = CloseReason::normal(self.close_reason.clone());
            if let Err(err) = self.sender.send(OutboundFrame::Close(Some(reason))).await {
                warn!(error = %err, "Failed to close client socket");
            }
        }

        self.cancel.cancel();
        self.session.close().await;

        if let Some(mut uplink) = self.uplink.take() {
            match tokio::time::timeout(self.uplink_grace, &mut uplink).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "Uplink task failed"),
                Err(_) => {
                    warn!(grace_ms = self.uplink_grace.as_millis() as u64, "Uplink did not stop in time, aborting");
                    uplink.abort();
                }
            }
        }

        self.state = DispatchState::Closed;
    }
}

/// Open a session for this connection and dispatch it to completion.
///
/// If the session cannot be started the client socket is closed with an
/// internal-error status and `None` is returned.
pub async fn relay<C, R, S>(
    client: &C,
    options: &SessionOptions,
    context: ConnectionContext<R, S>,
) -> Option<DispatchOutcome>
where
    C: ConversationClient,
    R: SocketReceiver,
    S: SocketSender,
{
    match client.start_session(options).await {
        Ok(session) => {
            let finish_tool = options.finish_tool.name.clone();
            Some(Dispatcher::new(session, context, finish_tool).run().await)
        }
        Err(err) => {
            error!(connection_id = %context.connection_id, error = %format!("{err:#}"), "Failed to start conversation session");
            let reason = CloseReason {
                code: INTERNAL_ERROR,
                description: Some("Conversation service unavailable".to_string()),
            };
            if context.sender.status().get().needs_close() {
                if let Err(err) = context.sender.send(OutboundFrame::Close(Some(reason))).await {
                    warn!(error = %err, "Failed to close client socket");
                }
            }
            context.cancel.cancel();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::conversation::{ToolDefinition, TurnDetection};
    use crate::socket::memory::{self, MemoryPeer, MemoryReceiver, MemorySender};
    use crate::socket::NORMAL_CLOSURE;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::timeout;

    const FINISH_TOOL: &str = "finish_conversation";

    struct ScriptedSession {
        updates: VecDeque<ConversationUpdate>,
        hold_open: bool,
        closed: Arc<AtomicBool>,
        uplinked: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedSession {
        fn new(updates: Vec<ConversationUpdate>) -> Self {
            Self {
                updates: updates.into(),
                hold_open: false,
                closed: Arc::new(AtomicBool::new(false)),
                uplinked: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Keep the session alive after the script runs out.
        fn held_open(mut self) -> Self {
            self.hold_open = true;
            self
        }
    }

    impl ConversationSession for ScriptedSession {
        type Uplink = ScriptedUplink;

        async fn next_update(&mut self) -> Option<ConversationUpdate> {
            match self.updates.pop_front() {
                Some(update) => Some(update),
                None if self.hold_open => std::future::pending().await,
                None => None,
            }
        }

        fn uplink(&self) -> ScriptedUplink {
            ScriptedUplink {
                uplinked: self.uplinked.clone(),
            }
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct ScriptedUplink {
        uplinked: Arc<Mutex<Vec<u8>>>,
    }

    impl AudioUplink for ScriptedUplink {
        async fn send_input_audio(self, source: AudioSource) -> anyhow::Result<()> {
            tokio::task::spawn_blocking(move || loop {
                let chunk = source.read(2);
                if chunk.is_empty() {
                    break;
                }
                self.uplinked.lock().unwrap().extend_from_slice(&chunk);
            })
            .await?;
            Ok(())
        }
    }

    struct FailingClient;

    impl ConversationClient for FailingClient {
        type Session = ScriptedSession;

        async fn start_session(&self, _options: &SessionOptions) -> anyhow::Result<ScriptedSession> {
            anyhow::bail!("service unreachable")
        }
    }

    fn connection() -> (MemoryPeer, ConnectionContext<MemoryReceiver, MemorySender>) {
        let (peer, receiver, sender) = memory::pair();
        let mut source_options = SourceOptions::for_format(&AudioFormat::default(), 1);
        source_options.poll_interval = Duration::from_millis(10);
        let context = ConnectionContext {
            connection_id: Uuid::new_v4(),
            receiver,
            sender,
            cancel: CancellationToken::new(),
            source_options,
            close_reason: "Conversation finished".to_string(),
            uplink_grace: Duration::from_secs(1),
        };
        (peer, context)
    }

    fn finished(function_name: Option<&str>) -> ConversationUpdate {
        ConversationUpdate::OutputItemFinished {
            item_id: Some("item_1".to_string()),
            function_name: function_name.map(str::to_string),
        }
    }

    fn normal_close() -> OutboundFrame {
        OutboundFrame::Close(Some(CloseReason::normal("Conversation finished")))
    }

    async fn run(session: ScriptedSession, context: ConnectionContext<MemoryReceiver, MemorySender>) -> DispatchOutcome {
        timeout(
            Duration::from_secs(5),
            Dispatcher::new(session, context, FINISH_TOOL).run(),
        )
        .await
        .expect("dispatcher should finish")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_finish_tool_ends_conversation_after_forwarding_audio() {
        let (mut peer, context) = connection();
        let session = ScriptedSession::new(vec![
            ConversationUpdate::Started { session_id: None },
            ConversationUpdate::SpeechStarted,
            ConversationUpdate::OutputDelta {
                audio: Some(vec![0x01, 0x02]),
                text: None,
            },
            ConversationUpdate::OutputDelta {
                audio: None,
                text: Some("hi".to_string()),
            },
            finished(Some(FINISH_TOOL)),
        ]);
        let closed = session.closed.clone();

        let outcome = run(session, context).await;

        assert_eq!(outcome.cause, TerminationCause::FinishToolInvoked);
        assert_eq!(outcome.audio_frames_sent, 1);
        assert_eq!(outcome.responses, vec!["hi".to_string()]);
        assert!(closed.load(Ordering::SeqCst));

        let frames = peer.sent_frames();
        let binary: Vec<_> = frames
            .iter()
            .filter(|frame| matches!(frame, OutboundFrame::Binary(_)))
            .collect();
        assert_eq!(binary, vec![&OutboundFrame::Binary(vec![0x01, 0x02])]);
        assert_eq!(frames.last(), Some(&normal_close()));
        assert_eq!(
            frames.iter().filter(|frame| matches!(frame, OutboundFrame::Close(_))).count(),
            1
        );
        assert_eq!(peer.status.get(), SocketState::CloseSent);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_speech_start_sends_control_signal_before_audio() {
        let (mut peer, context) = connection();
        let session = ScriptedSession::new(vec![
            ConversationUpdate::SpeechStarted,
            ConversationUpdate::OutputDelta {
                audio: Some(vec![7]),
                text: None,
            },
        ]);

        run(session, context).await;

        let frames = peer.sent_frames();
        assert_eq!(frames[0], ControlSignal::SpeechStarted.to_frame());
        assert_eq!(frames[1], OutboundFrame::Binary(vec![7]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_closes_open_socket() {
        let (mut peer, context) = connection();
        let session = ScriptedSession::new(vec![
            ConversationUpdate::Started { session_id: None },
            ConversationUpdate::Error {
                message: "rate limited".to_string(),
                code: Some("rate_limit_exceeded".to_string()),
            },
            ConversationUpdate::OutputDelta {
                audio: Some(vec![1]),
                text: None,
            },
        ]);

        let outcome = run(session, context).await;

        assert_eq!(outcome.cause, TerminationCause::SessionError("rate limited".to_string()));
        assert_eq!(peer.sent_frames(), vec![normal_close()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_on_closed_socket_sends_nothing() {
        let (mut peer, context) = connection();
        peer.disconnect();
        let session = ScriptedSession::new(vec![
            ConversationUpdate::Started { session_id: None },
            ConversationUpdate::Error {
                message: "boom".to_string(),
                code: None,
            },
        ]);

        let outcome = run(session, context).await;

        // Updates already queued win over the disconnect.
        assert_eq!(outcome.cause, TerminationCause::SessionError("boom".to_string()));
        assert!(peer.sent_frames().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_other_tools_do_not_end_conversation() {
        let (mut peer, context) = connection();
        let session = ScriptedSession::new(vec![
            ConversationUpdate::Started { session_id: None },
            finished(Some("lookup_weather")),
            finished(None),
        ]);

        let outcome = run(session, context).await;

        assert_eq!(outcome.cause, TerminationCause::UpdatesExhausted);
        let frames = peer.sent_frames();
        assert_eq!(frames, vec![normal_close()]);
        assert_eq!(frames[0], OutboundFrame::Close(Some(CloseReason {
            code: NORMAL_CLOSURE,
            description: Some("Conversation finished".to_string()),
        })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_uplink_forwards_client_audio_until_client_leaves() {
        let (mut peer, context) = connection();
        let session = ScriptedSession::new(vec![ConversationUpdate::Started { session_id: None }]).held_open();
        let uplinked = session.uplinked.clone();
        let dispatcher = tokio::spawn(Dispatcher::new(session, context, FINISH_TOOL).run());

        peer.send_audio(&[1, 2, 3, 4]);
        timeout(Duration::from_secs(2), async {
            while uplinked.lock().unwrap().len() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("uplink should forward client audio");
        assert_eq!(*uplinked.lock().unwrap(), vec![1, 2, 3, 4]);

        peer.close(1001, "going away");
        let outcome = timeout(Duration::from_secs(5), dispatcher)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.cause, TerminationCause::ClientDisconnected);
        // Only the echo of the client's own close goes out.
        assert_eq!(
            peer.sent_frames(),
            vec![OutboundFrame::Close(Some(CloseReason {
                code: 1001,
                description: Some("going away".to_string()),
            }))]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_close_before_start_ends_conversation() {
        let (mut peer, context) = connection();
        let session = ScriptedSession::new(Vec::new()).held_open();

        peer.close(1000, "never mind");
        let outcome = run(session, context).await;

        assert_eq!(outcome.cause, TerminationCause::ClientDisconnected);
        assert_eq!(peer.sent_frames(), vec![normal_close()]);
        assert_eq!(peer.status.get(), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (_peer, context) = connection();
        let cancel = context.cancel.clone();
        let mut dispatcher = Dispatcher::new(ScriptedSession::new(Vec::new()), context, FINISH_TOOL);
        assert_eq!(dispatcher.state(), DispatchState::AwaitingStart);

        assert!(matches!(
            dispatcher.handle(ConversationUpdate::Started { session_id: Some("sess_1".into()) }).await,
            Flow::Continue
        ));
        assert_eq!(dispatcher.state(), DispatchState::Active);

        // A second start neither restarts the uplink nor changes state.
        assert!(matches!(
            dispatcher.handle(ConversationUpdate::Started { session_id: Some("sess_2".into()) }).await,
            Flow::Continue
        ));
        assert_eq!(dispatcher.state(), DispatchState::Active);

        assert!(matches!(dispatcher.handle(ConversationUpdate::SpeechStopped).await, Flow::Continue));
        assert!(matches!(
            dispatcher.handle(finished(Some(FINISH_TOOL))).await,
            Flow::Terminate(TerminationCause::FinishToolInvoked)
        ));

        dispatcher.teardown(&TerminationCause::FinishToolInvoked).await;
        assert_eq!(dispatcher.state(), DispatchState::Closed);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_session_start_closes_with_internal_error() {
        let (mut peer, context) = connection();
        let options = SessionOptions {
            instructions: None,
            voice: "alloy".to_string(),
            audio_format: AudioFormat::default(),
            transcription_model: "whisper-1".to_string(),
            turn_detection: TurnDetection {
                threshold: 0.5,
                silence_duration: Duration::from_millis(500),
            },
            finish_tool: ToolDefinition {
                name: FINISH_TOOL.to_string(),
                description: "End the conversation".to_string(),
            },
        };

        assert!(relay(&FailingClient, &options, context).await.is_none());
        assert_eq!(
            peer.sent_frames(),
            vec![OutboundFrame::Close(Some(CloseReason {
                code: INTERNAL_ERROR,
                description: Some("Conversation service unavailable".to_string()),
            }))]
        );
    }
}
