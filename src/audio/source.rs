//! # Socket-Fed Audio Source
//!
//! An [`AudioSource`] is the readable byte stream handed to the conversation
//! session's uplink. It is fed by a background task that receives client frames
//! and copies them into a [`RingBuffer`], and drained by a blocking `read` that
//! always returns exactly the requested byte count, or nothing at end of stream.
//!
//! ## Threads and Tasks:
//! - **Receive loop**: async task on the runtime, awaits socket frames
//! - **Reader**: whoever calls `read`, expected to be a blocking thread
//!   (`tokio::task::spawn_blocking`), since `read` parks until data arrives
//!
//! The ring buffer is the only state they share. Its mutex is held for a single
//! copy at a time and never across an await.
//!
//! ## End of Stream:
//! The source ends when the peer closes the socket, the transport drops, the
//! owning conversation is cancelled or [`AudioSource::stop`] is called. Pending
//! and later reads then return 0 instead of waiting for bytes that will never
//! arrive; bytes already buffered can still be drained by reads they satisfy.

use crate::audio::buffer::RingBuffer;
use crate::config::AudioSettings;
use crate::socket::{
    InboundFrame, OutboundFrame, SocketReceiver, SocketSender, SocketState, SocketStatus,
};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Sizing and pacing for one audio source.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Ring buffer size in bytes
    pub capacity: usize,

    /// Largest slice copied into the ring per receive event
    pub receive_chunk_bytes: usize,

    /// Upper bound on how long a blocked reader sleeps before re-checking the socket
    pub poll_interval: Duration,
}

impl SourceOptions {
    /// Derive buffer and chunk sizes from the configured audio format.
    pub fn from_settings(audio: &AudioSettings) -> Self {
        let format = audio.format();
        Self {
            capacity: format.window_capacity(audio.window_seconds),
            receive_chunk_bytes: format.bytes_for(Duration::from_millis(audio.receive_chunk_ms)),
            poll_interval: Duration::from_millis(audio.read_poll_interval_ms),
        }
    }

    #[cfg(test)]
    pub fn for_format(format: &crate::audio::AudioFormat, window_seconds: u32) -> Self {
        Self {
            capacity: format.window_capacity(window_seconds),
            receive_chunk_bytes: format.bytes_per_second(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

struct SourceState {
    ring: RingBuffer,
    recording: bool,
}

struct Shared {
    state: Mutex<SourceState>,
    data_ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy one received chunk in, under a single lock.
    fn append(&self, chunk: &[u8]) {
        let lost = self.lock().ring.write(chunk);
        if lost > 0 {
            trace!(lost_bytes = lost, "Audio ring overflowed, oldest audio overwritten");
        }
        self.data_ready.notify_all();
    }

    fn stop_recording(&self) {
        self.lock().recording = false;
        self.data_ready.notify_all();
    }
}

/// Readable, blocking PCM stream backed by the client socket.
pub struct AudioSource {
    shared: Arc<Shared>,
    status: SocketStatus,
    cancel: CancellationToken,
    poll_interval: Duration,
    capacity: usize,
}

impl AudioSource {
    /// Start receiving from `receiver` and return a handle that can be read at once.
    ///
    /// ## Parameters:
    /// - **receiver**: inbound half of the client socket, owned by the receive loop
    /// - **sender**: outbound half, only used to echo a peer-initiated close
    /// - **cancel**: conversation-wide shutdown signal; the source also stops when
    ///   it is dropped
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<R, S>(
        receiver: R,
        sender: S,
        options: SourceOptions,
        cancel: CancellationToken,
    ) -> Self
    where
        R: SocketReceiver,
        S: SocketSender,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(SourceState {
                ring: RingBuffer::new(options.capacity),
                recording: true,
            }),
            data_ready: Condvar::new(),
        });
        let status = sender.status().clone();
        let cancel = cancel.child_token();

        tokio::spawn(receive_loop(
            receiver,
            sender,
            shared.clone(),
            options.receive_chunk_bytes.max(1),
            cancel.clone(),
        ));

        Self {
            shared,
            status,
            cancel,
            poll_interval: options.poll_interval,
            capacity: options.capacity,
        }
    }

    /// Blocking read of exactly `count` bytes.
    ///
    /// Returns an empty vector at end of stream. See [`AudioSource::read_into`].
    pub fn read(&self, count: usize) -> Vec<u8> {
        let mut data = vec![0u8; count];
        let read = self.read_into(&mut data);
        data.truncate(read);
        data
    }

    /// Block until `out` can be filled completely, then fill it.
    ///
    /// ## Returns:
    /// - `out.len()` once that many bytes were buffered
    /// - `0` if the source ended before they were
    ///
    /// A request larger than the ring can never be satisfied, so it reads
    /// nothing and returns `0` straight away.
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        let count = out.len();
        if count == 0 {
            return 0;
        }
        if count > self.capacity {
            warn!(requested = count, capacity = self.capacity, "Read larger than the audio ring");
            return 0;
        }

        let mut state = self.shared.lock();
        loop {
            if state.ring.read_into(out) {
                return count;
            }
            if self.has_ended(&state) {
                debug!(requested = count, buffered = state.ring.available(), "Audio source ended");
                return 0;
            }
            // Bounded wait: cancellation and socket state are re-checked even
            // if no notification arrives.
            state = match self.shared.data_ready.wait_timeout(state, self.poll_interval) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn has_ended(&self, state: &SourceState) -> bool {
        !state.recording || self.cancel.is_cancelled() || !self.status.get().is_open()
    }

    /// Bytes buffered and not yet read.
    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.shared.lock().ring.available()
    }

    #[cfg(test)]
    pub fn is_recording(&self) -> bool {
        self.shared.lock().recording
    }

    /// Stop the receive loop and end the stream.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.shared.stop_recording();
    }
}

impl io::Read for AudioSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_into(buf))
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Receive client frames into the ring until the socket closes.
async fn receive_loop<R, S>(
    mut receiver: R,
    sender: S,
    shared: Arc<Shared>,
    chunk_ceiling: usize,
    cancel: CancellationToken,
) where
    R: SocketReceiver,
    S: SocketSender,
{
    let mut received_bytes = 0usize;
    let mut peer_close = None;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Audio receive loop cancelled");
                break;
            }
            frame = receiver.receive() => frame,
        };

        match frame {
            Some(InboundFrame::Binary(data)) => {
                for chunk in data.chunks(chunk_ceiling) {
                    shared.append(chunk);
                }
                received_bytes += data.len();
            }
            Some(InboundFrame::Close(reason)) => {
                peer_close = Some(reason);
                break;
            }
            None => {
                debug!("Client transport ended without a close frame");
                break;
            }
        }
    }

    if let Some(reason) = peer_close {
        let state = sender.status().get();
        if state.needs_close() {
            debug!(?reason, ?state, "Echoing client close");
            if let Err(err) = sender.send(OutboundFrame::Close(reason)).await {
                warn!(error = %err, "Failed to echo client close");
            }
        }
    } else if sender.status().get() == SocketState::Open && !cancel.is_cancelled() {
        warn!("Audio receive loop stopped while the socket is still open");
    }

    shared.stop_recording();
    info!(received_bytes, "Closed socket receive loop");
}
