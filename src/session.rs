//! Resumable relay sessions.
//!
//! A [`RelayStream`] is an ordered byte stream whose backing WebSocket
//! connection can drop and be replaced without the caller noticing.
//! Both sides count the bytes they have received and acknowledge them
//! cumulatively; after a reconnect the relay reports its position and the
//! session replays exactly the suffix the relay never saw.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::buffer::{SendBuffer, DEFAULT_MAX_BUFFER_BYTES};
use crate::error::{Error, Result};
use crate::frame::{Frame, MAX_DATA_PAYLOAD};
use crate::transport::{CloseCode, MessageSink, MessageSource, RelayTarget, TransportError};

/// Smallest buffer a caller may pass to [`RelayStream::read`].
///
/// A DATA frame carries up to this many bytes and must be delivered
/// whole; readers with smaller buffers go through the fragmenting
/// adapter instead.
pub const MIN_READ_SIZE: usize = MAX_DATA_PAYLOAD;

/// Largest write a single call accepts (one DATA frame).
pub const MAX_WRITE_SIZE: usize = MAX_DATA_PAYLOAD;

/// Unacknowledged received bytes that trigger an ACK frame.
pub const MAX_READ_BYTES_PER_ACK: u64 = 1024 * 1024;

/// Default reconnect attempts per disconnect.
pub const DEFAULT_MAX_RECONNECTS: u32 = 2;

/// Default initial delay between reconnect attempts.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Tunables for a relay session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reconnect attempts allowed per disconnect before giving up.
    pub max_reconnects: u32,
    /// Initial delay between reconnect attempts; doubles per attempt.
    pub reconnect_backoff: Duration,
    /// Limit on buffered unacknowledged bytes.
    pub max_pending_bytes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            max_pending_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

/// Lifecycle of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Transport is live and the session ID is known.
    Established,
    /// Transport was lost; a replacement is being negotiated.
    Reconnecting,
    /// Closed locally or by a clean relay close.
    Closed,
    /// Terminal failure; the stream can no longer be used.
    Failed,
}

/// An ordered, resumable byte stream tunneled through a relay.
pub struct RelayStream {
    shared: Arc<Shared>,
}

impl RelayStream {
    /// Opens a session against the given relay target.
    ///
    /// Fails if the relay does not assign a session ID; a connection
    /// lost before that point is never retried because there is nothing
    /// to resume yet.
    pub async fn connect(target: Arc<dyn RelayTarget>, config: SessionConfig) -> Result<Self> {
        let (sink, mut source) = target.connect().await?;

        let msg = source.recv().await.map_err(|e| match e {
            TransportError::ClosedByPeer {
                code: CloseCode::NotAuthorized,
                ..
            } => Error::Unauthorized,
            e => Error::ConnectionFailed(format!(
                "connection lost before a session ID was assigned: {}",
                e
            )),
        })?;

        let sid = match Frame::decode(&msg)? {
            Frame::ConnectSuccessSid { sid } => sid,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "expected CONNECT_SUCCESS_SID, got {}",
                    other.name()
                )))
            }
        };
        tracing::debug!(sid = %sid, "relay session established");

        let shared = Arc::new(Shared {
            target,
            sid,
            unacked: Mutex::new(SendBuffer::new(config.max_pending_bytes)),
            config,
            conn: Mutex::new(ConnSlot {
                phase: SessionPhase::Established,
                generation: 1,
                sink: Some(Arc::new(Mutex::new(sink))),
                source: Some(Arc::new(Mutex::new(source))),
            }),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_ack_sent: AtomicU64::new(0),
            last_ack_received: AtomicU64::new(0),
        });

        Ok(Self { shared })
    }

    /// Reads the next chunk of stream data into `buf`.
    ///
    /// `buf` must hold at least [`MIN_READ_SIZE`] bytes. Returns `Ok(0)`
    /// at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.shared.read_into(buf).await
    }

    /// Writes up to [`MAX_WRITE_SIZE`] bytes to the stream.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.shared.write_chunk(buf).await
    }

    /// Closes the session. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.shared.close_session().await
    }

    /// The session ID assigned by the relay.
    pub fn sid(&self) -> &str {
        &self.shared.sid
    }

    /// Current lifecycle phase.
    pub async fn phase(&self) -> SessionPhase {
        self.shared.conn.lock().await.phase
    }

    /// Total bytes written to the stream so far.
    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::SeqCst)
    }

    /// Total bytes read from the stream so far.
    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::SeqCst)
    }

    /// Highest acknowledgement received from the relay.
    pub fn last_ack_received(&self) -> u64 {
        self.shared.last_ack_received.load(Ordering::SeqCst)
    }

    /// Highest acknowledgement sent to the relay.
    pub fn last_ack_sent(&self) -> u64 {
        self.shared.last_ack_sent.load(Ordering::SeqCst)
    }

    /// Splits the stream into independently owned read and write halves
    /// for bidirectional bridging.
    pub fn into_split(self) -> (RelayReadHalf, RelayWriteHalf) {
        let read = RelayReadHalf {
            shared: Arc::clone(&self.shared),
        };
        let write = RelayWriteHalf {
            shared: self.shared,
        };
        (read, write)
    }
}

/// Read half of a split [`RelayStream`].
pub struct RelayReadHalf {
    shared: Arc<Shared>,
}

impl RelayReadHalf {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.shared.read_into(buf).await
    }

    pub fn sid(&self) -> &str {
        &self.shared.sid
    }
}

/// Write half of a split [`RelayStream`].
pub struct RelayWriteHalf {
    shared: Arc<Shared>,
}

impl RelayWriteHalf {
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.shared.write_chunk(buf).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.shared.close_session().await
    }

    pub fn sid(&self) -> &str {
        &self.shared.sid
    }
}

/// The live (or pending) transport of a session.
///
/// The generation counter increments whenever the transport is replaced,
/// letting a task that failed on an old connection detect that another
/// task already reconnected.
struct ConnSlot {
    phase: SessionPhase,
    generation: u64,
    sink: Option<Arc<Mutex<Box<dyn MessageSink>>>>,
    source: Option<Arc<Mutex<Box<dyn MessageSource>>>>,
}

/// State shared between the stream handle and its split halves.
///
/// Lock order is conn, then sink or source, then unacked; never the
/// reverse. Counters are atomics so stats never need a lock.
struct Shared {
    target: Arc<dyn RelayTarget>,
    sid: String,
    config: SessionConfig,
    conn: Mutex<ConnSlot>,
    unacked: Mutex<SendBuffer>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    last_ack_sent: AtomicU64,
    last_ack_received: AtomicU64,
}

impl Shared {
    async fn read_into(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < MIN_READ_SIZE {
            return Err(Error::Config(format!(
                "read buffer holds {} bytes but DATA frames carry up to {}",
                buf.len(),
                MIN_READ_SIZE
            )));
        }

        loop {
            let (generation, source) = {
                let slot = self.conn.lock().await;
                match slot.phase {
                    SessionPhase::Closed => return Ok(0),
                    SessionPhase::Failed => {
                        return Err(Error::RelayUnavailable("session already failed".to_string()))
                    }
                    _ => {}
                }
                let source = match &slot.source {
                    Some(source) => Arc::clone(source),
                    None => return Err(Error::SessionClosed("transport detached".to_string())),
                };
                (slot.generation, source)
            };

            let received = {
                let mut source = source.lock().await;
                source.recv().await
            };

            match received {
                Ok(msg) => {
                    let frame = match Frame::decode(&msg) {
                        Ok(frame) => frame,
                        Err(e) => return Err(self.fail(e.into()).await),
                    };
                    match frame {
                        Frame::Data { data } => {
                            let len = data.len();
                            buf[..len].copy_from_slice(&data);
                            let total = self
                                .bytes_received
                                .fetch_add(len as u64, Ordering::SeqCst)
                                + len as u64;
                            self.maybe_send_ack(total).await;
                            return Ok(len);
                        }
                        Frame::Ack { ack } => self.apply_ack(ack, false).await?,
                        // The relay may re-affirm its position mid-stream.
                        Frame::ReconnectAck { ack } => self.apply_ack(ack, true).await?,
                        other => {
                            return Err(self
                                .fail(Error::ProtocolViolation(format!(
                                    "unexpected {} frame on an established session",
                                    other.name()
                                )))
                                .await)
                        }
                    }
                }
                Err(TransportError::ClosedByPeer { code, reason }) if code.is_clean_eof() => {
                    tracing::debug!(code = code.as_u16(), reason = %reason, "relay ended the stream");
                    self.close_session().await?;
                    return Ok(0);
                }
                Err(cause) => self.handle_disconnect(generation, cause).await?,
            }
        }
    }

    async fn write_chunk(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if buf.len() > MAX_WRITE_SIZE {
            return Err(Error::ProtocolViolation(format!(
                "write of {} bytes exceeds the {} byte frame limit",
                buf.len(),
                MAX_WRITE_SIZE
            )));
        }

        // Buffer before touching the wire; a reconnect replays from here.
        {
            let mut unacked = self.unacked.lock().await;
            unacked
                .push(Bytes::copy_from_slice(buf))
                .map_err(|_| Error::BufferLimitExceeded)?;
        }
        self.bytes_sent.fetch_add(buf.len() as u64, Ordering::SeqCst);

        loop {
            let (generation, sink) = {
                let slot = self.conn.lock().await;
                match slot.phase {
                    SessionPhase::Closed => {
                        return Err(Error::SessionClosed("session closed".to_string()))
                    }
                    SessionPhase::Failed => {
                        return Err(Error::RelayUnavailable("session already failed".to_string()))
                    }
                    _ => {}
                }
                let sink = match &slot.sink {
                    Some(sink) => Arc::clone(sink),
                    None => return Err(Error::SessionClosed("transport detached".to_string())),
                };
                (slot.generation, sink)
            };

            match self.flush_unsent(&sink).await {
                // A successful reconnect already replayed this chunk, so
                // an empty flush also means the write is on the wire.
                Ok(()) => return Ok(buf.len()),
                Err(cause) => self.handle_disconnect(generation, cause).await?,
            }
        }
    }

    /// Sends any outstanding ACK and every not-yet-transmitted chunk.
    async fn flush_unsent(
        &self,
        sink: &Arc<Mutex<Box<dyn MessageSink>>>,
    ) -> std::result::Result<(), TransportError> {
        let mut sink = sink.lock().await;

        // Piggyback an outstanding ACK ahead of the data.
        if let Some(ack) = self.pending_ack() {
            let mut out = BytesMut::new();
            Frame::Ack { ack }.encode(&mut out);
            sink.send(out.freeze()).await?;
            self.last_ack_sent.fetch_max(ack, Ordering::SeqCst);
        }

        let chunks = {
            let mut unacked = self.unacked.lock().await;
            unacked.take_unsent()
        };
        for (_, data) in chunks {
            let mut out = BytesMut::new();
            Frame::Data { data }.encode(&mut out);
            sink.send(out.freeze()).await?;
        }
        Ok(())
    }

    /// Returns the ACK value to send, if received bytes are outstanding.
    fn pending_ack(&self) -> Option<u64> {
        let received = self.bytes_received.load(Ordering::SeqCst);
        if received > self.last_ack_sent.load(Ordering::SeqCst) {
            Some(received)
        } else {
            None
        }
    }

    /// Sends an ACK once enough unacknowledged bytes have accumulated.
    async fn maybe_send_ack(&self, received: u64) {
        if received - self.last_ack_sent.load(Ordering::SeqCst) <= MAX_READ_BYTES_PER_ACK {
            return;
        }

        let sink = {
            let slot = self.conn.lock().await;
            slot.sink.as_ref().map(Arc::clone)
        };
        let Some(sink) = sink else { return };

        let mut out = BytesMut::new();
        Frame::Ack { ack: received }.encode(&mut out);
        let mut sink = sink.lock().await;
        if let Err(e) = sink.send(out.freeze()).await {
            // The next receive will notice the dead transport; the relay
            // learns our position again during the reconnect handshake.
            tracing::debug!(error = %e, "failed to send ACK");
            return;
        }
        self.last_ack_sent.fetch_max(received, Ordering::SeqCst);
    }

    /// Applies an ACK from the relay to the pending-send buffer.
    ///
    /// A zero ack is only meaningful on a RECONNECT_SUCCESS_ACK; a plain
    /// ACK frame acknowledging nothing is a protocol violation.
    async fn apply_ack(&self, ack: u64, allow_zero: bool) -> Result<()> {
        if ack == 0 && allow_zero {
            return Ok(());
        }
        if ack == 0 {
            return Err(self
                .fail(Error::ProtocolViolation("relay sent a zero ACK".to_string()))
                .await);
        }
        let sent = self.bytes_sent.load(Ordering::SeqCst);
        if ack > sent {
            return Err(self
                .fail(Error::ProtocolViolation(format!(
                    "relay acknowledged {} bytes but only {} were sent",
                    ack, sent
                )))
                .await);
        }

        self.last_ack_received.fetch_max(ack, Ordering::SeqCst);
        self.unacked.lock().await.ack(ack);
        Ok(())
    }

    /// Reacts to a transport failure observed under `generation`.
    ///
    /// Returns `Ok(())` once a usable transport is in place again, either
    /// because this call reconnected or because another task already did.
    async fn handle_disconnect(&self, generation: u64, cause: TransportError) -> Result<()> {
        let mut slot = self.conn.lock().await;
        if slot.generation != generation {
            return Ok(());
        }
        match slot.phase {
            SessionPhase::Closed => {
                return Err(Error::SessionClosed("session closed".to_string()))
            }
            SessionPhase::Failed => {
                return Err(Error::RelayUnavailable("session already failed".to_string()))
            }
            _ => {}
        }
        slot.sink = None;
        slot.source = None;

        if let TransportError::ClosedByPeer { code, reason } = &cause {
            if *code == CloseCode::NotAuthorized {
                slot.phase = SessionPhase::Failed;
                return Err(Error::Unauthorized);
            }
            if code.is_resume_rejection() {
                slot.phase = SessionPhase::Failed;
                return Err(Error::ResumeRejected(format!(
                    "close code {}: {}",
                    code.as_u16(),
                    reason
                )));
            }
        }

        tracing::warn!(sid = %self.sid, error = %cause, "relay transport lost, attempting to resume");
        slot.phase = SessionPhase::Reconnecting;
        self.reconnect_locked(&mut slot).await
    }

    /// Negotiates a replacement transport while holding the conn lock.
    async fn reconnect_locked(&self, slot: &mut ConnSlot) -> Result<()> {
        let mut backoff = self.config.reconnect_backoff;

        for attempt in 1..=self.config.max_reconnects {
            if attempt > 1 {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }

            let received = self.bytes_received.load(Ordering::SeqCst);
            tracing::info!(sid = %self.sid, attempt, ack = received, "reconnecting to relay");

            let (mut sink, mut source) = match self.target.reconnect(&self.sid, received).await {
                Ok(pair) => pair,
                Err(Error::Unauthorized) => {
                    slot.phase = SessionPhase::Failed;
                    return Err(Error::Unauthorized);
                }
                Err(e) => {
                    tracing::warn!(sid = %self.sid, attempt, error = %e, "reconnect attempt failed");
                    continue;
                }
            };

            let msg = match source.recv().await {
                Ok(msg) => msg,
                Err(TransportError::ClosedByPeer { code, reason }) => {
                    if code == CloseCode::NotAuthorized {
                        slot.phase = SessionPhase::Failed;
                        return Err(Error::Unauthorized);
                    }
                    if code.is_resume_rejection() {
                        slot.phase = SessionPhase::Failed;
                        return Err(Error::ResumeRejected(format!(
                            "close code {}: {}",
                            code.as_u16(),
                            reason
                        )));
                    }
                    tracing::warn!(
                        sid = %self.sid,
                        attempt,
                        code = code.as_u16(),
                        "relay closed the reconnect handshake"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(sid = %self.sid, attempt, error = %e, "reconnect handshake failed");
                    continue;
                }
            };

            let ack = match Frame::decode(&msg) {
                Ok(Frame::ReconnectAck { ack }) => ack,
                Ok(other) => {
                    slot.phase = SessionPhase::Failed;
                    return Err(Error::ProtocolViolation(format!(
                        "expected RECONNECT_SUCCESS_ACK, got {}",
                        other.name()
                    )));
                }
                Err(e) => {
                    slot.phase = SessionPhase::Failed;
                    return Err(e.into());
                }
            };

            let sent = self.bytes_sent.load(Ordering::SeqCst);
            if ack > sent {
                slot.phase = SessionPhase::Failed;
                return Err(Error::ProtocolViolation(format!(
                    "relay acknowledged {} bytes but only {} were sent",
                    ack, sent
                )));
            }

            // Replay exactly the bytes the relay never received.
            let chunks = {
                let mut unacked = self.unacked.lock().await;
                unacked.ack(ack);
                unacked.rewind(ack);
                unacked.take_unsent()
            };
            self.last_ack_received.fetch_max(ack, Ordering::SeqCst);
            // The reconnect request itself carried our receive position.
            self.last_ack_sent.fetch_max(received, Ordering::SeqCst);

            let mut resent: u64 = 0;
            let mut replay_failed = false;
            for (_, data) in chunks {
                resent += data.len() as u64;
                let mut out = BytesMut::new();
                Frame::Data { data }.encode(&mut out);
                if let Err(e) = sink.send(out.freeze()).await {
                    tracing::warn!(sid = %self.sid, attempt, error = %e, "replay failed on new connection");
                    replay_failed = true;
                    break;
                }
            }
            if replay_failed {
                continue;
            }

            slot.generation += 1;
            slot.sink = Some(Arc::new(Mutex::new(sink)));
            slot.source = Some(Arc::new(Mutex::new(source)));
            slot.phase = SessionPhase::Established;
            tracing::info!(sid = %self.sid, attempt, ack, resent, "relay session resumed");
            return Ok(());
        }

        slot.phase = SessionPhase::Failed;
        Err(Error::RelayUnavailable(format!(
            "giving up after {} reconnect attempts",
            self.config.max_reconnects
        )))
    }

    /// Marks the session failed and detaches the transport.
    async fn fail(&self, err: Error) -> Error {
        let mut slot = self.conn.lock().await;
        if !matches!(slot.phase, SessionPhase::Closed) {
            slot.phase = SessionPhase::Failed;
            slot.sink = None;
            slot.source = None;
        }
        err
    }

    async fn close_session(&self) -> Result<()> {
        let sink = {
            let mut slot = self.conn.lock().await;
            if matches!(slot.phase, SessionPhase::Closed) {
                return Ok(());
            }
            slot.phase = SessionPhase::Closed;
            slot.source = None;
            slot.sink.take()
        };

        if let Some(sink) = sink {
            let mut sink = sink.lock().await;
            if let Err(e) = sink.close().await {
                tracing::debug!(sid = %self.sid, error = %e, "close handshake failed");
            }
        }
        tracing::debug!(sid = %self.sid, "relay session closed");
        Ok(())
    }
}
