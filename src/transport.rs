//! WebSocket transport for relay sessions.
//!
//! The session layer talks to the relay through the [`MessageSink`] /
//! [`MessageSource`] traits so tests can substitute scripted transports,
//! and opens connections through [`RelayTarget`] so a single session can
//! be backed by successive WebSocket connections.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Close codes used by the relay service.
///
/// Anything in the 4xxx range is relay-specific; 1000 and 1006 are the
/// standard WebSocket codes the session layer also has to classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    Abnormal,
    SidUnknown,
    SidInUse,
    FailedToConnectToBackend,
    ReauthenticationRequired,
    BackendWriteFailed,
    BackendReadFailed,
    NotAuthorized,
    LookupFailed,
    LookupFailedReconnect,
    FailedToRewind,
    Other(u16),
}

impl CloseCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1006 => CloseCode::Abnormal,
            4001 => CloseCode::SidUnknown,
            4002 => CloseCode::SidInUse,
            4003 => CloseCode::FailedToConnectToBackend,
            4004 => CloseCode::ReauthenticationRequired,
            4009 => CloseCode::BackendWriteFailed,
            4010 => CloseCode::BackendReadFailed,
            4033 => CloseCode::NotAuthorized,
            4047 => CloseCode::LookupFailed,
            4051 => CloseCode::LookupFailedReconnect,
            4074 => CloseCode::FailedToRewind,
            other => CloseCode::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::Abnormal => 1006,
            CloseCode::SidUnknown => 4001,
            CloseCode::SidInUse => 4002,
            CloseCode::FailedToConnectToBackend => 4003,
            CloseCode::ReauthenticationRequired => 4004,
            CloseCode::BackendWriteFailed => 4009,
            CloseCode::BackendReadFailed => 4010,
            CloseCode::NotAuthorized => 4033,
            CloseCode::LookupFailed => 4047,
            CloseCode::LookupFailedReconnect => 4051,
            CloseCode::FailedToRewind => 4074,
            CloseCode::Other(code) => *code,
        }
    }

    /// Codes that end the byte stream cleanly. A reader treats these as
    /// end-of-stream, not as an error.
    pub fn is_clean_eof(&self) -> bool {
        matches!(
            self,
            CloseCode::Normal | CloseCode::BackendReadFailed | CloseCode::BackendWriteFailed
        )
    }

    /// Codes with which the relay permanently refuses to resume a session.
    pub fn is_resume_rejection(&self) -> bool {
        matches!(
            self,
            CloseCode::SidUnknown | CloseCode::SidInUse | CloseCode::FailedToRewind
        )
    }
}

/// Transport error types.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection, with the given close code.
    #[error("connection closed by peer: code {} ({reason})", .code.as_u16())]
    ClosedByPeer { code: CloseCode, reason: String },

    /// The transport failed without a close handshake.
    #[error("websocket error: {0}")]
    Ws(String),
}

/// Write half of a message transport.
#[async_trait]
pub trait MessageSink: Send {
    /// Sends one binary message.
    async fn send(&mut self, msg: Bytes) -> std::result::Result<(), TransportError>;

    /// Performs the close handshake.
    async fn close(&mut self) -> std::result::Result<(), TransportError>;
}

/// Read half of a message transport.
#[async_trait]
pub trait MessageSource: Send {
    /// Receives the next binary message.
    ///
    /// A connection ended by the peer surfaces as
    /// [`TransportError::ClosedByPeer`]; a stream that ends without a
    /// close handshake reports [`CloseCode::Abnormal`].
    async fn recv(&mut self) -> std::result::Result<Bytes, TransportError>;
}

/// A connected transport, split for independent reading and writing.
pub type TransportPair = (Box<dyn MessageSink>, Box<dyn MessageSource>);

/// A relay endpoint that sessions connect and reconnect through.
#[async_trait]
pub trait RelayTarget: Send + Sync {
    /// Opens a fresh relay connection.
    async fn connect(&self) -> Result<TransportPair>;

    /// Reopens a connection that resumes an existing session, presenting
    /// the session ID and how many bytes this side has received so far.
    async fn reconnect(&self, sid: &str, bytes_received: u64) -> Result<TransportPair>;
}

/// A relay endpoint reached over WebSocket.
#[derive(Debug, Clone)]
pub struct WsEndpoint {
    url: String,
    bearer_token: Option<String>,
}

impl WsEndpoint {
    pub fn new(url: String, bearer_token: Option<String>) -> Self {
        Self { url, bearer_token }
    }

    /// Builds the URL for resuming a session.
    ///
    /// The relay exposes reconnection as a sibling of the connect
    /// endpoint, keyed by session ID and received-byte count.
    fn reconnect_url(&self, sid: &str, bytes_received: u64) -> String {
        let base = match self.url.strip_suffix("/connect") {
            Some(prefix) => format!("{}/reconnect", prefix),
            None => self.url.clone(),
        };
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{}{}sid={}&ack={}", base, separator, sid, bytes_received)
    }

    async fn open(&self, url: &str) -> Result<TransportPair> {
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Config(format!("invalid relay URL '{}': {}", url, e)))?;

        if let Some(token) = &self.bearer_token {
            let value = format!("Bearer {}", token)
                .parse()
                .map_err(|_| Error::Config("bearer token is not a valid header value".to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws, _) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(response)
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                Error::Unauthorized
            }
            e => Error::ConnectionFailed(e.to_string()),
        })?;

        let (sink, source) = ws.split();
        Ok((
            Box::new(WsSink { inner: sink }),
            Box::new(WsSource { inner: source }),
        ))
    }
}

#[async_trait]
impl RelayTarget for WsEndpoint {
    async fn connect(&self) -> Result<TransportPair> {
        tracing::debug!(url = %self.url, "opening relay connection");
        self.open(&self.url.clone()).await
    }

    async fn reconnect(&self, sid: &str, bytes_received: u64) -> Result<TransportPair> {
        let url = self.reconnect_url(sid, bytes_received);
        tracing::debug!(sid, ack = bytes_received, "reopening relay connection");
        self.open(&url).await
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, msg: Bytes) -> std::result::Result<(), TransportError> {
        self.inner
            .send(Message::Binary(msg.to_vec()))
            .await
            .map_err(map_ws_error)
    }

    async fn close(&mut self) -> std::result::Result<(), TransportError> {
        self.inner.close().await.map_err(map_ws_error)
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl MessageSource for WsSource {
    async fn recv(&mut self) -> std::result::Result<Bytes, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Bytes::from(data)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (CloseCode::from_u16(u16::from(f.code)), f.reason.to_string()),
                        None => (CloseCode::Normal, String::new()),
                    };
                    return Err(TransportError::ClosedByPeer { code, reason });
                }
                // Ping/pong are answered by the protocol stack; the relay
                // never sends text messages.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(map_ws_error(e)),
                None => {
                    return Err(TransportError::ClosedByPeer {
                        code: CloseCode::Abnormal,
                        reason: String::new(),
                    })
                }
            }
        }
    }
}

fn map_ws_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ClosedByPeer {
            code: CloseCode::Normal,
            reason: String::new(),
        },
        WsError::Protocol(
            tokio_tungstenite::tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        ) => TransportError::ClosedByPeer {
            code: CloseCode::Abnormal,
            reason: String::new(),
        },
        e => TransportError::Ws(e.to_string()),
    }
}
