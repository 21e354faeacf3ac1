//! wsrelay - Resumable TCP-over-WebSocket relay tunnel.
//!
//! This crate tunnels TCP connections through a WebSocket relay service,
//! surviving relay connection drops: a session is identified by a relay
//! assigned SID, both sides acknowledge received bytes, and after a
//! reconnect the unacknowledged suffix is replayed so the byte stream
//! never loses or duplicates data.

pub mod buffer;
pub mod cli;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod listener;
pub mod probe;
pub mod session;
pub mod transport;

pub use buffer::{BufferError, BufferResult, SendBuffer, DEFAULT_MAX_BUFFER_BYTES};
pub use cli::{BuildInfo, Cli, Command, ListenArgs, ProbeArgs};
pub use error::{Error, ExitCode, Result};
pub use fragment::{
    FragmentingReader, FragmentingStream, FragmentingWriter, SessionRead, SessionWrite,
};
pub use frame::{Frame, FrameError, FrameResult, MAX_DATA_PAYLOAD};
pub use listener::{run_listen, ClientId, ListenerEvent, RelayListener};
pub use probe::{probe, run_probe, DEFAULT_PROBE_TIMEOUT};
pub use session::{
    RelayReadHalf, RelayStream, RelayWriteHalf, SessionConfig, SessionPhase,
    DEFAULT_MAX_RECONNECTS, MAX_READ_BYTES_PER_ACK, MAX_WRITE_SIZE, MIN_READ_SIZE,
};
pub use transport::{
    CloseCode, MessageSink, MessageSource, RelayTarget, TransportError, TransportPair, WsEndpoint,
};
