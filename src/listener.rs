//! Local TCP listener that tunnels clients through the relay.
//!
//! Each accepted TCP client gets its own relay session. The listener
//! reports lifecycle through [`ListenerEvent`]s; per-client failures are
//! reported there and never take down the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use crate::cli::ListenArgs;
use crate::error::{Error, Result};
use crate::fragment::{FragmentingReader, FragmentingWriter};
use crate::session::{RelayStream, SessionConfig, MIN_READ_SIZE};
use crate::transport::{RelayTarget, WsEndpoint};

/// Read buffer for the local TCP side.
const TCP_READ_BUFFER: usize = 64 * 1024;

/// Identifier for an accepted TCP client, assigned in accept order.
pub type ClientId = u64;

/// Lifecycle events emitted by the listener.
#[derive(Debug)]
pub enum ListenerEvent {
    /// A TCP client was accepted.
    ClientConnected { client: ClientId },
    /// A client's bridge ended; emitted exactly once per client.
    ClientDisconnected { client: ClientId },
    /// A client's bridge ended because of an error.
    ConnectionFailed { client: ClientId, error: Error },
}

/// A bound TCP listener that bridges clients onto relay sessions.
pub struct RelayListener {
    tcp: TcpListener,
    target: Arc<dyn RelayTarget>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<ListenerEvent>,
    shutdown_tx: broadcast::Sender<()>,
    accept_limit: Option<u64>,
}

impl RelayListener {
    /// Binds a local TCP listener. Port 0 asks the OS for a free port,
    /// exposed through [`RelayListener::local_addr`].
    pub async fn bind(
        listen: &str,
        target: Arc<dyn RelayTarget>,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ListenerEvent>)> {
        let addr = parse_listen_address(listen)?;
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::ListenFailed(e.to_string()))?;

        let (events, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        Ok((
            Self {
                tcp,
                target,
                config,
                events,
                shutdown_tx,
                accept_limit: None,
            },
            event_rx,
        ))
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.tcp.local_addr().map_err(Error::Io)
    }

    /// A handle that stops the accept loop and all client bridges.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Stops accepting after `limit` clients; existing bridges keep running.
    pub fn set_accept_limit(&mut self, limit: u64) {
        self.accept_limit = Some(limit);
    }

    /// Runs the accept loop until shutdown or the accept limit.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut clients = Vec::new();
        let mut next_client: ClientId = 1;
        let mut accepted: u64 = 0;

        tracing::info!(addr = %self.local_addr()?, "listening for clients");

        loop {
            if let Some(limit) = self.accept_limit {
                if accepted >= limit {
                    tracing::debug!(limit, "accept limit reached");
                    break;
                }
            }

            tokio::select! {
                incoming = self.tcp.accept() => {
                    match incoming {
                        Ok((socket, peer)) => {
                            accepted += 1;
                            let client = next_client;
                            next_client += 1;
                            tracing::info!(client, %peer, "client connected");
                            let _ = self.events.send(ListenerEvent::ClientConnected { client });

                            let target = Arc::clone(&self.target);
                            let config = self.config.clone();
                            let events = self.events.clone();
                            let conn_shutdown_rx = self.shutdown_tx.subscribe();

                            clients.push(tokio::spawn(async move {
                                let result = bridge_client(
                                    client,
                                    socket,
                                    target,
                                    config,
                                    conn_shutdown_rx,
                                )
                                .await;

                                match result {
                                    Ok(()) | Err(Error::SessionClosed(_)) => {
                                        tracing::info!(client, "client session ended");
                                    }
                                    Err(error) => {
                                        tracing::warn!(client, %error, "client session failed");
                                        let _ = events
                                            .send(ListenerEvent::ConnectionFailed { client, error });
                                    }
                                }
                                let _ = events.send(ListenerEvent::ClientDisconnected { client });
                            }));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept client");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown signal received, closing listener");
                    break;
                }
            }
        }

        // Wait for all client bridges to finish
        for handle in clients {
            let _ = handle.await;
        }

        tracing::info!("listener shutdown complete");
        Ok(())
    }
}

/// Bridges one TCP client onto its own relay session.
async fn bridge_client(
    client: ClientId,
    socket: TcpStream,
    target: Arc<dyn RelayTarget>,
    config: SessionConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let stream = RelayStream::connect(target, config).await?;
    tracing::debug!(client, sid = %stream.sid(), "relay session established");

    let (relay_read, relay_write) = stream.into_split();
    let (mut tcp_read, mut tcp_write) = socket.into_split();

    // TCP -> relay, fragmenting to frame-sized writes
    let local_to_relay = tokio::spawn(async move {
        let mut writer = FragmentingWriter::new(relay_write);
        let mut buf = [0u8; TCP_READ_BUFFER];
        loop {
            let n = tcp_read.read(&mut buf).await.map_err(Error::Io)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
        }
        writer.close().await
    });

    // Relay -> TCP
    let relay_to_local = tokio::spawn(async move {
        let mut reader = FragmentingReader::new(relay_read);
        let mut buf = vec![0u8; MIN_READ_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            tcp_write.write_all(&buf[..n]).await.map_err(Error::Io)?;
        }
        let _ = tcp_write.shutdown().await;
        Ok::<(), Error>(())
    });

    // Dropping a JoinHandle does NOT cancel the task; abort explicitly so
    // either direction ending tears the whole bridge down.
    let local_abort = local_to_relay.abort_handle();
    let relay_abort = relay_to_local.abort_handle();

    tokio::select! {
        result = local_to_relay => {
            relay_abort.abort();
            result.map_err(|e| Error::SessionClosed(format!("bridge task panicked: {}", e)))?
        }
        result = relay_to_local => {
            local_abort.abort();
            result.map_err(|e| Error::SessionClosed(format!("bridge task panicked: {}", e)))?
        }
        _ = shutdown_rx.recv() => {
            tracing::debug!(client, "shutdown signal received, closing bridge");
            local_abort.abort();
            relay_abort.abort();
            Ok(())
        }
    }
}

/// Runs the listen subcommand.
pub async fn run_listen(args: &ListenArgs) -> Result<()> {
    let target = Arc::new(WsEndpoint::new(
        args.url.clone(),
        args.bearer_token.clone(),
    ));
    let config = SessionConfig {
        max_reconnects: args.max_reconnects,
        reconnect_backoff: args.reconnect_backoff,
        max_pending_bytes: args.max_pending_bytes,
    };

    let (listener, mut events) = RelayListener::bind(&args.listen, target, config).await?;

    print_startup_message(args, listener.local_addr()?);

    // Ctrl-C triggers a graceful shutdown
    let shutdown_tx = listener.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, initiating graceful shutdown");
            let _ = shutdown_tx.send(());
        }
    });

    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ListenerEvent::ClientConnected { client } => {
                    tracing::debug!(client, "event: connected");
                }
                ListenerEvent::ClientDisconnected { client } => {
                    tracing::debug!(client, "event: disconnected");
                }
                ListenerEvent::ConnectionFailed { client, error } => {
                    tracing::error!(client, %error, "event: connection failed");
                }
            }
        }
    });

    let result = listener.run().await;
    event_log.abort();
    result
}

/// Parses a listen address string into a SocketAddr.
fn parse_listen_address(listen: &str) -> Result<SocketAddr> {
    // Handle ":port" format by prepending "127.0.0.1"
    let addr_str = if listen.starts_with(':') {
        format!("127.0.0.1{}", listen)
    } else {
        listen.to_string()
    };

    addr_str
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address '{}': {}", listen, e)))
}

/// Prints the startup message.
fn print_startup_message(args: &ListenArgs, addr: SocketAddr) {
    eprintln!("Starting listener...");
    eprintln!("  Listen: {}", addr);
    eprintln!("  Relay URL: {}", args.url);
    eprintln!("  Max Reconnects: {}", args.max_reconnects);
    eprintln!(
        "  Reconnect Backoff: {}",
        humantime::format_duration(args.reconnect_backoff)
    );
    eprintln!("  Max Pending Bytes: {}", args.max_pending_bytes);
    if args.bearer_token.is_some() {
        eprintln!("  Authorization: bearer token");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_address_with_port_only() {
        let addr = parse_listen_address(":2222").unwrap();
        assert_eq!(addr.port(), 2222);
        assert_eq!(addr.ip(), std::net::Ipv4Addr::new(127, 0, 0, 1));
    }

    #[test]
    fn test_parse_listen_address_with_full_addr() {
        let addr = parse_listen_address("127.0.0.1:2222").unwrap();
        assert_eq!(addr.port(), 2222);
        assert_eq!(addr.ip(), std::net::Ipv4Addr::new(127, 0, 0, 1));
    }

    #[test]
    fn test_parse_listen_address_invalid() {
        let result = parse_listen_address("invalid");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_listen_address_ipv6() {
        let addr = parse_listen_address("[::1]:2222").unwrap();
        assert_eq!(addr.port(), 2222);
    }
}
