//! Relay connectivity probing.
//!
//! A probe answers one question: can a session be established through the
//! relay right now? It connects, waits briefly for traffic, and tears the
//! session down. An idle session is a healthy one; only a connect failure
//! or a read error within the deadline counts as a failed probe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cli::ProbeArgs;
use crate::error::{Error, Result};
use crate::session::{RelayStream, SessionConfig, MIN_READ_SIZE};
use crate::transport::{RelayTarget, WsEndpoint};

/// Default overall probe deadline.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Probes the relay target once under the given deadline.
///
/// A probe is a single attempt: a transport lost mid-probe is a failed
/// probe, never a reconnect.
pub async fn probe(
    target: Arc<dyn RelayTarget>,
    config: SessionConfig,
    deadline: Duration,
) -> Result<()> {
    let started = Instant::now();
    let config = SessionConfig {
        max_reconnects: 0,
        ..config
    };

    let stream = match tokio::time::timeout(deadline, RelayStream::connect(target, config)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(Error::ConnectionFailed(format!(
                "relay did not answer within {:?}",
                deadline
            )))
        }
    };
    tracing::debug!(sid = %stream.sid(), "probe session established");

    let remaining = deadline.saturating_sub(started.elapsed());
    let mut buf = vec![0u8; MIN_READ_SIZE];
    let verdict = match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
        // Data or a clean EOF both prove the relay answers.
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        // No traffic within the deadline; an idle relay is healthy.
        Err(_) => Ok(()),
    };

    if let Err(e) = stream.close().await {
        tracing::debug!(error = %e, "probe session close failed");
    }
    verdict
}

/// Runs the probe subcommand.
pub async fn run_probe(args: &ProbeArgs) -> Result<()> {
    let target = Arc::new(WsEndpoint::new(
        args.url.clone(),
        args.bearer_token.clone(),
    ));
    match probe(target, SessionConfig::default(), args.timeout).await {
        Ok(()) => {
            eprintln!("relay endpoint is reachable: {}", args.url);
            Ok(())
        }
        Err(e) => {
            tracing::error!(url = %args.url, error = %e, "probe failed");
            Err(e)
        }
    }
}
