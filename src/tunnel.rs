//! `CONNECT <port>` tunnel from the host to a loopback TCP service.
//!
//! ```text
//! client → CONNECT 8080\r\n
//! server → OK\r\n                (or ERROR <message>\r\n and close)
//! ...raw bytes relayed both ways until each side half-closes...
//! ```
//!
//! Network failures (reset, broken pipe, timeouts) end the session and are
//! reported as operational errors. Anything else means our own invariants
//! broke, and the process aborts.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::channel::{read_line, AnyChannel, Channel, EventDrivenChannel, Line};
use crate::error::{fail_fast, ChannelError, ErrorClass, OperationalError, Phase};
use crate::listener::ConnectionHandler;
use crate::observer::Observer;
use crate::protocol::{timeouts::HANDSHAKE_MS, MAX_HANDSHAKE_LINE};
use crate::relay::relay;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Parse a trimmed handshake line. `Err` carries the text sent after
/// `ERROR `.
pub fn parse_connect(line: &str) -> Result<u16, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix("CONNECT ") else {
        return Err("Expected CONNECT command".to_string());
    };
    let rest = rest.trim();
    rest.parse::<u16>()
        .map_err(|_| format!("Invalid port: {rest}"))
}

/// Dial `localhost:<port>`, IPv4 first, then IPv6, with `TCP_NODELAY`.
pub async fn dial_loopback(port: u16) -> std::io::Result<EventDrivenChannel> {
    let stream = match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
        Ok(stream) => stream,
        Err(v4) => {
            tracing::trace!(port, error = %v4, "IPv4 dial failed, trying IPv6");
            TcpStream::connect((Ipv6Addr::LOCALHOST, port)).await?
        }
    };
    stream.set_nodelay(true)?;
    let std_stream = stream.into_std()?;
    EventDrivenChannel::new(OwnedFd::from(std_stream)).map_err(std::io::Error::other)
}

pub struct TunnelHandler {
    handshake_timeout: Duration,
    observer: Arc<dyn Observer>,
    port: u32,
}

impl TunnelHandler {
    pub fn new(port: u32, observer: Arc<dyn Observer>) -> Self {
        TunnelHandler {
            handshake_timeout: Duration::from_millis(HANDSHAKE_MS),
            observer,
            port,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    async fn run(&self, session: u64, client: &AnyChannel) -> Result<(), (Phase, ChannelError)> {
        let line = match tokio::time::timeout(
            self.handshake_timeout,
            read_line(client, MAX_HANDSHAKE_LINE),
        )
        .await
        {
            Err(_) => return Err((Phase::Handshake, ChannelError::TimedOut)),
            Ok(Err(e)) => return Err((Phase::Handshake, e)),
            Ok(Ok(Line::TooLong)) => {
                return refuse(client, "Handshake line too long").await;
            }
            Ok(Ok(Line::Complete(line))) => line,
        };

        let target = match parse_connect(&line) {
            Ok(port) => port,
            Err(message) => {
                tracing::debug!(session, line = %line.trim(), "bad tunnel handshake");
                return refuse(client, &message).await;
            }
        };

        let upstream = match dial_loopback(target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::debug!(session, target, error = %e, "tunnel dial failed");
                self.observer.operational_error(&OperationalError::new(
                    Phase::Dial,
                    e.to_string(),
                    Some(u32::from(target)),
                ));
                return refuse(client, &format!("Connection to port {target} failed: {e}")).await;
            }
        };

        client
            .write_all(b"OK\r\n")
            .await
            .map_err(|e| (Phase::Handshake, e))?;
        self.observer.connection_success();
        tracing::debug!(session, target, "tunnel established");

        let result = relay(client, &upstream).await;
        upstream.close();
        let stats = result.map_err(|e| (Phase::Relay, e))?;
        tracing::debug!(
            session,
            target,
            to_service = stats.a_to_b,
            to_client = stats.b_to_a,
            "tunnel closed"
        );
        Ok(())
    }
}

async fn refuse(client: &AnyChannel, message: &str) -> Result<(), (Phase, ChannelError)> {
    client
        .write_all(format!("ERROR {message}\r\n").as_bytes())
        .await
        .map_err(|e| (Phase::Handshake, e))
}

impl ConnectionHandler for TunnelHandler {
    async fn serve(self: Arc<Self>, channel: AnyChannel) {
        let session = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        if let Err((phase, err)) = self.run(session, &channel).await {
            match err.class() {
                ErrorClass::Operational => {
                    tracing::info!(session, ?phase, error = %err, "tunnel session ended");
                    self.observer.operational_error(&OperationalError::new(
                        phase,
                        err.to_string(),
                        Some(self.port),
                    ));
                }
                ErrorClass::Unexpected => fail_fast("tunnel session", &err),
            }
        }
        channel.close();
    }
}
