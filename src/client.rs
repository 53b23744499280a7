//! Host-side helpers for talking to the guest services.

use std::fmt;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::channel::{read_line, AnyChannel, Channel, Line, Strategy};
use crate::error::ChannelError;
use crate::events::PushEvent;
use crate::heartbeat::HeartbeatStatus;
use crate::protocol::MAX_HANDSHAKE_LINE;
use crate::sys;

const MAX_STATUS_LINE: usize = 4096;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connect {addr} failed: {source}")]
    Connect { addr: String, source: std::io::Error },

    #[error("tunnel refused: {0}")]
    Refused(String),

    #[error("unexpected reply: {0:?}")]
    Protocol(String),

    #[error("invalid JSON line: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Where a guest service can be reached from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialAddr {
    Vsock { cid: u32, port: u32 },
    Tcp(SocketAddr),
}

impl fmt::Display for DialAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialAddr::Vsock { cid, port } => write!(f, "vsock://{cid}:{port}"),
            DialAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Dial `addr` and wrap it in the channel its transport needs.
pub async fn connect(addr: DialAddr) -> Result<AnyChannel, ClientError> {
    let connect_err = |source| ClientError::Connect {
        addr: addr.to_string(),
        source,
    };
    match addr {
        DialAddr::Vsock { cid, port } => {
            let fd = tokio::task::spawn_blocking(move || sys::connect_vsock(cid, port))
                .await
                .map_err(|e| connect_err(std::io::Error::other(e)))?
                .map_err(connect_err)?;
            Ok(AnyChannel::open(Strategy::Blocking, fd)?)
        }
        DialAddr::Tcp(sock) => {
            let stream = TcpStream::connect(sock).await.map_err(connect_err)?;
            let _ = stream.set_nodelay(true);
            let std_stream = stream.into_std().map_err(connect_err)?;
            Ok(AnyChannel::open(Strategy::EventDriven, OwnedFd::from(std_stream))?)
        }
    }
}

async fn expect_line<C: Channel + ?Sized>(channel: &C, max: usize) -> Result<String, ClientError> {
    match read_line(channel, max).await? {
        Line::Complete(line) => Ok(line.trim_end_matches('\r').to_string()),
        Line::TooLong => Err(ClientError::Protocol(format!("line longer than {max} bytes"))),
    }
}

/// Read the status line a heartbeat connection starts with. Keep the
/// channel open afterwards for as long as the guest should count as alive.
pub async fn read_heartbeat<C: Channel + ?Sized>(channel: &C) -> Result<HeartbeatStatus, ClientError> {
    let line = expect_line(channel, MAX_STATUS_LINE).await?;
    Ok(serde_json::from_str(&line)?)
}

/// Ask the tunnel service to connect to guest-local `port`. On success the
/// channel carries the raw stream.
pub async fn open_tunnel<C: Channel + ?Sized>(channel: &C, port: u16) -> Result<(), ClientError> {
    channel
        .write_all(format!("CONNECT {port}\r\n").as_bytes())
        .await?;
    let reply = expect_line(channel, MAX_HANDSHAKE_LINE).await?;
    if reply == "OK" {
        Ok(())
    } else if let Some(message) = reply.strip_prefix("ERROR ") {
        Err(ClientError::Refused(message.to_string()))
    } else {
        Err(ClientError::Protocol(reply))
    }
}

/// Decodes the NDJSON event stream.
pub struct EventStream<C> {
    channel: C,
    pending: Vec<u8>,
}

impl<C: Channel> EventStream<C> {
    pub fn new(channel: C) -> Self {
        EventStream {
            channel,
            pending: Vec::new(),
        }
    }

    /// Next event, or `None` once the guest closes the stream.
    pub async fn next_event(&mut self) -> Result<Option<PushEvent>, ClientError> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(serde_json::from_slice(line)?));
            }
            match self.channel.read(16 * 1024).await? {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None if self.pending.is_empty() => return Ok(None),
                None => {
                    return Err(ClientError::Channel(ChannelError::PrematureEof {
                        expected: self.pending.len() + 1,
                        received: self.pending.len(),
                    }))
                }
            }
        }
    }

    pub fn into_inner(self) -> C {
        self.channel
    }
}
