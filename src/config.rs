//! Daemon configuration, loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ListenError;
use crate::listener::ListenAddr;
use crate::protocol::{self, ports, timeouts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Vsock,
    Tcp,
}

/// The four services the agent exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Tunnel,
    Heartbeat,
    Events,
    Http,
}

impl Service {
    pub const ALL: [Service; 4] = [Service::Tunnel, Service::Heartbeat, Service::Events, Service::Http];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ports {
    pub tunnel: u32,
    pub heartbeat: u32,
    pub events: u32,
    pub http: u32,
}

impl Default for Ports {
    fn default() -> Self {
        Ports {
            tunnel: ports::TUNNEL,
            heartbeat: ports::HEARTBEAT,
            events: ports::EVENTS,
            http: ports::HTTP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Reported by the heartbeat line.
    pub version: String,
    pub transport: TransportKind,
    /// Bind address when `transport = "tcp"`.
    pub tcp_host: IpAddr,
    pub ports: Ports,
    pub handshake_timeout_ms: u64,
    pub accept_backoff_ms: u64,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
    /// Enables streamed `PUT /upload/...` into this directory.
    pub upload_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: protocol::VERSION.to_string(),
            transport: TransportKind::Vsock,
            tcp_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: Ports::default(),
            handshake_timeout_ms: timeouts::HANDSHAKE_MS,
            accept_backoff_ms: timeouts::ACCEPT_BACKOFF_MS,
            max_header_bytes: protocol::MAX_HEADER_BYTES,
            max_body_bytes: protocol::MAX_BODY_BYTES,
            upload_dir: None,
        }
    }
}

impl Config {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => Self::from_toml(&data)
                .with_context(|| format!("Failed to parse config: {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read config: {}", path.display())),
        }
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        Ok(toml::from_str(data)?)
    }

    pub fn port(&self, service: Service) -> u32 {
        match service {
            Service::Tunnel => self.ports.tunnel,
            Service::Heartbeat => self.ports.heartbeat,
            Service::Events => self.ports.events,
            Service::Http => self.ports.http,
        }
    }

    /// Vsock ports span the full `u32` range; TCP ports must fit a `u16`.
    pub fn listen_addr(&self, service: Service) -> Result<ListenAddr, ListenError> {
        let port = self.port(service);
        match self.transport {
            TransportKind::Vsock => Ok(ListenAddr::Vsock { port }),
            TransportKind::Tcp => {
                let port = u16::try_from(port).map_err(|_| ListenError::PortOutOfRange(port))?;
                Ok(ListenAddr::Tcp(SocketAddr::new(self.tcp_host, port)))
            }
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }
}
