//! Command-line options for guestlinkd.

use clap::{ArgAction, Parser};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::config::{Config, TransportKind};

/// Guest-side bridge daemon: tunnel, heartbeat, events and HTTP services
#[derive(Clone, Debug, Parser)]
#[command(name = "guestlinkd", version)]
pub struct DaemonOpts {
    /// Config file (TOML). Missing file means defaults.
    #[arg(long, default_value = "/etc/guestlink.toml")]
    pub config: PathBuf,

    /// Socket family to listen on
    #[arg(long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Bind address when listening on TCP
    #[arg(long)]
    pub tcp_host: Option<IpAddr>,

    #[arg(long)]
    pub tunnel_port: Option<u32>,

    #[arg(long)]
    pub heartbeat_port: Option<u32>,

    #[arg(long)]
    pub events_port: Option<u32>,

    #[arg(long)]
    pub http_port: Option<u32>,

    /// Accept streamed uploads under /upload/ into this directory
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// Append service events as JSON lines to this file
    #[arg(long)]
    pub event_log: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl DaemonOpts {
    /// Flags given on the command line win over the config file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(host) = self.tcp_host {
            config.tcp_host = host;
        }
        if let Some(port) = self.tunnel_port {
            config.ports.tunnel = port;
        }
        if let Some(port) = self.heartbeat_port {
            config.ports.heartbeat = port;
        }
        if let Some(port) = self.events_port {
            config.ports.events = port;
        }
        if let Some(port) = self.http_port {
            config.ports.http = port;
        }
        if let Some(dir) = &self.upload_dir {
            config.upload_dir = Some(dir.clone());
        }
    }

    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "guestlink=info",
            1 => "guestlink=debug",
            _ => "guestlink=trace",
        }
    }
}
