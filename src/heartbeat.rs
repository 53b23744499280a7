//! Liveness heartbeat.
//!
//! The peer connects, receives one status line, and then the connection is
//! simply held open: open means healthy, dropped means unhealthy. Incoming
//! bytes are read and discarded only to notice the disconnect; there is
//! deliberately no read timeout. A newer connection displaces the current
//! one.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::channel::{AnyChannel, Channel};
use crate::error::{OperationalError, Phase};
use crate::listener::ConnectionHandler;
use crate::observer::Observer;
use crate::slot::SingleSlot;

/// The single line sent on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatStatus {
    pub status: String,
    pub version: String,
}

impl HeartbeatStatus {
    pub fn ok(version: impl Into<String>) -> Self {
        HeartbeatStatus {
            status: "ok".to_string(),
            version: version.into(),
        }
    }

    /// `{"status":"ok","version":"..."}\n`
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).unwrap_or_default();
        line.push(b'\n');
        line
    }
}

pub struct HeartbeatHandler {
    line: Vec<u8>,
    slot: SingleSlot<AnyChannel>,
    observer: Arc<dyn Observer>,
    port: u32,
}

impl HeartbeatHandler {
    pub fn new(version: &str, port: u32, observer: Arc<dyn Observer>) -> Self {
        HeartbeatHandler {
            line: HeartbeatStatus::ok(version).to_line(),
            slot: SingleSlot::new(),
            observer,
            port,
        }
    }

    pub fn has_peer(&self) -> bool {
        self.slot.is_occupied()
    }

    /// Drop the current peer, if any.
    pub fn disconnect(&self) {
        self.slot.clear();
    }
}

impl ConnectionHandler for HeartbeatHandler {
    async fn serve(self: Arc<Self>, channel: AnyChannel) {
        let channel = Arc::new(channel);
        self.slot.replace(Arc::clone(&channel));

        if let Err(e) = channel.write_all(&self.line).await {
            tracing::debug!(error = %e, "heartbeat peer gone before status line");
            self.observer.operational_error(&OperationalError::new(
                Phase::Heartbeat,
                e.to_string(),
                Some(self.port),
            ));
            self.slot.release(&channel);
            channel.close();
            return;
        }
        self.observer.connection_success();

        loop {
            match channel.read(1).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "heartbeat read ended");
                    break;
                }
            }
        }
        tracing::debug!(port = self.port, "heartbeat peer disconnected");
        self.slot.release(&channel);
        channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line_format() {
        let line = HeartbeatStatus::ok("1.2.3").to_line();
        assert_eq!(line, b"{\"status\":\"ok\",\"version\":\"1.2.3\"}\n");
    }

    #[test]
    fn test_status_line_escapes_version() {
        let line = HeartbeatStatus::ok("a\"b\nc").to_line();
        let text = std::str::from_utf8(&line).unwrap();
        assert_eq!(text.matches('\n').count(), 1);
        let parsed: HeartbeatStatus = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(parsed.version, "a\"b\nc");
    }
}
