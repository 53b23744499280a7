//! Single-subscriber event push.
//!
//! At most one subscriber is connected; a new one replaces (and closes) the
//! previous. Each [`EventHub::push`] writes exactly one NDJSON line to the
//! current subscriber, or is dropped silently when nobody listens. There is
//! no queue: delivery is at most once.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::channel::{AnyChannel, Channel};
use crate::error::{OperationalError, Phase};
use crate::listener::ConnectionHandler;
use crate::observer::Observer;
use crate::slot::SingleSlot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEntry {
    pub port: u16,
    pub process: String,
}

/// Events pushed to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushEvent {
    /// Shared file list changed.
    Files { files: Vec<String> },
    /// URLs opened in the guest.
    Urls { urls: Vec<String> },
    Log { message: String },
    /// Listening ports and their owning processes.
    Ports { ports: Vec<PortEntry> },
    /// Foreground application changed.
    App {
        name: String,
        #[serde(rename = "bundleId")]
        bundle_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        icon: Option<String>,
    },
}

impl PushEvent {
    /// One JSON document terminated by `\n`. String fields are escaped, so
    /// embedded newlines never split the line.
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

pub struct EventHub {
    subscriber: SingleSlot<AnyChannel>,
    observer: Arc<dyn Observer>,
    port: u32,
}

impl EventHub {
    pub fn new(port: u32, observer: Arc<dyn Observer>) -> Self {
        EventHub {
            subscriber: SingleSlot::new(),
            observer,
            port,
        }
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber.is_occupied()
    }

    /// Deliver `event` to the current subscriber. Never fails: with no
    /// subscriber the event is dropped, and a failed write detaches the
    /// subscriber and is reported as an operational error.
    pub async fn push(&self, event: &PushEvent) {
        let Some(channel) = self.subscriber.current() else {
            tracing::trace!(?event, "no subscriber, event dropped");
            return;
        };
        let line = match event.to_line() {
            Ok(line) => line,
            Err(e) => {
                self.report(format!("encode event: {e}"));
                return;
            }
        };
        if let Err(e) = channel.write_all(&line).await {
            tracing::debug!(error = %e, "event subscriber write failed");
            self.subscriber.release(&channel);
            self.report(e.to_string());
        }
    }

    /// Drop the current subscriber, if any.
    pub fn disconnect(&self) {
        self.subscriber.clear();
    }

    fn report(&self, message: String) {
        self.observer.operational_error(&OperationalError::new(
            Phase::EventPush,
            message,
            Some(self.port),
        ));
    }
}

impl ConnectionHandler for EventHub {
    async fn serve(self: Arc<Self>, channel: AnyChannel) {
        let channel = Arc::new(channel);
        self.subscriber.replace(Arc::clone(&channel));
        self.observer.connection_success();
        tracing::debug!(port = self.port, "event subscriber attached");

        // Incoming bytes are never interpreted; the loop only detects EOF.
        loop {
            match channel.read(1024).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "event subscriber read ended");
                    break;
                }
            }
        }
        if self.subscriber.release(&channel) {
            tracing::debug!(port = self.port, "event subscriber detached");
        }
        channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(event: &PushEvent) -> String {
        String::from_utf8(event.to_line().unwrap()).unwrap()
    }

    #[test]
    fn test_wire_format_per_kind() {
        assert_eq!(
            line(&PushEvent::Files {
                files: vec!["a.txt".into()]
            }),
            "{\"type\":\"files\",\"files\":[\"a.txt\"]}\n"
        );
        assert_eq!(
            line(&PushEvent::Urls {
                urls: vec!["https://example.com".into()]
            }),
            "{\"type\":\"urls\",\"urls\":[\"https://example.com\"]}\n"
        );
        assert_eq!(
            line(&PushEvent::Ports {
                ports: vec![PortEntry {
                    port: 8080,
                    process: "node".into()
                }]
            }),
            "{\"type\":\"ports\",\"ports\":[{\"port\":8080,\"process\":\"node\"}]}\n"
        );
    }

    #[test]
    fn test_app_icon_is_optional() {
        let without = PushEvent::App {
            name: "Safari".into(),
            bundle_id: "com.apple.Safari".into(),
            icon: None,
        };
        assert_eq!(
            line(&without),
            "{\"type\":\"app\",\"name\":\"Safari\",\"bundleId\":\"com.apple.Safari\"}\n"
        );
        let with = PushEvent::App {
            name: "Safari".into(),
            bundle_id: "com.apple.Safari".into(),
            icon: Some("iVBOR".into()),
        };
        assert!(line(&with).ends_with(",\"icon\":\"iVBOR\"}\n"));
    }

    #[test]
    fn test_log_message_escaping_keeps_one_line() {
        let event = PushEvent::Log {
            message: "quote \" slash \\ tab \t cr \r nl \n end".into(),
        };
        let text = line(&event);
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.contains("\\\""));
        assert!(text.contains("\\\\"));
        assert!(text.contains("\\t"));
        assert!(text.contains("\\r"));
        assert!(text.contains("\\n"));
        let back: PushEvent = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(back, event);
    }
}
