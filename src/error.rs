//! Error types for guestlink.
//!
//! Channel failures are split into two classes. Operational errors are the
//! network misbehaving (peer reset, broken pipe, timeouts) and end only the
//! affected connection. Unexpected errors mean an invariant this crate relies
//! on no longer holds; callers that must not continue hand those to
//! [`fail_fast`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

fn os_message(code: &i32) -> String {
    io::Error::from_raw_os_error(*code).to_string()
}

/// Errors surfaced by [`crate::channel::Channel`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error("premature end of stream: expected {expected} bytes, received {received}")]
    PrematureEof { expected: usize, received: usize },

    #[error("{op} failed: {}", os_message(.code))]
    Syscall { op: &'static str, code: i32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    TimedOut,
}

/// How a caller should react to a [`ChannelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Log it, end this connection, keep serving others.
    Operational,
    /// Internal invariant broken; the process should not continue.
    Unexpected,
}

impl ChannelError {
    pub(crate) fn from_sys(op: &'static str, err: crate::sys::SysError) -> Self {
        ChannelError::Syscall {
            op,
            code: err.code(),
        }
    }

    pub(crate) fn from_io(op: &'static str, err: &io::Error) -> Self {
        ChannelError::Syscall {
            op,
            code: err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// OS error code for syscall failures.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            ChannelError::Syscall { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when the far side or this side has already torn the stream down.
    pub fn is_closed(&self) -> bool {
        match self {
            ChannelError::Closed => true,
            ChannelError::Syscall { code, .. } => *code == libc::ENOTCONN,
            _ => false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ChannelError::PrematureEof { .. } | ChannelError::TimedOut | ChannelError::Cancelled => {
                ErrorClass::Operational
            }
            ChannelError::Syscall { code, .. } => {
                let code = *code;
                if code == libc::ECONNRESET
                    || code == libc::ECONNABORTED
                    || code == libc::EPIPE
                    || code == libc::ENOTCONN
                    || code == libc::ESHUTDOWN
                    || code == libc::ETIMEDOUT
                {
                    ErrorClass::Operational
                } else {
                    ErrorClass::Unexpected
                }
            }
            ChannelError::Closed => ErrorClass::Unexpected,
        }
    }
}

/// Request framing failures.
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("request headers exceed {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("request body of {length} bytes exceeds {limit} bytes")]
    BodyTooLarge { length: usize, limit: usize },

    #[error("malformed request line: {0:?}")]
    RequestLine(String),

    #[error("malformed header line: {0:?}")]
    Header(String),

    #[error("invalid Content-Length: {0:?}")]
    ContentLength(String),

    #[error("connection closed before the request was complete")]
    Incomplete,

    #[error("upload failed: {0}")]
    Upload(#[from] io::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl FramingError {
    /// Status code to answer with, or `None` when the peer is already gone.
    pub fn status(&self) -> Option<u16> {
        match self {
            FramingError::HeaderTooLarge { .. } => Some(431),
            FramingError::BodyTooLarge { .. } => Some(413),
            FramingError::RequestLine(_)
            | FramingError::Header(_)
            | FramingError::ContentLength(_) => Some(400),
            FramingError::Upload(e) if e.kind() == io::ErrorKind::InvalidInput => Some(400),
            FramingError::Upload(_) => Some(500),
            FramingError::Incomplete | FramingError::Channel(_) => None,
        }
    }
}

/// Failures creating a listening socket.
#[derive(Error, Debug)]
pub enum ListenError {
    #[error("bind {addr} failed: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("listener on {0} is already running")]
    AlreadyRunning(String),

    #[error("failed to spawn accept thread: {0}")]
    Spawn(io::Error),

    #[error("tcp port {0} is out of range (max {max})", max = u16::MAX)]
    PortOutOfRange(u32),
}

/// Where a recoverable failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Accept,
    Handshake,
    Dial,
    Relay,
    Heartbeat,
    EventPush,
    Framing,
    Upload,
}

/// A recoverable runtime condition, reported through
/// [`crate::observer::Observer::operational_error`] and never thrown across
/// layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationalError {
    pub phase: Phase,
    pub message: String,
    pub port: Option<u32>,
    pub timestamp: String,
}

impl OperationalError {
    pub fn new(phase: Phase, message: impl Into<String>, port: Option<u32>) -> Self {
        OperationalError {
            phase,
            message: message.into(),
            port,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Log and abort. Used when an error proves our own state is corrupt.
pub fn fail_fast(context: &str, err: &ChannelError) -> ! {
    tracing::error!(context, error = %err, "unexpected channel error, aborting");
    eprintln!("guestlink: fatal: {context}: {err}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_failures_are_operational() {
        for code in [libc::ECONNRESET, libc::EPIPE, libc::ENOTCONN, libc::ETIMEDOUT] {
            let err = ChannelError::Syscall { op: "read", code };
            assert_eq!(err.class(), ErrorClass::Operational, "code {code}");
        }
        let eof = ChannelError::PrematureEof {
            expected: 4,
            received: 1,
        };
        assert_eq!(eof.class(), ErrorClass::Operational);
        assert_eq!(ChannelError::TimedOut.class(), ErrorClass::Operational);
    }

    #[test]
    fn test_invariant_failures_are_unexpected() {
        let bad_fd = ChannelError::Syscall {
            op: "read",
            code: libc::EBADF,
        };
        assert_eq!(bad_fd.class(), ErrorClass::Unexpected);
        assert_eq!(ChannelError::Closed.class(), ErrorClass::Unexpected);
    }

    #[test]
    fn test_closed_detection() {
        assert!(ChannelError::Closed.is_closed());
        assert!(ChannelError::Syscall {
            op: "shutdown",
            code: libc::ENOTCONN
        }
        .is_closed());
        assert!(!ChannelError::TimedOut.is_closed());
    }

    #[test]
    fn test_syscall_display_includes_os_message() {
        let err = ChannelError::Syscall {
            op: "write",
            code: libc::EPIPE,
        };
        let text = err.to_string();
        assert!(text.starts_with("write failed: "), "{text}");
    }

    #[test]
    fn test_framing_status_codes() {
        assert_eq!(FramingError::HeaderTooLarge { limit: 1 }.status(), Some(431));
        assert_eq!(FramingError::RequestLine("x".into()).status(), Some(400));
        assert_eq!(FramingError::Incomplete.status(), None);
        let traversal = io::Error::new(io::ErrorKind::InvalidInput, "..");
        assert_eq!(FramingError::Upload(traversal).status(), Some(400));
    }

    #[test]
    fn test_operational_record_serializes_phase() {
        let rec = OperationalError::new(Phase::Dial, "refused", Some(8080));
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"phase\":\"dial\""), "{json}");
        assert!(json.contains("\"port\":8080"));
    }
}
