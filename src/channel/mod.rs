//! The byte-stream contract every protocol handler drives.
//!
//! Two strategies implement it: [`BlockingChannel`] parks blocking syscalls on
//! dedicated worker threads (for transports whose readiness notification
//! does not fire, i.e. vsock), and [`EventDrivenChannel`] uses non-blocking
//! sockets registered with the tokio reactor. Call sites hold an
//! [`AnyChannel`] and never branch on the strategy themselves.

mod blocking;
mod event;

pub use blocking::BlockingChannel;
pub use event::EventDrivenChannel;

use std::future::Future;
use std::os::fd::OwnedFd;

use crate::error::ChannelError;

/// An owned, full-duplex connection.
///
/// At most one read and one write are in flight at any time; concurrent
/// callers of the same direction are queued. A read and a write may run
/// concurrently, which is what [`crate::relay::relay`] relies on.
pub trait Channel: Send + Sync {
    /// Read up to `max_bytes`. `Ok(None)` is end-of-stream; a live channel
    /// never yields an empty chunk.
    ///
    /// Panics if `max_bytes` is zero.
    fn read(
        &self,
        max_bytes: usize,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, ChannelError>> + Send;

    /// Read exactly `n` bytes or fail with [`ChannelError::PrematureEof`].
    ///
    /// Panics if `n` is zero.
    fn read_exactly(&self, n: usize) -> impl Future<Output = Result<Vec<u8>, ChannelError>> + Send {
        async move {
            assert!(n > 0, "read_exactly requires a positive length");
            let mut out = Vec::with_capacity(n);
            while out.len() < n {
                match self.read(n - out.len()).await? {
                    Some(chunk) => out.extend_from_slice(&chunk),
                    None => {
                        return Err(ChannelError::PrematureEof {
                            expected: n,
                            received: out.len(),
                        })
                    }
                }
            }
            Ok(out)
        }
    }

    /// Completes once every byte has been handed to the kernel.
    fn write_all(&self, data: &[u8]) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Half-close: no more writes, reads stay open.
    fn shutdown_write(&self) -> Result<(), ChannelError>;

    /// Idempotent. Wakes any in-flight operation; the descriptor itself is
    /// released once the last in-flight operation has returned.
    fn close(&self);
}

/// Which I/O strategy a transport needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Blocking,
    EventDriven,
}

/// The channel type handed to connection handlers.
pub enum AnyChannel {
    Blocking(BlockingChannel),
    EventDriven(EventDrivenChannel),
}

impl AnyChannel {
    /// Wrap a connected socket. `EventDriven` must be called from inside a
    /// tokio runtime.
    pub fn open(strategy: Strategy, fd: OwnedFd) -> Result<Self, ChannelError> {
        Ok(match strategy {
            Strategy::Blocking => AnyChannel::Blocking(BlockingChannel::new(fd)?),
            Strategy::EventDriven => AnyChannel::EventDriven(EventDrivenChannel::new(fd)?),
        })
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            AnyChannel::Blocking(_) => Strategy::Blocking,
            AnyChannel::EventDriven(_) => Strategy::EventDriven,
        }
    }
}

impl Channel for AnyChannel {
    async fn read(&self, max_bytes: usize) -> Result<Option<Vec<u8>>, ChannelError> {
        match self {
            AnyChannel::Blocking(c) => c.read(max_bytes).await,
            AnyChannel::EventDriven(c) => c.read(max_bytes).await,
        }
    }

    async fn write_all(&self, data: &[u8]) -> Result<(), ChannelError> {
        match self {
            AnyChannel::Blocking(c) => c.write_all(data).await,
            AnyChannel::EventDriven(c) => c.write_all(data).await,
        }
    }

    fn shutdown_write(&self) -> Result<(), ChannelError> {
        match self {
            AnyChannel::Blocking(c) => c.shutdown_write(),
            AnyChannel::EventDriven(c) => c.shutdown_write(),
        }
    }

    fn close(&self) {
        match self {
            AnyChannel::Blocking(c) => c.close(),
            AnyChannel::EventDriven(c) => c.close(),
        }
    }
}

/// Result of [`read_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Line without its `\n` (a trailing `\r` is kept; callers trim).
    Complete(String),
    /// `max_len` bytes arrived without a newline.
    TooLong,
}

/// Read one `\n`-terminated line a byte at a time, so nothing past the
/// newline is consumed. EOF before the newline is a premature EOF.
pub async fn read_line<C: Channel + ?Sized>(channel: &C, max_len: usize) -> Result<Line, ChannelError> {
    let mut line = Vec::with_capacity(64);
    loop {
        if line.len() >= max_len {
            return Ok(Line::TooLong);
        }
        match channel.read(1).await? {
            Some(byte) if byte[0] == b'\n' => {
                return Ok(Line::Complete(String::from_utf8_lossy(&line).into_owned()))
            }
            Some(byte) => line.push(byte[0]),
            None => {
                return Err(ChannelError::PrematureEof {
                    expected: line.len() + 1,
                    received: line.len(),
                })
            }
        }
    }
}
