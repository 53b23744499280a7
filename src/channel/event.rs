//! Channel over a non-blocking socket registered with the tokio reactor.
//!
//! Same approach as wrapping a raw vsock fd in `AsyncFd`: try the syscall,
//! and only on `WouldBlock` wait for readiness, then loop. The descriptor is
//! looked up under the lock before every attempt so a concurrent `close`
//! is noticed instead of racing the syscall.

use parking_lot::Mutex;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;

use super::Channel;
use crate::error::ChannelError;
use crate::sys::{self, SysError};

pub struct EventDrivenChannel {
    fd: Mutex<Option<Arc<AsyncFd<OwnedFd>>>>,
    reader: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<()>,
}

impl EventDrivenChannel {
    /// Must be called from inside a tokio runtime.
    pub fn new(fd: OwnedFd) -> Result<Self, ChannelError> {
        sys::set_nonblocking(fd.as_raw_fd(), true)
            .map_err(|e| ChannelError::from_sys("fcntl", e))?;
        sys::suppress_sigpipe(fd.as_raw_fd()).map_err(|e| ChannelError::from_sys("setsockopt", e))?;
        // SAFETY: the AsyncFd takes ownership of the OwnedFd, so the
        // descriptor stays open and unchanged until the AsyncFd drops.
        let registered = unsafe { AsyncFd::register(fd) }.map_err(|e| {
            let (_, err) = e.into_parts();
            ChannelError::from_io("register", &err)
        })?;
        Ok(EventDrivenChannel {
            fd: Mutex::new(Some(Arc::new(registered))),
            reader: tokio::sync::Mutex::new(()),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    fn current_fd(&self) -> Result<Arc<AsyncFd<OwnedFd>>, ChannelError> {
        self.fd.lock().clone().ok_or(ChannelError::Closed)
    }
}

impl Channel for EventDrivenChannel {
    async fn read(&self, max_bytes: usize) -> Result<Option<Vec<u8>>, ChannelError> {
        assert!(max_bytes > 0, "read requires a positive max_bytes");
        let _turn = self.reader.lock().await;
        let mut buf = vec![0u8; max_bytes];
        loop {
            let fd = self.current_fd()?;
            match sys::read(fd.get_ref().as_raw_fd(), &mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some(buf));
                }
                Err(SysError::WouldBlock) => {
                    let mut ready = fd
                        .readable()
                        .await
                        .map_err(|e| ChannelError::from_io("poll", &e))?;
                    ready.clear_ready();
                }
                Err(e) => return Err(ChannelError::from_sys("read", e)),
            }
        }
    }

    async fn write_all(&self, data: &[u8]) -> Result<(), ChannelError> {
        let _turn = self.writer.lock().await;
        let mut written = 0;
        while written < data.len() {
            let fd = self.current_fd()?;
            match sys::send(fd.get_ref().as_raw_fd(), &data[written..]) {
                Ok(0) => {
                    return Err(ChannelError::Syscall {
                        op: "write",
                        code: libc::EPIPE,
                    })
                }
                Ok(n) => written += n,
                Err(SysError::WouldBlock) => {
                    let mut ready = fd
                        .writable()
                        .await
                        .map_err(|e| ChannelError::from_io("poll", &e))?;
                    ready.clear_ready();
                }
                Err(e) => return Err(ChannelError::from_sys("write", e)),
            }
        }
        Ok(())
    }

    fn shutdown_write(&self) -> Result<(), ChannelError> {
        let fd = self.current_fd()?;
        sys::shutdown(fd.get_ref().as_raw_fd(), Shutdown::Write)
            .map_err(|e| ChannelError::from_sys("shutdown", e))
    }

    fn close(&self) {
        let fd = self.fd.lock().take();
        if let Some(fd) = fd {
            // Pending readiness waits hold their own Arc and wake on the
            // shutdown; the fd is deregistered and closed with the last one.
            let _ = sys::shutdown(fd.get_ref().as_raw_fd(), Shutdown::Both);
        }
    }
}

impl Drop for EventDrivenChannel {
    fn drop(&mut self) {
        self.close();
    }
}
