//! Channel backed by blocking syscalls on dedicated worker threads.
//!
//! Used for vsock, where the readiness notification never fires on some
//! hosts. Each channel owns one read worker and one write worker for its
//! whole life. An operation is queued to the worker for its direction,
//! which runs the blocking syscall and hands the result back over a
//! oneshot; the async caller just awaits the rendezvous.
//!
//! Cancelling (dropping) an in-flight operation cannot stop the worker, so
//! it shuts the socket down in both directions instead. That makes the
//! blocked syscall return. Each worker holds its own clone of the
//! descriptor, so the fd is never closed while a syscall can still
//! reference it.

use parking_lot::Mutex;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{mpsc, Arc};
use std::thread;
use tokio::sync::oneshot;

use super::Channel;
use crate::error::ChannelError;
use crate::sys;

type Job = Box<dyn FnOnce(&OwnedFd) + Send>;

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

/// Live descriptor plus the queues feeding its two workers. Dropping the
/// senders lets the workers drain and exit.
struct Workers {
    fd: Arc<OwnedFd>,
    reader: mpsc::Sender<Job>,
    writer: mpsc::Sender<Job>,
}

pub struct BlockingChannel {
    state: Mutex<Option<Workers>>,
    reader: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<()>,
}

/// Shuts the socket down if the awaiting future is dropped before the
/// worker reports back.
struct InFlight {
    fd: Option<Arc<OwnedFd>>,
}

impl InFlight {
    fn finish(mut self) {
        self.fd = None;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            tracing::debug!(fd = fd.as_raw_fd(), "blocking op cancelled, shutting socket down");
            let _ = sys::shutdown(fd.as_raw_fd(), Shutdown::Both);
        }
    }
}

fn spawn_worker(name: &str, fd: Arc<OwnedFd>) -> std::io::Result<mpsc::Sender<Job>> {
    let (tx, rx) = mpsc::channel::<Job>();
    thread::Builder::new()
        .name(format!("guestlink-{name}"))
        .spawn(move || {
            while let Ok(job) = rx.recv() {
                job(&fd);
            }
        })?;
    Ok(tx)
}

impl BlockingChannel {
    pub fn new(fd: OwnedFd) -> Result<Self, ChannelError> {
        sys::set_nonblocking(fd.as_raw_fd(), false)
            .map_err(|e| ChannelError::from_sys("fcntl", e))?;
        sys::suppress_sigpipe(fd.as_raw_fd()).map_err(|e| ChannelError::from_sys("setsockopt", e))?;
        let fd = Arc::new(fd);
        let reader = spawn_worker("read", Arc::clone(&fd))
            .map_err(|e| ChannelError::from_io("spawn", &e))?;
        // On failure here the read queue drops and its worker exits.
        let writer = spawn_worker("write", Arc::clone(&fd))
            .map_err(|e| ChannelError::from_io("spawn", &e))?;
        Ok(BlockingChannel {
            state: Mutex::new(Some(Workers { fd, reader, writer })),
            reader: tokio::sync::Mutex::new(()),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    fn current_fd(&self) -> Result<Arc<OwnedFd>, ChannelError> {
        self.state
            .lock()
            .as_ref()
            .map(|w| Arc::clone(&w.fd))
            .ok_or(ChannelError::Closed)
    }

    async fn on_worker<T, F>(&self, direction: Direction, op: F) -> Result<T, ChannelError>
    where
        T: Send + 'static,
        F: FnOnce(&OwnedFd) -> Result<T, ChannelError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |fd| {
            let _ = tx.send(op(fd));
        });
        let fd = {
            let state = self.state.lock();
            let workers = state.as_ref().ok_or(ChannelError::Closed)?;
            let queue = match direction {
                Direction::Read => &workers.reader,
                Direction::Write => &workers.writer,
            };
            queue.send(job).map_err(|_| ChannelError::Closed)?;
            Arc::clone(&workers.fd)
        };

        let guard = InFlight { fd: Some(fd) };
        // A dropped sender means the worker panicked mid-syscall.
        let result = rx.await.unwrap_or(Err(ChannelError::Cancelled));
        guard.finish();
        result
    }
}

impl Channel for BlockingChannel {
    async fn read(&self, max_bytes: usize) -> Result<Option<Vec<u8>>, ChannelError> {
        assert!(max_bytes > 0, "read requires a positive max_bytes");
        let _turn = self.reader.lock().await;
        self.on_worker(Direction::Read, move |fd| {
            let mut buf = vec![0u8; max_bytes];
            match sys::read(fd.as_raw_fd(), &mut buf) {
                Ok(0) => Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(Some(buf))
                }
                Err(e) => Err(ChannelError::from_sys("read", e)),
            }
        })
        .await
    }

    async fn write_all(&self, data: &[u8]) -> Result<(), ChannelError> {
        if data.is_empty() {
            return Ok(());
        }
        let _turn = self.writer.lock().await;
        let owned = data.to_vec();
        self.on_worker(Direction::Write, move |fd| {
            sys::send_all(fd.as_raw_fd(), &owned).map_err(|e| ChannelError::from_sys("write", e))
        })
        .await
    }

    fn shutdown_write(&self) -> Result<(), ChannelError> {
        let fd = self.current_fd()?;
        sys::shutdown(fd.as_raw_fd(), Shutdown::Write)
            .map_err(|e| ChannelError::from_sys("shutdown", e))
    }

    fn close(&self) {
        let workers = self.state.lock().take();
        if let Some(workers) = workers {
            // Wake any worker still parked in a syscall. Dropping the queues
            // then lets both workers exit, and the last clone closes the fd.
            let _ = sys::shutdown(workers.fd.as_raw_fd(), Shutdown::Both);
        }
    }
}

impl Drop for BlockingChannel {
    fn drop(&mut self) {
        self.close();
    }
}
