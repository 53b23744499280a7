//! Generic bind/listen/accept loop.
//!
//! The accept loop runs on its own OS thread doing a blocking `accept(2)`
//! (vsock listeners never become readable through the reactor on some
//! hosts, and blocking accept is harmless for TCP). Every accepted
//! connection is wrapped in the channel type its transport needs and handed
//! to the handler as an independent tokio task.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::channel::{AnyChannel, Strategy};
use crate::error::{ChannelError, ListenError, OperationalError, Phase};
use crate::observer::Observer;
use crate::protocol::timeouts::{ACCEPT_BACKOFF_MS, ACCEPT_WAKE_MS};
use crate::sys::{self, SysError};

/// Socket family a service is exposed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Vsock,
    Tcp,
}

impl Transport {
    /// The one place a transport picks its channel strategy.
    pub fn strategy(self) -> Strategy {
        match self {
            Transport::Vsock => Strategy::Blocking,
            Transport::Tcp => Strategy::EventDriven,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenAddr {
    /// Any CID, given port.
    Vsock { port: u32 },
    Tcp(SocketAddr),
}

impl ListenAddr {
    pub fn transport(&self) -> Transport {
        match self {
            ListenAddr::Vsock { .. } => Transport::Vsock,
            ListenAddr::Tcp(_) => Transport::Tcp,
        }
    }

    pub fn port(&self) -> u32 {
        match self {
            ListenAddr::Vsock { port } => *port,
            ListenAddr::Tcp(addr) => addr.port() as u32,
        }
    }

    /// TCP address, for services exposed on loopback.
    pub fn tcp(&self) -> Option<SocketAddr> {
        match self {
            ListenAddr::Tcp(addr) => Some(*addr),
            ListenAddr::Vsock { .. } => None,
        }
    }

    fn raw(&self) -> sys::RawAddr {
        match self {
            ListenAddr::Vsock { port } => sys::RawAddr::vsock(sys::VMADDR_CID_ANY, *port),
            ListenAddr::Tcp(addr) => sys::RawAddr::inet(addr),
        }
    }

    fn with_port(&self, port: u32) -> io::Result<ListenAddr> {
        match self {
            ListenAddr::Vsock { .. } => Ok(ListenAddr::Vsock { port }),
            ListenAddr::Tcp(addr) => {
                let port = u16::try_from(port)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "inet port out of range"))?;
                let mut addr = *addr;
                addr.set_port(port);
                Ok(ListenAddr::Tcp(addr))
            }
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Vsock { port } => write!(f, "vsock://*:{port}"),
            ListenAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Drives one accepted connection to completion.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn serve(self: Arc<Self>, channel: AnyChannel) -> impl Future<Output = ()> + Send;
}

struct ListenerState {
    socket: Option<Arc<OwnedFd>>,
    stopped: bool,
}

pub struct ConnectionListener {
    addr: ListenAddr,
    state: Arc<Mutex<ListenerState>>,
    thread: Option<thread::JoinHandle<()>>,
    backoff: Duration,
}

impl ConnectionListener {
    /// Create, bind and listen. A TCP port of 0 binds an ephemeral port;
    /// [`local_addr`](Self::local_addr) reports the real one.
    pub fn bind(addr: ListenAddr, backlog: i32) -> Result<Self, ListenError> {
        let bind_err = |source| ListenError::Bind {
            addr: addr.to_string(),
            source,
        };
        let socket = sys::bind_listener(&addr.raw(), backlog).map_err(bind_err)?;
        sys::set_recv_timeout(socket.as_raw_fd(), Duration::from_millis(ACCEPT_WAKE_MS))
            .map_err(bind_err)?;
        let port = sys::local_port(socket.as_raw_fd()).map_err(bind_err)?;
        let addr = addr.with_port(port).map_err(bind_err)?;
        tracing::debug!(%addr, backlog, "listening");
        Ok(ConnectionListener {
            addr,
            state: Arc::new(Mutex::new(ListenerState {
                socket: Some(Arc::new(socket)),
                stopped: false,
            })),
            thread: None,
            backoff: Duration::from_millis(ACCEPT_BACKOFF_MS),
        })
    }

    /// Pause after a failed accept (fixed, not exponential).
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn local_addr(&self) -> ListenAddr {
        self.addr
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some() && !self.state.lock().stopped
    }

    /// Start the accept thread. Handlers run as tasks on `runtime`.
    pub fn start<H: ConnectionHandler>(
        &mut self,
        runtime: &Handle,
        handler: Arc<H>,
        observer: Arc<dyn Observer>,
    ) -> Result<(), ListenError> {
        if self.thread.is_some() {
            return Err(ListenError::AlreadyRunning(self.addr.to_string()));
        }
        let socket = {
            let st = self.state.lock();
            match (&st.socket, st.stopped) {
                (Some(socket), false) => Arc::clone(socket),
                _ => {
                    return Err(ListenError::Spawn(std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        "listener already stopped",
                    )))
                }
            }
        };
        let accept = AcceptLoop {
            addr: self.addr,
            socket,
            state: Arc::clone(&self.state),
            runtime: runtime.clone(),
            handler,
            observer,
            backoff: self.backoff,
        };
        let thread = thread::Builder::new()
            .name(format!("guestlink-accept-{}", self.addr.port()))
            .spawn(move || accept.run())
            .map_err(ListenError::Spawn)?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Stop accepting and close the listening socket. Connections already
    /// handed to handlers are unaffected. Idempotent.
    ///
    /// Blocks while the accept thread is joined. TCP returns at once; a
    /// vsock listener can take up to `ACCEPT_WAKE_MS` to notice. Async
    /// callers should go through `spawn_blocking` or `block_in_place`.
    pub fn stop(&mut self) {
        let socket = {
            let mut st = self.state.lock();
            st.stopped = true;
            st.socket.take()
        };
        if let Some(socket) = &socket {
            // Wakes a blocked TCP accept(2) at once. Vsock ignores this and
            // the loop notices `stopped` at the next accept timeout.
            let _ = sys::shutdown(socket.as_raw_fd(), Shutdown::Both);
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            if let ListenAddr::Tcp(addr) = self.addr {
                let _ = std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200));
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            tracing::debug!(addr = %self.addr, "listener stopped");
        }
        drop(socket);
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        self.stop();
    }
}

struct AcceptLoop<H> {
    addr: ListenAddr,
    socket: Arc<OwnedFd>,
    state: Arc<Mutex<ListenerState>>,
    runtime: Handle,
    handler: Arc<H>,
    observer: Arc<dyn Observer>,
    backoff: Duration,
}

impl<H: ConnectionHandler> AcceptLoop<H> {
    fn run(self) {
        let strategy = self.addr.transport().strategy();
        loop {
            let accepted = sys::accept(self.socket.as_raw_fd());
            if self.state.lock().stopped {
                break;
            }
            match accepted {
                Ok(conn) => self.dispatch(strategy, conn),
                Err(SysError::WouldBlock) => continue,
                Err(e) => {
                    let err = ChannelError::from_sys("accept", e);
                    tracing::warn!(addr = %self.addr, error = %err, "accept failed, backing off");
                    self.observer.operational_error(&OperationalError::new(
                        Phase::Accept,
                        err.to_string(),
                        Some(self.addr.port()),
                    ));
                    thread::sleep(self.backoff);
                }
            }
        }
        tracing::debug!(addr = %self.addr, "accept loop exited");
    }

    fn dispatch(&self, strategy: Strategy, conn: OwnedFd) {
        let handler = Arc::clone(&self.handler);
        let observer = Arc::clone(&self.observer);
        let port = self.addr.port();
        self.runtime.spawn(async move {
            match AnyChannel::open(strategy, conn) {
                Ok(channel) => handler.serve(channel).await,
                Err(e) => {
                    tracing::warn!(port, error = %e, "could not wrap accepted connection");
                    observer.operational_error(&OperationalError::new(
                        Phase::Accept,
                        e.to_string(),
                        Some(port),
                    ));
                }
            }
        });
    }
}
