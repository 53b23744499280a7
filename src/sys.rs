//! Thin wrappers over the socket syscalls shared by both channel strategies
//! and the accept loop.
//!
//! Every wrapper retries `EINTR` itself, so callers only ever see
//! `WouldBlock` (non-blocking sockets) or a raw OS error code.

use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Outcome of a failed syscall. `Interrupted` is retried inside this module
/// and is only kept as a variant so the translation stays explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SysError {
    Interrupted,
    WouldBlock,
    Failed(i32),
}

impl SysError {
    fn last() -> Self {
        let code = io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        Self::from_code(code)
    }

    pub(crate) fn from_code(code: i32) -> Self {
        if code == libc::EINTR {
            SysError::Interrupted
        } else if code == libc::EAGAIN || code == libc::EWOULDBLOCK {
            SysError::WouldBlock
        } else {
            SysError::Failed(code)
        }
    }

    /// OS error code, with the internal variants mapped back to theirs.
    pub(crate) fn code(self) -> i32 {
        match self {
            SysError::Interrupted => libc::EINTR,
            SysError::WouldBlock => libc::EAGAIN,
            SysError::Failed(code) => code,
        }
    }
}

pub(crate) type SysResult<T> = Result<T, SysError>;

// Linux reports EPIPE instead of raising SIGPIPE only when asked per call.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Single `read(2)`. `Ok(0)` is end-of-stream.
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> SysResult<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match SysError::last() {
            SysError::Interrupted => continue,
            other => return Err(other),
        }
    }
}

/// Single `send(2)` without SIGPIPE.
pub(crate) fn send(fd: RawFd, buf: &[u8]) -> SysResult<usize> {
    loop {
        let n = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                SEND_FLAGS,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        match SysError::last() {
            SysError::Interrupted => continue,
            other => return Err(other),
        }
    }
}

/// Blocking loop until every byte of `buf` is handed to the kernel.
pub(crate) fn send_all(fd: RawFd, mut buf: &[u8]) -> SysResult<()> {
    while !buf.is_empty() {
        let n = send(fd, buf)?;
        if n == 0 {
            return Err(SysError::Failed(libc::EPIPE));
        }
        buf = &buf[n..];
    }
    Ok(())
}

pub(crate) fn shutdown(fd: RawFd, how: Shutdown) -> SysResult<()> {
    let how = match how {
        Shutdown::Read => libc::SHUT_RD,
        Shutdown::Write => libc::SHUT_WR,
        Shutdown::Both => libc::SHUT_RDWR,
    };
    if unsafe { libc::shutdown(fd, how) } == 0 {
        Ok(())
    } else {
        Err(SysError::last())
    }
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> SysResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(SysError::last());
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(SysError::last());
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> SysResult<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(SysError::last());
    }
    Ok(())
}

/// Stops the socket from raising SIGPIPE where `MSG_NOSIGNAL` is unavailable.
pub(crate) fn suppress_sigpipe(_fd: RawFd) -> SysResult<()> {
    #[cfg(target_vendor = "apple")]
    {
        let one: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                _fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(SysError::last());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// `AF_VSOCK` is 40 on both Linux and Darwin.
pub(crate) const AF_VSOCK: libc::c_int = 40;
pub(crate) const VMADDR_CID_ANY: u32 = u32::MAX;

#[cfg(not(target_vendor = "apple"))]
#[repr(C)]
struct SockaddrVm {
    svm_family: libc::sa_family_t,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_zero: [u8; 4],
}

#[cfg(target_vendor = "apple")]
#[repr(C)]
struct SockaddrVm {
    svm_len: u8,
    svm_family: libc::sa_family_t,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
}

/// Raw socket address, ready for `bind(2)`/`connect(2)`.
pub(crate) struct RawAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
    family: libc::c_int,
}

impl RawAddr {
    pub(crate) fn vsock(cid: u32, port: u32) -> Self {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let addr = &mut storage as *mut libc::sockaddr_storage as *mut SockaddrVm;
        unsafe {
            #[cfg(target_vendor = "apple")]
            {
                (*addr).svm_len = mem::size_of::<SockaddrVm>() as u8;
            }
            (*addr).svm_family = AF_VSOCK as libc::sa_family_t;
            (*addr).svm_port = port;
            (*addr).svm_cid = cid;
        }
        RawAddr {
            storage,
            len: mem::size_of::<SockaddrVm>() as libc::socklen_t,
            family: AF_VSOCK,
        }
    }

    pub(crate) fn inet(addr: &SocketAddr) -> Self {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        match addr {
            SocketAddr::V4(v4) => {
                let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
                unsafe {
                    #[cfg(target_vendor = "apple")]
                    {
                        (*sin).sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
                    }
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = v4.port().to_be();
                    (*sin).sin_addr = libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    };
                }
                RawAddr {
                    storage,
                    len: mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    family: libc::AF_INET,
                }
            }
            SocketAddr::V6(v6) => {
                let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
                unsafe {
                    #[cfg(target_vendor = "apple")]
                    {
                        (*sin6).sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
                    }
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = v6.port().to_be();
                    (*sin6).sin6_flowinfo = v6.flowinfo();
                    (*sin6).sin6_addr = libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    };
                    (*sin6).sin6_scope_id = v6.scope_id();
                }
                RawAddr {
                    storage,
                    len: mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    family: libc::AF_INET6,
                }
            }
        }
    }

    fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const libc::sockaddr_storage as *const libc::sockaddr
    }
}

fn new_stream_socket(family: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    set_cloexec(owned.as_raw_fd()).map_err(|e| io::Error::from_raw_os_error(e.code()))?;
    Ok(owned)
}

/// socket + SO_REUSEADDR + bind + listen.
pub(crate) fn bind_listener(addr: &RawAddr, backlog: i32) -> io::Result<OwnedFd> {
    let fd = new_stream_socket(addr.family)?;
    let one: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::bind(fd.as_raw_fd(), addr.as_ptr(), addr.len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::listen(fd.as_raw_fd(), backlog) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// `SO_RCVTIMEO`: also bounds a blocking `accept(2)`, which then fails with
/// `WouldBlock`. Shutting down a listening vsock socket does not wake a
/// parked accept, so the accept loop relies on this to notice a stop.
/// Zero means wait forever.
pub(crate) fn set_recv_timeout(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Port the kernel actually bound (resolves port 0 for TCP).
pub(crate) fn local_port(fd: RawFd) -> io::Result<u32> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    let family = storage.ss_family as libc::c_int;
    let port = unsafe {
        if family == libc::AF_INET {
            let sin = &*(&storage as *const libc::sockaddr_storage as *const libc::sockaddr_in);
            u16::from_be(sin.sin_port) as u32
        } else if family == libc::AF_INET6 {
            let sin6 = &*(&storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6);
            u16::from_be(sin6.sin6_port) as u32
        } else if family == AF_VSOCK {
            let svm = &*(&storage as *const libc::sockaddr_storage as *const SockaddrVm);
            svm.svm_port
        } else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unexpected socket family {family}"),
            ));
        }
    };
    Ok(port)
}

/// Blocking `accept(2)`, retrying `EINTR`.
pub(crate) fn accept(listener: RawFd) -> SysResult<OwnedFd> {
    loop {
        let fd = unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd >= 0 {
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            set_cloexec(owned.as_raw_fd())?;
            // Accepted TCP sockets inherit the listener's timeout.
            set_recv_timeout(owned.as_raw_fd(), Duration::ZERO)
                .map_err(|e| SysError::from_code(e.raw_os_error().unwrap_or(libc::EIO)))?;
            return Ok(owned);
        }
        match SysError::last() {
            SysError::Interrupted => continue,
            other => return Err(other),
        }
    }
}

/// Blocking `connect(2)` to a vsock address. Run off the async workers.
pub(crate) fn connect_vsock(cid: u32, port: u32) -> io::Result<OwnedFd> {
    let addr = RawAddr::vsock(cid, port);
    let fd = new_stream_socket(addr.family)?;
    loop {
        if unsafe { libc::connect(fd.as_raw_fd(), addr.as_ptr(), addr.len) } == 0 {
            return Ok(fd);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EALREADY) => std::thread::yield_now(),
            // An interrupted connect finished in the background.
            Some(libc::EISCONN) => return Ok(fd),
            _ => return Err(err),
        }
    }
}
