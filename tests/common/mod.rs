#![allow(dead_code)]

use anyhow::Result;
use parking_lot::Mutex;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use guestlink::channel::{AnyChannel, Channel, Strategy};
use guestlink::error::{OperationalError, Phase};
use guestlink::observer::Observer;

pub const BOTH: [Strategy; 2] = [Strategy::Blocking, Strategy::EventDriven];

/// Two connected channels over a socketpair.
pub fn pair(strategy: Strategy) -> Result<(AnyChannel, AnyChannel)> {
    let (a, b) = UnixStream::pair()?;
    Ok((
        AnyChannel::open(strategy, OwnedFd::from(a))?,
        AnyChannel::open(strategy, OwnedFd::from(b))?,
    ))
}

/// Drain `channel` until EOF.
pub async fn read_to_end<C: Channel>(channel: &C) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = channel.read(16 * 1024).await? {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Observer that remembers every hook call.
#[derive(Default)]
pub struct Recorder {
    pub status: Mutex<Vec<bool>>,
    pub errors: Mutex<Vec<OperationalError>>,
    successes: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.errors.lock().iter().map(|e| e.phase).collect()
    }
}

impl Observer for Recorder {
    fn status_changed(&self, running: bool) {
        self.status.lock().push(running);
    }
    fn operational_error(&self, err: &OperationalError) {
        self.errors.lock().push(err.clone());
    }
    fn connection_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Loopback TCP echo server; returns its port.
pub async fn echo_server() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = sock.shutdown().await;
            });
        }
    });
    Ok(port)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200u32 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
