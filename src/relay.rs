//! Bidirectional byte copy between two channels.

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::protocol::RELAY_CHUNK;

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copy `a → b` and `b → a` concurrently until both directions reach
/// end-of-stream. Each direction half-closes its destination on EOF.
///
/// The first direction to fail cancels the other and its error is returned.
pub async fn relay<A, B>(a: &A, b: &B) -> Result<RelayStats, ChannelError>
where
    A: Channel + ?Sized,
    B: Channel + ?Sized,
{
    let (a_to_b, b_to_a) = tokio::try_join!(pump(a, b), pump(b, a))?;
    Ok(RelayStats { a_to_b, b_to_a })
}

async fn pump<S, D>(src: &S, dst: &D) -> Result<u64, ChannelError>
where
    S: Channel + ?Sized,
    D: Channel + ?Sized,
{
    let mut total = 0u64;
    while let Some(chunk) = src.read(RELAY_CHUNK).await? {
        dst.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    match dst.shutdown_write() {
        Ok(()) => {}
        // The peer may already have torn its side down.
        Err(e) if e.is_closed() => tracing::trace!(error = %e, "half-close on closed channel"),
        Err(e) => return Err(e),
    }
    Ok(total)
}
