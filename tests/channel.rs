mod common;

use anyhow::Result;
use std::time::Duration;

use common::{pair, read_to_end, BOTH};
use guestlink::channel::{read_line, Channel, Line, Strategy};
use guestlink::ChannelError;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_then_read_exactly() -> Result<()> {
    for strategy in BOTH {
        let (a, b) = pair(strategy)?;
        a.write_all(b"hello world").await?;
        assert_eq!(b.read_exactly(5).await?, b"hello", "{strategy:?}");
        assert_eq!(b.read_exactly(6).await?, b" world", "{strategy:?}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_exactly_reports_short_stream() -> Result<()> {
    for strategy in BOTH {
        let (a, b) = pair(strategy)?;
        a.write_all(b"abc").await?;
        a.shutdown_write()?;
        let err = b.read_exactly(5).await.unwrap_err();
        assert_eq!(
            err,
            ChannelError::PrematureEof {
                expected: 5,
                received: 3
            },
            "{strategy:?}"
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_write_keeps_reads_open() -> Result<()> {
    for strategy in BOTH {
        let (a, b) = pair(strategy)?;
        a.write_all(b"last words").await?;
        a.shutdown_write()?;
        assert_eq!(read_to_end(&b).await?, b"last words");

        b.write_all(b"reply").await?;
        assert_eq!(a.read_exactly(5).await?, b"reply", "{strategy:?}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_is_idempotent_and_final() -> Result<()> {
    for strategy in BOTH {
        let (a, b) = pair(strategy)?;
        a.close();
        a.close();
        assert_eq!(a.read(1).await.unwrap_err(), ChannelError::Closed);
        assert_eq!(a.write_all(b"x").await.unwrap_err(), ChannelError::Closed);
        assert!(a.shutdown_write().unwrap_err().is_closed());
        assert_eq!(b.read(16).await?, None, "{strategy:?}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_wakes_pending_read() -> Result<()> {
    for strategy in BOTH {
        let (a, _b) = pair(strategy)?;
        let a = std::sync::Arc::new(a);
        let reader = {
            let a = std::sync::Arc::clone(&a);
            tokio::spawn(async move { a.read(16).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.close();
        let outcome = tokio::time::timeout(Duration::from_secs(2), reader).await??;
        assert!(
            matches!(outcome, Ok(None) | Err(_)),
            "{strategy:?}: {outcome:?}"
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_blocking_read_releases_socket() -> Result<()> {
    let (a, b) = pair(Strategy::Blocking)?;
    let timed_out = tokio::time::timeout(Duration::from_millis(50), a.read(16)).await;
    assert!(timed_out.is_err());
    // The cancelled read shut the socket down, so the peer sees EOF.
    let eof = tokio::time::timeout(Duration::from_secs(2), b.read(16)).await??;
    assert_eq!(eof, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_read_and_write() -> Result<()> {
    for strategy in BOTH {
        let (a, b) = pair(strategy)?;
        let payload = vec![7u8; 256 * 1024];
        let (written, echoed) = tokio::join!(a.write_all(&payload), b.read_exactly(payload.len()));
        written?;
        assert_eq!(echoed?.len(), payload.len(), "{strategy:?}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_line_stops_at_newline() -> Result<()> {
    for strategy in BOTH {
        let (a, b) = pair(strategy)?;
        a.write_all(b"CONNECT 80\r\nrest").await?;
        assert_eq!(
            read_line(&b, 255).await?,
            Line::Complete("CONNECT 80\r".to_string())
        );
        assert_eq!(b.read_exactly(4).await?, b"rest");

        a.write_all(&[b'x'; 16]).await?;
        assert_eq!(read_line(&b, 8).await?, Line::TooLong, "{strategy:?}");
    }
    Ok(())
}
