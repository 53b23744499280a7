mod common;

use anyhow::Result;

use common::{pair, read_to_end, BOTH};
use guestlink::channel::Channel;
use guestlink::relay::relay;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_forwards_until_both_sides_close() -> Result<()> {
    for strategy in BOTH {
        // client <-> (a | b) <-> service
        let (client, a) = pair(strategy)?;
        let (b, service) = pair(strategy)?;

        let bridge = tokio::spawn(async move { relay(&a, &b).await });

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await?;
        client.shutdown_write()?;

        let received = read_to_end(&service).await?;
        assert_eq!(received, payload, "{strategy:?}");

        service.write_all(b"done").await?;
        service.shutdown_write()?;
        assert_eq!(read_to_end(&client).await?, b"done");

        let stats = bridge.await??;
        assert_eq!(stats.a_to_b, 10_000);
        assert_eq!(stats.b_to_a, 4);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_handles_early_half_close() -> Result<()> {
    for strategy in BOTH {
        let (client, a) = pair(strategy)?;
        let (b, service) = pair(strategy)?;
        let bridge = tokio::spawn(async move { relay(&a, &b).await });

        // Service finishes first; the client can keep sending afterwards.
        service.write_all(b"banner\n").await?;
        service.shutdown_write()?;
        assert_eq!(read_to_end(&client).await?, b"banner\n");

        client.write_all(b"late").await?;
        client.shutdown_write()?;
        assert_eq!(read_to_end(&service).await?, b"late", "{strategy:?}");

        bridge.await??;
    }
    Ok(())
}
