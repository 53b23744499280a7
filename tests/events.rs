mod common;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use common::{eventually, Recorder};
use guestlink::client::{connect, DialAddr, EventStream};
use guestlink::events::{EventHub, PortEntry, PushEvent};
use guestlink::listener::{ConnectionListener, ListenAddr};

fn start_hub(recorder: Arc<Recorder>) -> Result<(Arc<EventHub>, ConnectionListener, DialAddr)> {
    let hub = Arc::new(EventHub::new(0, recorder.clone()));
    let mut listener = ConnectionListener::bind(ListenAddr::Tcp("127.0.0.1:0".parse()?), 1)?;
    listener.start(&Handle::current(), hub.clone(), recorder)?;
    let addr = DialAddr::Tcp(listener.local_addr().tcp().unwrap());
    Ok((hub, listener, addr))
}

async fn attached(hub: &Arc<EventHub>) -> bool {
    eventually(|| {
        let hub = hub.clone();
        async move { hub.has_subscriber() }
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_without_subscriber_is_dropped() -> Result<()> {
    let recorder = Recorder::new();
    let (hub, _listener, _) = start_hub(recorder.clone())?;
    assert!(!hub.has_subscriber());
    hub.push(&PushEvent::Log {
        message: "nobody home".into(),
    })
    .await;
    assert!(recorder.errors.lock().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_arrive_in_push_order() -> Result<()> {
    let recorder = Recorder::new();
    let (hub, _listener, addr) = start_hub(recorder.clone())?;

    let mut stream = EventStream::new(connect(addr).await?);
    assert!(attached(&hub).await);

    let sent = vec![
        PushEvent::Files {
            files: vec!["a.txt".into(), "b c.txt".into()],
        },
        PushEvent::Log {
            message: "multi\nline".into(),
        },
        PushEvent::Ports {
            ports: vec![PortEntry {
                port: 3000,
                process: "node".into(),
            }],
        },
        PushEvent::App {
            name: "Terminal".into(),
            bundle_id: "com.example.term".into(),
            icon: None,
        },
    ];
    for event in &sent {
        hub.push(event).await;
    }
    for expected in &sent {
        assert_eq!(stream.next_event().await?.as_ref(), Some(expected));
    }
    assert_eq!(recorder.successes(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn newer_subscriber_replaces_older() -> Result<()> {
    let recorder = Recorder::new();
    let (hub, _listener, addr) = start_hub(recorder.clone())?;

    let mut first = EventStream::new(connect(addr).await?);
    assert!(attached(&hub).await);
    let mut second = EventStream::new(connect(addr).await?);

    let evicted = tokio::time::timeout(Duration::from_secs(2), first.next_event()).await??;
    assert_eq!(evicted, None);

    let event = PushEvent::Urls {
        urls: vec!["https://example.com".into()],
    };
    hub.push(&event).await;
    assert_eq!(second.next_event().await?, Some(event));

    drop(second);
    assert!(
        eventually(|| {
            let hub = hub.clone();
            async move { !hub.has_subscriber() }
        })
        .await
    );
    Ok(())
}
