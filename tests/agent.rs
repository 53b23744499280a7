mod common;

use anyhow::Result;
use std::sync::Arc;
use tokio::runtime::Handle;

use common::{eventually, Recorder};
use guestlink::client::{connect, read_heartbeat, DialAddr, EventStream};
use guestlink::config::{Ports, TransportKind};
use guestlink::events::PushEvent;
use guestlink::http::{NoUploads, StatusRouter};
use guestlink::error::ListenError;
use guestlink::{Agent, Config, Service};

fn tcp_config() -> Config {
    Config {
        version: "0.0.7".into(),
        transport: TransportKind::Tcp,
        ports: Ports {
            tunnel: 0,
            heartbeat: 0,
            events: 0,
            http: 0,
        },
        ..Config::default()
    }
}

fn dial(agent: &Agent<StatusRouter>, service: Service) -> Result<DialAddr> {
    let addr = agent
        .local_addr(service)
        .and_then(|a| a.tcp())
        .ok_or_else(|| anyhow::anyhow!("{service:?} not listening"))?;
    Ok(DialAddr::Tcp(addr))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_runs_all_services() -> Result<()> {
    let recorder = Recorder::new();
    let mut agent = Agent::new(
        tcp_config(),
        Arc::new(StatusRouter::new("0.0.7")),
        Arc::new(NoUploads),
        recorder.clone(),
    );
    agent.start(&Handle::current())?;
    assert!(agent.is_running());
    assert_eq!(*recorder.status.lock(), vec![true]);

    let bound = agent.local_addrs();
    assert_eq!(
        bound.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
        Service::ALL.to_vec()
    );
    assert!(bound.iter().all(|(_, addr)| addr.port() != 0));

    let heartbeat = connect(dial(&agent, Service::Heartbeat)?).await?;
    assert_eq!(read_heartbeat(&heartbeat).await?.version, "0.0.7");

    let mut events = EventStream::new(connect(dial(&agent, Service::Events)?).await?);
    let hub = agent.events();
    assert!(
        eventually(|| {
            let hub = hub.clone();
            async move { hub.has_subscriber() }
        })
        .await
    );
    let event = PushEvent::Log {
        message: "booted".into(),
    };
    hub.push(&event).await;
    assert_eq!(events.next_event().await?, Some(event));

    tokio::task::block_in_place(|| {
        agent.stop();
        agent.stop();
    });
    assert!(!agent.is_running());
    assert_eq!(*recorder.status.lock(), vec![true, false]);

    // Stopping releases the long-lived peers.
    assert_eq!(events.next_event().await?, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_start_failure_rolls_back() -> Result<()> {
    let taken = std::net::TcpListener::bind("127.0.0.1:0")?;
    let mut config = tcp_config();
    config.ports.http = u32::from(taken.local_addr()?.port());

    let recorder = Recorder::new();
    let mut agent = Agent::new(
        config,
        Arc::new(StatusRouter::default()),
        Arc::new(NoUploads),
        recorder.clone(),
    );
    assert!(agent.start(&Handle::current()).is_err());
    assert!(!agent.is_running());
    assert!(agent.local_addr(Service::Tunnel).is_none());
    assert!(recorder.status.lock().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_refuses_tcp_port_above_u16() -> Result<()> {
    let mut config = tcp_config();
    config.ports.events = 65_536 + 4_464;

    let recorder = Recorder::new();
    let mut agent = Agent::new(
        config,
        Arc::new(StatusRouter::default()),
        Arc::new(NoUploads),
        recorder.clone(),
    );
    match agent.start(&Handle::current()) {
        Err(ListenError::PortOutOfRange(port)) => assert_eq!(port, 70_000),
        other => anyhow::bail!("expected an out-of-range port, got {other:?}"),
    }
    assert!(!agent.is_running());
    assert!(agent.local_addr(Service::Tunnel).is_none());
    Ok(())
}
