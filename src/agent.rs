//! Service lifecycle: binds and runs the four guest services.

use std::sync::Arc;
use tokio::runtime::Handle;

use crate::config::{Config, Service};
use crate::error::ListenError;
use crate::events::EventHub;
use crate::heartbeat::HeartbeatHandler;
use crate::http::{RequestServer, Router, UploadStore};
use crate::listener::{ConnectionHandler, ConnectionListener, ListenAddr};
use crate::observer::Observer;
use crate::protocol::backlog;
use crate::tunnel::TunnelHandler;

pub struct Agent<R> {
    config: Config,
    router: Arc<R>,
    store: Arc<dyn UploadStore>,
    observer: Arc<dyn Observer>,
    events: Arc<EventHub>,
    heartbeat: Arc<HeartbeatHandler>,
    listeners: Vec<(Service, ConnectionListener)>,
}

impl<R: Router> Agent<R> {
    pub fn new(
        config: Config,
        router: Arc<R>,
        store: Arc<dyn UploadStore>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let events = Arc::new(EventHub::new(config.ports.events, Arc::clone(&observer)));
        let heartbeat = Arc::new(HeartbeatHandler::new(
            &config.version,
            config.ports.heartbeat,
            Arc::clone(&observer),
        ));
        Agent {
            config,
            router,
            store,
            observer,
            events,
            heartbeat,
            listeners: Vec::new(),
        }
    }

    /// Producers push events through this hub.
    pub fn events(&self) -> Arc<EventHub> {
        Arc::clone(&self.events)
    }

    pub fn is_running(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Bound address of a running service.
    pub fn local_addr(&self, service: Service) -> Option<ListenAddr> {
        self.listeners
            .iter()
            .find(|(s, _)| *s == service)
            .map(|(_, l)| l.local_addr())
    }

    /// Every running service with its bound address, in start order.
    pub fn local_addrs(&self) -> Vec<(Service, ListenAddr)> {
        self.listeners
            .iter()
            .map(|(s, l)| (*s, l.local_addr()))
            .collect()
    }

    /// Bind and start every service. On failure, services already started
    /// are stopped again and the error is returned.
    pub fn start(&mut self, runtime: &Handle) -> Result<(), ListenError> {
        if self.is_running() {
            return Ok(());
        }
        for service in Service::ALL {
            if let Err(e) = self.start_service(service, runtime) {
                tracing::error!(?service, error = %e, "service failed to start");
                self.shutdown_listeners();
                return Err(e);
            }
        }
        tracing::info!(transport = ?self.config.transport, "guest services running");
        self.observer.status_changed(true);
        Ok(())
    }

    fn start_service(&mut self, service: Service, runtime: &Handle) -> Result<(), ListenError> {
        let addr = self.config.listen_addr(service)?;
        let port = addr.port();
        match service {
            Service::Tunnel => {
                let handler = TunnelHandler::new(port, Arc::clone(&self.observer))
                    .with_handshake_timeout(self.config.handshake_timeout());
                self.spawn_listener(service, addr, backlog::TUNNEL, Arc::new(handler), runtime)
            }
            Service::Heartbeat => {
                let handler = Arc::clone(&self.heartbeat);
                self.spawn_listener(service, addr, backlog::HEARTBEAT, handler, runtime)
            }
            Service::Events => {
                let handler = Arc::clone(&self.events);
                self.spawn_listener(service, addr, backlog::EVENTS, handler, runtime)
            }
            Service::Http => {
                let handler = RequestServer::new(
                    Arc::clone(&self.router),
                    Arc::clone(&self.store),
                    port,
                    Arc::clone(&self.observer),
                )
                .with_limits(self.config.max_header_bytes, self.config.max_body_bytes);
                self.spawn_listener(service, addr, backlog::HTTP, Arc::new(handler), runtime)
            }
        }
    }

    fn spawn_listener<H: ConnectionHandler>(
        &mut self,
        service: Service,
        addr: ListenAddr,
        backlog: i32,
        handler: Arc<H>,
        runtime: &Handle,
    ) -> Result<(), ListenError> {
        let mut listener =
            ConnectionListener::bind(addr, backlog)?.with_backoff(self.config.accept_backoff());
        listener.start(runtime, handler, Arc::clone(&self.observer))?;
        tracing::info!(?service, addr = %listener.local_addr(), "service listening");
        self.listeners.push((service, listener));
        Ok(())
    }

    fn shutdown_listeners(&mut self) {
        while let Some((service, mut listener)) = self.listeners.pop() {
            listener.stop();
            tracing::debug!(?service, "service stopped");
        }
    }

    /// Stop accepting on every service and drop the long-lived heartbeat
    /// and event peers. Idempotent.
    ///
    /// Blocking: each listener is joined in turn, see
    /// [`ConnectionListener::stop`].
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.shutdown_listeners();
        self.heartbeat.disconnect();
        self.events.disconnect();
        tracing::info!("guest services stopped");
        self.observer.status_changed(false);
    }
}

impl<R> Drop for Agent<R> {
    fn drop(&mut self) {
        // Listeners stop themselves on drop; peers are released here.
        self.heartbeat.disconnect();
        self.events.disconnect();
    }
}
