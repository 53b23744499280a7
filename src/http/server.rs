use serde::Serialize;
use std::future::Future;
use std::io;
use std::sync::Arc;

use super::{read_body, read_head, stream_body, ParsedRequest, RequestHead, Response};
use crate::channel::{AnyChannel, Channel};
use crate::error::{FramingError, OperationalError, Phase};
use crate::listener::ConnectionHandler;
use crate::observer::Observer;
use crate::protocol::{MAX_BODY_BYTES, MAX_HEADER_BYTES, VERSION};

/// Maps a parsed request to a response. Supplied by the application.
pub trait Router: Send + Sync + 'static {
    fn handle(&self, request: ParsedRequest) -> impl Future<Output = Response> + Send;

    /// Response after a streamed upload completed.
    fn handle_upload(
        &self,
        head: RequestHead,
        stored: StoredUpload,
    ) -> impl Future<Output = Response> + Send {
        async move {
            tracing::debug!(path = %head.path, bytes = stored.bytes, "upload stored");
            Response::json(201, &stored)
        }
    }
}

/// Where a streamed upload ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredUpload {
    pub location: String,
    pub bytes: u64,
}

/// Receives one upload body chunk by chunk.
pub trait UploadSink: Send {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;
    fn finish(self: Box<Self>) -> io::Result<StoredUpload>;
}

/// Decides, from the head alone, whether a request body is streamed to
/// storage instead of buffered.
pub trait UploadStore: Send + Sync + 'static {
    fn begin(&self, head: &RequestHead) -> io::Result<Option<Box<dyn UploadSink>>>;
}

/// Never claims a request; every body is buffered.
pub struct NoUploads;

impl UploadStore for NoUploads {
    fn begin(&self, _head: &RequestHead) -> io::Result<Option<Box<dyn UploadSink>>> {
        Ok(None)
    }
}

/// Minimal router: `GET /health` and 404 for everything else.
pub struct StatusRouter {
    version: String,
}

impl StatusRouter {
    pub fn new(version: impl Into<String>) -> Self {
        StatusRouter {
            version: version.into(),
        }
    }
}

impl Default for StatusRouter {
    fn default() -> Self {
        Self::new(VERSION)
    }
}

impl Router for StatusRouter {
    async fn handle(&self, request: ParsedRequest) -> Response {
        match (request.method(), request.path()) {
            ("GET", "/health") => Response::json(
                200,
                &serde_json::json!({"status": "ok", "version": self.version}),
            ),
            (_, "/health") => Response::new(405).with_header("Allow", "GET"),
            _ => Response::text(404, format!("no route for {}", request.path())),
        }
    }
}

/// Connection handler: one request, one response, close.
pub struct RequestServer<R> {
    router: Arc<R>,
    store: Arc<dyn UploadStore>,
    observer: Arc<dyn Observer>,
    max_header_bytes: usize,
    max_body_bytes: usize,
    port: u32,
}

impl<R: Router> RequestServer<R> {
    pub fn new(router: Arc<R>, store: Arc<dyn UploadStore>, port: u32, observer: Arc<dyn Observer>) -> Self {
        RequestServer {
            router,
            store,
            observer,
            max_header_bytes: MAX_HEADER_BYTES,
            max_body_bytes: MAX_BODY_BYTES,
            port,
        }
    }

    pub fn with_limits(mut self, max_header_bytes: usize, max_body_bytes: usize) -> Self {
        self.max_header_bytes = max_header_bytes;
        self.max_body_bytes = max_body_bytes;
        self
    }

    async fn exchange(&self, channel: &AnyChannel) -> Result<Response, FramingError> {
        let (head, buffered) = read_head(channel, self.max_header_bytes).await?;
        tracing::debug!(method = %head.method, path = %head.path, "request");

        if let Some(mut sink) = self.store.begin(&head)? {
            let bytes = stream_body(channel, &head, buffered, sink.as_mut()).await?;
            let stored = sink.finish()?;
            debug_assert_eq!(stored.bytes, bytes);
            return Ok(self.router.handle_upload(head, stored).await);
        }

        let body = read_body(channel, &head, buffered, self.max_body_bytes).await?;
        Ok(self.router.handle(ParsedRequest { head, body }).await)
    }
}

impl<R: Router> ConnectionHandler for RequestServer<R> {
    async fn serve(self: Arc<Self>, channel: AnyChannel) {
        let response = match self.exchange(&channel).await {
            Ok(response) => response,
            Err(e) => {
                let phase = match e {
                    FramingError::Upload(_) => Phase::Upload,
                    _ => Phase::Framing,
                };
                tracing::debug!(error = %e, "request failed");
                self.observer.operational_error(&OperationalError::new(
                    phase,
                    e.to_string(),
                    Some(self.port),
                ));
                match e.status() {
                    Some(status) => Response::text(status, e.to_string()),
                    None => {
                        channel.close();
                        return;
                    }
                }
            }
        };

        if let Err(e) = channel.write_all(&response.to_bytes()).await {
            tracing::debug!(error = %e, "response write failed");
        } else {
            let _ = channel.shutdown_write();
        }
        channel.close();
    }
}
