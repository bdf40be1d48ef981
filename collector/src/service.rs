use crate::event::LifecycleEvent;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// HTTP ingest for lifecycle events. The driver keeps a connection open and
/// streams newline-delimited JSON, one event object per line; events are
/// forwarded into the tracker channel as each line completes.
#[derive(Debug, Clone)]
pub struct EventIngest {
    events: mpsc::Sender<LifecycleEvent>,
}

impl EventIngest {
    pub fn new(events: mpsc::Sender<LifecycleEvent>) -> Self {
        Self { events }
    }

    pub async fn handle(
        &self,
        mut req: Request<Incoming>,
    ) -> Result<Response<Empty<Bytes>>, Infallible> {
        if req.method() != Method::POST && req.method() != Method::PUT {
            info!("received not allowed request: {}", req.method());
            return Ok(self.empty_response(StatusCode::METHOD_NOT_ALLOWED));
        }

        debug!("event stream opened: {}", req.uri().path());

        let mut buffer: Vec<u8> = Vec::new();
        while let Some(frame_result) = req.frame().await {
            match frame_result {
                Ok(frame) => {
                    if frame.is_data() {
                        let data = frame.into_data().unwrap();
                        buffer.extend_from_slice(&data);
                        while let Some(line) = take_line(&mut buffer) {
                            self.forward(line.as_slice()).await;
                        }
                    }
                }
                Err(e) => {
                    error!("error reading event stream: {:?}", e);
                    break;
                }
            }
        }

        // A final line without a trailing newline still counts.
        if !buffer.is_empty() {
            self.forward(buffer.as_slice()).await;
        }

        Ok(self.empty_response(StatusCode::OK))
    }

    async fn forward(&self, line: &[u8]) {
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            return;
        }

        match serde_json::from_slice::<LifecycleEvent>(line) {
            Ok(event) => {
                if self.events.send(event).await.is_err() {
                    warn!("event channel closed, dropping event");
                }
            }
            Err(e) => {
                warn!("malformed event line: {}", e);
            }
        }
    }

    fn empty_response(&self, status: StatusCode) -> Response<Empty<Bytes>> {
        Response::builder()
            .status(status)
            .body(Empty::new())
            .unwrap()
    }
}

impl Service<Request<Incoming>> for EventIngest {
    type Response = Response<Empty<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.handle(req).await })
    }
}

/// Pop one complete line off the front of the buffer, without its newline.
fn take_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buffer.iter().position(|b| *b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=pos).collect();
    line.pop();
    Some(line)
}
