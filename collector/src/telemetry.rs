use crate::error::CollectorError;
use crate::sink::{csv_field, now_millis, CsvSink};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::{header, Method, Request, Uri};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Point-in-time readout of player diagnostic metrics. All fields are
/// optional; the overlay exposes different sets depending on platform and
/// whether the stream is live.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub resolution: Option<String>,
    pub fps: Option<String>,
    pub codecs: Option<String>,
    pub bandwidth_kbps: Option<u64>,
    pub buffer_health_secs: Option<f64>,
    pub live_latency_secs: Option<f64>,
    pub latency_mode: Option<String>,
}

pub const SAMPLE_CSV_HEADER: &str =
    "utc_timestamp,resolution,fps,codecs,bandwidth_kbps,buffer_health_s,live_latency_s,latency_mode";

impl TelemetrySnapshot {
    /// Comma-joined metric fields in header order; absent metrics render as
    /// empty fields.
    pub fn csv_fields(&self) -> String {
        let fields = [
            self.resolution.as_deref().map(csv_field).unwrap_or_default(),
            self.fps.as_deref().map(csv_field).unwrap_or_default(),
            self.codecs.as_deref().map(csv_field).unwrap_or_default(),
            self.bandwidth_kbps
                .map(|v| v.to_string())
                .unwrap_or_default(),
            self.buffer_health_secs
                .map(|v| v.to_string())
                .unwrap_or_default(),
            self.live_latency_secs
                .map(|v| v.to_string())
                .unwrap_or_default(),
            self.latency_mode.as_deref().map(csv_field).unwrap_or_default(),
        ];

        fields.join(",")
    }

    /// Field placeholder for a record without a snapshot.
    pub fn empty_csv_fields() -> String {
        ",,,,,,".to_string()
    }
}

/// Source of telemetry snapshots. The production implementation crosses into
/// the driven browser context, so calls may be slow or fail outright.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot(&self) -> Result<TelemetrySnapshot, CollectorError>;
}

/// Polls a stats endpoint exposed by the player driver. One connection per
/// snapshot; the endpoint returns a JSON object with the overlay readout.
pub struct HttpSnapshotProvider {
    uri: Uri,
    timeout: Duration,
}

impl HttpSnapshotProvider {
    pub fn new(uri: Uri, timeout: Duration) -> Self {
        Self { uri, timeout }
    }

    async fn fetch(&self) -> Result<TelemetrySnapshot, CollectorError> {
        let (mut sender, conn) = self.connect().await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                error!("telemetry connection: {:?}", e);
            }
        });

        let authority = match self.uri.authority() {
            Some(authority) => authority.to_string(),
            None => String::new(),
        };
        let req = Request::builder()
            .method(Method::GET)
            .uri(self.uri.clone())
            .header(header::HOST, authority)
            .header(header::USER_AGENT, "segmeter-collector/1.0")
            .body(Empty::<Bytes>::new())
            .map_err(|e| CollectorError::TelemetryError(format!("build request: {}", e)))?;

        let res = sender
            .send_request(req)
            .await
            .map_err(|e| CollectorError::TelemetryError(format!("send request: {}", e)))?;

        if !res.status().is_success() {
            return Err(CollectorError::TelemetryError(format!(
                "stats endpoint returned {}",
                res.status()
            )));
        }

        let body = res
            .into_body()
            .collect()
            .await
            .map_err(|e| CollectorError::TelemetryError(format!("read response: {}", e)))?
            .to_bytes();

        serde_json::from_slice(&body)
            .map_err(|e| CollectorError::TelemetryError(format!("decode snapshot: {}", e)))
    }

    async fn connect(
        &self,
    ) -> Result<
        (
            http1::SendRequest<Empty<Bytes>>,
            http1::Connection<TokioIo<TcpStream>, Empty<Bytes>>,
        ),
        CollectorError,
    > {
        let host = self.uri.host().ok_or_else(|| {
            CollectorError::ConfigError("telemetry URL has no host".to_string())
        })?;
        let port = self.uri.port_u16().unwrap_or(80);
        let addr = format!("{}:{}", host, port);

        let tcp_stream = TcpStream::connect(addr.as_str()).await.map_err(|e| {
            CollectorError::NetworkError(format!("connect to {}: {}", addr, e))
        })?;

        let io = TokioIo::new(tcp_stream);
        http1::handshake(io)
            .await
            .map_err(|e| CollectorError::NetworkError(format!("http1 handshake: {}", e)))
    }
}

#[async_trait]
impl SnapshotProvider for HttpSnapshotProvider {
    async fn snapshot(&self) -> Result<TelemetrySnapshot, CollectorError> {
        match tokio::time::timeout(self.timeout, self.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(CollectorError::TelemetryError(format!(
                "snapshot timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

/// Periodic telemetry sampler. Independent of request accounting: one row per
/// poll, appended to its own CSV file.
pub struct Sampler {
    provider: Arc<dyn SnapshotProvider>,
    sink: CsvSink,
    interval: Duration,
    log_failures: bool,
}

impl Sampler {
    pub fn new(
        provider: Arc<dyn SnapshotProvider>,
        sink: CsvSink,
        interval: Duration,
        log_failures: bool,
    ) -> Self {
        Self {
            provider,
            sink,
            interval,
            log_failures,
        }
    }

    pub async fn run(mut self, shutdown: Arc<Notify>) {
        let notified = shutdown.notified();
        tokio::pin!(notified);

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = &mut notified => {
                    debug!("sampler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.sample().await;
                }
            }
        }

        if let Err(e) = self.sink.flush().await {
            error!("final sample flush: {}", e);
        }
    }

    async fn sample(&mut self) {
        let timestamp = now_millis();
        let line = match self.provider.snapshot().await {
            Ok(snapshot) => format!("{},{}", timestamp, snapshot.csv_fields()),
            Err(e) => {
                warn!("telemetry sample failed: {}", e);
                if !self.log_failures {
                    return;
                }
                format!("{},{}", timestamp, TelemetrySnapshot::empty_csv_fields())
            }
        };

        if let Err(e) = self.sink.append_line(line.as_str()).await {
            error!("sample row dropped: {}", e);
        }
    }
}
