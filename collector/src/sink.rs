use crate::error::CollectorError;
use crate::event::ResourceKind;
use crate::telemetry::TelemetrySnapshot;
use async_trait::async_trait;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{error, warn};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Quote a CSV field when it contains a delimiter, quote or newline.
pub fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Immutable output row for one completed transfer.
#[derive(Debug, Clone)]
pub struct FinalizedRecord {
    pub timestamp: u64,
    pub request_id: String,
    pub url: String,
    pub resource_kind: ResourceKind,
    pub total_bytes: u64,
    pub snapshot: Option<TelemetrySnapshot>,
}

impl FinalizedRecord {
    pub const CSV_HEADER: &'static str = "utc_timestamp,request_id,url,resource_kind,total_bytes,resolution,fps,codecs,bandwidth_kbps,buffer_health_s,live_latency_s,latency_mode";

    pub fn to_csv_line(&self) -> String {
        let snapshot = match &self.snapshot {
            Some(snapshot) => snapshot.csv_fields(),
            None => TelemetrySnapshot::empty_csv_fields(),
        };

        format!(
            "{},{},{},{},{},{}",
            self.timestamp,
            csv_field(self.request_id.as_str()),
            csv_field(self.url.as_str()),
            self.resource_kind,
            self.total_bytes,
            snapshot
        )
    }
}

/// Durable destination for finalized records.
#[async_trait]
pub trait RecordSink: Send {
    async fn append(&mut self, record: &FinalizedRecord) -> Result<(), CollectorError>;
    async fn flush(&mut self) -> Result<(), CollectorError>;
}

/// Append-only CSV log. Lines are buffered and written out once per flush
/// interval; a zero interval writes on every append. A failed write is
/// retried once, then the buffered lines are logged and dropped to bound
/// memory.
pub struct CsvSink<W = File> {
    writer: W,
    buffer: String,
    flush_interval: Duration,
    last_flush: Instant,
}

impl CsvSink<File> {
    /// Open (or create) the log at `path`, writing the header row when the
    /// file is empty.
    pub async fn open(
        path: &str,
        header: &str,
        flush_interval: Duration,
    ) -> Result<Self, CollectorError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    CollectorError::SinkError(format!(
                        "create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await
            .map_err(|e| CollectorError::SinkError(format!("open log {}: {}", path, e)))?;

        let meta = file
            .metadata()
            .await
            .map_err(|e| CollectorError::SinkError(format!("stat log {}: {}", path, e)))?;

        if meta.len() == 0 {
            file.write_all(format!("{}\n", header).as_bytes())
                .await
                .map_err(|e| CollectorError::SinkError(format!("write header: {}", e)))?;
        }

        Ok(Self::from_writer(file, flush_interval))
    }
}

impl<W: AsyncWrite + Unpin + Send> CsvSink<W> {
    fn from_writer(writer: W, flush_interval: Duration) -> Self {
        Self {
            writer,
            buffer: String::new(),
            flush_interval,
            last_flush: Instant::now(),
        }
    }

    pub async fn append_line(&mut self, line: &str) -> Result<(), CollectorError> {
        self.buffer.push_str(line);
        self.buffer.push('\n');

        if !self.flush_interval.is_zero() && self.last_flush.elapsed() < self.flush_interval {
            return Ok(());
        }

        self.write_durable().await
    }

    /// Force the buffer out to the file. Must be called at shutdown when
    /// buffering, otherwise trailing rows are lost.
    pub async fn flush(&mut self) -> Result<(), CollectorError> {
        self.write_durable().await?;
        self.writer
            .flush()
            .await
            .map_err(|e| CollectorError::SinkError(format!("flush log: {}", e)))
    }

    async fn write_durable(&mut self) -> Result<(), CollectorError> {
        match self.write_buffer().await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("sink write failed, retrying once: {}", first);
                match self.write_buffer().await {
                    Ok(()) => Ok(()),
                    Err(second) => {
                        // The buffer is dropped to bound memory, but every
                        // lost row is named on the error channel first.
                        for line in self.buffer.lines() {
                            error!("dropping unwritten row: {}", line);
                        }
                        self.buffer.clear();
                        Err(second)
                    }
                }
            }
        }
    }

    async fn write_buffer(&mut self) -> Result<(), CollectorError> {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return Ok(());
        }

        self.writer
            .write_all(self.buffer.as_bytes())
            .await
            .map_err(|e| CollectorError::SinkError(format!("append to log: {}", e)))?;

        self.buffer.clear();
        self.last_flush = Instant::now();
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RecordSink for CsvSink<W> {
    async fn append(&mut self, record: &FinalizedRecord) -> Result<(), CollectorError> {
        self.append_line(record.to_csv_line().as_str()).await
    }

    async fn flush(&mut self) -> Result<(), CollectorError> {
        CsvSink::flush(self).await
    }
}
