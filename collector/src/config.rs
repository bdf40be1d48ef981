use crate::filter::MarkerFilter;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for the collector
#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub http: HttpServer,
    pub output: Output,
    pub telemetry: Option<Telemetry>,
    #[serde(default)]
    pub filter: Filter,
}

#[derive(Debug, Default, Deserialize)]
pub struct Runtime {
    pub threads: Option<usize>,
}

/// Event ingest endpoint configuration
#[derive(Debug, Deserialize)]
pub struct HttpServer {
    #[serde(default = "HttpServer::default_addr")]
    pub addr: String,
}

impl HttpServer {
    fn default_addr() -> String {
        "0.0.0.0:9092".to_string()
    }
}

impl Default for HttpServer {
    fn default() -> Self {
        Self {
            addr: Self::default_addr(),
        }
    }
}

/// Record log configuration
#[derive(Debug, Deserialize)]
pub struct Output {
    pub path: String,
    /// Zero flushes on every append.
    #[serde(default, with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// Telemetry provider configuration; absent disables the join entirely.
#[derive(Debug, Deserialize)]
pub struct Telemetry {
    pub url: String,
    #[serde(default = "Telemetry::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Enables the periodic sampler when set.
    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
    pub sample_path: Option<String>,
    /// Write a timestamp-only row when a periodic poll fails.
    #[serde(default)]
    pub log_failures: bool,
}

impl Telemetry {
    fn default_timeout() -> Duration {
        Duration::from_secs(2)
    }
}

/// URL relevance markers
#[derive(Debug, Deserialize)]
pub struct Filter {
    #[serde(default = "default_segment_markers")]
    pub segment_markers: Vec<String>,
    #[serde(default = "default_manifest_markers")]
    pub manifest_markers: Vec<String>,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            segment_markers: default_segment_markers(),
            manifest_markers: default_manifest_markers(),
        }
    }
}

fn default_segment_markers() -> Vec<String> {
    MarkerFilter::default_segment_markers()
}

fn default_manifest_markers() -> Vec<String> {
    MarkerFilter::default_manifest_markers()
}
