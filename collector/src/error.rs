use std::{error::Error, fmt};

#[derive(Debug)]
pub enum CollectorError {
    ConfigError(String),
    NetworkError(String),
    SinkError(String),
    TelemetryError(String),
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectorError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            CollectorError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            CollectorError::SinkError(msg) => write!(f, "Sink error: {}", msg),
            CollectorError::TelemetryError(msg) => write!(f, "Telemetry error: {}", msg),
        }
    }
}

impl Error for CollectorError {}
