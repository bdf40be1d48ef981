use serde::Deserialize;
use std::fmt;

/// Classification of a network resource by its URL shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Segment,
    Manifest,
    #[default]
    Other,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Segment => write!(f, "segment"),
            ResourceKind::Manifest => write!(f, "manifest"),
            ResourceKind::Other => write!(f, "other"),
        }
    }
}

/// One network request lifecycle event, as posted by the driving side.
///
/// Delivery is monotonic per request id but events for a request may arrive
/// before its `observed` event has been processed.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LifecycleEvent {
    Observed {
        request_id: String,
        url: String,
        #[serde(default)]
        resource_kind: ResourceKind,
    },
    Data {
        request_id: String,
        byte_count: i64,
    },
    Finished {
        request_id: String,
    },
    Failed {
        request_id: String,
        #[serde(default)]
        reason: String,
    },
}
