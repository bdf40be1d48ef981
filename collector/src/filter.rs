use crate::event::ResourceKind;

/// Decides which observed URLs are worth tracking.
pub trait Relevance: Send {
    /// Returns the kind a URL looks like, or `None` when it should be ignored.
    fn classify(&self, url: &str) -> Option<ResourceKind>;
}

/// Substring-marker filter. Separate marker lists per resource kind so one
/// tracker serves both Twitch-style (`.ts`/`.m3u8`) and YouTube-style
/// (`videoplayback`) URL layouts.
#[derive(Debug, Clone)]
pub struct MarkerFilter {
    segment_markers: Vec<String>,
    manifest_markers: Vec<String>,
}

impl MarkerFilter {
    pub fn new(segment_markers: Vec<String>, manifest_markers: Vec<String>) -> Self {
        Self {
            segment_markers,
            manifest_markers,
        }
    }

    pub fn default_segment_markers() -> Vec<String> {
        vec![
            ".ts".to_string(),
            ".m4s".to_string(),
            "videoplayback".to_string(),
        ]
    }

    pub fn default_manifest_markers() -> Vec<String> {
        vec![".m3u8".to_string(), ".mpd".to_string()]
    }
}

impl Default for MarkerFilter {
    fn default() -> Self {
        Self::new(
            Self::default_segment_markers(),
            Self::default_manifest_markers(),
        )
    }
}

impl Relevance for MarkerFilter {
    fn classify(&self, url: &str) -> Option<ResourceKind> {
        // Manifest markers first: a playlist URL never carries segment markers
        // but segment markers are short enough to appear in odd places.
        for marker in &self.manifest_markers {
            if url.contains(marker.as_str()) {
                return Some(ResourceKind::Manifest);
            }
        }

        for marker in &self.segment_markers {
            if url.contains(marker.as_str()) {
                return Some(ResourceKind::Segment);
            }
        }

        None
    }
}
