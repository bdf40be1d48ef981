use crate::event::{LifecycleEvent, ResourceKind};
use crate::filter::Relevance;
use crate::sink::{now_millis, FinalizedRecord, RecordSink};
use crate::telemetry::SnapshotProvider;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// One in-flight transfer. Exactly one live entry exists per request id.
#[derive(Debug)]
struct TrackedRequest {
    url: String,
    resource_kind: ResourceKind,
    bytes_accumulated: u64,
    started_at: u64,
    /// False while the entry only exists because data outran the observed
    /// event for its request id.
    attributed: bool,
}

impl TrackedRequest {
    fn new(url: String, resource_kind: ResourceKind) -> Self {
        Self {
            url,
            resource_kind,
            bytes_accumulated: 0,
            started_at: now_millis(),
            attributed: true,
        }
    }

    fn unattributed() -> Self {
        Self {
            url: "unknown".to_string(),
            resource_kind: ResourceKind::Other,
            bytes_accumulated: 0,
            started_at: now_millis(),
            attributed: false,
        }
    }
}

/// Correlates request lifecycle events into per-request byte totals and emits
/// one finalized record per completed transfer. Owns the live request map for
/// its lifetime; all mutation happens on its single consumer loop.
pub struct RequestTracker {
    live: HashMap<String, TrackedRequest>,
    // Ids whose URL failed the relevance filter. Kept so their later data
    // events are not mistaken for reordered segment traffic; drained by the
    // finished/failed event of the same request.
    dismissed: HashSet<String>,
    filter: Box<dyn Relevance>,
    telemetry: Option<Arc<dyn SnapshotProvider>>,
    sink: Box<dyn RecordSink>,
}

impl RequestTracker {
    pub fn new(
        filter: Box<dyn Relevance>,
        telemetry: Option<Arc<dyn SnapshotProvider>>,
        sink: Box<dyn RecordSink>,
    ) -> Self {
        Self {
            live: HashMap::new(),
            dismissed: HashSet::new(),
            filter,
            telemetry,
            sink,
        }
    }

    /// Consume events until the channel closes or shutdown fires, then flush
    /// the sink. In-flight requests are discarded without a record.
    pub async fn run(mut self, mut events: mpsc::Receiver<LifecycleEvent>, shutdown: Arc<Notify>) {
        let notified = shutdown.notified();
        tokio::pin!(notified);

        loop {
            tokio::select! {
                _ = &mut notified => {
                    debug!("tracker stopping");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        self.finish().await;
    }

    pub async fn handle(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Observed {
                request_id,
                url,
                resource_kind,
            } => self.on_request_observed(request_id, url, resource_kind),
            LifecycleEvent::Data {
                request_id,
                byte_count,
            } => self.on_data_received(request_id.as_str(), byte_count),
            LifecycleEvent::Finished { request_id } => {
                self.on_request_finished(request_id.as_str()).await
            }
            LifecycleEvent::Failed { request_id, reason } => {
                self.on_request_failed(request_id.as_str(), reason.as_str())
            }
        }
    }

    pub async fn finish(mut self) {
        if !self.live.is_empty() {
            info!("discarding {} in-flight requests", self.live.len());
        }

        if let Err(e) = self.sink.flush().await {
            error!("final sink flush: {}", e);
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    fn on_request_observed(&mut self, request_id: String, url: String, kind: ResourceKind) {
        if self.dismissed.contains(request_id.as_str()) {
            return;
        }

        if let Some(entry) = self.live.get_mut(request_id.as_str()) {
            if entry.attributed {
                return;
            }

            // Data outran the observed event; attribute or dismiss it now.
            match self.filter.classify(url.as_str()) {
                Some(classified) => {
                    entry.url = url;
                    entry.resource_kind = pick_kind(kind, classified);
                    entry.attributed = true;
                }
                None => {
                    debug!("dismissing early-data request {}: irrelevant url", request_id);
                    self.live.remove(request_id.as_str());
                    self.dismissed.insert(request_id);
                }
            }
            return;
        }

        match self.filter.classify(url.as_str()) {
            Some(classified) => {
                debug!("tracking request {}: {}", request_id, url);
                self.live
                    .insert(request_id, TrackedRequest::new(url, pick_kind(kind, classified)));
            }
            None => {
                self.dismissed.insert(request_id);
            }
        }
    }

    fn on_data_received(&mut self, request_id: &str, byte_count: i64) {
        if byte_count < 0 {
            warn!(
                "rejected negative byte count {} for request {}",
                byte_count, request_id
            );
            return;
        }

        if self.dismissed.contains(request_id) {
            return;
        }

        let entry = self
            .live
            .entry(request_id.to_string())
            .or_insert_with(|| {
                debug!("data before observe for request {}", request_id);
                TrackedRequest::unattributed()
            });
        entry.bytes_accumulated += byte_count as u64;
    }

    async fn on_request_finished(&mut self, request_id: &str) {
        if self.dismissed.remove(request_id) {
            return;
        }

        let entry = match self.live.remove(request_id) {
            Some(entry) => entry,
            // Expected under relevance filtering.
            None => return,
        };

        // The byte total is frozen and the entry gone from the live set
        // before the telemetry await below.
        let mut record = FinalizedRecord {
            timestamp: now_millis(),
            request_id: request_id.to_string(),
            url: entry.url,
            resource_kind: entry.resource_kind,
            total_bytes: entry.bytes_accumulated,
            snapshot: None,
        };

        debug!(
            "request {} finished: {} bytes in {} ms",
            record.request_id,
            record.total_bytes,
            record.timestamp.saturating_sub(entry.started_at)
        );

        if let Some(provider) = &self.telemetry {
            match provider.snapshot().await {
                Ok(snapshot) => record.snapshot = Some(snapshot),
                Err(e) => {
                    warn!(
                        "telemetry unavailable for request {}: {}",
                        record.request_id, e
                    );
                }
            }
        }

        if let Err(e) = self.sink.append(&record).await {
            error!("record for request {} dropped: {}", record.request_id, e);
        }
    }

    fn on_request_failed(&mut self, request_id: &str, reason: &str) {
        if self.dismissed.remove(request_id) {
            return;
        }

        if self.live.remove(request_id).is_some() {
            info!("request {} failed: {}", request_id, reason);
        }
    }
}

fn pick_kind(from_event: ResourceKind, from_filter: ResourceKind) -> ResourceKind {
    if from_event == ResourceKind::Other {
        from_filter
    } else {
        from_event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollectorError;
    use crate::filter::MarkerFilter;
    use crate::telemetry::TelemetrySnapshot;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct VecSink {
        records: Arc<Mutex<Vec<FinalizedRecord>>>,
        flushed: Arc<Mutex<bool>>,
    }

    impl VecSink {
        fn records(&self) -> Vec<FinalizedRecord> {
            self.records.lock().unwrap().clone()
        }

        fn flushed(&self) -> bool {
            *self.flushed.lock().unwrap()
        }
    }

    #[async_trait]
    impl RecordSink for VecSink {
        async fn append(&mut self, record: &FinalizedRecord) -> Result<(), CollectorError> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), CollectorError> {
            *self.flushed.lock().unwrap() = true;
            Ok(())
        }
    }

    struct FixedProvider(TelemetrySnapshot);

    #[async_trait]
    impl SnapshotProvider for FixedProvider {
        async fn snapshot(&self) -> Result<TelemetrySnapshot, CollectorError> {
            Ok(self.0.clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl SnapshotProvider for FailingProvider {
        async fn snapshot(&self) -> Result<TelemetrySnapshot, CollectorError> {
            Err(CollectorError::TelemetryError(
                "stats endpoint unreachable".to_string(),
            ))
        }
    }

    fn tracker_with(telemetry: Option<Arc<dyn SnapshotProvider>>) -> (RequestTracker, VecSink) {
        let sink = VecSink::default();
        let tracker = RequestTracker::new(
            Box::new(MarkerFilter::default()),
            telemetry,
            Box::new(sink.clone()),
        );
        (tracker, sink)
    }

    fn observed(id: &str, url: &str) -> LifecycleEvent {
        LifecycleEvent::Observed {
            request_id: id.to_string(),
            url: url.to_string(),
            resource_kind: ResourceKind::Other,
        }
    }

    fn data(id: &str, byte_count: i64) -> LifecycleEvent {
        LifecycleEvent::Data {
            request_id: id.to_string(),
            byte_count,
        }
    }

    fn finished(id: &str) -> LifecycleEvent {
        LifecycleEvent::Finished {
            request_id: id.to_string(),
        }
    }

    fn failed(id: &str) -> LifecycleEvent {
        LifecycleEvent::Failed {
            request_id: id.to_string(),
            reason: "net::ERR_ABORTED".to_string(),
        }
    }

    #[tokio::test]
    async fn finished_request_sums_bytes_in_delivery_order() {
        let (mut tracker, sink) = tracker_with(None);

        tracker.handle(observed("r1", "https://edge/seg1.ts")).await;
        tracker.handle(data("r1", 1000)).await;
        tracker.handle(data("r1", 500)).await;
        tracker.handle(finished("r1")).await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request_id, "r1");
        assert_eq!(records[0].url, "https://edge/seg1.ts");
        assert_eq!(records[0].total_bytes, 1500);
        assert_eq!(records[0].resource_kind, ResourceKind::Segment);
        assert_eq!(tracker.live_count(), 0);
    }

    #[tokio::test]
    async fn data_before_observed_is_attributed() {
        let (mut tracker, sink) = tracker_with(None);

        tracker.handle(data("r1", 10)).await;
        tracker.handle(data("r1", 20)).await;
        tracker.handle(observed("r1", "https://edge/seg2.ts")).await;
        tracker.handle(finished("r1")).await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_bytes, 30);
        assert_eq!(records[0].url, "https://edge/seg2.ts");
    }

    #[tokio::test]
    async fn negative_byte_count_is_never_applied() {
        let (mut tracker, sink) = tracker_with(None);

        tracker.handle(observed("r1", "https://edge/seg1.ts")).await;
        tracker.handle(data("r1", 10)).await;
        tracker.handle(data("r1", -5)).await;
        tracker.handle(finished("r1")).await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_bytes, 10);
    }

    #[tokio::test]
    async fn failed_request_emits_no_record() {
        let (mut tracker, sink) = tracker_with(None);

        tracker.handle(observed("r1", "https://edge/seg1.ts")).await;
        tracker.handle(data("r1", 4096)).await;
        tracker.handle(failed("r1")).await;

        assert!(sink.records().is_empty());
        assert_eq!(tracker.live_count(), 0);
    }

    #[tokio::test]
    async fn finished_without_history_is_a_noop() {
        let (mut tracker, sink) = tracker_with(None);

        tracker.handle(finished("ghost")).await;

        assert!(sink.records().is_empty());
        assert_eq!(tracker.live_count(), 0);
    }

    #[tokio::test]
    async fn irrelevant_url_is_not_tracked() {
        let (mut tracker, sink) = tracker_with(None);

        tracker.handle(observed("r1", "https://example.com/page.html")).await;
        tracker.handle(data("r1", 100)).await;
        tracker.handle(finished("r1")).await;

        assert!(sink.records().is_empty());
        assert_eq!(tracker.live_count(), 0);
    }

    #[tokio::test]
    async fn early_data_for_irrelevant_url_is_dropped_on_attribution() {
        let (mut tracker, sink) = tracker_with(None);

        tracker.handle(data("r1", 64)).await;
        tracker.handle(observed("r1", "https://static.cdn/app.js")).await;
        tracker.handle(finished("r1")).await;

        assert!(sink.records().is_empty());
        assert_eq!(tracker.live_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_observed_keeps_first_attribution() {
        let (mut tracker, sink) = tracker_with(None);

        tracker.handle(observed("r1", "https://edge/seg1.ts")).await;
        tracker.handle(data("r1", 5)).await;
        tracker.handle(observed("r1", "https://edge/other.ts")).await;
        tracker.handle(finished("r1")).await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, "https://edge/seg1.ts");
        assert_eq!(records[0].total_bytes, 5);
    }

    #[tokio::test]
    async fn unattributed_finish_still_accounts_bytes() {
        let (mut tracker, sink) = tracker_with(None);

        tracker.handle(data("r1", 40)).await;
        tracker.handle(finished("r1")).await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, "unknown");
        assert_eq!(records[0].total_bytes, 40);
    }

    #[tokio::test]
    async fn live_set_drains_after_interleaved_finishes() {
        let (mut tracker, sink) = tracker_with(None);
        let ids: Vec<String> = (0..8).map(|i| format!("r{}", i)).collect();

        for (i, id) in ids.iter().enumerate() {
            let url = format!("https://edge/seg{}.ts", i);
            tracker.handle(observed(id, url.as_str())).await;
        }

        // Two interleaved delivery passes.
        for id in &ids {
            tracker.handle(data(id, 100)).await;
        }
        for id in ids.iter().rev() {
            tracker.handle(data(id, 23)).await;
        }

        for id in &ids {
            tracker.handle(finished(id)).await;
        }

        assert_eq!(tracker.live_count(), 0);
        let records = sink.records();
        assert_eq!(records.len(), ids.len());
        assert!(records.iter().all(|r| r.total_bytes == 123));
    }

    #[tokio::test]
    async fn telemetry_failure_still_emits_record() {
        let (mut tracker, sink) = tracker_with(Some(Arc::new(FailingProvider)));

        tracker.handle(observed("r1", "https://edge/seg1.ts")).await;
        tracker.handle(data("r1", 777)).await;
        tracker.handle(finished("r1")).await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_bytes, 777);
        assert!(records[0].snapshot.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_joined_on_finish() {
        let snapshot = TelemetrySnapshot {
            resolution: Some("1920x1080".to_string()),
            ..Default::default()
        };
        let (mut tracker, sink) = tracker_with(Some(Arc::new(FixedProvider(snapshot))));

        tracker.handle(observed("r1", "https://edge/seg1.ts")).await;
        tracker.handle(finished("r1")).await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        let joined = records[0].snapshot.as_ref().unwrap();
        assert_eq!(joined.resolution.as_deref(), Some("1920x1080"));
    }

    #[tokio::test]
    async fn run_drains_channel_and_flushes() {
        let (tracker, sink) = tracker_with(None);
        let (tx, rx) = mpsc::channel(16);
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(tracker.run(rx, shutdown));

        tx.send(observed("r1", "https://edge/seg1.ts")).await.unwrap();
        tx.send(data("r1", 9)).await.unwrap();
        tx.send(finished("r1")).await.unwrap();
        drop(tx);

        task.await.unwrap();
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_bytes, 9);
        assert!(sink.flushed());
    }

    #[tokio::test]
    async fn shutdown_flushes_while_senders_still_open() {
        let (tracker, sink) = tracker_with(None);
        let (tx, rx) = mpsc::channel(16);
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(tracker.run(rx, shutdown.clone()));

        tx.send(observed("r1", "https://edge/seg1.ts")).await.unwrap();
        tx.send(data("r1", 7)).await.unwrap();
        tx.send(finished("r1")).await.unwrap();

        // Let the loop drain the queue before signalling.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.notify_waiters();
        task.await.unwrap();

        // The sender is still alive; only the notify ended the loop.
        assert!(sink.flushed());
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_bytes, 7);
        drop(tx);
    }
}
