//! Topic name to estimator map, and the handles ingestion sites hold.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::watch;

use crate::config::EstimatorConfig;
use crate::consumer::MessageHandler;
use crate::estimator::{IntervalBatch, RateEstimator};
use crate::model::RateSnapshot;
use crate::protocol::Message;
use crate::ring::EventTimestamp;

/// Shared access to one topic's estimator. Ingest and update both run under
/// the same lock, so a topic never sees two writers at once.
#[derive(Clone, Debug)]
pub struct TopicHandle {
    topic: Arc<str>,
    estimator: Arc<Mutex<RateEstimator>>,
}

impl TopicHandle {
    fn new(topic: &str, config: &EstimatorConfig) -> Self {
        TopicHandle {
            topic: Arc::from(topic),
            estimator: Arc::new(Mutex::new(RateEstimator::new(topic, config))),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    // The critical section is plain arithmetic; a poisoned lock still holds
    // a consistent posterior.
    fn lock(&self) -> MutexGuard<'_, RateEstimator> {
        self.estimator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ingest(&self, now: EventTimestamp) -> Option<IntervalBatch> {
        self.lock().ingest(now)
    }

    pub fn snapshot(&self) -> RateSnapshot {
        self.lock().snapshot()
    }
}

impl MessageHandler for TopicHandle {
    fn handle_message(&self, _message: &Message) {
        self.ingest(Instant::now());
    }
}

#[derive(Clone, Debug, Default)]
pub struct TopicSupervisor {
    estimators: BTreeMap<String, TopicHandle>,
}

impl TopicSupervisor {
    pub fn new<I, S>(config: &EstimatorConfig, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let estimators = topics
            .into_iter()
            .map(|t| {
                let t = t.as_ref();
                (t.to_string(), TopicHandle::new(t, config))
            })
            .collect();
        TopicSupervisor { estimators }
    }

    pub fn len(&self) -> usize {
        self.estimators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.estimators.is_empty()
    }

    pub fn handle(&self, topic: &str) -> Option<TopicHandle> {
        self.estimators.get(topic).cloned()
    }

    pub fn handles(&self) -> impl Iterator<Item = &TopicHandle> {
        self.estimators.values()
    }

    /// Snapshots in topic order.
    pub fn snapshots(&self) -> Vec<RateSnapshot> {
        self.estimators.values().map(TopicHandle::snapshot).collect()
    }

    pub fn log_snapshots(&self) {
        for snap in self.snapshots() {
            info!("{snap}");
        }
    }

    /// Logs every topic's snapshot each `period` until `shutdown` flips.
    pub async fn report_every(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        // first tick is immediate; nothing to report yet
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.log_snapshots(),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("reporter lost its shutdown signal");
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RateEstimate;
    use crate::protocol::MessageId;

    fn config(capacity: usize) -> EstimatorConfig {
        EstimatorConfig {
            capacity,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_dedups_topics() {
        let sup = TopicSupervisor::new(&config(4), ["orders", "clicks", "orders"]);
        assert_eq!(sup.len(), 2);
        let topics: Vec<_> = sup.handles().map(|h| h.topic().to_string()).collect();
        assert_eq!(topics, vec!["clicks", "orders"]);
        assert!(sup.handle("signups").is_none());
    }

    #[test]
    fn test_handles_share_state() {
        let sup = TopicSupervisor::new(&config(4), ["clicks"]);
        let a = sup.handle("clicks").unwrap();
        let b = sup.handle("clicks").unwrap();
        let base = Instant::now();
        for i in 0..5u64 {
            a.ingest(base + Duration::from_secs(i));
        }
        let snap = b.snapshot();
        assert_eq!(snap.observed, 5);
        assert_eq!(snap.shape, 3.0);
    }

    #[test]
    fn test_handle_message_ingests() {
        let sup = TopicSupervisor::new(&config(4), ["clicks"]);
        let handle = sup.handle("clicks").unwrap();
        let msg = Message {
            id: MessageId(*b"0123456789abcdef"),
            timestamp: 0,
            attempts: 1,
            body: Vec::new(),
        };
        handle.handle_message(&msg);
        handle.handle_message(&msg);
        assert_eq!(handle.snapshot().observed, 2);
        assert_eq!(handle.snapshot().pending, 2);
    }

    #[test]
    fn test_snapshots_start_undefined() {
        let sup = TopicSupervisor::new(&config(10), ["clicks", "orders"]);
        let snaps = sup.snapshots();
        assert_eq!(snaps.len(), 2);
        assert!(snaps.iter().all(|s| s.estimate == RateEstimate::Undefined));
    }

    #[tokio::test]
    async fn test_report_every_stops_on_shutdown() {
        let sup = TopicSupervisor::new(&config(10), ["clicks"]);
        let (tx, rx) = watch::channel(false);
        let reporter = tokio::spawn(async move {
            sup.report_every(Duration::from_millis(5), rx).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        reporter.await.unwrap();
    }
}
