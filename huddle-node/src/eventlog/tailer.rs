//! Cross-node fan-out
//!
//! Every node follows the store's global append order and hands events
//! authored elsewhere to its local subscribers. Entries this node wrote were
//! already dispatched by `publish`. Gaps (entries trimmed before we saw them)
//! are harmless: consumers detect a jump in ids and re-read the log.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use huddle_common::config::EventLogConfig;

use super::EventLog;

pub struct LogTailer {
    events: Arc<EventLog>,
    interval: Duration,
    batch: usize,
}

impl LogTailer {
    pub fn new(events: Arc<EventLog>, config: &EventLogConfig) -> Self {
        Self {
            events,
            interval: Duration::from_millis(config.tail_interval_ms.max(10)),
            batch: config.tail_batch.max(1),
        }
    }

    /// Follow the log until cancelled, starting from the current end
    pub async fn run(self, cancel: CancellationToken) {
        let mut after = loop {
            match self.events.store().tail_head().await {
                Ok(head) => break head,
                Err(e) => {
                    warn!("Log tailer cannot read the log head yet: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.interval) => {}
                    }
                }
            }
        };
        info!("Log tailer started at sequence {}", after);

        loop {
            match self.poll_once(after).await {
                Ok((next, full_batch)) => {
                    after = next;
                    if full_batch {
                        continue;
                    }
                }
                Err(e) => warn!("Log tailer read failed: {}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Log tailer stopped");
    }

    /// Dispatch one batch; returns the new position and whether the batch was full
    pub async fn poll_once(&self, after: u64) -> huddle_common::Result<(u64, bool)> {
        let entries = self.events.store().tail(after, self.batch).await?;
        let full_batch = entries.len() == self.batch;
        let mut position = after;
        for entry in entries {
            if entry.event.origin_node != self.events.node_id() {
                let delivered = self.events.hub().dispatch(&entry.topic, &entry.event);
                if delivered > 0 {
                    debug!(
                        topic = %entry.topic,
                        event_id = entry.event.id,
                        origin = %entry.event.origin_node,
                        "Relayed remote event"
                    );
                }
            }
            position = entry.seq;
        }
        Ok((position, full_batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::SubscriptionEvent;
    use huddle_common::events::{NewEvent, Topic};
    use huddle_common::ids::{TenantId, UserId};
    use huddle_common::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_remote_events_reach_local_subscribers() {
        // Two nodes sharing one store
        let store = Arc::new(MemoryStore::new());
        let config = EventLogConfig::default();
        let node_a = Arc::new(EventLog::new(store.clone(), &config, "node-a"));
        let node_b = Arc::new(EventLog::new(store, &config, "node-b"));

        let topic = Topic::new(TenantId::new("acme"), UserId::new("alice"));
        let mut sub_b = node_b.subscribe(&topic);

        let published = node_a
            .publish(&topic, NewEvent::new("Ping", json!({})))
            .await
            .unwrap();

        let tailer = LogTailer::new(node_b.clone(), &config);
        let (position, full) = tailer.poll_once(0).await.unwrap();
        assert_eq!(position, 1);
        assert!(!full);
        assert_eq!(sub_b.recv().await, Some(SubscriptionEvent::Event(published)));
    }

    #[tokio::test]
    async fn test_own_events_are_not_relayed_twice() {
        let store = Arc::new(MemoryStore::new());
        let config = EventLogConfig::default();
        let node = Arc::new(EventLog::new(store, &config, "node-a"));
        let topic = Topic::new(TenantId::new("acme"), UserId::new("alice"));
        let mut sub = node.subscribe(&topic);

        node.publish(&topic, NewEvent::new("Ping", json!({})))
            .await
            .unwrap();
        LogTailer::new(node.clone(), &config).poll_once(0).await.unwrap();

        assert!(matches!(sub.recv().await, Some(SubscriptionEvent::Event(_))));
        let again = tokio::time::timeout(Duration::from_millis(20), sub.recv()).await;
        assert!(again.is_err(), "own event was dispatched twice");
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let config = EventLogConfig::default();
        let node = Arc::new(EventLog::new(Arc::new(MemoryStore::new()), &config, "node-a"));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(LogTailer::new(node, &config).run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
