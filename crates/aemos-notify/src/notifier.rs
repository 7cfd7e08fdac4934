//! Buffered notification manager and the outbound publisher seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use aemos_core::{NotificationPriority, NotifyConfig, Result};

/// Outbound delivery seam.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Value thresholds that escalate a notification to high priority.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Thresholds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Thresholds {
    /// Whether a value falls outside the configured band.
    pub fn crossed_by(&self, value: &str) -> bool {
        let Ok(v) = value.trim().parse::<f64>() else {
            return false;
        };
        self.min.is_some_and(|min| v < min) || self.max.is_some_and(|max| v > max)
    }

    /// Priority for a value under these thresholds.
    pub fn priority_for(&self, value: &str) -> NotificationPriority {
        if self.crossed_by(value) {
            NotificationPriority::High
        } else {
            NotificationPriority::Normal
        }
    }
}

/// One outbound notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub organization_id: i64,
    pub topic: String,
    pub payload: Value,
    pub priority: NotificationPriority,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// State-change notification on the device's notification topic.
    pub fn state_change(
        organization_id: i64,
        device_uuid: &str,
        state_name: &str,
        value: &str,
        priority: NotificationPriority,
    ) -> Self {
        Self {
            organization_id,
            topic: format!("devices/{device_uuid}/notifications"),
            payload: serde_json::json!({
                "kind": "stateChange",
                "deviceUuid": device_uuid,
                "stateName": state_name,
                "value": value,
            }),
            priority,
            created_at: Utc::now(),
        }
    }

    /// Data-stream notification on the device's notification topic.
    pub fn data_stream(
        organization_id: i64,
        device_uuid: &str,
        variable_name: &str,
        value: &Value,
        priority: NotificationPriority,
    ) -> Self {
        Self {
            organization_id,
            topic: format!("devices/{device_uuid}/notifications"),
            payload: serde_json::json!({
                "kind": "dataStream",
                "deviceUuid": device_uuid,
                "variableName": variable_name,
                "value": value,
            }),
            priority,
            created_at: Utc::now(),
        }
    }

    /// State echo on the device's state topic.
    pub fn state_echo(
        organization_id: i64,
        device_uuid: &str,
        state_name: &str,
        value: &str,
    ) -> Self {
        Self {
            organization_id,
            topic: format!("devices/{device_uuid}/state"),
            payload: serde_json::json!({
                "stateName": state_name,
                "value": value,
            }),
            priority: NotificationPriority::Normal,
            created_at: Utc::now(),
        }
    }

    /// Execution summary on the organization's rule-chain topic.
    pub fn chain_summary(organization_id: i64, rule_chain_id: i64, summary: Value) -> Self {
        Self {
            organization_id,
            topic: format!("organizations/{organization_id}/rulechain/{rule_chain_id}"),
            payload: summary,
            priority: NotificationPriority::Normal,
            created_at: Utc::now(),
        }
    }
}

/// Buffered fan-out manager.
pub struct NotificationManager {
    config: NotifyConfig,
    publisher: Arc<dyn Publisher>,
    /// (org, topic) -> pending notifications. One mutex per bucket.
    buffers: DashMap<(i64, String), Mutex<Vec<Notification>>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationManager {
    pub fn new(config: NotifyConfig, publisher: Arc<dyn Publisher>) -> Arc<Self> {
        Arc::new(Self {
            config,
            publisher,
            buffers: DashMap::new(),
            flush_task: Mutex::new(None),
        })
    }

    /// Spawn the periodic flush task.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = Duration::from_millis(self.config.flush_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.flush_all().await;
            }
        });
        *self.flush_task.lock() = Some(handle);
    }

    /// Stop the flush task and drain every buffer.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.flush_task.lock().take() {
            handle.abort();
        }
        self.flush_all().await;
    }

    /// Enqueue a notification. High priority publishes immediately; normal
    /// priority lands in the bucket and flushes on the interval or when the
    /// bucket reaches the configured size.
    pub async fn enqueue(&self, notification: Notification) {
        if notification.priority == NotificationPriority::High {
            let topic = notification.topic.clone();
            self.deliver(&topic, vec![notification]).await;
            return;
        }

        let key = (
            notification.organization_id,
            notification.topic.clone(),
        );
        let should_flush = {
            let bucket = self.buffers.entry(key.clone()).or_default();
            let mut pending = bucket.lock();
            pending.push(notification);
            pending.len() >= self.config.max_buffer_size
        };
        if should_flush {
            self.flush_bucket(&key).await;
        }
    }

    /// Flush every bucket.
    pub async fn flush_all(&self) {
        let keys: Vec<(i64, String)> = self.buffers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.flush_bucket(&key).await;
        }
    }

    async fn flush_bucket(&self, key: &(i64, String)) {
        let drained = {
            let Some(bucket) = self.buffers.get(key) else {
                return;
            };
            let mut pending = bucket.lock();
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };
        self.deliver(&key.1, drained).await;
    }

    async fn deliver(&self, topic: &str, batch: Vec<Notification>) {
        let payload = if batch.len() == 1 {
            serde_json::to_vec(&batch[0].payload)
        } else {
            let payloads: Vec<&Value> = batch.iter().map(|n| &n.payload).collect();
            serde_json::to_vec(&payloads)
        };
        let payload = match payload {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(topic, error = %e, "failed to serialize notification batch");
                return;
            }
        };
        if let Err(e) = self.publisher.publish(topic, payload).await {
            tracing::error!(topic, count = batch.len(), error = %e, "notification publish failed");
        }
    }

    /// Pending count across all buffers (for metrics).
    pub fn pending(&self) -> usize {
        self.buffers.iter().map(|e| e.value().lock().len()).sum()
    }
}

/// Publisher that records every publish; used by the test suites.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.published.lock().iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(config: NotifyConfig) -> (Arc<NotificationManager>, Arc<RecordingPublisher>) {
        let publisher = RecordingPublisher::new();
        let manager = NotificationManager::new(config, Arc::clone(&publisher) as Arc<dyn Publisher>);
        (manager, publisher)
    }

    #[tokio::test]
    async fn high_priority_bypasses_the_buffer() {
        let (manager, publisher) = manager_with(NotifyConfig::default());
        manager
            .enqueue(Notification::state_change(
                1,
                "d1",
                "fan",
                "on",
                NotificationPriority::High,
            ))
            .await;

        assert_eq!(publisher.topics(), ["devices/d1/notifications"]);
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn normal_priority_waits_for_a_flush() {
        let (manager, publisher) = manager_with(NotifyConfig::default());
        manager
            .enqueue(Notification::state_change(
                1,
                "d1",
                "fan",
                "on",
                NotificationPriority::Normal,
            ))
            .await;

        assert!(publisher.published().is_empty());
        assert_eq!(manager.pending(), 1);

        manager.flush_all().await;
        assert_eq!(publisher.topics(), ["devices/d1/notifications"]);
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn full_buffer_flushes_immediately() {
        let config = NotifyConfig {
            max_buffer_size: 3,
            ..NotifyConfig::default()
        };
        let (manager, publisher) = manager_with(config);
        for i in 0..3 {
            manager
                .enqueue(Notification::state_change(
                    1,
                    "d1",
                    "fan",
                    &format!("v{i}"),
                    NotificationPriority::Normal,
                ))
                .await;
        }

        // Third enqueue hit the cap and flushed one batch of three.
        let published = publisher.published();
        assert_eq!(published.len(), 1);
        let body: Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn buckets_are_per_org_and_topic() {
        let (manager, publisher) = manager_with(NotifyConfig::default());
        manager
            .enqueue(Notification::state_change(
                1,
                "d1",
                "fan",
                "on",
                NotificationPriority::Normal,
            ))
            .await;
        manager
            .enqueue(Notification::state_change(
                1,
                "d2",
                "fan",
                "on",
                NotificationPriority::Normal,
            ))
            .await;
        manager.flush_all().await;

        let mut topics = publisher.topics();
        topics.sort();
        assert_eq!(
            topics,
            ["devices/d1/notifications", "devices/d2/notifications"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn interval_flush_delivers_buffered_notifications() {
        let (manager, publisher) = manager_with(NotifyConfig::default());
        manager.start();
        manager
            .enqueue(Notification::state_change(
                1,
                "d1",
                "fan",
                "on",
                NotificationPriority::Normal,
            ))
            .await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!publisher.published().is_empty());
        manager.shutdown().await;
    }

    #[test]
    fn thresholds_escalate_priority() {
        let thresholds = Thresholds {
            min: Some(10.0),
            max: Some(30.0),
        };
        assert_eq!(
            thresholds.priority_for("35"),
            NotificationPriority::High
        );
        assert_eq!(
            thresholds.priority_for("5"),
            NotificationPriority::High
        );
        assert_eq!(
            thresholds.priority_for("20"),
            NotificationPriority::Normal
        );
        assert_eq!(
            thresholds.priority_for("warm"),
            NotificationPriority::Normal
        );
    }

    #[test]
    fn chain_summary_topic_shape() {
        let n = Notification::chain_summary(4, 9, serde_json::json!({"status": "success"}));
        assert_eq!(n.topic, "organizations/4/rulechain/9");
    }
}
