//! Action effects: what happens after the interpreter emits actions.
//!
//! Each action record becomes a device-state write (atomically closing the
//! previous open interval), a state-change notification (high priority when
//! the value crosses the chain's configured thresholds), and a state echo
//! for subscribers. The record is marked `notification_sent` once the
//! notification is enqueued.

use serde_json::Value;

use aemos_core::{BusEvent, SharedEventBus};
use aemos_notify::{Notification, NotificationManager, Thresholds};
use aemos_rules::{ChainExecution, ParsedChain};
use aemos_storage::{NewStateInstance, SharedRepository};
use std::sync::Arc;

/// Applies the downstream effects of emitted actions.
pub struct ActionEffects {
    repo: SharedRepository,
    notify: Arc<NotificationManager>,
    bus: SharedEventBus,
}

impl ActionEffects {
    pub fn new(
        repo: SharedRepository,
        notify: Arc<NotificationManager>,
        bus: SharedEventBus,
    ) -> Self {
        Self { repo, notify, bus }
    }

    /// Apply effects for every action in the execution, in order.
    pub async fn apply(&self, chain: &ParsedChain, execution: &mut ChainExecution) {
        let thresholds = chain
            .chain
            .schedule_metadata
            .as_ref()
            .and_then(|m| m.get("thresholds"))
            .and_then(|t| serde_json::from_value::<Thresholds>(t.clone()).ok())
            .unwrap_or_default();

        for record in execution.node_results.actions.iter_mut() {
            let value_text = match &record.command.value {
                Value::String(s) => s.clone(),
                v => v.to_string(),
            };

            let instance = self
                .repo
                .create_state_instance(NewStateInstance {
                    device_uuid: record.command.device_uuid.clone(),
                    state_name: record.command.state_name.clone(),
                    value: value_text.clone(),
                    initiated_by: "rule_chain".to_string(),
                    initiator_id: Some(chain.chain.id),
                    metadata: Some(serde_json::json!({
                        "ruleChainId": chain.chain.id,
                        "ruleChainName": chain.chain.name,
                        "nodeId": record.node_id,
                    })),
                })
                .await;

            let instance = match instance {
                Ok(instance) => instance,
                Err(e) => {
                    tracing::warn!(
                        rule_chain_id = chain.chain.id,
                        device_uuid = %record.command.device_uuid,
                        state_name = %record.command.state_name,
                        error = %e,
                        "action state write failed"
                    );
                    record.status = "error".to_string();
                    continue;
                }
            };

            let priority = thresholds.priority_for(&value_text);
            self.notify
                .enqueue(Notification::state_change(
                    chain.chain.organization_id,
                    &record.command.device_uuid,
                    &record.command.state_name,
                    &value_text,
                    priority,
                ))
                .await;
            self.notify
                .enqueue(Notification::state_echo(
                    chain.chain.organization_id,
                    &record.command.device_uuid,
                    &record.command.state_name,
                    &value_text,
                ))
                .await;
            self.bus.publish_with_source(
                BusEvent::StateChanged {
                    organization_id: chain.chain.organization_id,
                    device_uuid: record.command.device_uuid.clone(),
                    state_name: record.command.state_name.clone(),
                    value: value_text,
                    priority,
                    timestamp: instance.from_timestamp,
                },
                "engine",
            );
            record.notification_sent = true;
        }
    }
}
