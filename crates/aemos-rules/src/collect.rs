//! Latest-value collection for chain inputs.
//!
//! Before a chain runs, the engine collects the newest value for every
//! `(sourceType, UUID, key)` leaf the chain reads. Sensor leaves join
//! through TelemetryData to the latest DataStream row and coerce the text
//! value per the channel datatype; device leaves read the latest open
//! DeviceStateInstance.
//!
//! Collection is bounded. When the bound fires the outcome is an empty
//! scope rather than a failed event: every filter then evaluates false and
//! the chain short-circuits. Non-timeout repository errors propagate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use aemos_core::{Deadline, Error};
use aemos_storage::SharedRepository;

use crate::expr::{LeafDep, SourceType};
use crate::scope::{DataScope, ScopedValue};

/// Details recorded when collection hits its bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutDetails {
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Collected scope plus timeout bookkeeping.
#[derive(Debug, Clone)]
pub struct CollectionOutcome {
    pub scope: DataScope,
    pub timeout_details: Option<TimeoutDetails>,
}

/// Collects chain inputs from the repository.
pub struct DataCollector {
    repo: SharedRepository,
    timeout: Duration,
}

impl DataCollector {
    pub fn new(repo: SharedRepository, timeout: Duration) -> Self {
        Self { repo, timeout }
    }

    /// Collect the latest value for each dependency, bounded by the
    /// collector timeout and the event deadline, whichever is earlier.
    pub async fn collect(
        &self,
        deps: &[LeafDep],
        deadline: Deadline,
    ) -> Result<CollectionOutcome, Error> {
        let bound = deadline.bounded(self.timeout);
        let started = tokio::time::Instant::now();

        let result = tokio::time::timeout_at(bound.instant(), self.collect_inner(deps)).await;
        match result {
            Ok(Ok(scope)) => Ok(CollectionOutcome {
                scope,
                timeout_details: None,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let elapsed = started.elapsed();
                tracing::warn!(
                    deps = deps.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "data collection timed out, evaluating against empty scope"
                );
                Ok(CollectionOutcome {
                    scope: DataScope::new(),
                    timeout_details: Some(TimeoutDetails {
                        timed_out: true,
                        duration_ms: elapsed.as_millis() as u64,
                    }),
                })
            }
        }
    }

    async fn collect_inner(&self, deps: &[LeafDep]) -> Result<DataScope, Error> {
        let mut scope = DataScope::new();
        for dep in deps {
            match dep.source_type {
                SourceType::Sensor => {
                    if let Some((td, row)) = self
                        .repo
                        .latest_data_stream(&dep.uuid, &dep.key)
                        .await
                        .map_err(aemos_core::Error::from)?
                    {
                        scope.insert(
                            SourceType::Sensor,
                            dep.uuid.clone(),
                            dep.key.clone(),
                            ScopedValue::at(td.datatype.coerce(&row.value), row.received_at),
                        );
                    }
                }
                SourceType::Device => {
                    if let Some(instance) = self
                        .repo
                        .latest_open_state_instance(&dep.uuid, &dep.key)
                        .await
                        .map_err(aemos_core::Error::from)?
                    {
                        scope.insert(
                            SourceType::Device,
                            dep.uuid.clone(),
                            dep.key.clone(),
                            ScopedValue::at(
                                Value::String(instance.value.clone()),
                                instance.from_timestamp,
                            ),
                        );
                    }
                }
            }
        }
        Ok(scope)
    }
}
