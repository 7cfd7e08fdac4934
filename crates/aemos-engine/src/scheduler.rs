//! Schedule manager: cron-driven chain execution with repository auto-sync.
//!
//! Each schedule-enabled rule chain owns one entry here. A tick loop checks
//! due entries and enqueues `scheduleTrigger` events onto the engine queue,
//! never calling the interpreter directly, so backpressure and worker
//! policies apply to cron fires exactly as to telemetry.
//!
//! Auto-sync reconciles the in-memory entries against the repository on an
//! interval (and immediately when the engine signals a chain mutation):
//! new ids get entries, changed schedule fields replace the entry, absent
//! ids are cancelled. The sync is idempotent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;

use aemos_core::{EngineEvent, Error, EventMetadata, Result, SchedulerConfig};
use aemos_ingress::EventSink;
use aemos_storage::{RuleChain, SharedRepository};

/// A parsed cron schedule. Implementations answer "when is the next fire
/// after this instant".
pub trait CronSchedule: Send + Sync {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Cron parsing seam, so tests (and other platforms) can plug their own.
pub trait CronBackend: Send + Sync {
    fn parse(&self, cron: &str, timezone: &str) -> Result<Box<dyn CronSchedule>>;
}

/// Backend over the `cron` crate with chrono-tz timezones.
pub struct StandardCron;

struct StandardSchedule {
    schedule: cron::Schedule,
    timezone: Tz,
}

impl CronSchedule for StandardSchedule {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.schedule
            .after(&local)
            .next()
            .map(|next| next.with_timezone(&Utc))
    }
}

impl CronBackend for StandardCron {
    fn parse(&self, cron: &str, timezone: &str) -> Result<Box<dyn CronSchedule>> {
        let normalized = normalize_cron(cron);
        let schedule = normalized
            .parse::<cron::Schedule>()
            .map_err(|e| Error::Validation(format!("invalid cron {cron:?}: {e}")))?;
        let timezone = timezone.parse::<Tz>().unwrap_or_else(|_| {
            tracing::warn!(timezone, "unknown timezone, falling back to UTC");
            Tz::UTC
        });
        Ok(Box::new(StandardSchedule { schedule, timezone }))
    }
}

/// The `cron` crate wants a seconds field; standard 5-field expressions get
/// one prepended. 6- and 7-field expressions pass through.
fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    }
}

/// One managed schedule.
pub struct ScheduleEntry {
    pub rule_chain_id: i64,
    pub organization_id: i64,
    pub cron: String,
    pub timezone: String,
    pub priority: u8,
    pub max_retries: u8,
    pub retry_delay_ms: u32,
    pub schedule_metadata: Option<Value>,
    pub enabled: bool,
    pub is_database_backed: bool,
    pub execution_count: u64,
    pub failure_count: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    schedule: Box<dyn CronSchedule>,
    next_fire: Option<DateTime<Utc>>,
    /// Snapshot of the chain row the entry was built from, for change
    /// detection during sync.
    source: RuleChain,
}

/// Counts from one auto-sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Cron schedule owner.
pub struct ScheduleManager {
    repo: SharedRepository,
    sink: Arc<dyn EventSink>,
    backend: Arc<dyn CronBackend>,
    config: SchedulerConfig,
    entries: RwLock<HashMap<i64, ScheduleEntry>>,
    running: Arc<RwLock<bool>>,
    sync_notify: Arc<Notify>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ScheduleManager {
    pub fn new(
        repo: SharedRepository,
        sink: Arc<dyn EventSink>,
        backend: Arc<dyn CronBackend>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            sink,
            backend,
            config,
            entries: RwLock::new(HashMap::new()),
            running: Arc::new(RwLock::new(false)),
            sync_notify: Arc::new(Notify::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Initial sync, then spawn the tick and auto-sync loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }
        self.sync_now().await?;

        let tick = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(manager.config.tick_interval_ms));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if !*manager.running.read().await {
                        break;
                    }
                    manager.fire_due().await;
                }
            })
        };

        let sync = {
            let manager = Arc::clone(self);
            let interval =
                Duration::from_millis(manager.config.effective_auto_sync_interval_ms());
            tokio::spawn(async move {
                loop {
                    // Wake on the interval or on a mutation signal.
                    let _ = tokio::time::timeout(interval, manager.sync_notify.notified()).await;
                    if !*manager.running.read().await {
                        break;
                    }
                    if let Err(e) = manager.sync_now().await {
                        tracing::error!(error = %e, "schedule auto-sync failed");
                    }
                }
            })
        };

        self.tasks.lock().extend([tick, sync]);
        tracing::info!(
            auto_sync_interval_ms = self.config.effective_auto_sync_interval_ms(),
            "schedule manager started"
        );
        Ok(())
    }

    /// Stop the loops.
    pub async fn shutdown(&self) {
        *self.running.write().await = false;
        self.sync_notify.notify_waiters();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("schedule manager stopped");
    }

    /// Signal that a rule chain changed; the auto-sync loop wakes up.
    pub fn notify_changed(&self) {
        self.sync_notify.notify_one();
    }

    /// Reconcile entries against the repository immediately.
    pub async fn sync_now(&self) -> Result<SyncSummary> {
        let chains = self
            .repo
            .schedule_enabled_chains()
            .await
            .map_err(Error::from)?;
        let now = Utc::now();
        let mut summary = SyncSummary::default();
        let mut entries = self.entries.write().await;

        let mut seen: Vec<i64> = Vec::with_capacity(chains.len());
        for chain in chains {
            seen.push(chain.id);
            match entries.get(&chain.id) {
                None => {
                    match self.build_entry(&chain, now) {
                        Ok(entry) => {
                            entries.insert(chain.id, entry);
                            summary.added += 1;
                        }
                        Err(e) => {
                            tracing::warn!(rule_chain_id = chain.id, error = %e, "skipping unschedulable chain");
                        }
                    }
                }
                Some(existing) if !existing.source.schedule_fields_eq(&chain) => {
                    // Cancel the old handle, create a new one.
                    let stats = (
                        existing.execution_count,
                        existing.failure_count,
                        existing.last_executed_at,
                    );
                    match self.build_entry(&chain, now) {
                        Ok(mut entry) => {
                            (
                                entry.execution_count,
                                entry.failure_count,
                                entry.last_executed_at,
                            ) = stats;
                            entries.insert(chain.id, entry);
                            summary.updated += 1;
                        }
                        Err(e) => {
                            entries.remove(&chain.id);
                            summary.removed += 1;
                            tracing::warn!(rule_chain_id = chain.id, error = %e, "chain no longer schedulable, cancelled");
                        }
                    }
                }
                Some(_) => {}
            }
        }

        let before = entries.len();
        entries.retain(|id, _| seen.contains(id));
        summary.removed += before - entries.len();

        if summary != SyncSummary::default() {
            tracing::info!(
                added = summary.added,
                updated = summary.updated,
                removed = summary.removed,
                "schedule sync complete"
            );
        }
        Ok(summary)
    }

    fn build_entry(&self, chain: &RuleChain, now: DateTime<Utc>) -> Result<ScheduleEntry> {
        let cron = chain
            .cron_expression
            .clone()
            .ok_or_else(|| Error::Validation(format!("chain {} has no cron expression", chain.id)))?;
        let timezone = if chain.timezone.is_empty() {
            self.config.default_timezone.clone()
        } else {
            chain.timezone.clone()
        };
        let schedule = self.backend.parse(&cron, &timezone)?;
        let next_fire = schedule.next_after(now);
        Ok(ScheduleEntry {
            rule_chain_id: chain.id,
            organization_id: chain.organization_id,
            cron,
            timezone,
            priority: chain.priority,
            max_retries: chain.max_retries,
            retry_delay_ms: chain.retry_delay_ms,
            schedule_metadata: chain.schedule_metadata.clone(),
            enabled: chain.schedule_enabled,
            is_database_backed: true,
            execution_count: 0,
            failure_count: 0,
            last_executed_at: None,
            schedule,
            next_fire,
            source: chain.clone(),
        })
    }

    /// Fire every due entry by enqueuing a schedule trigger.
    async fn fire_due(&self) {
        let now = Utc::now();
        let due: Vec<(i64, i64)> = {
            let mut entries = self.entries.write().await;
            let mut due = Vec::new();
            for entry in entries.values_mut() {
                if !entry.enabled {
                    continue;
                }
                let Some(next) = entry.next_fire else {
                    continue;
                };
                if now >= next {
                    due.push((entry.rule_chain_id, entry.organization_id));
                    entry.next_fire = entry.schedule.next_after(now);
                    if entry.next_fire.is_none() {
                        // No more occurrences.
                        entry.enabled = false;
                    }
                }
            }
            due
        };

        for (rule_chain_id, organization_id) in due {
            let event = EngineEvent::ScheduleTrigger {
                rule_chain_id,
                organization_id,
                attempt: 0,
            };
            match self
                .sink
                .submit(event, EventMetadata::new("scheduler"))
                .await
            {
                Ok(()) => {
                    tracing::debug!(rule_chain_id, "schedule trigger enqueued");
                }
                Err(e) => {
                    tracing::warn!(rule_chain_id, error = %e, "schedule trigger rejected");
                    self.record_result(rule_chain_id, false).await;
                }
            }
        }
    }

    /// Record an execution outcome against the schedule stats.
    pub async fn record_result(&self, rule_chain_id: i64, success: bool) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&rule_chain_id) {
            entry.execution_count += 1;
            entry.last_executed_at = Some(Utc::now());
            if !success {
                entry.failure_count += 1;
            }
        }
    }

    /// Retry policy for a chain, `(max_retries, retry_delay_ms)`.
    pub async fn retry_policy(&self, rule_chain_id: i64) -> Option<(u8, u32)> {
        let entries = self.entries.read().await;
        entries
            .get(&rule_chain_id)
            .map(|e| (e.max_retries, e.retry_delay_ms))
    }

    /// Number of managed schedules.
    pub async fn schedule_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Stats snapshot for one schedule:
    /// `(execution_count, failure_count, last_executed_at)`.
    pub async fn schedule_stats(
        &self,
        rule_chain_id: i64,
    ) -> Option<(u64, u64, Option<DateTime<Utc>>)> {
        let entries = self.entries.read().await;
        entries.get(&rule_chain_id).map(|e| {
            (
                e.execution_count,
                e.failure_count,
                e.last_executed_at,
            )
        })
    }

    /// Next fire time for one schedule.
    pub async fn next_fire(&self, rule_chain_id: i64) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().await;
        entries.get(&rule_chain_id).and_then(|e| e.next_fire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aemos_storage::{ExecutionType, MemoryRepository, Repository};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<EngineEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn submit(&self, event: EngineEvent, _meta: EventMetadata) -> aemos_core::Result<()> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    fn scheduled_chain(name: &str, cron: &str) -> RuleChain {
        RuleChain {
            id: 0,
            name: name.into(),
            organization_id: 1,
            schedule_enabled: true,
            cron_expression: Some(cron.into()),
            timezone: "UTC".into(),
            priority: 50,
            max_retries: 2,
            retry_delay_ms: 100,
            schedule_metadata: None,
            execution_type: ExecutionType::ScheduleOnly,
            last_executed_at: None,
            last_error_at: None,
            execution_count: 0,
            failure_count: 0,
        }
    }

    fn manager(
        repo: Arc<MemoryRepository>,
    ) -> (Arc<ScheduleManager>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let manager = ScheduleManager::new(
            repo as SharedRepository,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            Arc::new(StandardCron),
            SchedulerConfig::default(),
        );
        (manager, sink)
    }

    #[test]
    fn five_field_cron_gets_a_seconds_field() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("*/10 * * * * *"), "*/10 * * * * *");
    }

    #[test]
    fn standard_backend_parses_both_widths() {
        let backend = StandardCron;
        assert!(backend.parse("0 * * * *", "UTC").is_ok());
        assert!(backend.parse("*/10 * * * * *", "UTC").is_ok());
        assert!(backend.parse("not a cron", "UTC").is_err());
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let backend = StandardCron;
        let schedule = backend.parse("0 * * * *", "Mars/Olympus").unwrap();
        assert!(schedule.next_after(Utc::now()).is_some());
    }

    #[tokio::test]
    async fn sync_adds_new_schedules() {
        let repo = Arc::new(MemoryRepository::new());
        repo.add_rule_chain(scheduled_chain("r1", "0 * * * *"), vec![]);
        let (manager, _) = manager(Arc::clone(&repo));

        let summary = manager.sync_now().await.unwrap();
        assert_eq!(summary.added, 1);
        assert_eq!(manager.schedule_count().await, 1);
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let repo = Arc::new(MemoryRepository::new());
        repo.add_rule_chain(scheduled_chain("r1", "0 * * * *"), vec![]);
        let (manager, _) = manager(Arc::clone(&repo));

        manager.sync_now().await.unwrap();
        let summary = manager.sync_now().await.unwrap();
        assert_eq!(summary, SyncSummary::default());
        assert_eq!(manager.schedule_count().await, 1);
    }

    #[tokio::test]
    async fn sync_replaces_changed_cron() {
        let repo = Arc::new(MemoryRepository::new());
        let chain = repo.add_rule_chain(scheduled_chain("r3", "0 * * * *"), vec![]);
        let (manager, _) = manager(Arc::clone(&repo));
        manager.sync_now().await.unwrap();

        let mut updated = chain.clone();
        updated.cron_expression = Some("*/5 * * * *".into());
        repo.update_rule_chain(updated).await.unwrap();

        let summary = manager.sync_now().await.unwrap();
        assert_eq!(summary.updated, 1);

        // The replaced handle fires on the new cadence: next fire is at
        // most five minutes out.
        let next = manager.next_fire(chain.id).await.unwrap();
        assert!(next <= Utc::now() + chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn sync_cancels_disabled_schedules() {
        let repo = Arc::new(MemoryRepository::new());
        let chain = repo.add_rule_chain(scheduled_chain("r1", "0 * * * *"), vec![]);
        let (manager, _) = manager(Arc::clone(&repo));
        manager.sync_now().await.unwrap();

        let mut updated = chain.clone();
        updated.schedule_enabled = false;
        repo.update_rule_chain(updated).await.unwrap();

        let summary = manager.sync_now().await.unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(manager.schedule_count().await, 0);
    }

    #[tokio::test]
    async fn sync_keeps_stats_across_updates() {
        let repo = Arc::new(MemoryRepository::new());
        let chain = repo.add_rule_chain(scheduled_chain("r1", "0 * * * *"), vec![]);
        let (manager, _) = manager(Arc::clone(&repo));
        manager.sync_now().await.unwrap();
        manager.record_result(chain.id, true).await;
        manager.record_result(chain.id, false).await;

        let mut updated = chain.clone();
        updated.cron_expression = Some("*/5 * * * *".into());
        repo.update_rule_chain(updated).await.unwrap();
        manager.sync_now().await.unwrap();

        let (executions, failures, last) = manager.schedule_stats(chain.id).await.unwrap();
        assert_eq!(executions, 2);
        assert_eq!(failures, 1);
        assert!(last.is_some());
    }

    #[tokio::test]
    async fn due_entries_enqueue_schedule_triggers() {
        let repo = Arc::new(MemoryRepository::new());
        let chain = repo.add_rule_chain(scheduled_chain("r2", "*/10 * * * * *"), vec![]);
        let (manager, sink) = manager(Arc::clone(&repo));
        manager.sync_now().await.unwrap();

        // Force the entry due and fire.
        {
            let mut entries = manager.entries.write().await;
            let entry = entries.get_mut(&chain.id).unwrap();
            entry.next_fire = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        manager.fire_due().await;

        let events = sink.events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            EngineEvent::ScheduleTrigger {
                rule_chain_id,
                organization_id: 1,
                attempt: 0,
            } if rule_chain_id == chain.id
        ));

        // Next fire was recomputed into the future.
        drop(events);
        assert!(manager.next_fire(chain.id).await.unwrap() > Utc::now() - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn retry_policy_reflects_the_chain() {
        let repo = Arc::new(MemoryRepository::new());
        let chain = repo.add_rule_chain(scheduled_chain("r1", "0 * * * *"), vec![]);
        let (manager, _) = manager(Arc::clone(&repo));
        manager.sync_now().await.unwrap();

        assert_eq!(manager.retry_policy(chain.id).await, Some((2, 100)));
        assert_eq!(manager.retry_policy(999).await, None);
    }
}
