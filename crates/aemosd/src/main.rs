//! AEMOS core daemon.
//!
//! Wires the processing core together with explicit dependency injection:
//! repository → notification fan-out → engine → router → MQTT bridge →
//! schedule manager, then runs until interrupted and shuts the components
//! down in reverse order.
//!
//! Exit codes: 0 normal, 1 fatal configuration, 2 repository unreachable at
//! startup.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::OnceCell;

use aemos_core::{AemosConfig, EngineMetrics, EventBus};
use aemos_engine::{BackpressureController, Engine, ScheduleManager, StandardCron};
use aemos_ingress::{DeviceAuthenticator, EventSink, MessageRouter, MqttBridge};
use aemos_notify::{NotificationManager, Publisher};
use aemos_storage::{MemoryRepository, Repository, SharedRepository};

#[derive(Parser, Debug)]
#[command(name = "aemosd", about = "AEMOS telemetry and rule-engine core")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<AemosConfig> {
    match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            AemosConfig::from_json(&raw)
                .with_context(|| format!("parse config {}", path.display()))
        }
        None => {
            let mut config = AemosConfig::default();
            config.apply_env();
            config.validate().context("validate default config")?;
            Ok(config)
        }
    }
}

/// Event sink that forwards to the engine once it exists. The router is
/// constructed before the engine because the bridge needs it; nothing
/// publishes before `Engine::start` anyway.
struct DeferredSink(Arc<OnceCell<Arc<Engine>>>);

#[async_trait::async_trait]
impl EventSink for DeferredSink {
    async fn submit(
        &self,
        event: aemos_core::EngineEvent,
        metadata: aemos_core::EventMetadata,
    ) -> aemos_core::Result<()> {
        match self.0.get() {
            Some(engine) => engine.submit(event, metadata).await,
            None => Err(aemos_core::Error::Routing("engine not ready".to_string())),
        }
    }
}

/// Publisher that forwards to the MQTT bridge once it exists.
struct DeferredPublisher(Arc<OnceCell<Arc<MqttBridge>>>);

#[async_trait::async_trait]
impl Publisher for DeferredPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> aemos_core::Result<()> {
        match self.0.get() {
            Some(bridge) => bridge.publish(topic, payload).await,
            None => Err(aemos_core::Error::Routing("bridge not ready".to_string())),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal configuration error");
            return ExitCode::from(1);
        }
    };

    // The relational backend is deployed separately; the bundled reference
    // backend keeps the daemon self-contained. A startup ping decides
    // whether the repository is reachable at all.
    let repo: SharedRepository = Arc::new(MemoryRepository::new());
    if let Err(e) = repo.rule_chains().await {
        tracing::error!(error = %e, "repository unreachable at startup");
        return ExitCode::from(2);
    }

    let bus = Arc::new(EventBus::with_name("aemos"));
    let metrics = Arc::new(EngineMetrics::new(config.metrics.max_series_per_metric));

    let auth = Arc::new(DeviceAuthenticator::new(
        Arc::clone(&repo),
        config.ingress.clone(),
    ));
    let sweeper = auth.spawn_sweeper();

    // Router → notify → bridge → router is a construction cycle; the
    // engine and bridge slots are filled right after the pieces exist.
    let engine_slot: Arc<OnceCell<Arc<Engine>>> = Arc::new(OnceCell::new());
    let bridge_slot: Arc<OnceCell<Arc<MqttBridge>>> = Arc::new(OnceCell::new());

    let notify = NotificationManager::new(
        config.notify.clone(),
        Arc::new(DeferredPublisher(Arc::clone(&bridge_slot))) as Arc<dyn Publisher>,
    );
    let router = Arc::new(MessageRouter::new(
        Arc::clone(&repo),
        Arc::clone(&auth),
        Arc::new(DeferredSink(Arc::clone(&engine_slot))),
        Arc::clone(&bus),
        Arc::clone(&notify),
    ));
    let bridge = Arc::new(MqttBridge::new(config.ingress.clone(), Arc::clone(&router)));
    if bridge_slot.set(Arc::clone(&bridge)).is_err() {
        tracing::error!("bridge wired twice");
        return ExitCode::from(1);
    }
    notify.start();

    let engine = Engine::new(
        Arc::clone(&repo),
        Arc::clone(&bus),
        Arc::clone(&notify),
        Arc::clone(&metrics),
        config.engine.clone(),
        BackpressureController::new(config.backpressure.clone()),
    );
    if engine_slot.set(Arc::clone(&engine)).is_err() {
        tracing::error!("engine wired twice");
        return ExitCode::from(1);
    }
    if let Err(e) = engine.start().await {
        tracing::error!(error = %e, "engine failed to start");
        return ExitCode::from(2);
    }

    let scheduler = ScheduleManager::new(
        Arc::clone(&repo),
        Arc::clone(&engine) as Arc<dyn EventSink>,
        Arc::new(StandardCron),
        config.scheduler.clone(),
    );
    engine.set_schedule_manager(Arc::clone(&scheduler)).await;
    if let Err(e) = scheduler.start().await {
        tracing::error!(error = %e, "schedule manager failed to start");
        return ExitCode::from(2);
    }

    let bridge_task = match bridge.start().await {
        Ok(handle) => Some(handle),
        Err(e) => {
            // The daemon still serves CoAP/HTTP ingest without a broker.
            tracing::warn!(error = %e, "mqtt bridge unavailable, continuing without it");
            None
        }
    };

    tracing::info!("aemos core running");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "signal listener failed");
    }

    tracing::info!("shutting down");
    bridge.shutdown().await;
    if let Some(task) = bridge_task {
        task.abort();
    }
    scheduler.shutdown().await;
    engine.shutdown().await;
    notify.shutdown().await;
    sweeper.abort();

    ExitCode::from(0)
}
