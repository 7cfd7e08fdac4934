//! Full-path tests: seed a repository, index chains, collect inputs,
//! interpret.

use std::sync::Arc;
use std::time::Duration;

use aemos_core::Deadline;
use aemos_rules::{interpreter, ChainIndex, DataCollector, SourceType};
use aemos_storage::{
    Datatype, DeviceStatus, ExecutionType, MemoryRepository, NodeType, Repository, RuleChain,
    RuleChainNode, SensorStatus, SharedRepository,
};

fn chain_row(name: &str) -> RuleChain {
    RuleChain {
        id: 0,
        name: name.into(),
        organization_id: 1,
        schedule_enabled: false,
        cron_expression: None,
        timezone: "UTC".into(),
        priority: 50,
        max_retries: 0,
        retry_delay_ms: 0,
        schedule_metadata: None,
        execution_type: ExecutionType::Hybrid,
        last_executed_at: None,
        last_error_at: None,
        execution_count: 0,
        failure_count: 0,
    }
}

fn node(name: &str, node_type: NodeType, config: &str) -> RuleChainNode {
    RuleChainNode {
        id: 0,
        rule_chain_id: 0,
        name: name.into(),
        node_type,
        config: config.into(),
        next_node_id: None,
    }
}

async fn seeded_repo() -> Arc<MemoryRepository> {
    let repo = Arc::new(MemoryRepository::new());
    let sensor = repo.add_sensor("s1", "Sensor 1", SensorStatus::Active, 1);
    let temp = repo.add_telemetry_data(sensor.id, "temp", Datatype::Number);
    let device = repo.add_device("d1", "Device 1", DeviceStatus::Active, 1);
    repo.add_device_state(device.id, "door");
    repo.insert_data_stream(temp.id, "32".into()).await.unwrap();
    repo.seed_state_instance(
        "d1",
        "door",
        "open",
        chrono::Utc::now() - chrono::Duration::seconds(600),
    )
    .unwrap();
    repo
}

#[tokio::test]
async fn collected_scope_drives_a_mixed_filter() {
    let repo = seeded_repo().await;
    let chain = repo.add_rule_chain(
        chain_row("mixed"),
        vec![
            node(
                "hot-and-open",
                NodeType::Filter,
                r#"{
                    "type": "AND",
                    "expressions": [
                        {"sourceType":"sensor","UUID":"s1","key":"temp","operator":">","value":30},
                        {"sourceType":"device","UUID":"d1","key":"door","operator":"==","value":"open"}
                    ]
                }"#,
            ),
            node(
                "close-door",
                NodeType::Action,
                r#"{"type":"deviceCommand","command":{"deviceUuid":"d1","stateName":"door","value":"closed"}}"#,
            ),
        ],
    );

    let index = ChainIndex::new(Arc::clone(&repo) as SharedRepository);
    index.rebuild().await.unwrap();
    let snapshot = index.snapshot();

    // The chain is reachable from either entity it reads.
    assert_eq!(snapshot.resolve_sensor(1, "s1").len(), 1);
    assert_eq!(snapshot.resolve_device(1, "d1").len(), 1);

    let parsed = snapshot.chain(chain.id).unwrap();
    assert_eq!(parsed.deps.len(), 2);

    let collector = DataCollector::new(
        Arc::clone(&repo) as SharedRepository,
        Duration::from_secs(2),
    );
    let outcome = collector
        .collect(&parsed.deps, Deadline::after_ms(5_000))
        .await
        .unwrap();
    assert!(outcome
        .scope
        .get(SourceType::Sensor, "s1", "temp")
        .is_some());
    assert!(outcome
        .scope
        .get(SourceType::Device, "d1", "door")
        .is_some());

    let result = interpreter::execute(&parsed, outcome.scope, Deadline::after_ms(5_000));
    assert!(result.succeeded());
    assert!(result.summary.filters_passed);
    assert_eq!(result.summary.actions_executed, 1);
    assert_eq!(
        result.node_results.actions[0].command.state_name,
        "door"
    );
}

#[tokio::test]
async fn unknown_uuid_leaf_never_emits_actions() {
    // A filter reading an entity nobody has ever seen: the chain
    // short-circuits as a success with filters_passed false, and no
    // action is emitted.
    let repo = seeded_repo().await;
    let chain = repo.add_rule_chain(
        chain_row("ghost"),
        vec![
            node(
                "ghost-check",
                NodeType::Filter,
                r#"{"sourceType":"sensor","UUID":"ghost","key":"temp","operator":">","value":0}"#,
            ),
            node(
                "never",
                NodeType::Action,
                r#"{"type":"deviceCommand","command":{"deviceUuid":"d1","stateName":"door","value":"closed"}}"#,
            ),
        ],
    );

    let index = ChainIndex::new(Arc::clone(&repo) as SharedRepository);
    index.rebuild().await.unwrap();
    let parsed = index.snapshot().chain(chain.id).unwrap();

    let collector = DataCollector::new(
        Arc::clone(&repo) as SharedRepository,
        Duration::from_secs(2),
    );
    let outcome = collector
        .collect(&parsed.deps, Deadline::after_ms(5_000))
        .await
        .unwrap();

    let result = interpreter::execute(&parsed, outcome.scope, Deadline::after_ms(5_000));
    assert_eq!(result.status, "success");
    assert!(!result.summary.filters_passed);
    assert!(result.node_results.actions.is_empty());
}

#[tokio::test]
async fn transforms_see_collected_values() {
    let repo = seeded_repo().await;
    let chain = repo.add_rule_chain(
        chain_row("convert"),
        vec![
            node(
                "to-fahrenheit",
                NodeType::Transform,
                r#"{"key":"temp","operation":"multiply","operand":1.8}"#,
            ),
            node(
                "offset",
                NodeType::Transform,
                r#"{"key":"temp","operation":"add","operand":32}"#,
            ),
        ],
    );

    let index = ChainIndex::new(Arc::clone(&repo) as SharedRepository);
    index.rebuild().await.unwrap();
    let parsed = index.snapshot().chain(chain.id).unwrap();

    // No filter leaves, so nothing to collect; feed the scope directly.
    let mut scope = aemos_rules::DataScope::new();
    scope.insert(
        SourceType::Sensor,
        "s1",
        "temp",
        aemos_rules::ScopedValue::new(serde_json::json!(30.0)),
    );

    let result = interpreter::execute(&parsed, scope, Deadline::after_ms(5_000));
    assert!(result.succeeded());
    assert_eq!(result.summary.transformations_applied, 2);
    let final_temp = result
        .execution_details
        .final_data
        .get(SourceType::Sensor, "s1", "temp")
        .unwrap();
    assert_eq!(final_temp.value, serde_json::json!(86.0));
}

#[tokio::test]
async fn org_wide_chain_resolves_for_every_entity() {
    let repo = seeded_repo().await;
    // A chain with no filter leaves indexes under the organization
    // sentinel and rides along with every entity event in the org.
    repo.add_rule_chain(
        chain_row("org-wide"),
        vec![node(
            "always",
            NodeType::Action,
            r#"{"type":"deviceCommand","command":{"deviceUuid":"d1","stateName":"door","value":"closed"}}"#,
        )],
    );

    let index = ChainIndex::new(Arc::clone(&repo) as SharedRepository);
    index.rebuild().await.unwrap();
    let snapshot = index.snapshot();

    assert_eq!(snapshot.resolve_sensor(1, "s1").len(), 1);
    assert_eq!(snapshot.resolve_sensor(1, "anything-else").len(), 1);
    assert_eq!(snapshot.resolve_device(1, "d1").len(), 1);
    assert!(snapshot.resolve_sensor(2, "s1").is_empty());
}
