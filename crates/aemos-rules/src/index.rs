//! Reverse index from entities to the chains that depend on them.
//!
//! Resolution is the hot path: an incoming event maps to its candidate
//! chains in O(1). The index is copy-on-write: mutators build a fresh
//! snapshot and swap the shared pointer, so readers never block and never
//! see a half-built index. Chain configs are parsed exactly once, when the
//! snapshot is built.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::chain::ParsedChain;
use crate::error::Result;
use crate::expr::SourceType;
use aemos_storage::SharedRepository;

/// Immutable view of the index at one point in time.
#[derive(Default)]
pub struct IndexSnapshot {
    /// org -> sensor uuid -> chain ids.
    by_sensor: HashMap<i64, HashMap<String, Vec<i64>>>,
    /// org -> device uuid -> chain ids.
    by_device: HashMap<i64, HashMap<String, Vec<i64>>>,
    /// org -> chain ids with no entity dependency.
    by_organization: HashMap<i64, Vec<i64>>,
    /// Parsed chains by id.
    chains: HashMap<i64, Arc<ParsedChain>>,
}

impl IndexSnapshot {
    fn insert_chain(&mut self, parsed: Arc<ParsedChain>) {
        let org = parsed.chain.organization_id;
        let id = parsed.chain.id;

        if parsed.deps.is_empty() {
            self.by_organization.entry(org).or_default().push(id);
        } else {
            for dep in &parsed.deps {
                let map = match dep.source_type {
                    SourceType::Sensor => self.by_sensor.entry(org).or_default(),
                    SourceType::Device => self.by_device.entry(org).or_default(),
                };
                let ids = map.entry(dep.uuid.clone()).or_default();
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        self.chains.insert(id, parsed);
    }

    fn chains_for_ids(&self, ids: impl IntoIterator<Item = i64>) -> Vec<Arc<ParsedChain>> {
        let mut seen = Vec::new();
        let mut out = Vec::new();
        for id in ids {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            if let Some(chain) = self.chains.get(&id) {
                out.push(Arc::clone(chain));
            }
        }
        out
    }

    /// Chains affected by a sensor event: sensor-keyed plus org-wide.
    pub fn resolve_sensor(&self, organization_id: i64, sensor_uuid: &str) -> Vec<Arc<ParsedChain>> {
        let keyed = self
            .by_sensor
            .get(&organization_id)
            .and_then(|m| m.get(sensor_uuid))
            .into_iter()
            .flatten()
            .copied();
        let org_wide = self
            .by_organization
            .get(&organization_id)
            .into_iter()
            .flatten()
            .copied();
        self.chains_for_ids(keyed.chain(org_wide))
    }

    /// Chains affected by a device event: device-keyed plus org-wide.
    pub fn resolve_device(&self, organization_id: i64, device_uuid: &str) -> Vec<Arc<ParsedChain>> {
        let keyed = self
            .by_device
            .get(&organization_id)
            .and_then(|m| m.get(device_uuid))
            .into_iter()
            .flatten()
            .copied();
        let org_wide = self
            .by_organization
            .get(&organization_id)
            .into_iter()
            .flatten()
            .copied();
        self.chains_for_ids(keyed.chain(org_wide))
    }

    /// A specific chain, if indexed.
    pub fn chain(&self, rule_chain_id: i64) -> Option<Arc<ParsedChain>> {
        self.chains.get(&rule_chain_id).cloned()
    }

    /// Number of indexed chains.
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

/// Copy-on-write chain index.
pub struct ChainIndex {
    repo: SharedRepository,
    snapshot: RwLock<Arc<IndexSnapshot>>,
}

impl ChainIndex {
    pub fn new(repo: SharedRepository) -> Self {
        Self {
            repo,
            snapshot: RwLock::new(Arc::new(IndexSnapshot::default())),
        }
    }

    /// Current snapshot. Cheap; callers hold it for the whole event.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Rebuild the whole index from the repository.
    ///
    /// Chains whose configs fail to parse are skipped with a warning; one
    /// broken chain must not take down resolution for the rest.
    pub async fn rebuild(&self) -> Result<()> {
        let chains = self.repo.rule_chains().await?;
        let mut next = IndexSnapshot::default();
        for chain in chains {
            let nodes = self.repo.rule_chain_nodes(chain.id).await?;
            let chain_id = chain.id;
            match ParsedChain::parse(chain, nodes) {
                Ok(parsed) => next.insert_chain(Arc::new(parsed)),
                Err(e) => {
                    tracing::warn!(rule_chain_id = chain_id, error = %e, "skipping unparseable chain");
                }
            }
        }
        let count = next.len();
        *self.snapshot.write() = Arc::new(next);
        tracing::debug!(chains = count, "rule-chain index rebuilt");
        Ok(())
    }

    /// Re-index one chain after a mutation, or drop it after deletion.
    ///
    /// Builds the new snapshot from the current one minus the chain, then
    /// re-inserts the fresh definition when the repository still has it.
    pub async fn invalidate(&self, rule_chain_id: i64) -> Result<()> {
        let fresh = match self.repo.rule_chain(rule_chain_id).await? {
            Some(chain) => {
                let nodes = self.repo.rule_chain_nodes(rule_chain_id).await?;
                match ParsedChain::parse(chain, nodes) {
                    Ok(parsed) => Some(Arc::new(parsed)),
                    Err(e) => {
                        tracing::warn!(rule_chain_id, error = %e, "chain no longer parseable, dropping from index");
                        None
                    }
                }
            }
            None => None,
        };

        let current = self.snapshot();
        let mut next = IndexSnapshot::default();
        for parsed in current.chains.values() {
            if parsed.chain.id != rule_chain_id {
                next.insert_chain(Arc::clone(parsed));
            }
        }
        if let Some(parsed) = fresh {
            next.insert_chain(parsed);
        }
        *self.snapshot.write() = Arc::new(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aemos_storage::{
        ExecutionType, MemoryRepository, NodeType, Repository, RuleChain, RuleChainNode,
    };

    fn chain_row(org: i64, name: &str) -> RuleChain {
        RuleChain {
            id: 0,
            name: name.into(),
            organization_id: org,
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

    fn filter_node(name: &str, uuid: &str) -> RuleChainNode {
        RuleChainNode {
            id: 0,
            rule_chain_id: 0,
            name: name.into(),
            node_type: NodeType::Filter,
            config: format!(
                r#"{{"sourceType":"sensor","UUID":"{uuid}","key":"temp","operator":">","value":30}}"#
            ),
            next_node_id: None,
        }
    }

    #[tokio::test]
    async fn resolves_by_sensor_uuid() {
        let repo = Arc::new(MemoryRepository::new());
        let c1 = repo.add_rule_chain(chain_row(1, "r1"), vec![filter_node("f", "s1")]);
        repo.add_rule_chain(chain_row(1, "r2"), vec![filter_node("f", "s2")]);

        let index = ChainIndex::new(repo);
        index.rebuild().await.unwrap();

        let snapshot = index.snapshot();
        let hits = snapshot.resolve_sensor(1, "s1");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chain.id, c1.id);
        assert!(snapshot.resolve_sensor(1, "s9").is_empty());
        assert!(snapshot.resolve_sensor(2, "s1").is_empty());
    }

    #[tokio::test]
    async fn chains_without_deps_index_by_organization() {
        let repo = Arc::new(MemoryRepository::new());
        let bare = repo.add_rule_chain(chain_row(1, "bare"), vec![]);

        let index = ChainIndex::new(repo);
        index.rebuild().await.unwrap();

        let snapshot = index.snapshot();
        // Org-wide chains resolve for every entity event in the org.
        let hits = snapshot.resolve_sensor(1, "anything");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chain.id, bare.id);
        assert_eq!(snapshot.resolve_device(1, "d1").len(), 1);
    }

    #[tokio::test]
    async fn invalidate_picks_up_mutations() {
        let repo = Arc::new(MemoryRepository::new());
        let chain = repo.add_rule_chain(chain_row(1, "r1"), vec![filter_node("f", "s1")]);

        let index = ChainIndex::new(Arc::clone(&repo) as SharedRepository);
        index.rebuild().await.unwrap();
        assert_eq!(index.snapshot().resolve_sensor(1, "s1").len(), 1);

        // Mutate the chain's name and re-index.
        let mut updated = chain.clone();
        updated.name = "renamed".into();
        repo.update_rule_chain(updated).await.unwrap();
        index.invalidate(chain.id).await.unwrap();

        let hits = index.snapshot().resolve_sensor(1, "s1");
        assert_eq!(hits[0].chain.name, "renamed");
    }

    #[tokio::test]
    async fn old_snapshots_stay_valid_across_swaps() {
        let repo = Arc::new(MemoryRepository::new());
        let chain = repo.add_rule_chain(chain_row(1, "r1"), vec![filter_node("f", "s1")]);

        let index = ChainIndex::new(repo);
        index.rebuild().await.unwrap();

        let held = index.snapshot();
        index.invalidate(chain.id).await.unwrap();

        // The held snapshot still resolves; new snapshots see the rebuild.
        assert_eq!(held.resolve_sensor(1, "s1").len(), 1);
        assert_eq!(index.snapshot().resolve_sensor(1, "s1").len(), 1);
    }

    #[tokio::test]
    async fn unparseable_chains_are_skipped() {
        let repo = Arc::new(MemoryRepository::new());
        repo.add_rule_chain(chain_row(1, "good"), vec![filter_node("f", "s1")]);
        let mut bad = filter_node("f", "s2");
        bad.config = "{broken".into();
        repo.add_rule_chain(chain_row(1, "bad"), vec![bad]);

        let index = ChainIndex::new(repo);
        index.rebuild().await.unwrap();

        let snapshot = index.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.resolve_sensor(1, "s2").len(), 0);
    }
}
