//! Parsed rule chains and their execution order.
//!
//! A chain's nodes are parsed once, ordered once, and the walk is validated
//! for cycles up front; the interpreter then only follows a precomputed
//! path.

use crate::error::{Result, RuleError};
use crate::expr::{LeafDep, NodeConfig};
use aemos_storage::{NodeType, RuleChain, RuleChainNode};

/// One parsed node.
#[derive(Debug, Clone)]
pub struct ParsedNode {
    pub id: i64,
    pub name: String,
    pub node_type: NodeType,
    pub config: NodeConfig,
    pub next_node_id: Option<i64>,
}

/// A chain with parsed configs and a validated execution order.
#[derive(Debug, Clone)]
pub struct ParsedChain {
    pub chain: RuleChain,
    /// Nodes in execution order (the precomputed walk).
    pub nodes: Vec<ParsedNode>,
    /// Number of nodes defined on the chain, including any the walk skips.
    pub total_nodes: usize,
    /// Unique entity values the chain reads.
    pub deps: Vec<LeafDep>,
}

impl ParsedChain {
    /// Parse node configs and compute the execution walk.
    ///
    /// Base order is `(type rank, name)`: filters, then transforms, then
    /// actions, name as tie-break. A `next_node_id` link overrides the step
    /// after the node carrying it; otherwise the walk continues with the
    /// next node by base order. Revisiting a node is a cycle and rejects
    /// the chain.
    pub fn parse(chain: RuleChain, mut rows: Vec<RuleChainNode>) -> Result<Self> {
        rows.sort_by(|a, b| {
            a.node_type
                .rank()
                .cmp(&b.node_type.rank())
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut parsed = Vec::with_capacity(rows.len());
        for row in &rows {
            let config = NodeConfig::parse(row.node_type, &row.config).map_err(|e| {
                RuleError::Parse {
                    rule_chain_id: chain.id,
                    message: format!("node {}: {e}", row.name),
                }
            })?;
            parsed.push(ParsedNode {
                id: row.id,
                name: row.name.clone(),
                node_type: row.node_type,
                config,
                next_node_id: row.next_node_id,
            });
        }

        let walk = Self::compute_walk(chain.id, &parsed)?;
        let ordered: Vec<ParsedNode> = walk.into_iter().map(|i| parsed[i].clone()).collect();

        let mut deps = Vec::new();
        for node in &ordered {
            if let NodeConfig::Filter(expr) = &node.config {
                expr.collect_deps(&mut deps);
            }
        }

        Ok(Self {
            total_nodes: parsed.len(),
            chain,
            nodes: ordered,
            deps,
        })
    }

    fn compute_walk(chain_id: i64, nodes: &[ParsedNode]) -> Result<Vec<usize>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let mut walk = Vec::with_capacity(nodes.len());
        let mut visited = vec![false; nodes.len()];
        let mut current = Some(0usize);

        while let Some(pos) = current {
            if visited[pos] {
                return Err(RuleError::Cycle {
                    rule_chain_id: chain_id,
                    node: nodes[pos].name.clone(),
                });
            }
            visited[pos] = true;
            walk.push(pos);

            current = match nodes[pos].next_node_id {
                Some(next_id) => {
                    let target = nodes.iter().position(|n| n.id == next_id);
                    match target {
                        Some(t) => Some(t),
                        None => {
                            return Err(RuleError::Parse {
                                rule_chain_id: chain_id,
                                message: format!(
                                    "node {} links to unknown node id {next_id}",
                                    nodes[pos].name
                                ),
                            })
                        }
                    }
                }
                None => {
                    // Next unvisited node by base order after this one.
                    ((pos + 1)..nodes.len()).find(|&i| !visited[i])
                }
            };
        }
        Ok(walk)
    }
}
