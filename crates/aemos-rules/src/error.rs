//! Error types for the rules crate.

/// Failures while parsing or executing rule chains.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("parse error in chain {rule_chain_id}: {message}")]
    Parse { rule_chain_id: i64, message: String },

    #[error("cycle detected in chain {rule_chain_id} at node {node}")]
    Cycle { rule_chain_id: i64, node: String },

    #[error("evaluation error: {0}")]
    Eval(String),

    #[error(transparent)]
    Storage(#[from] aemos_storage::StorageError),
}

/// Result type for rule operations.
pub type Result<T> = std::result::Result<T, RuleError>;

impl From<RuleError> for aemos_core::Error {
    fn from(e: RuleError) -> Self {
        match e {
            RuleError::Parse { .. } | RuleError::Cycle { .. } => {
                aemos_core::Error::Validation(e.to_string())
            }
            RuleError::Eval(s) => aemos_core::Error::RuleEval(s),
            RuleError::Storage(s) => s.into(),
        }
    }
}
