//! Error taxonomy shared across the AEMOS core.
//!
//! Every failure that crosses a component boundary maps to one of these
//! variants. The stable string codes returned by [`Error::code`] are part of
//! the wire contract: handlers embed them in response envelopes and metrics
//! label executions by them.

/// Core error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed envelope, topic, or path.
    #[error("validation error: {0}")]
    Validation(String),

    /// Bad or expired token, or a UUID mismatch between token and claim.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The referenced device does not exist.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The claimed device UUID is not a well-formed UUID.
    #[error("invalid device uuid: {0}")]
    InvalidDeviceUuid(String),

    /// The organization segment of a topic is not a valid identifier.
    #[error("invalid organization id: {0}")]
    InvalidOrgId(String),

    /// Data collection exceeded its deadline. Absorbed locally: the chain
    /// evaluates against an empty scope instead of failing the event.
    #[error("data collection timed out after {timeout_ms}ms for {source_type} {ids:?}")]
    DataCollectionTimeout {
        source_type: String,
        ids: Vec<String>,
        timeout_ms: u64,
    },

    /// The interpreter exceeded the event deadline mid-chain.
    #[error("rule chain {rule_chain_id} timed out after {timeout_ms}ms")]
    RuleChainTimeout { rule_chain_id: i64, timeout_ms: u64 },

    /// Unknown operator, invalid regex, or a type the operator forbids.
    #[error("rule evaluation error: {0}")]
    RuleEval(String),

    /// Admission control refused the event.
    #[error("backpressure rejected event")]
    BackpressureRejected,

    /// Internal invariant violation while routing a message.
    #[error("routing error: {0}")]
    Routing(String),

    /// Repository failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Fatal configuration problem.
    #[error("config error: {0}")]
    Config(String),

    /// (De)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Error::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Error::InvalidDeviceUuid(_) => "INVALID_DEVICE_UUID",
            Error::InvalidOrgId(_) => "INVALID_ORG_ID",
            Error::DataCollectionTimeout { .. } => "DATA_COLLECTION_TIMEOUT",
            Error::RuleChainTimeout { .. } => "RULE_CHAIN_TIMEOUT",
            Error::RuleEval(_) => "RULE_EVAL_ERROR",
            Error::BackpressureRejected => "BACKPRESSURE_REJECTED",
            Error::Routing(_) => "ROUTING_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether this error is a deadline exceedance.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::DataCollectionTimeout { .. } | Error::RuleChainTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;
