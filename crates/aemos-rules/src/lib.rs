//! Rule-chain machinery: expression AST, reverse index, interpreter, and
//! input collection.
//!
//! A chain's serialized node configs are parsed once into the typed AST
//! when the chain enters the [`ChainIndex`]; events then resolve their
//! candidate chains through the index, [`DataCollector`] gathers the newest
//! entity values the chain reads, and [`interpreter::execute`] walks the
//! nodes under the event deadline.

pub mod chain;
pub mod collect;
pub mod error;
pub mod expr;
pub mod index;
pub mod interpreter;
pub mod scope;

pub use chain::{ParsedChain, ParsedNode};
pub use collect::{CollectionOutcome, DataCollector, TimeoutDetails};
pub use error::{Result, RuleError};
pub use expr::{
    ActionCommand, ActionExpr, FilterExpr, GroupExpr, GroupOp, LeafDep, LeafExpr, NodeConfig,
    Operator, SourceType, TransformExpr, TransformOp,
};
pub use index::{ChainIndex, IndexSnapshot};
pub use interpreter::{
    execute, ActionRecord, ChainExecution, ExecutionDetails, ExecutionSummary, FilterResult,
    NodeResults, TransformResult,
};
pub use scope::{DataScope, ScopedValue};
