//! gridpool-selection — decides which nodes satisfy a request.
//!
//! ```text
//!   Criteria ──► CriteriaMatcher::validate ──► ok / CriteriaError
//!                        │
//!   registry nodes ──► CriteriaMatcher::select
//!                        ├── is_candidate      (state, locks, lists, tokens)
//!                        ├── ScriptEvaluator   (compiled once, run per node)
//!                        └── topology::select  (host placement)
//!                        ▼
//!                     NodeSet { nodes, extra_nodes }
//! ```

pub mod matcher;
pub mod script;
pub mod topology;

pub use matcher::{CriteriaMatcher, MatchReport};
pub use script::{CompiledScript, ExpressionEvaluator, ScriptAuthorizer, ScriptError, ScriptEvaluator, ScriptResult};
pub use topology::HostIndex;
