//! crucible-engine: the dynamic workflow engine of the Crucible
//! knowledge refinery.
//!
//! A workflow is an ordered list of heterogeneous steps (llm, check,
//! sql, http). The engine:
//! - groups steps into stage groups by order rank,
//! - runs each group sequentially, fanning groups of two or more out to
//!   parallel sibling tasks with private context copies,
//! - enforces model grants at run time,
//! - persists every step run and an audit trail as it goes,
//! - retries failed attempts with per-attempt timeouts and linear
//!   backoff.
//!
//! [`Refinery`] wraps the engine with challenge/resolution entry points
//! over tree-shaped claims, and [`ModelDiscovery`] keeps the model
//! catalogue synchronized with the configured backends.

mod context;
mod discovery;
mod engine;
mod error;
mod grants;
mod refine;
mod steps;
mod template;

pub use context::FlowContext;
pub use discovery::ModelDiscovery;
pub use engine::{RunRequest, WorkflowEngine};
pub use error::EngineError;
pub use grants::{derive_provider, evaluate, GrantDecision};
pub use refine::{ClaimNode, NodeKind, Principal, Refinery};
pub use steps::StepOutcome;
pub use template::render;
