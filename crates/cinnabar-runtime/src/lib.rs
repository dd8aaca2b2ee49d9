//! Session layer for the Cinnabar inference engine.
//!
//! Orchestrates full-graph execution: binds named inputs to tensors, invokes
//! each node's kernel in dependency order through the execution-provider
//! dispatch, collects outputs, and supports both the synchronous by-name
//! path and the explicitly-bound zero-copy path.

pub mod binding;
pub mod env;
pub mod options;
pub mod session;

pub use binding::IoBinding;
pub use env::Env;
pub use options::{ProviderConfig, RunOptions, SessionOptions};
pub use session::{ProfileEvent, Session};
