//! A location-scoped rules engine.
//!
//! Facts, rules, and policy are partitioned into locations: independent
//! namespaces with in-memory indexes over durable storage. Incoming events
//! are matched against stored rules with a unification-style pattern
//! matcher; rules whose conditions hold have their actions dispatched to
//! an embedded script runtime or an HTTP endpoint.
//!
//! The crate is synchronous; callers bring their own threads (the server
//! crate drives it from a tokio blocking pool). Per-location concurrency is
//! a reader–writer lock; one rule's actions fan out over scoped threads
//! unless the rule asks for serial execution.

pub mod actions;
pub mod breaker;
pub mod cache;
pub mod control;
pub mod error;
pub mod fetch;
pub mod location;
pub mod manager;
pub mod matcher;
pub mod pattern_index;
pub mod pipeline;
pub mod query;
pub mod script;
pub mod sqlite;
pub mod storage;
pub mod term_index;

pub use control::Control;
pub use error::{Error, Result};
pub use location::{Location, SearchResult, SearchResults};
pub use manager::Manager;
pub use matcher::{match_pattern, Bindings};
pub use pipeline::{Disposition, EventState, Pipeline};
pub use script::{ScriptRuntime, StaticRuntime};
pub use storage::{MemStorage, Storage};
