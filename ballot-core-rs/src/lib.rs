//! Ballot Core Library
//!
//! Lease-backed sessions, leader election and distributed mutexes over a
//! linearizable, revisioned key-value store. The store is reached through
//! the `Kv`, `Watcher` and `Lease` traits; `MemoryStore` implements them
//! in-process.

pub mod context;
pub mod election;
pub mod error;
pub mod history;
pub mod key;
pub mod memory;
pub mod mutex;
pub mod session;
pub mod store;
pub mod types;

pub use context::Context;
pub use election::{Election, ElectionState, Observer};
pub use error::{Error, Result};
pub use history::{LeadershipHistory, Violation};
pub use memory::{MemoryStore, MemoryStoreConfig};
pub use mutex::Mutex;
pub use session::{Session, SessionConfig, DEFAULT_SESSION_TTL};
pub use store::{Client, Kv, Lease, Watcher};
pub use types::*;
