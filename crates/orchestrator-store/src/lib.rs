//! Durable persistence for the TDD task orchestrator.
//!
//! ```text
//!   +------------------+       +----------------------+
//!   |  TaskStore trait |<------|  PostgresTaskStore    |
//!   |  (this crate)    |       |  (production)         |
//!   +------------------+       +----------------------+
//!            ^
//!            |
//!   +----------------------+
//!   |  InMemoryTaskStore   |
//!   |  (tests, embedding)  |
//!   +----------------------+
//! ```
//!
//! Every mutation that could race with another writer (claiming a task, updating a circuit
//! breaker row) is modeled as a conditional update returning `bool`/`Option` rather than an
//! exception. Callers re-read and retry, or move on to the next candidate — see
//! [`TaskStore::claim_task`] and [`TaskStore::update_circuit`].

pub mod config;
pub mod error;
pub mod model;
pub mod store;

pub mod memory;
pub mod postgres;

pub mod prelude {
    pub use crate::config::{clamp_config_int, CONFIG_BOUNDS};
    pub use crate::error::StoreError;
    pub use crate::model::*;
    pub use crate::store::TaskStore;
}

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use prelude::*;
