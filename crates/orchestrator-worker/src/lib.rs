//! Worker pool, claim queue, and GREEN retry loop for the TDD task orchestrator.

pub mod config;
pub mod error;
pub mod executor;
pub mod green;
pub mod pool;
pub mod worker;

pub use config::{GreenRetryConfig, WorkerLoopConfig, WorkerPoolConfig};
pub use error::WorkerError;
pub use executor::{StageExecutor, StageRequest, StageResult};
pub use green::run_green_retry_loop;
pub use pool::{PoolResult, WorkerPool};
pub use worker::{Worker, WorkerStats};
