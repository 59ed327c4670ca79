//! Media worker pool and supervision.

pub mod pool;
pub mod supervisor;

pub use pool::{PoolStats, WorkerId, WorkerInfo, WorkerPool};
pub use supervisor::{SupervisorSettings, WorkerSupervisor};
