pub mod cache;
pub mod circuit;
pub mod dispatch;
pub mod graph;
pub mod infra;
pub mod monitor;
pub mod worker;

pub use cache::{CacheStats, ResultCache};
pub use circuit::{Admission, CircuitBreaker, CircuitState, CircuitStatus};
pub use dispatch::{DispatchOutcome, FaultKind, NodeDispatcher};
pub use graph::{GraphEngine, NodeStatus, NodeTrace, RunOptions, RunReport, ValidationReport};
pub use infra::InfraGuard;
pub use monitor::{HealthLevel, HealthReport, QueueStats, WorkerHeartbeat, WorkerMonitor};
pub use worker::{enqueue, PollOutcome, QueueWorker};
