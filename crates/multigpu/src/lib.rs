//! Multi-GPU batch orchestration: one worker process per device, disjoint
//! size-balanced workloads, line-protocol task/result streams, aggregate
//! accounting.

pub mod aggregator;
pub mod allocator;
pub mod device;
pub mod error;
pub mod messages;
pub mod orchestrator;
pub mod supervisor;

pub use aggregator::{BatchStats, FailedFile, GpuStats, ProgressAggregator};
pub use device::{Device, DeviceProbe, GpuDetector, NvidiaSmi};
pub use error::{Error, Result};
pub use messages::{TaskMessage, WorkItem, WorkerResult};
pub use orchestrator::{Orchestrator, OrchestratorOptions, RunRequest};
pub use supervisor::{WorkerCommand, WorkerShare, WorkerStatus, WorkerSupervisor};
