//! Worker instances: launching, supervising and talking to them.

pub mod log_reader;
pub mod manager;
mod monitor;
pub mod protocol;
pub mod worker;

pub use log_reader::LogFormat;
pub use manager::{
    InstanceManager, InstanceStatus, InstanceSummary, ManagerSettings, SpawnRequest, WaitOutcome,
    WaitTarget,
};
pub use worker::{
    ExecutionProfile, ExitClass, ProcessLauncher, WorkerCommand, WorkerExit, WorkerLauncher,
    WorkerOutput, WorkerProcess,
};
