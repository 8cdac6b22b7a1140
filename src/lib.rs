//! Predict the per-iteration runtime of a parallelization strategy for a
//! tensor-operator graph on a multi-node GPU machine. One `Simulator` per
//! search worker; `simulate_runtime` is called once per candidate strategy.

#![deny(bare_trait_objects)]
#![warn(clippy::all)]

mod cost;
mod dot;
mod machine;
mod ops;
mod simulator;
mod task;

pub use cost::Workspace;
pub use machine::{Device, DeviceId, MachineConfig, SimError, Topology};
pub use ops::{
    CompMode, CostMetrics, DataType, DeviceType, Domain, Model, ModelConfig, Op, OpId, OpType,
    ParallelConfig, Strategy, MAX_DIM,
};
pub use simulator::Simulator;
pub use task::{SimTask, TaskId, TaskKind};
