#![doc = include_str!("../readme.md")]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod job_runner;
pub mod monitoring;
pub mod pool;
pub mod simulation;
pub mod timer;
pub mod workload_generators;

pub use dispatcher::Dispatcher;
pub use error::{AllocationError, PlacementError, SimulationError};
pub use job::Job;
pub use job_runner::JobRunner;
pub use monitoring::StateMonitor;
pub use pool::{AllocationHandle, AllocationState, ResourcePool, SimplePool};
pub use simulation::{DispatchSimulation, RunSummary};
pub use workload_generators::generator::TraceGenerator;
