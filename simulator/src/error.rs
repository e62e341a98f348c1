use thiserror::Error;

use crate::pool::{AllocationHandle, AllocationState};

/// A pool refused a placement request outright. Recoverable: the dispatcher
/// counts the job as ignored.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("pool {pool}: no host can ever hold an allocation of {units} units")]
    Unsatisfiable { pool: String, units: f64 },
    #[error("pool {pool}: storage endpoint {storage} is not registered")]
    UnknownStorage { pool: String, storage: usize },
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("unknown allocation {0:?}")]
    Unknown(AllocationHandle),
    #[error("cannot {operation} allocation {allocation:?} in state {state:?}")]
    InvalidState {
        allocation: AllocationHandle,
        state: AllocationState,
        operation: &'static str,
    },
    #[error("allocation {0:?} already runs a workload")]
    WorkloadInFlight(AllocationHandle),
}

/// Run-level failures. Everything except placement errors ends the run.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("destroy counter can only grow by a positive amount, got {0}")]
    InvalidDestroyCount(u64),
    #[error("none of the pools has any hosts")]
    NoHosts,
    #[error("monitoring output: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("config: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("trace: {0}")]
    Trace(String),
}
