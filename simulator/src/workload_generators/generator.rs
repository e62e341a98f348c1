use crate::{error::SimulationError, job::Job};

/// Source of the jobs handed to the dispatcher.
pub trait TraceGenerator {
    fn get_jobs(&mut self) -> Result<Vec<Job>, SimulationError>;
}

/// A trace already held in memory.
impl TraceGenerator for Vec<Job> {
    fn get_jobs(&mut self) -> Result<Vec<Job>, SimulationError> {
        Ok(std::mem::take(self))
    }
}
