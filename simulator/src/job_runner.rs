//! Start and completion barriers of a single job spread over several
//! allocations.

use dslab_core::Id;

use crate::{
    error::AllocationError,
    job::Job,
    pool::{AllocationHandle, AllocationState, PoolRef},
    timer::Time,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunnerPhase {
    /// Some allocations are not RUNNING yet.
    Waiting,
    /// Every allocation is RUNNING, workload is being issued.
    Ready,
    /// Workload in flight on every allocation.
    Running,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunnerProgress {
    Pending,
    Started,
    Completed { destroyed: u64 },
}

pub struct JobRunner {
    job: usize,
    allocations: Vec<AllocationHandle>,
    ready: Vec<bool>,
    ready_count: usize,
    completed: Vec<bool>,
    completed_count: usize,
    phase: RunnerPhase,
    listener: Id,
}

fn pool_of<'a>(pools: &'a [PoolRef], allocation: AllocationHandle) -> Result<&'a PoolRef, AllocationError> {
    pools
        .get(allocation.pool)
        .ok_or(AllocationError::Unknown(allocation))
}

impl JobRunner {
    /// Subscribes `listener` to every allocation. Allocations that are
    /// already RUNNING count as ready right away; call
    /// [`try_start`](JobRunner::try_start) afterwards to act on that.
    pub fn new(
        job: usize,
        allocations: Vec<AllocationHandle>,
        pools: &[PoolRef],
        listener: Id,
    ) -> Result<JobRunner, AllocationError> {
        let mut ready = vec![false; allocations.len()];
        for (i, allocation) in allocations.iter().enumerate() {
            let pool = pool_of(pools, *allocation)?;
            pool.borrow_mut().subscribe_state_change(*allocation, listener)?;
            ready[i] = pool.borrow().state(*allocation) == Some(AllocationState::Running);
        }
        let ready_count = ready.iter().filter(|r| **r).count();
        let count = allocations.len();

        Ok(JobRunner {
            job,
            allocations,
            ready,
            ready_count,
            completed: vec![false; count],
            completed_count: 0,
            phase: RunnerPhase::Waiting,
            listener,
        })
    }

    pub fn job(&self) -> usize {
        self.job
    }

    pub fn allocations(&self) -> &[AllocationHandle] {
        &self.allocations
    }

    fn position(&self, allocation: AllocationHandle) -> Option<usize> {
        self.allocations.iter().position(|a| *a == allocation)
    }

    pub fn on_state_change(
        &mut self,
        job: &mut Job,
        allocation: AllocationHandle,
        new_state: AllocationState,
        pools: &[PoolRef],
        now: Time,
    ) -> Result<RunnerProgress, AllocationError> {
        if new_state != AllocationState::Running {
            return Ok(RunnerProgress::Pending);
        }
        if let Some(i) = self.position(allocation) {
            if !self.ready[i] {
                self.ready[i] = true;
                self.ready_count += 1;
            }
        }
        self.try_start(job, pools, now)
    }

    /// Start barrier: issues the workload once every allocation is RUNNING.
    pub fn try_start(
        &mut self,
        job: &mut Job,
        pools: &[PoolRef],
        now: Time,
    ) -> Result<RunnerProgress, AllocationError> {
        if self.phase != RunnerPhase::Waiting || self.ready_count < self.allocations.len() {
            return Ok(RunnerProgress::Pending);
        }

        self.phase = RunnerPhase::Ready;
        job.mark_started(now);

        for allocation in self.allocations.iter() {
            let pool = pool_of(pools, *allocation)?;
            let units = pool
                .borrow()
                .allocated_units(*allocation)
                .ok_or(AllocationError::Unknown(*allocation))?;
            pool.borrow_mut().issue_workload(
                *allocation,
                job.exec_time as f64 * units,
                f64::INFINITY,
                self.listener,
            )?;
        }

        self.phase = RunnerPhase::Running;
        Ok(RunnerProgress::Started)
    }

    /// Completion barrier: once every workload unit is done, the allocations
    /// are destroyed and their count is returned for the dispatcher.
    pub fn on_workload_finished(
        &mut self,
        job: &mut Job,
        allocation: AllocationHandle,
        pools: &[PoolRef],
        now: Time,
    ) -> Result<RunnerProgress, AllocationError> {
        if self.phase != RunnerPhase::Running {
            return Ok(RunnerProgress::Pending);
        }
        let Some(i) = self.position(allocation) else {
            return Ok(RunnerProgress::Pending);
        };
        if !self.completed[i] {
            self.completed[i] = true;
            self.completed_count += 1;
        }
        if self.completed_count < self.allocations.len() {
            return Ok(RunnerProgress::Pending);
        }

        job.mark_completed(now);
        for allocation in self.allocations.iter() {
            let pool = pool_of(pools, *allocation)?;
            let mut pool = pool.borrow_mut();
            pool.unsubscribe_state_change(*allocation, self.listener);
            pool.destroy(*allocation, false)?;
        }
        self.phase = RunnerPhase::Done;

        Ok(RunnerProgress::Completed {
            destroyed: self.allocations.len() as u64,
        })
    }

    /// State change observed after the dispatcher was stopped: allocations
    /// reaching RUNNING are torn down, everything else is left to the pool.
    pub fn on_cancelled_state_change(
        &mut self,
        allocation: AllocationHandle,
        new_state: AllocationState,
        pools: &[PoolRef],
    ) {
        match new_state {
            AllocationState::NonServable
            | AllocationState::Destroyed
            | AllocationState::Requested
            | AllocationState::InitialTransfer => {}
            AllocationState::Running => self.force_destroy(allocation, pools),
        }
    }

    /// Tears down one allocation, ignoring pool errors.
    pub fn force_destroy(&mut self, allocation: AllocationHandle, pools: &[PoolRef]) {
        if let Ok(pool) = pool_of(pools, allocation) {
            let mut pool = pool.borrow_mut();
            pool.unsubscribe_state_change(allocation, self.listener);
            let _ = pool.destroy(allocation, true);
        }
    }

    /// Every allocation reached a terminal state.
    pub fn is_torn_down(&self, pools: &[PoolRef]) -> bool {
        self.allocations.iter().all(|a| {
            pools
                .get(a.pool)
                .and_then(|pool| pool.borrow().state(*a))
                .map_or(true, AllocationState::is_terminal)
        })
    }

    /// Still behind the start barrier, with no allocation in its initial
    /// transfer and no RUNNING notification left to deliver. Only capacity
    /// freed by some other job can move it forward.
    pub fn is_blocked(&self, pools: &[PoolRef]) -> bool {
        self.phase == RunnerPhase::Waiting
            && self.allocations.iter().zip(self.ready.iter()).all(|(a, ready)| {
                match pools.get(a.pool).and_then(|pool| pool.borrow().state(*a)) {
                    Some(AllocationState::InitialTransfer) => false,
                    Some(AllocationState::Running) => *ready,
                    _ => true,
                }
            })
    }

    /// Tears down allocations that already reached RUNNING while the start
    /// barrier is still closed. Nothing else would ever wake them up once
    /// the dispatcher has stopped.
    pub fn release_idle(&mut self, pools: &[PoolRef]) {
        if self.phase != RunnerPhase::Waiting {
            return;
        }
        for i in 0..self.allocations.len() {
            if self.ready[i] {
                let allocation = self.allocations[i];
                self.force_destroy(allocation, pools);
            }
        }
    }

    /// Drops the job: force-destroys every allocation that has not reached a
    /// terminal state yet.
    pub fn abort(&mut self, pools: &[PoolRef]) -> Result<(), AllocationError> {
        for allocation in self.allocations.iter() {
            let pool = pool_of(pools, *allocation)?;
            let mut pool = pool.borrow_mut();
            pool.unsubscribe_state_change(*allocation, self.listener);
            if pool.state(*allocation).is_some_and(|s| !s.is_terminal()) {
                pool.destroy(*allocation, true)?;
            }
        }
        self.phase = RunnerPhase::Done;
        Ok(())
    }
}
