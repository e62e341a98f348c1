//! Trace dispatcher: submits every job of a trace at its due time, splitting
//! it into equally sized allocations spread over the pools in round-robin
//! order, and keeps the run-wide ignored/destroyed accounting.

use dslab_core::{
    cast, log_debug, log_error, log_info, log_warn, Event, EventHandler, Id, SimulationContext,
};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::{
    config::sim_config::DispatcherConfig,
    error::SimulationError,
    job::Job,
    job_runner::{JobRunner, RunnerProgress},
    pool::{
        AllocationHandle, AllocationShape, AllocationState, AllocationStateChanged, PoolRef,
        StorageId, VirtualImage, WorkloadCancelled, WorkloadFinished,
    },
    timer::{ticks, Time, Timer},
};

#[derive(Clone, Serialize)]
pub struct DispatchDue {}

#[derive(Clone, Serialize)]
pub struct StopDispatching {}

/// How a single job is cut into allocations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JobSplit {
    pub allocations: u32,
    pub units_per_allocation: f64,
    pub pools: u32,
}

pub struct Dispatcher {
    jobs: Vec<Job>,
    next_job: usize,

    pools: Vec<PoolRef>,
    storages: Vec<StorageId>,
    image: VirtualImage,
    pool_cursor: usize,

    max_units_per_allocation: f64,
    min_unit_processing_power: f64,
    max_pool_hosts: u32,
    processing_power: f64,
    minimum_power: bool,
    memory: u64,

    ignored: u64,
    destroyed: u64,
    stopped: bool,
    stop_scheduled: bool,

    runners: FxHashMap<usize, JobRunner>,
    owners: FxHashMap<AllocationHandle, usize>,
    failure: Option<SimulationError>,

    timer: Timer<DispatchDue>,
    ctx: SimulationContext,
}

impl Dispatcher {
    /// Sorts the trace by submission time, measures the pools and arms the
    /// timer for the first due job.
    pub fn new(
        ctx: SimulationContext,
        mut jobs: Vec<Job>,
        pools: Vec<PoolRef>,
        config: &DispatcherConfig,
    ) -> Result<Dispatcher, SimulationError> {
        jobs.sort_by_key(|job| job.submit_time);

        let mut max_units_per_allocation: f64 = 0.;
        let mut min_unit_processing_power = f64::INFINITY;
        let mut max_pool_hosts = 0;
        let mut storages = Vec::with_capacity(pools.len());
        for pool in pools.iter() {
            let mut pool = pool.borrow_mut();
            let hosts = pool.hosts();
            for host in hosts.iter() {
                max_units_per_allocation = max_units_per_allocation.max(host.units);
                min_unit_processing_power = min_unit_processing_power.min(host.processing_power);
            }
            max_pool_hosts = max_pool_hosts.max(hosts.len() as u32);
            storages.push(pool.register_image(&config.image));
        }
        if max_pool_hosts == 0 || max_units_per_allocation <= 0. {
            return Err(SimulationError::NoHosts);
        }

        let mut dispatcher = Dispatcher {
            jobs,
            next_job: 0,
            pools,
            storages,
            image: config.image.clone(),
            pool_cursor: 0,
            max_units_per_allocation,
            min_unit_processing_power,
            max_pool_hosts,
            processing_power: config.processing_power.unwrap_or(min_unit_processing_power),
            minimum_power: config.minimum_power,
            memory: config.memory,
            ignored: 0,
            destroyed: 0,
            stopped: false,
            stop_scheduled: false,
            runners: FxHashMap::default(),
            owners: FxHashMap::default(),
            failure: None,
            timer: Timer::new(DispatchDue {}),
            ctx,
        };

        if let Some(first) = dispatcher.first_due_time() {
            let delay = first.saturating_sub(ticks(&dispatcher.ctx));
            dispatcher.timer.subscribe(&dispatcher.ctx, delay);
        }
        log_info!(
            dispatcher.ctx,
            "prepared {} jobs, max {} units per allocation, max {} hosts per pool",
            dispatcher.jobs.len(),
            dispatcher.max_units_per_allocation,
            dispatcher.max_pool_hosts
        );

        Ok(dispatcher)
    }

    pub fn get_id(&self) -> Id {
        self.ctx.id()
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn first_due_time(&self) -> Option<Time> {
        self.jobs.first().map(|job| job.due_time())
    }

    pub fn get_ignored_count(&self) -> u64 {
        self.ignored
    }

    pub fn get_destroyed_count(&self) -> u64 {
        self.destroyed
    }

    pub fn is_subscribed(&self) -> bool {
        self.timer.is_subscribed()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Jobs placed but not completed yet.
    pub fn in_flight_count(&self) -> usize {
        self.runners.len()
    }

    pub fn max_units_per_allocation(&self) -> f64 {
        self.max_units_per_allocation
    }

    pub fn min_unit_processing_power(&self) -> f64 {
        self.min_unit_processing_power
    }

    pub fn max_pool_hosts(&self) -> u32 {
        self.max_pool_hosts
    }

    pub fn has_failure(&self) -> bool {
        self.failure.is_some()
    }

    pub fn take_failure(&mut self) -> Option<SimulationError> {
        self.failure.take()
    }

    /// Nothing is left to submit and every job in flight waits on allocations
    /// that only a finishing job could make room for.
    pub fn is_deadlocked(&self) -> bool {
        !self.timer.is_subscribed()
            && !self.stop_scheduled
            && !self.runners.is_empty()
            && self.runners.values().all(|runner| runner.is_blocked(&self.pools))
    }

    /// Processing power requested per unit; `minimum` turns it into a lower
    /// bound the hosts have to guarantee.
    pub fn set_usable_processing_power(&mut self, power: f64, minimum: bool) {
        self.processing_power = power;
        self.minimum_power = minimum;
    }

    pub fn split(&self, requested_units: u32) -> JobSplit {
        let units = requested_units.max(1) as f64;
        let allocations = if units > self.max_units_per_allocation {
            (units / self.max_units_per_allocation).ceil() as u32
        } else {
            1
        };
        JobSplit {
            allocations,
            units_per_allocation: units / allocations as f64,
            pools: allocations.div_ceil(self.max_pool_hosts),
        }
    }

    pub fn increase_destroy_counter(&mut self, count: u64) -> Result<(), SimulationError> {
        if count == 0 {
            return Err(SimulationError::InvalidDestroyCount(count));
        }
        self.destroyed += count;
        Ok(())
    }

    /// Stops trace processing. Allocations reporting state changes from now on
    /// are torn down without further accounting.
    pub fn stop(&mut self) {
        self.timer.unsubscribe(&self.ctx);
        if self.stopped {
            return;
        }
        self.stopped = true;
        for runner in self.runners.values_mut() {
            log_debug!(self.ctx, "releasing idle allocations of job {}", self.jobs[runner.job()].id);
            runner.release_idle(&self.pools);
        }
        log_info!(
            self.ctx,
            "trace processing stopped with {} jobs in flight",
            self.runners.len()
        );
    }

    /// Schedules [`stop`](Dispatcher::stop) at simulated time `time`.
    pub fn stop_at(&mut self, time: Time) {
        let delay = time.saturating_sub(ticks(&self.ctx));
        self.ctx.emit_self(StopDispatching {}, delay as f64);
        self.stop_scheduled = true;
    }

    fn on_due(&mut self) {
        let now = self.timer.now(&self.ctx);
        while self.next_job < self.jobs.len() && self.jobs[self.next_job].due_time() <= now {
            let index = self.next_job;
            self.next_job += 1;
            if let Err(e) = self.dispatch(index) {
                self.fail(e);
                return;
            }
        }

        match self.jobs.get(self.next_job) {
            Some(next) => {
                let delay = next.due_time() - now;
                self.timer.subscribe(&self.ctx, delay);
            }
            None => {
                log_info!(self.ctx, "all {} jobs dispatched", self.jobs.len());
                self.timer.unsubscribe(&self.ctx);
            }
        }
    }

    fn dispatch(&mut self, index: usize) -> Result<(), SimulationError> {
        let job = &self.jobs[index];
        let split = self.split(job.requested_units);
        log_debug!(
            self.ctx,
            "job {} ({} units): {} allocations of {} units over {} pools",
            job.id,
            job.requested_units,
            split.allocations,
            split.units_per_allocation,
            split.pools
        );

        if split.pools as usize > self.pools.len() {
            log_warn!(
                self.ctx,
                "job {} needs {} pools, only {} exist: ignored",
                job.id,
                split.pools,
                self.pools.len()
            );
            self.mark_ignored(index);
            return Ok(());
        }

        let shape = AllocationShape {
            units: split.units_per_allocation,
            processing_power: self.processing_power,
            minimum_power: self.minimum_power,
            memory: self.memory,
        };

        let mut obtained: Vec<AllocationHandle> = Vec::with_capacity(split.allocations as usize);
        let mut remaining = split.allocations;
        let mut rejected = false;
        while remaining > 0 {
            let count = remaining.min(self.max_pool_hosts);
            let target = self.pool_cursor;
            let result = self.pools[target].borrow_mut().request_allocations(
                &self.image,
                &shape,
                self.storages[target],
                count,
            );
            match result {
                Ok(handles) => {
                    self.pool_cursor = (self.pool_cursor + 1) % self.pools.len();
                    obtained.extend(handles);
                    remaining -= count;
                }
                Err(e) => {
                    log_debug!(self.ctx, "job {} rejected: {}", self.jobs[index].id, e);
                    rejected = true;
                    break;
                }
            }
        }

        let nonservable = obtained.iter().any(|a| {
            self.pools[a.pool].borrow().state(*a) == Some(AllocationState::NonServable)
        });
        if rejected || nonservable {
            self.mark_ignored(index);
            for allocation in obtained {
                let mut pool = self.pools[allocation.pool].borrow_mut();
                if pool.state(allocation).is_some_and(|s| !s.is_terminal()) {
                    pool.destroy(allocation, true)?;
                }
            }
            return Ok(());
        }

        let mut runner = JobRunner::new(index, obtained, &self.pools, self.ctx.id())?;
        for allocation in runner.allocations() {
            self.owners.insert(*allocation, index);
        }
        let progress = runner.try_start(&mut self.jobs[index], &self.pools, ticks(&self.ctx))?;
        self.runners.insert(index, runner);
        self.apply(index, progress)
    }

    fn apply(&mut self, job: usize, progress: RunnerProgress) -> Result<(), SimulationError> {
        match progress {
            RunnerProgress::Pending => {}
            RunnerProgress::Started => {
                log_debug!(self.ctx, "job {} started", self.jobs[job].id);
            }
            RunnerProgress::Completed { destroyed } => {
                log_debug!(self.ctx, "job {} completed", self.jobs[job].id);
                self.release_runner(job);
                self.increase_destroy_counter(destroyed)?;
            }
        }
        Ok(())
    }

    /// Lines of the `ignored` target read `job <id> IGNORED`, the format
    /// `IgnoreFilter` reads back.
    fn mark_ignored(&mut self, job: usize) {
        self.ignored += 1;
        ::log::info!(target: "ignored", "job {} IGNORED", self.jobs[job].id);
    }

    fn release_runner(&mut self, job: usize) -> Option<JobRunner> {
        let runner = self.runners.remove(&job)?;
        for allocation in runner.allocations() {
            self.owners.remove(allocation);
        }
        Some(runner)
    }

    fn on_allocation_state(&mut self, allocation: AllocationHandle, new_state: AllocationState) {
        let Some(job) = self.owners.get(&allocation).copied() else {
            return;
        };
        let Some(runner) = self.runners.get_mut(&job) else {
            return;
        };

        if self.stopped {
            runner.on_cancelled_state_change(allocation, new_state, &self.pools);
            if runner.is_torn_down(&self.pools) {
                self.release_runner(job);
            }
            return;
        }

        if new_state == AllocationState::NonServable {
            log_warn!(
                self.ctx,
                "allocation {:?} of job {} became nonservable",
                allocation,
                self.jobs[job].id
            );
            self.mark_ignored(job);
            let result = match self.release_runner(job) {
                Some(mut runner) => runner.abort(&self.pools),
                None => Ok(()),
            };
            if let Err(e) = result {
                self.fail(e.into());
            }
            return;
        }

        let now = ticks(&self.ctx);
        let result = runner
            .on_state_change(&mut self.jobs[job], allocation, new_state, &self.pools, now)
            .map_err(SimulationError::from)
            .and_then(|progress| self.apply(job, progress));
        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn on_workload_finished(&mut self, allocation: AllocationHandle) {
        let Some(job) = self.owners.get(&allocation).copied() else {
            return;
        };
        let Some(runner) = self.runners.get_mut(&job) else {
            return;
        };

        if self.stopped {
            runner.force_destroy(allocation, &self.pools);
            if runner.is_torn_down(&self.pools) {
                self.release_runner(job);
            }
            return;
        }

        let now = ticks(&self.ctx);
        let result = runner
            .on_workload_finished(&mut self.jobs[job], allocation, &self.pools, now)
            .map_err(SimulationError::from)
            .and_then(|progress| self.apply(job, progress));
        if let Err(e) = result {
            self.fail(e);
        }
    }

    /// Unexpected failures end the whole run: dispatching stops here and the
    /// run loop returns the error before the next event.
    fn fail(&mut self, error: SimulationError) {
        log_error!(self.ctx, "fatal: {}", error);
        self.stop();
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }
}

impl EventHandler for Dispatcher {
    fn on(&mut self, event: Event) {
        let event_id = event.id;
        cast!(match event.data {
            DispatchDue {} => {
                if self.timer.on_fire(&self.ctx, event_id) {
                    self.on_due();
                }
            }
            StopDispatching {} => {
                log_info!(self.ctx, "time limit reached");
                self.stop_scheduled = false;
                self.stop();
            }
            AllocationStateChanged {
                allocation,
                new_state,
                ..
            } => {
                self.on_allocation_state(allocation, new_state);
            }
            WorkloadFinished { allocation } => {
                self.on_workload_finished(allocation);
            }
            WorkloadCancelled { allocation } => {
                // workloads are not expected to fail once started
                log_debug!(self.ctx, "workload on {:?} cancelled", allocation);
            }
        })
    }
}
