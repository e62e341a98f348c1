use std::{cell::RefCell, fs::File, io::BufWriter, io::Write, rc::Rc};

use dslab_core::Simulation;
use serde::Serialize;

use crate::{
    config::sim_config::{DispatcherConfig, SimulationConfig},
    dispatcher::Dispatcher,
    error::SimulationError,
    job::Job,
    monitoring::StateMonitor,
    pool::{PoolRef, SimplePool},
    timer::Time,
};

const SEED: u64 = 42;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunSummary {
    pub jobs: usize,
    pub ignored: u64,
    pub destroyed: u64,
    pub completed_jobs: usize,
    /// Jobs still holding allocations when the event queue ran dry.
    pub in_flight: usize,
    pub completed_allocations: u64,
    pub energy_kwh: Option<f64>,
    /// Simulated time from the first due job to the last event.
    pub simulated_span: Time,
    pub events: u64,
}

struct PendingMonitor {
    output: Box<dyn Write>,
    interval: Time,
}

pub struct DispatchSimulation {
    sim: Simulation,
    pools: Vec<PoolRef>,
    dispatcher: Rc<RefCell<Dispatcher>>,
    monitor: Option<Rc<RefCell<StateMonitor>>>,
    pending_monitor: Option<PendingMonitor>,
    time_limit: Option<Time>,
}

impl DispatchSimulation {
    /// Builds every configured pool as a [`SimplePool`]. The monitoring report
    /// goes to [`SimulationConfig::report_path`] when monitoring is enabled.
    pub fn new(config: &SimulationConfig, jobs: Vec<Job>) -> Result<DispatchSimulation, SimulationError> {
        let mut sim = Simulation::new(SEED);

        let mut pools: Vec<PoolRef> = Vec::new();
        for (index, pool_config) in config.pool_configs().into_iter().enumerate() {
            let pool = Rc::new(RefCell::new(SimplePool::new(
                sim.create_context(&pool_config.name),
                index,
                &pool_config.name,
                pool_config.hosts,
                pool_config.options,
            )));
            sim.add_handler(&pool_config.name, pool.clone());
            pools.push(pool);
        }

        let mut simulation = Self::from_parts(sim, pools, jobs, &config.dispatcher)?;
        if let (Some(path), Some(monitoring)) = (config.report_path(), &config.monitoring) {
            let file = File::create(&path)?;
            simulation.set_monitoring(Box::new(BufWriter::new(file)), monitoring.interval);
        }
        simulation.time_limit = config.time_limit;
        Ok(simulation)
    }

    /// Uses pools built by the caller; they must already be registered as
    /// handlers of `sim` and listed in handle index order.
    pub fn from_parts(
        mut sim: Simulation,
        pools: Vec<PoolRef>,
        jobs: Vec<Job>,
        config: &DispatcherConfig,
    ) -> Result<DispatchSimulation, SimulationError> {
        let dispatcher = Rc::new(RefCell::new(Dispatcher::new(
            sim.create_context("dispatcher"),
            jobs,
            pools.clone(),
            config,
        )?));
        sim.add_handler("dispatcher", dispatcher.clone());

        Ok(DispatchSimulation {
            sim,
            pools,
            dispatcher,
            monitor: None,
            pending_monitor: None,
            time_limit: None,
        })
    }

    /// The monitor is attached when the run starts, at the first due instant.
    pub fn set_monitoring(&mut self, output: Box<dyn Write>, interval: Time) {
        self.pending_monitor = Some(PendingMonitor { output, interval });
    }

    pub fn set_time_limit(&mut self, limit: Option<Time>) {
        self.time_limit = limit;
    }

    pub fn dispatcher(&self) -> Rc<RefCell<Dispatcher>> {
        self.dispatcher.clone()
    }

    pub fn monitor(&self) -> Option<Rc<RefCell<StateMonitor>>> {
        self.monitor.clone()
    }

    pub fn pools(&self) -> &[PoolRef] {
        &self.pools
    }

    pub fn sim(&mut self) -> &mut Simulation {
        &mut self.sim
    }

    /// Steps until the event queue drains, a component fails or the jobs in
    /// flight can no longer make progress.
    pub fn run(&mut self) -> Result<RunSummary, SimulationError> {
        let start = self.dispatcher.borrow().first_due_time().unwrap_or(0);
        self.sim.step_until_time(start as f64);

        if let Some(pending) = self.pending_monitor.take() {
            let monitor = Rc::new(RefCell::new(StateMonitor::new(
                self.sim.create_context("monitor"),
                self.dispatcher.clone(),
                self.pools.clone(),
                pending.output,
                pending.interval,
            )?));
            self.sim.add_handler("monitor", monitor.clone());
            self.monitor = Some(monitor);
        }

        if let Some(limit) = self.time_limit {
            self.dispatcher.borrow_mut().stop_at(limit);
        }
        while !self.has_failure() && self.sim.step() {
            if self.is_stalled() {
                log::warn!(
                    "[{} simulation] {} jobs are stuck waiting for allocations, closing the report",
                    self.sim.time(),
                    self.dispatcher.borrow().in_flight_count()
                );
                if let Some(monitor) = &self.monitor {
                    monitor.borrow_mut().finish()?;
                }
                break;
            }
        }

        if let Some(failure) = self.dispatcher.borrow_mut().take_failure() {
            return Err(failure);
        }
        if let Some(monitor) = &self.monitor {
            if let Some(failure) = monitor.borrow_mut().take_failure() {
                return Err(failure);
            }
        }

        Ok(self.summary(start))
    }

    fn has_failure(&self) -> bool {
        self.dispatcher.borrow().has_failure()
            || self
                .monitor
                .as_ref()
                .is_some_and(|monitor| monitor.borrow().has_failure())
    }

    /// The monitor keeps ticking while jobs wait on allocations that will
    /// never be placed, so the pools never become idle.
    fn is_stalled(&self) -> bool {
        let Some(monitor) = &self.monitor else {
            return false;
        };
        !monitor.borrow().is_finished() && self.dispatcher.borrow().is_deadlocked()
    }

    fn summary(&self, start: Time) -> RunSummary {
        let dispatcher = self.dispatcher.borrow();
        let completed_allocations: u64 = self
            .pools
            .iter()
            .map(|pool| {
                pool.borrow()
                    .metrics()
                    .hosts
                    .iter()
                    .map(|h| h.completed)
                    .sum::<u64>()
            })
            .sum();

        RunSummary {
            jobs: dispatcher.jobs().len(),
            ignored: dispatcher.get_ignored_count(),
            destroyed: dispatcher.get_destroyed_count(),
            completed_jobs: dispatcher.jobs().iter().filter(|j| j.ran()).count(),
            in_flight: dispatcher.in_flight_count(),
            completed_allocations,
            energy_kwh: self
                .monitor
                .as_ref()
                .and_then(|m| m.borrow().total_energy_kwh()),
            simulated_span: (self.sim.time() as Time).saturating_sub(start),
            events: self.sim.event_count(),
        }
    }
}
