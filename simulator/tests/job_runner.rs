use std::{cell::RefCell, rc::Rc};

use dslab_core::{cast, Event, EventHandler, Id, Simulation, SimulationContext};
use serde::Serialize;
use trace_dispatch::{
    config::sim_config::DispatcherConfig,
    pool::{
        AllocationHandle, AllocationShape, AllocationState, AllocationStateChanged, HostSpec,
        PoolMetrics, PoolRef, ResourcePool, StorageId, VirtualImage, WorkloadFinished,
    },
    timer::{ticks, Time},
    AllocationError, DispatchSimulation, Dispatcher, Job, PlacementError, SimulationError,
};

#[derive(Clone, Serialize)]
struct BecomeRunning {
    id: u64,
}

#[derive(Clone, Serialize)]
struct BecomeNonServable {
    id: u64,
}

#[derive(Clone, Serialize)]
struct Done {
    id: u64,
}

#[derive(Default)]
struct Journal {
    issued: Vec<(Time, u64)>,
    destroyed: Vec<(Time, u64, bool)>,
}

struct ScriptedAllocation {
    state: AllocationState,
    listeners: Vec<Id>,
    workload_listener: Option<Id>,
}

/// Pool whose allocations turn RUNNING and finish their workload after fixed
/// per-allocation delays.
struct ScriptedPool {
    hosts: usize,
    ready_after: Vec<Time>,
    finish_after: Vec<Time>,
    nonservable: Option<(u64, Time)>,
    /// Allocation whose workload issuance is refused.
    refuse_workload: Option<u64>,
    allocations: Vec<ScriptedAllocation>,
    journal: Rc<RefCell<Journal>>,
    ctx: SimulationContext,
}

impl ScriptedPool {
    fn set_state(&mut self, id: u64, new_state: AllocationState) {
        let allocation = &mut self.allocations[id as usize];
        let old_state = allocation.state;
        allocation.state = new_state;
        for listener in allocation.listeners.iter() {
            self.ctx.emit_now(
                AllocationStateChanged {
                    allocation: AllocationHandle { pool: 0, id },
                    old_state,
                    new_state,
                },
                *listener,
            );
        }
    }
}

impl ResourcePool for ScriptedPool {
    fn name(&self) -> &str {
        "scripted"
    }

    fn hosts(&self) -> Vec<HostSpec> {
        vec![
            HostSpec {
                units: 1.,
                processing_power: 1.,
                memory: 1 << 30,
            };
            self.hosts
        ]
    }

    fn register_image(&mut self, _image: &VirtualImage) -> StorageId {
        0
    }

    fn request_allocations(
        &mut self,
        _image: &VirtualImage,
        _shape: &AllocationShape,
        _storage: StorageId,
        count: u32,
    ) -> Result<Vec<AllocationHandle>, PlacementError> {
        let mut handles = Vec::new();
        for _ in 0..count {
            let id = self.allocations.len() as u64;
            self.allocations.push(ScriptedAllocation {
                state: AllocationState::Requested,
                listeners: Vec::new(),
                workload_listener: None,
            });
            self.ctx
                .emit_self(BecomeRunning { id }, self.ready_after[id as usize] as f64);
            handles.push(AllocationHandle { pool: 0, id });
        }
        if let Some((id, delay)) = self.nonservable {
            self.ctx.emit_self(BecomeNonServable { id }, delay as f64);
        }
        Ok(handles)
    }

    fn state(&self, allocation: AllocationHandle) -> Option<AllocationState> {
        self.allocations.get(allocation.id as usize).map(|a| a.state)
    }

    fn allocated_units(&self, allocation: AllocationHandle) -> Option<f64> {
        self.allocations.get(allocation.id as usize).map(|_| 1.)
    }

    fn subscribe_state_change(
        &mut self,
        allocation: AllocationHandle,
        listener: Id,
    ) -> Result<(), AllocationError> {
        match self.allocations.get_mut(allocation.id as usize) {
            Some(a) => {
                a.listeners.push(listener);
                Ok(())
            }
            None => Err(AllocationError::Unknown(allocation)),
        }
    }

    fn unsubscribe_state_change(&mut self, allocation: AllocationHandle, listener: Id) {
        if let Some(a) = self.allocations.get_mut(allocation.id as usize) {
            a.listeners.retain(|l| *l != listener);
        }
    }

    fn destroy(&mut self, allocation: AllocationHandle, force: bool) -> Result<(), AllocationError> {
        self.journal
            .borrow_mut()
            .destroyed
            .push((ticks(&self.ctx), allocation.id, force));
        self.set_state(allocation.id, AllocationState::Destroyed);
        Ok(())
    }

    fn issue_workload(
        &mut self,
        allocation: AllocationHandle,
        _amount: f64,
        _limit: f64,
        listener: Id,
    ) -> Result<(), AllocationError> {
        if self.refuse_workload == Some(allocation.id) {
            return Err(AllocationError::WorkloadInFlight(allocation));
        }
        self.journal
            .borrow_mut()
            .issued
            .push((ticks(&self.ctx), allocation.id));
        self.allocations[allocation.id as usize].workload_listener = Some(listener);
        self.ctx.emit_self(
            Done { id: allocation.id },
            self.finish_after[allocation.id as usize] as f64,
        );
        Ok(())
    }

    fn metrics(&self) -> PoolMetrics {
        PoolMetrics::default()
    }

    fn host_energy(&mut self, _host: usize) -> f64 {
        0.
    }
}

impl EventHandler for ScriptedPool {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            BecomeRunning { id } => {
                if self.allocations[id as usize].state == AllocationState::Requested {
                    self.set_state(id, AllocationState::Running);
                }
            }
            BecomeNonServable { id } => {
                if self.allocations[id as usize].state == AllocationState::Requested {
                    self.set_state(id, AllocationState::NonServable);
                }
            }
            Done { id } => {
                let allocation = &self.allocations[id as usize];
                if let (AllocationState::Running, Some(listener)) =
                    (allocation.state, allocation.workload_listener)
                {
                    self.ctx.emit_now(
                        WorkloadFinished {
                            allocation: AllocationHandle { pool: 0, id },
                        },
                        listener,
                    );
                }
            }
        })
    }
}

struct Setup {
    sim: Simulation,
    dispatcher: Rc<RefCell<Dispatcher>>,
    journal: Rc<RefCell<Journal>>,
}

fn scripted_pool(
    sim: &mut Simulation,
    ready_after: Vec<Time>,
    finish_after: Vec<Time>,
    nonservable: Option<(u64, Time)>,
    refuse_workload: Option<u64>,
) -> (PoolRef, Rc<RefCell<Journal>>) {
    let journal = Rc::new(RefCell::new(Journal::default()));
    let pool = Rc::new(RefCell::new(ScriptedPool {
        hosts: ready_after.len(),
        ready_after,
        finish_after,
        nonservable,
        refuse_workload,
        allocations: Vec::new(),
        journal: journal.clone(),
        ctx: sim.create_context("scripted"),
    }));
    sim.add_handler("scripted", pool.clone());
    let pool: PoolRef = pool;
    (pool, journal)
}

fn job() -> Job {
    Job::new("job", 0, 0, 1, 3)
}

fn setup_with(
    ready_after: Vec<Time>,
    finish_after: Vec<Time>,
    nonservable: Option<(u64, Time)>,
    refuse_workload: Option<u64>,
) -> Setup {
    let mut sim = Simulation::new(42);
    let (pool, journal) = scripted_pool(
        &mut sim,
        ready_after,
        finish_after,
        nonservable,
        refuse_workload,
    );

    let dispatcher = Rc::new(RefCell::new(
        Dispatcher::new(
            sim.create_context("dispatcher"),
            vec![job()],
            vec![pool],
            &DispatcherConfig::default(),
        )
        .unwrap(),
    ));
    sim.add_handler("dispatcher", dispatcher.clone());

    Setup {
        sim,
        dispatcher,
        journal,
    }
}

fn setup(
    ready_after: Vec<Time>,
    finish_after: Vec<Time>,
    nonservable: Option<(u64, Time)>,
) -> Setup {
    setup_with(ready_after, finish_after, nonservable, None)
}

#[test]
fn test_workload_waits_for_last_allocation() {
    let mut setup = setup(vec![10, 12, 15], vec![5, 30, 20], None);

    setup.sim.step_until_time(14.);
    assert!(setup.journal.borrow().issued.is_empty());

    setup.sim.step_until_no_events();
    let journal = setup.journal.borrow();
    assert_eq!(journal.issued, vec![(15, 0), (15, 1), (15, 2)]);

    let dispatcher = setup.dispatcher.borrow();
    assert_eq!(dispatcher.jobs()[0].queue_delay(), Some(15));
}

#[test]
fn test_completion_waits_for_every_workload() {
    let mut setup = setup(vec![10, 12, 15], vec![5, 30, 20], None);

    // workloads end at 20, 45 and 35
    setup.sim.step_until_time(44.);
    assert!(setup.journal.borrow().destroyed.is_empty());
    assert_eq!(setup.dispatcher.borrow().get_destroyed_count(), 0);
    assert_eq!(setup.dispatcher.borrow().in_flight_count(), 1);

    setup.sim.step_until_no_events();
    assert_eq!(
        setup.journal.borrow().destroyed,
        vec![(45, 0, false), (45, 1, false), (45, 2, false)]
    );

    let dispatcher = setup.dispatcher.borrow();
    assert_eq!(dispatcher.get_destroyed_count(), 3);
    assert_eq!(dispatcher.get_ignored_count(), 0);
    assert_eq!(dispatcher.in_flight_count(), 0);
    assert_eq!(dispatcher.jobs()[0].stop_delay(), Some(45));
    assert!(dispatcher.jobs()[0].ran());
}

#[test]
fn test_late_nonservable_drops_the_job() {
    let mut setup = setup(vec![10, 1000, 1000], vec![1, 1, 1], Some((1, 20)));
    setup.sim.step_until_no_events();

    assert!(setup.journal.borrow().issued.is_empty());
    assert_eq!(
        setup.journal.borrow().destroyed,
        vec![(20, 0, true), (20, 2, true)]
    );

    let dispatcher = setup.dispatcher.borrow();
    assert_eq!(dispatcher.get_ignored_count(), 1);
    assert_eq!(dispatcher.get_destroyed_count(), 0);
    assert_eq!(dispatcher.in_flight_count(), 0);
}

#[test]
fn test_stopped_dispatcher_tears_down_running_allocations() {
    let mut setup = setup(vec![10, 12, 15], vec![5, 30, 20], None);

    setup.sim.step_until_time(12.);
    setup.dispatcher.borrow_mut().stop();
    setup.sim.step_until_no_events();

    let journal = setup.journal.borrow();
    assert!(journal.issued.is_empty());
    assert_eq!(
        journal.destroyed,
        vec![(12, 0, true), (12, 1, true), (15, 2, true)]
    );

    let dispatcher = setup.dispatcher.borrow();
    assert_eq!(dispatcher.get_destroyed_count(), 0);
    assert_eq!(dispatcher.in_flight_count(), 0);
    assert_eq!(dispatcher.jobs()[0].queue_delay(), None);
}

#[test]
fn test_refused_workload_fails_the_run() {
    let mut setup = setup_with(vec![10, 12, 15], vec![5, 30, 20], None, Some(1));

    setup.sim.step_until_time(15.);
    assert_eq!(setup.journal.borrow().issued, vec![(15, 0)]);
    assert!(setup.journal.borrow().destroyed.is_empty());

    let mut dispatcher = setup.dispatcher.borrow_mut();
    assert!(dispatcher.is_stopped());
    assert!(!dispatcher.is_subscribed());
    assert_eq!(dispatcher.get_destroyed_count(), 0);
    assert_eq!(dispatcher.get_ignored_count(), 0);
    assert!(!dispatcher.jobs()[0].ran());
    assert!(dispatcher.has_failure());
    assert!(matches!(
        dispatcher.take_failure(),
        Some(SimulationError::Allocation(AllocationError::WorkloadInFlight(
            AllocationHandle { pool: 0, id: 1 }
        )))
    ));
    assert!(dispatcher.take_failure().is_none());
}

#[test]
fn test_run_returns_at_the_failing_barrier() {
    let mut sim = Simulation::new(42);
    let (pool, journal) =
        scripted_pool(&mut sim, vec![10, 12, 15], vec![5, 30, 20], None, Some(1));
    let mut simulation =
        DispatchSimulation::from_parts(sim, vec![pool], vec![job()], &DispatcherConfig::default())
            .unwrap();

    assert!(matches!(
        simulation.run(),
        Err(SimulationError::Allocation(AllocationError::WorkloadInFlight(_)))
    ));
    // the first workload would finish at 20
    assert_eq!(simulation.sim().time(), 15.);
    assert_eq!(journal.borrow().issued, vec![(15, 0)]);
    assert!(journal.borrow().destroyed.is_empty());

    let dispatcher = simulation.dispatcher();
    let dispatcher = dispatcher.borrow();
    assert!(dispatcher.is_stopped());
    assert_eq!(dispatcher.get_destroyed_count(), 0);
    assert_eq!(dispatcher.get_ignored_count(), 0);
    assert_eq!(dispatcher.jobs()[0].stop_delay(), None);
}
