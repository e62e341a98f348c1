use std::{cell::RefCell, io::Write, rc::Rc};

use dslab_core::{cast, log_debug, log_error, log_info, Event, EventHandler, Id, SimulationContext};
use serde::Serialize;

use crate::{
    dispatcher::Dispatcher,
    error::SimulationError,
    pool::PoolRef,
    timer::{ticks, Time, Timer},
};

pub const DEFAULT_MONITORING_INTERVAL: Time = 300_000;

pub const REPORT_HEADER: [&str; 7] = [
    "UnixTime*1000",
    "NrFinished",
    "NrQueued",
    "VMNum",
    "UsedCores",
    "OnPMs",
    "CentralRepoTX",
];

/// One sample of the whole system. Field order is the report column order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct OverallSystemState {
    pub timestamp: Time,
    pub finished: u64,
    pub queued: u64,
    pub running: u64,
    pub used_units: u64,
    pub powered_on_hosts: u64,
    pub transferred_bytes: u64,
}

impl OverallSystemState {
    pub fn collect(timestamp: Time, pools: &[PoolRef]) -> Self {
        let mut state = OverallSystemState {
            timestamp,
            finished: 0,
            queued: 0,
            running: 0,
            used_units: 0,
            powered_on_hosts: 0,
            transferred_bytes: 0,
        };
        let mut used_units = 0.;
        let mut transferred = 0.;
        for pool in pools.iter() {
            let metrics = pool.borrow().metrics();
            for host in metrics.hosts.iter() {
                state.finished += host.completed;
                state.running += host.running;
                used_units += host.used_units;
                if host.powered_on {
                    state.powered_on_hosts += 1;
                }
            }
            state.queued += metrics.queue_length;
            transferred += metrics.transferred_bytes;
        }
        state.used_units = used_units as u64;
        state.transferred_bytes = transferred as u64;
        state
    }
}

/// Energy consumed by one host between `start` and `stop`, in W·ms.
pub struct HostEnergyMeter {
    pool: usize,
    host: usize,
    started: f64,
    consumed: Option<f64>,
}

impl HostEnergyMeter {
    pub fn start(pools: &[PoolRef], pool: usize, host: usize) -> Self {
        Self {
            pool,
            host,
            started: pools[pool].borrow_mut().host_energy(host),
            consumed: None,
        }
    }

    pub fn stop(&mut self, pools: &[PoolRef]) {
        if self.consumed.is_none() {
            let now = pools[self.pool].borrow_mut().host_energy(self.host);
            self.consumed = Some(now - self.started);
        }
    }

    pub fn total_consumption(&self, pools: &[PoolRef]) -> f64 {
        match self.consumed {
            Some(consumed) => consumed,
            None => pools[self.pool].borrow_mut().host_energy(self.host) - self.started,
        }
    }
}

fn to_kwh(energy: f64) -> f64 {
    energy / 1000. / 3_600_000.
}

#[derive(Clone, Serialize)]
pub struct MonitorTick {}

/// Samples the system periodically until the dispatcher is done and every
/// pool is idle, then writes the report and closes the energy meters.
pub struct StateMonitor {
    dispatcher: Rc<RefCell<Dispatcher>>,
    pools: Vec<PoolRef>,
    meters: Vec<HostEnergyMeter>,
    snapshots: Vec<OverallSystemState>,
    writer: csv::Writer<Box<dyn Write>>,
    finished: bool,
    energy_kwh: Option<f64>,
    failure: Option<SimulationError>,
    timer: Timer<MonitorTick>,
    ctx: SimulationContext,
}

impl StateMonitor {
    pub fn new(
        ctx: SimulationContext,
        dispatcher: Rc<RefCell<Dispatcher>>,
        pools: Vec<PoolRef>,
        output: Box<dyn Write>,
        interval: Time,
    ) -> Result<StateMonitor, SimulationError> {
        if interval == 0 {
            return Err(SimulationError::InvalidConfig(
                "monitoring interval must be positive".to_string(),
            ));
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(output);
        writer.write_record(REPORT_HEADER)?;

        let mut meters = Vec::new();
        for (index, pool) in pools.iter().enumerate() {
            let hosts = pool.borrow().hosts().len();
            for host in 0..hosts {
                meters.push(HostEnergyMeter::start(&pools, index, host));
            }
        }

        let mut timer = Timer::new(MonitorTick {});
        timer.subscribe_periodic(&ctx, interval);
        log_info!(ctx, "monitoring {} hosts every {} ticks", meters.len(), interval);

        Ok(StateMonitor {
            dispatcher,
            pools,
            meters,
            snapshots: Vec::new(),
            writer,
            finished: false,
            energy_kwh: None,
            failure: None,
            timer,
            ctx,
        })
    }

    pub fn get_id(&self) -> Id {
        self.ctx.id()
    }

    pub fn snapshots(&self) -> &[OverallSystemState] {
        &self.snapshots
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Energy of all hosts in kWh, known once monitoring finished.
    pub fn total_energy_kwh(&self) -> Option<f64> {
        self.energy_kwh
    }

    /// Energy consumed so far, whether or not monitoring finished.
    pub fn consumed_energy_kwh(&self) -> f64 {
        to_kwh(
            self.meters
                .iter()
                .map(|m| m.total_consumption(&self.pools))
                .sum::<f64>(),
        )
    }

    pub fn has_failure(&self) -> bool {
        self.failure.is_some()
    }

    pub fn take_failure(&mut self) -> Option<SimulationError> {
        self.failure.take()
    }

    fn on_tick(&mut self) {
        let state = OverallSystemState::collect(ticks(&self.ctx), &self.pools);
        log_debug!(self.ctx, "{}", serde_json::to_string(&state).unwrap_or_default());
        self.snapshots.push(state);

        let dispatching = self.dispatcher.borrow().is_subscribed();
        if !dispatching && state.queued == 0 && state.running == 0 {
            if let Err(e) = self.finish() {
                log_error!(self.ctx, "cannot write the report: {}", e);
                self.failure = Some(e);
            }
        }
    }

    /// Stops sampling, closes the meters and writes the report. Called on its
    /// own once the system is idle; calling it again does nothing.
    pub fn finish(&mut self) -> Result<(), SimulationError> {
        if self.finished {
            return Ok(());
        }
        self.timer.unsubscribe(&self.ctx);
        self.finished = true;
        for meter in self.meters.iter_mut() {
            meter.stop(&self.pools);
        }
        let energy = self.consumed_energy_kwh();
        self.energy_kwh = Some(energy);

        for state in self.snapshots.iter() {
            self.writer.serialize(state)?;
        }
        self.writer.flush()?;

        log_info!(
            self.ctx,
            "system idle, {} samples written, {:.6} kWh consumed",
            self.snapshots.len(),
            energy
        );
        Ok(())
    }
}

impl EventHandler for StateMonitor {
    fn on(&mut self, event: Event) {
        let event_id = event.id;
        cast!(match event.data {
            MonitorTick {} => {
                if self.timer.on_fire(&self.ctx, event_id) {
                    self.on_tick();
                }
            }
        })
    }
}
