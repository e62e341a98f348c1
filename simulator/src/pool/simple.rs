//! Reference pool: first-fit gang placement over a fixed set of hosts.
//!
//! Allocations of one request are placed together or not at all, in FIFO
//! request order. A placed allocation first waits for its host to boot (if
//! the host was off), then copies its image from the storage endpoint and
//! finally becomes RUNNING. Hosts power off as soon as they become empty.

use std::collections::VecDeque;

use dslab_core::{cast, event::EventId, log_debug, Event, EventHandler, Id, SimulationContext};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AllocationError, PlacementError},
    timer::{ticks, Time},
};

use super::{
    AllocationHandle, AllocationShape, AllocationState, AllocationStateChanged, HostMetrics,
    HostSpec, PoolMetrics, ResourcePool, StorageId, VirtualImage, WorkloadCancelled,
    WorkloadFinished,
};

const EPS: f64 = 1e-9;

/// Host power draw in watts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PowerModel {
    pub off: f64,
    pub idle: f64,
    pub max: f64,
}

impl Default for PowerModel {
    fn default() -> Self {
        Self {
            off: 20.,
            idle: 296.,
            max: 493.,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolOptions {
    pub boot_time: Time,
    pub power: PowerModel,
    /// Bytes per tick served by the storage endpoint.
    pub storage_bandwidth: f64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            boot_time: 89_000,
            power: PowerModel::default(),
            storage_bandwidth: 1_250_000.,
        }
    }
}

#[derive(Clone, Serialize)]
struct TransferCompleted {
    allocation: u64,
}

#[derive(Clone, Serialize)]
struct WorkloadDone {
    allocation: u64,
}

struct Host {
    spec: HostSpec,
    free_units: f64,
    running: u64,
    completed: u64,
    powered_on: bool,
    ready_at: Time,
    energy: f64,
    last_accounted: Time,
}

impl Host {
    fn new(spec: HostSpec) -> Self {
        Self {
            spec,
            free_units: spec.units,
            running: 0,
            completed: 0,
            powered_on: false,
            ready_at: 0,
            energy: 0.,
            last_accounted: 0,
        }
    }

    fn accepts(&self, shape: &AllocationShape) -> bool {
        self.spec.memory >= shape.memory
            && (!shape.minimum_power || self.spec.processing_power + EPS >= shape.processing_power)
    }

    fn power(&self, model: &PowerModel) -> f64 {
        if !self.powered_on {
            return model.off;
        }
        let utilization = if self.spec.units > 0. {
            ((self.spec.units - self.free_units) / self.spec.units).clamp(0., 1.)
        } else {
            0.
        };
        model.idle + (model.max - model.idle) * utilization
    }

    fn account(&mut self, now: Time, model: &PowerModel) {
        if now > self.last_accounted {
            self.energy += self.power(model) * (now - self.last_accounted) as f64;
            self.last_accounted = now;
        }
    }
}

struct StorageEndpoint {
    images: FxHashSet<String>,
    transferred: f64,
}

struct RunningWorkload {
    event: EventId,
    listener: Id,
}

struct Allocation {
    state: AllocationState,
    shape: AllocationShape,
    image_size: u64,
    storage: StorageId,
    host: Option<usize>,
    listeners: Vec<Id>,
    transfer: Option<EventId>,
    workload: Option<RunningWorkload>,
}

struct PendingRequest {
    allocations: Vec<u64>,
}

pub struct SimplePool {
    index: usize,
    name: String,
    options: PoolOptions,
    hosts: Vec<Host>,
    storages: Vec<StorageEndpoint>,
    allocations: FxHashMap<u64, Allocation>,
    queue: VecDeque<PendingRequest>,
    next_allocation_id: u64,
    ctx: SimulationContext,
}

impl SimplePool {
    /// `index` is the position of the pool in the dispatcher's pool list and
    /// ends up in every handle the pool gives out.
    pub fn new(
        ctx: SimulationContext,
        index: usize,
        name: &str,
        hosts: Vec<HostSpec>,
        options: PoolOptions,
    ) -> SimplePool {
        SimplePool {
            index,
            name: name.to_string(),
            options,
            hosts: hosts.into_iter().map(Host::new).collect(),
            storages: vec![StorageEndpoint {
                images: FxHashSet::default(),
                transferred: 0.,
            }],
            allocations: FxHashMap::default(),
            queue: VecDeque::new(),
            next_allocation_id: 0,
            ctx,
        }
    }

    pub fn get_id(&self) -> Id {
        self.ctx.id()
    }

    fn handle(&self, id: u64) -> AllocationHandle {
        AllocationHandle {
            pool: self.index,
            id,
        }
    }

    fn own_id(&self, allocation: AllocationHandle) -> Result<u64, AllocationError> {
        if allocation.pool == self.index && self.allocations.contains_key(&allocation.id) {
            Ok(allocation.id)
        } else {
            Err(AllocationError::Unknown(allocation))
        }
    }

    /// How many allocations of `shape` the empty pool could hold at once.
    fn capacity_for(&self, shape: &AllocationShape) -> u64 {
        let units = shape.units.max(EPS);
        self.hosts
            .iter()
            .filter(|h| h.accepts(shape))
            .map(|h| ((h.spec.units + EPS) / units).floor() as u64)
            .sum()
    }

    fn transition(&mut self, id: u64, new_state: AllocationState) {
        let handle = self.handle(id);
        let Some(allocation) = self.allocations.get_mut(&id) else {
            return;
        };
        let old_state = allocation.state;
        allocation.state = new_state;
        log_debug!(self.ctx, "allocation {} {:?} -> {:?}", id, old_state, new_state);
        for listener in allocation.listeners.iter() {
            self.ctx.emit_now(
                AllocationStateChanged {
                    allocation: handle,
                    old_state,
                    new_state,
                },
                *listener,
            );
        }
    }

    fn find_placement(&self, request: &PendingRequest) -> Option<Vec<usize>> {
        let mut free = self.hosts.iter().map(|h| h.free_units).collect::<Vec<_>>();
        let mut placement = Vec::with_capacity(request.allocations.len());
        for id in request.allocations.iter() {
            let shape = &self.allocations.get(id)?.shape;
            let host = (0..self.hosts.len())
                .find(|&i| self.hosts[i].accepts(shape) && free[i] + EPS >= shape.units)?;
            free[host] -= shape.units;
            placement.push(host);
        }
        Some(placement)
    }

    fn process_queue(&mut self) {
        while let Some(request) = self.queue.front() {
            let Some(placement) = self.find_placement(request) else {
                break;
            };
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            for (id, host) in request.allocations.into_iter().zip(placement) {
                self.place(id, host);
            }
        }
    }

    fn place(&mut self, id: u64, host_index: usize) {
        let now = ticks(&self.ctx);
        let Some(allocation) = self.allocations.get_mut(&id) else {
            return;
        };

        let host = &mut self.hosts[host_index];
        host.account(now, &self.options.power);
        if !host.powered_on {
            host.powered_on = true;
            host.ready_at = now + self.options.boot_time;
        }
        host.free_units -= allocation.shape.units;
        host.running += 1;

        let transfer = if self.options.storage_bandwidth > 0. {
            (allocation.image_size as f64 / self.options.storage_bandwidth).ceil() as Time
        } else {
            0
        };
        let delay = host.ready_at.saturating_sub(now) + transfer;

        allocation.host = Some(host_index);
        allocation.transfer = Some(
            self.ctx
                .emit_self(TransferCompleted { allocation: id }, delay as f64),
        );

        log_debug!(
            self.ctx,
            "allocation {} placed on host {}, running in {}",
            id,
            host_index,
            delay
        );
        self.transition(id, AllocationState::InitialTransfer);
    }

    fn release(&mut self, id: u64) {
        let now = ticks(&self.ctx);
        let Some(allocation) = self.allocations.get_mut(&id) else {
            return;
        };
        if let Some(host_index) = allocation.host.take() {
            let host = &mut self.hosts[host_index];
            host.account(now, &self.options.power);
            host.free_units = (host.free_units + allocation.shape.units).min(host.spec.units);
            host.running -= 1;
            host.completed += 1;
            if host.running == 0 {
                host.powered_on = false;
            }
        }
        self.transition(id, AllocationState::Destroyed);
        self.process_queue();
    }

    fn dequeue(&mut self, id: u64) {
        for request in self.queue.iter_mut() {
            request.allocations.retain(|a| *a != id);
        }
        self.transition(id, AllocationState::Destroyed);
        self.process_queue();
    }

    fn on_transfer_completed(&mut self, id: u64) {
        let Some(allocation) = self.allocations.get_mut(&id) else {
            return;
        };
        if allocation.state != AllocationState::InitialTransfer {
            return;
        }
        allocation.transfer = None;
        if let Some(storage) = self.storages.get_mut(allocation.storage) {
            storage.transferred += allocation.image_size as f64;
        }
        self.transition(id, AllocationState::Running);
    }

    fn on_workload_done(&mut self, id: u64) {
        let handle = self.handle(id);
        if let Some(workload) = self
            .allocations
            .get_mut(&id)
            .and_then(|a| a.workload.take())
        {
            self.ctx.emit_now(WorkloadFinished { allocation: handle }, workload.listener);
        }
    }
}

impl ResourcePool for SimplePool {
    fn name(&self) -> &str {
        &self.name
    }

    fn hosts(&self) -> Vec<HostSpec> {
        self.hosts.iter().map(|h| h.spec).collect()
    }

    fn register_image(&mut self, image: &VirtualImage) -> StorageId {
        self.storages[0].images.insert(image.name.clone());
        0
    }

    fn request_allocations(
        &mut self,
        image: &VirtualImage,
        shape: &AllocationShape,
        storage: StorageId,
        count: u32,
    ) -> Result<Vec<AllocationHandle>, PlacementError> {
        if storage >= self.storages.len() {
            return Err(PlacementError::UnknownStorage {
                pool: self.name.clone(),
                storage,
            });
        }
        let capacity = self.capacity_for(shape);
        if capacity == 0 {
            return Err(PlacementError::Unsatisfiable {
                pool: self.name.clone(),
                units: shape.units,
            });
        }

        let servable = count as u64 <= capacity;
        let state = if servable {
            AllocationState::Requested
        } else {
            AllocationState::NonServable
        };

        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = self.next_allocation_id;
            self.next_allocation_id += 1;
            self.allocations.insert(
                id,
                Allocation {
                    state,
                    shape: *shape,
                    image_size: image.size,
                    storage,
                    host: None,
                    listeners: Vec::new(),
                    transfer: None,
                    workload: None,
                },
            );
            ids.push(id);
        }
        let handles = ids.iter().map(|id| self.handle(*id)).collect::<Vec<_>>();

        if servable {
            self.queue.push_back(PendingRequest { allocations: ids });
            self.process_queue();
        } else {
            log_debug!(
                self.ctx,
                "{} allocations of {} units exceed the pool capacity of {}",
                count,
                shape.units,
                capacity
            );
        }
        Ok(handles)
    }

    fn state(&self, allocation: AllocationHandle) -> Option<AllocationState> {
        if allocation.pool != self.index {
            return None;
        }
        self.allocations.get(&allocation.id).map(|a| a.state)
    }

    fn allocated_units(&self, allocation: AllocationHandle) -> Option<f64> {
        if allocation.pool != self.index {
            return None;
        }
        self.allocations.get(&allocation.id).map(|a| a.shape.units)
    }

    fn subscribe_state_change(
        &mut self,
        allocation: AllocationHandle,
        listener: Id,
    ) -> Result<(), AllocationError> {
        let id = self.own_id(allocation)?;
        if let Some(a) = self.allocations.get_mut(&id) {
            if !a.listeners.contains(&listener) {
                a.listeners.push(listener);
            }
        }
        Ok(())
    }

    fn unsubscribe_state_change(&mut self, allocation: AllocationHandle, listener: Id) {
        if allocation.pool != self.index {
            return;
        }
        if let Some(a) = self.allocations.get_mut(&allocation.id) {
            a.listeners.retain(|l| *l != listener);
        }
    }

    fn destroy(&mut self, allocation: AllocationHandle, force: bool) -> Result<(), AllocationError> {
        let id = self.own_id(allocation)?;
        let Some(a) = self.allocations.get_mut(&id) else {
            return Err(AllocationError::Unknown(allocation));
        };

        match (a.state, force) {
            (AllocationState::Destroyed | AllocationState::NonServable, true) => Ok(()),
            (AllocationState::Running, false) if a.workload.is_none() => {
                self.release(id);
                Ok(())
            }
            (state, false) => Err(AllocationError::InvalidState {
                allocation,
                state,
                operation: "gracefully destroy",
            }),
            (AllocationState::Requested, true) => {
                self.dequeue(id);
                Ok(())
            }
            (AllocationState::InitialTransfer, true) => {
                if let Some(event) = a.transfer.take() {
                    self.ctx.cancel_event(event);
                }
                self.release(id);
                Ok(())
            }
            (AllocationState::Running, true) => {
                if let Some(workload) = a.workload.take() {
                    self.ctx.cancel_event(workload.event);
                    self.ctx
                        .emit_now(WorkloadCancelled { allocation }, workload.listener);
                }
                self.release(id);
                Ok(())
            }
        }
    }

    fn issue_workload(
        &mut self,
        allocation: AllocationHandle,
        amount: f64,
        limit: f64,
        listener: Id,
    ) -> Result<(), AllocationError> {
        let id = self.own_id(allocation)?;
        let Some(a) = self.allocations.get_mut(&id) else {
            return Err(AllocationError::Unknown(allocation));
        };
        if a.state != AllocationState::Running {
            return Err(AllocationError::InvalidState {
                allocation,
                state: a.state,
                operation: "issue a workload on",
            });
        }
        if a.workload.is_some() {
            return Err(AllocationError::WorkloadInFlight(allocation));
        }

        let rate = a.shape.units.min(limit).max(EPS);
        let duration = (amount / rate * 1000.).round() as Time;
        let event = self.ctx.emit_self(WorkloadDone { allocation: id }, duration as f64);
        a.workload = Some(RunningWorkload { event, listener });
        Ok(())
    }

    fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            hosts: self
                .hosts
                .iter()
                .map(|h| HostMetrics {
                    completed: h.completed,
                    running: h.running,
                    total_units: h.spec.units,
                    used_units: h.spec.units - h.free_units,
                    powered_on: h.powered_on,
                })
                .collect(),
            queue_length: self
                .queue
                .iter()
                .map(|r| r.allocations.len() as u64)
                .sum(),
            transferred_bytes: self.storages[0].transferred,
        }
    }

    fn host_energy(&mut self, host: usize) -> f64 {
        let now = ticks(&self.ctx);
        match self.hosts.get_mut(host) {
            Some(h) => {
                h.account(now, &self.options.power);
                h.energy
            }
            None => 0.,
        }
    }
}

impl EventHandler for SimplePool {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            TransferCompleted { allocation } => {
                self.on_transfer_completed(allocation);
            }
            WorkloadDone { allocation } => {
                self.on_workload_done(allocation);
            }
        })
    }
}
