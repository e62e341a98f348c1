//! Contract between the dispatcher and the compute pools it places
//! allocations on.
//!
//! A pool owns the lifecycle of its allocations. Consumers hold plain
//! [`AllocationHandle`]s and observe progress through events sent to the
//! listener ids they subscribed:
//!
//! - [`AllocationStateChanged`] whenever an allocation moves between states,
//! - [`WorkloadFinished`] / [`WorkloadCancelled`] for issued workloads.

pub mod simple;

use std::{cell::RefCell, rc::Rc};

use dslab_core::Id;
use serde::{Deserialize, Serialize};

use crate::error::{AllocationError, PlacementError};

pub use simple::SimplePool;

pub type PoolRef = Rc<RefCell<dyn ResourcePool>>;

/// Index of a storage endpoint inside its pool.
pub type StorageId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct AllocationHandle {
    pub pool: usize,
    pub id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum AllocationState {
    Requested,
    InitialTransfer,
    Running,
    NonServable,
    Destroyed,
}

impl AllocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AllocationState::NonServable | AllocationState::Destroyed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VirtualImage {
    pub name: String,
    pub startup_processing: f64,
    pub size: u64,
}

impl Default for VirtualImage {
    fn default() -> Self {
        Self {
            name: "generic".to_string(),
            startup_processing: 30.,
            size: 100_000_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AllocationShape {
    pub units: f64,
    /// Processing power requested for every unit.
    pub processing_power: f64,
    /// Whether `processing_power` is a lower bound the host has to offer.
    pub minimum_power: bool,
    pub memory: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    pub units: f64,
    pub processing_power: f64,
    pub memory: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct HostMetrics {
    pub completed: u64,
    pub running: u64,
    pub total_units: f64,
    pub used_units: f64,
    pub powered_on: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub hosts: Vec<HostMetrics>,
    pub queue_length: u64,
    /// Bytes served so far by the primary (first registered) storage endpoint.
    pub transferred_bytes: f64,
}

#[derive(Clone, Serialize)]
pub struct AllocationStateChanged {
    pub allocation: AllocationHandle,
    pub old_state: AllocationState,
    pub new_state: AllocationState,
}

#[derive(Clone, Serialize)]
pub struct WorkloadFinished {
    pub allocation: AllocationHandle,
}

#[derive(Clone, Serialize)]
pub struct WorkloadCancelled {
    pub allocation: AllocationHandle,
}

pub trait ResourcePool {
    fn name(&self) -> &str;

    fn hosts(&self) -> Vec<HostSpec>;

    /// Makes `image` available on the primary storage endpoint and returns it.
    fn register_image(&mut self, image: &VirtualImage) -> StorageId;

    /// Requests `count` allocations of `shape`. Fails only when the request
    /// can never be served; requests exceeding the pool's total capacity come
    /// back as NONSERVABLE allocations instead.
    fn request_allocations(
        &mut self,
        image: &VirtualImage,
        shape: &AllocationShape,
        storage: StorageId,
        count: u32,
    ) -> Result<Vec<AllocationHandle>, PlacementError>;

    fn state(&self, allocation: AllocationHandle) -> Option<AllocationState>;

    /// Units actually granted to the allocation.
    fn allocated_units(&self, allocation: AllocationHandle) -> Option<f64>;

    fn subscribe_state_change(
        &mut self,
        allocation: AllocationHandle,
        listener: Id,
    ) -> Result<(), AllocationError>;

    fn unsubscribe_state_change(&mut self, allocation: AllocationHandle, listener: Id);

    /// Graceful destruction requires a RUNNING allocation without workload;
    /// `force` tears down from any state and is idempotent.
    fn destroy(&mut self, allocation: AllocationHandle, force: bool) -> Result<(), AllocationError>;

    /// Starts processing `amount` unit-seconds at no more than `limit` units
    /// per second; completion is reported to `listener`.
    fn issue_workload(
        &mut self,
        allocation: AllocationHandle,
        amount: f64,
        limit: f64,
        listener: Id,
    ) -> Result<(), AllocationError>;

    fn metrics(&self) -> PoolMetrics;

    /// Energy consumed by `host` since the start of the simulation, in W·ms.
    fn host_energy(&mut self, host: usize) -> f64;
}
