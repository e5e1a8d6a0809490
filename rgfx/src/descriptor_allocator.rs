//! A pool of descriptor pools that grows on demand.
//!
//! Pools sit on one of two stacks. `ready` pools may still have room and
//! are tried first; `full` pools reported exhaustion and stay there until
//! [`clear_pools`](GrowableDescriptorAllocator::clear_pools) resets them.
//! When no ready pool exists a new one is created at the current capacity,
//! and the capacity for the next one doubles. Each pool keeps the capacity
//! it was created with, and pools are never destroyed before the allocator.
//!
//! The Vulkan calls sit behind [`DescriptorPoolBackend`] so the policy can
//! be exercised without a device.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::descriptor::DescriptorPool;
use crate::device::Device;

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

/// Sizes a descriptor pool is created with.
#[derive(Debug, Clone)]
pub struct PoolCapacity {
    pub max_sets: u32,
    pub per_type: Vec<vk::DescriptorPoolSize>,
}

impl PartialEq for PoolCapacity {
    fn eq(&self, other: &Self) -> bool {
        self.max_sets == other.max_sets
            && self.per_type.len() == other.per_type.len()
            && self
                .per_type
                .iter()
                .zip(&other.per_type)
                .all(|(a, b)| a.ty == b.ty && a.descriptor_count == b.descriptor_count)
    }
}

impl Eq for PoolCapacity {}

impl Default for PoolCapacity {
    fn default() -> Self {
        let size = |ty, descriptor_count| vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        };
        Self {
            max_sets: 64,
            per_type: vec![
                size(vk::DescriptorType::UNIFORM_BUFFER, 64),
                size(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 32),
                size(vk::DescriptorType::STORAGE_BUFFER, 32),
                size(vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, 16),
                size(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 256),
            ],
        }
    }
}

impl PoolCapacity {
    /// Twice this capacity in every dimension, saturating at `u32::MAX`.
    pub fn doubled(&self) -> Self {
        Self {
            max_sets: self.max_sets.saturating_mul(2),
            per_type: self
                .per_type
                .iter()
                .map(|s| vk::DescriptorPoolSize {
                    ty: s.ty,
                    descriptor_count: s.descriptor_count.saturating_mul(2),
                })
                .collect(),
        }
    }

    pub fn count_of(&self, ty: vk::DescriptorType) -> u32 {
        self.per_type
            .iter()
            .filter(|s| s.ty == ty)
            .map(|s| s.descriptor_count)
            .sum()
    }

    /// True when no dimension of `self` is smaller than in `other`.
    pub fn covers(&self, other: &Self) -> bool {
        self.max_sets >= other.max_sets
            && other
                .per_type
                .iter()
                .all(|s| self.count_of(s.ty) >= s.descriptor_count)
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// One set to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetRequest {
    pub layout: vk::DescriptorSetLayout,
    /// Descriptor count for a variable-count binding, if the layout has one.
    pub variable_count: Option<u32>,
}

pub trait DescriptorPoolBackend {
    type Pool;
    type Set;

    fn create_pool(&mut self, capacity: &PoolCapacity) -> Result<Self::Pool, vk::Result>;

    fn allocate_set(
        &mut self,
        pool: &Self::Pool,
        request: &SetRequest,
    ) -> Result<Self::Set, vk::Result>;

    /// Frees every set allocated from `pool`.
    fn reset_pool(&mut self, pool: &Self::Pool) -> Result<(), vk::Result>;
}

/// Creates real pools on a device. Pools get `UPDATE_AFTER_BIND` when the
/// device enabled descriptor indexing so bindless layouts can use them.
pub struct DevicePoolBackend {
    device: Arc<Device>,
    created: u32,
}

impl std::fmt::Debug for DevicePoolBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePoolBackend")
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

impl DevicePoolBackend {
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            device: Arc::clone(device),
            created: 0,
        }
    }
}

impl DescriptorPoolBackend for DevicePoolBackend {
    type Pool = DescriptorPool;
    type Set = vk::DescriptorSet;

    fn create_pool(&mut self, capacity: &PoolCapacity) -> Result<DescriptorPool, vk::Result> {
        let name = format!("descriptor pool {}", self.created);
        let pool = DescriptorPool::new(
            &self.device,
            capacity,
            self.device.descriptor_indexing_enabled(),
            Some(&name),
        )?;
        self.created += 1;
        Ok(pool)
    }

    fn allocate_set(
        &mut self,
        pool: &DescriptorPool,
        request: &SetRequest,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        pool.allocate(request.layout, request.variable_count)
    }

    fn reset_pool(&mut self, pool: &DescriptorPool) -> Result<(), vk::Result> {
        // SAFETY: the allocator only resets pools from clear_pools, whose
        // caller guarantees no pending work uses their sets.
        unsafe { pool.reset() }
    }
}

// ---------------------------------------------------------------------------
// GrowableDescriptorAllocator
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AllocateDescriptorSetError {
    #[error("Vulkan error creating descriptor pool: {0}")]
    CreatePool(vk::Result),
    #[error("Vulkan error allocating descriptor set: {0}")]
    Allocate(vk::Result),
    #[error("Descriptor set does not fit a freshly created pool: {0}")]
    Exhausted(vk::Result),
    #[error("Vulkan error resetting descriptor pool: {0}")]
    ResetPool(vk::Result),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u32);

/// Identifies the pool a set came from and the reset generation it was
/// allocated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLease {
    pool: PoolId,
    epoch: u64,
}

impl PoolLease {
    pub fn pool(&self) -> PoolId {
        self.pool
    }
}

#[derive(Debug)]
pub struct SetAllocation<S> {
    pub set: S,
    pub lease: PoolLease,
}

#[derive(Debug)]
struct PoolSlot<P> {
    id: PoolId,
    capacity: PoolCapacity,
    epoch: u64,
    pool: P,
}

/// Exclusive ownership of one pool while it is off both stacks. Hand it
/// back with [`set_full_pool`](GrowableDescriptorAllocator::set_full_pool)
/// or [`return_pool`](GrowableDescriptorAllocator::return_pool).
#[derive(Debug)]
#[must_use = "a pool token must be returned to the allocator"]
pub struct PoolToken<P> {
    slot: PoolSlot<P>,
}

impl<P> PoolToken<P> {
    pub fn id(&self) -> PoolId {
        self.slot.id
    }

    pub fn capacity(&self) -> &PoolCapacity {
        &self.slot.capacity
    }

    pub fn pool(&self) -> &P {
        &self.slot.pool
    }
}

pub struct GrowableDescriptorAllocator<B: DescriptorPoolBackend> {
    backend: B,
    ready: Vec<PoolSlot<B::Pool>>,
    full: Vec<PoolSlot<B::Pool>>,
    next_capacity: PoolCapacity,
    next_id: u32,
}

impl<B> std::fmt::Debug for GrowableDescriptorAllocator<B>
where
    B: DescriptorPoolBackend,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowableDescriptorAllocator")
            .field("ready", &self.ready.len())
            .field("full", &self.full.len())
            .field("next_capacity", &self.next_capacity)
            .finish_non_exhaustive()
    }
}

fn is_exhaustion(result: vk::Result) -> bool {
    matches!(
        result,
        vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL
    )
}

impl<B: DescriptorPoolBackend> GrowableDescriptorAllocator<B> {
    pub fn new(backend: B, initial_capacity: PoolCapacity) -> Self {
        Self {
            backend,
            ready: Vec::new(),
            full: Vec::new(),
            next_capacity: initial_capacity,
            next_id: 0,
        }
    }

    /// Takes a ready pool, or creates one at the current capacity and
    /// doubles the capacity for the next creation.
    pub fn get_pool(&mut self) -> Result<PoolToken<B::Pool>, AllocateDescriptorSetError> {
        if let Some(slot) = self.ready.pop() {
            return Ok(PoolToken { slot });
        }

        let capacity = self.next_capacity.clone();
        let pool = self
            .backend
            .create_pool(&capacity)
            .map_err(AllocateDescriptorSetError::CreatePool)?;
        let id = PoolId(self.next_id);
        self.next_id += 1;
        tracing::debug!(
            "Created descriptor pool {} (max_sets {})",
            id.0,
            capacity.max_sets
        );
        self.next_capacity = capacity.doubled();
        Ok(PoolToken {
            slot: PoolSlot {
                id,
                capacity,
                epoch: 0,
                pool,
            },
        })
    }

    /// Parks an exhausted pool until the next [`clear_pools`](Self::clear_pools).
    pub fn set_full_pool(&mut self, token: PoolToken<B::Pool>) {
        self.full.push(token.slot);
    }

    pub fn return_pool(&mut self, token: PoolToken<B::Pool>) {
        self.ready.push(token.slot);
    }

    /// Allocates one set. An exhausted pool moves to the full stack and the
    /// request is retried once on another pool; a second failure is
    /// returned as [`AllocateDescriptorSetError::Exhausted`].
    pub fn allocate(
        &mut self,
        request: &SetRequest,
    ) -> Result<SetAllocation<B::Set>, AllocateDescriptorSetError> {
        let token = self.get_pool()?;
        let first_error = match self.backend.allocate_set(token.pool(), request) {
            Ok(set) => return Ok(self.finish(token, set)),
            Err(e) if is_exhaustion(e) => e,
            Err(e) => {
                self.return_pool(token);
                return Err(AllocateDescriptorSetError::Allocate(e));
            }
        };

        tracing::debug!(
            "Descriptor pool {} exhausted ({first_error}), retrying",
            token.id().0
        );
        self.set_full_pool(token);

        let token = self.get_pool()?;
        match self.backend.allocate_set(token.pool(), request) {
            Ok(set) => Ok(self.finish(token, set)),
            Err(e) if is_exhaustion(e) => {
                tracing::error!("Descriptor set allocation failed after growing pools: {e}");
                self.set_full_pool(token);
                Err(AllocateDescriptorSetError::Exhausted(e))
            }
            Err(e) => {
                self.return_pool(token);
                Err(AllocateDescriptorSetError::Allocate(e))
            }
        }
    }

    fn finish(&mut self, token: PoolToken<B::Pool>, set: B::Set) -> SetAllocation<B::Set> {
        let lease = PoolLease {
            pool: token.slot.id,
            epoch: token.slot.epoch,
        };
        self.return_pool(token);
        SetAllocation { set, lease }
    }

    /// Resets every pool and makes them all ready again. Every set
    /// allocated so far becomes invalid.
    ///
    /// The caller must ensure no pending GPU work uses any of those sets.
    pub fn clear_pools(&mut self) -> Result<(), AllocateDescriptorSetError> {
        for slot in self.ready.iter_mut().chain(self.full.iter_mut()) {
            self.backend
                .reset_pool(&slot.pool)
                .map_err(AllocateDescriptorSetError::ResetPool)?;
            slot.epoch += 1;
        }
        self.ready.append(&mut self.full);
        tracing::debug!("Cleared {} descriptor pools", self.ready.len());
        Ok(())
    }

    /// Whether a set allocated under `lease` is still valid.
    pub fn is_live(&self, lease: &PoolLease) -> bool {
        self.ready
            .iter()
            .chain(&self.full)
            .any(|slot| slot.id == lease.pool && slot.epoch == lease.epoch)
    }

    /// Capacity the next created pool will get.
    pub fn next_capacity(&self) -> &PoolCapacity {
        &self.next_capacity
    }

    pub fn ready_pools(&self) -> impl Iterator<Item = (PoolId, &PoolCapacity)> {
        self.ready.iter().map(|s| (s.id, &s.capacity))
    }

    pub fn full_pools(&self) -> impl Iterator<Item = (PoolId, &PoolCapacity)> {
        self.full.iter().map(|s| (s.id, &s.capacity))
    }

    pub fn pool_count(&self) -> usize {
        self.ready.len() + self.full.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Each pool holds `max_sets` sets; set handles count up from 1.
    #[derive(Default)]
    struct CountingBackend {
        created: Vec<PoolCapacity>,
        next_set: u64,
        fail_creation: bool,
        /// Pretend every pool is fragmented.
        always_fragmented: bool,
    }

    struct MockPool {
        capacity: u32,
        used: std::cell::Cell<u32>,
    }

    impl DescriptorPoolBackend for CountingBackend {
        type Pool = MockPool;
        type Set = u64;

        fn create_pool(&mut self, capacity: &PoolCapacity) -> Result<MockPool, vk::Result> {
            if self.fail_creation {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            self.created.push(capacity.clone());
            Ok(MockPool {
                capacity: capacity.max_sets,
                used: std::cell::Cell::new(0),
            })
        }

        fn allocate_set(&mut self, pool: &MockPool, _: &SetRequest) -> Result<u64, vk::Result> {
            if self.always_fragmented {
                return Err(vk::Result::ERROR_FRAGMENTED_POOL);
            }
            if pool.used.get() >= pool.capacity {
                return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
            }
            pool.used.set(pool.used.get() + 1);
            self.next_set += 1;
            Ok(self.next_set)
        }

        fn reset_pool(&mut self, pool: &MockPool) -> Result<(), vk::Result> {
            pool.used.set(0);
            Ok(())
        }
    }

    fn capacity(max_sets: u32) -> PoolCapacity {
        PoolCapacity {
            max_sets,
            per_type: vec![
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: max_sets,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: 2 * max_sets,
                },
            ],
        }
    }

    fn request() -> SetRequest {
        SetRequest {
            layout: vk::DescriptorSetLayout::null(),
            variable_count: None,
        }
    }

    fn allocator(max_sets: u32) -> GrowableDescriptorAllocator<CountingBackend> {
        GrowableDescriptorAllocator::new(CountingBackend::default(), capacity(max_sets))
    }

    #[test]
    fn exhausting_first_pool_creates_double_capacity() {
        let mut alloc = allocator(4);
        for _ in 0..4 {
            alloc.allocate(&request()).unwrap();
        }
        assert_eq!(alloc.backend.created.len(), 1);
        assert_eq!(alloc.full_pools().count(), 0);

        alloc.allocate(&request()).unwrap();

        let created = &alloc.backend.created;
        assert_eq!(created.len(), 2);
        assert_eq!(created[1], created[0].doubled());
        assert_eq!(
            created[1].count_of(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            16
        );
        let full: Vec<_> = alloc.full_pools().map(|(id, _)| id).collect();
        assert_eq!(full, vec![PoolId(0)]);
        let ready: Vec<_> = alloc.ready_pools().map(|(id, _)| id).collect();
        assert_eq!(ready, vec![PoolId(1)]);
    }

    #[test]
    fn capacity_never_shrinks_and_pools_are_kept() {
        let mut alloc = allocator(1);
        let mut last = alloc.next_capacity().clone();
        for i in 0..100 {
            alloc.allocate(&request()).unwrap();
            assert!(alloc.next_capacity().covers(&last));
            last = alloc.next_capacity().clone();
            assert_eq!(alloc.pool_count(), alloc.backend.created.len(), "allocation {i}");
        }
        // 1 + 2 + 4 + 8 + 16 + 32 + 64 sets fit in seven pools.
        assert_eq!(alloc.pool_count(), 7);
        for (id, cap) in alloc.ready_pools().chain(alloc.full_pools()) {
            assert_eq!(cap.max_sets, 1 << id.0);
        }
    }

    #[test]
    fn second_failure_is_fatal() {
        let mut alloc = allocator(4);
        alloc.backend.always_fragmented = true;
        let err = alloc.allocate(&request()).unwrap_err();
        assert!(matches!(
            err,
            AllocateDescriptorSetError::Exhausted(vk::Result::ERROR_FRAGMENTED_POOL)
        ));
        // Exactly one retry: two pools, both parked as full.
        assert_eq!(alloc.backend.created.len(), 2);
        assert_eq!(alloc.full_pools().count(), 2);
    }

    #[test]
    fn pool_creation_failure_is_reported() {
        let mut alloc = allocator(4);
        alloc.backend.fail_creation = true;
        assert!(matches!(
            alloc.allocate(&request()),
            Err(AllocateDescriptorSetError::CreatePool(_))
        ));
        assert_eq!(alloc.pool_count(), 0);
    }

    #[test]
    fn clear_pools_recycles_and_invalidates() {
        let mut alloc = allocator(2);
        let first = alloc.allocate(&request()).unwrap();
        for _ in 0..2 {
            alloc.allocate(&request()).unwrap();
        }
        assert_eq!(alloc.full_pools().count(), 1);
        assert!(alloc.is_live(&first.lease));

        alloc.clear_pools().unwrap();
        assert_eq!(alloc.full_pools().count(), 0);
        assert_eq!(alloc.ready_pools().count(), 2);
        assert!(!alloc.is_live(&first.lease));

        // Recycled pools serve new sets without creating more.
        for _ in 0..6 {
            alloc.allocate(&request()).unwrap();
        }
        assert_eq!(alloc.backend.created.len(), 2);
    }

    #[test]
    fn tokens_round_trip_through_stacks() {
        let mut alloc = allocator(8);
        let token = alloc.get_pool().unwrap();
        assert_eq!(token.capacity().max_sets, 8);
        assert_eq!(alloc.next_capacity().max_sets, 16);
        alloc.set_full_pool(token);
        let token = alloc.get_pool().unwrap();
        assert_eq!(token.id(), PoolId(1));
        alloc.return_pool(token);
        assert_eq!(alloc.get_pool().unwrap().id(), PoolId(1));
    }

    #[test]
    fn doubling_saturates() {
        let cap = PoolCapacity {
            max_sets: u32::MAX - 1,
            per_type: vec![vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: u32::MAX / 2 + 1,
            }],
        };
        let doubled = cap.doubled();
        assert_eq!(doubled.max_sets, u32::MAX);
        assert_eq!(doubled.count_of(vk::DescriptorType::STORAGE_BUFFER), u32::MAX);
    }
}
