//! Memory resource manager
//!
//! Processors register resources up front. Each pass then runs:
//! 1. [`MemoryResourceManager::compute_sizes`] - every layout callback runs against
//!    a sizing cursor and the manager records the byte size per resource
//! 2. [`MemoryResourceManager::allocate`] - one allocation per pool, reused across
//!    passes while it stays large enough
//! 3. [`MemoryResourceManager::bind`] - the callbacks run again against real offsets
//! 4. [`MemoryResourceManager::allocate_custom`] for resources whose size is only
//!    known after a dependent stage ran
//! 5. [`MemoryResourceManager::reset_pass`] - teardown is arena reset, not
//!    per-object destruction
//!
//! Pool layout (host and device scratch):
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┬───────────────────┐
//! │ regular resources    │ stack region (groups alias)  │ custom tail       │
//! └──────────────────────┴──────────────────────────────┴───────────────────┘
//! ```

use std::sync::atomic::AtomicU32;

use bytemuck::Pod;

use super::arena::{Arena, ArenaSlice, SharedSlice};
use super::layout::{align_up, LayoutCursor, RESOURCE_ALIGNMENT};
use super::types::{MemoryError, MemoryPool, MemoryResult, ProcessorId, ResourceId, ResourceType};
use crate::config::MemorySettings;
use crate::processor::Processor;

/// Final location of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub pool: MemoryPool,
    pub offset: usize,
    pub size: usize,
}

/// An OUTPUT resource did not fit into caller-supplied memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitError {
    pub resource: String,
    pub requested: usize,
    pub available: usize,
}

#[derive(Debug, Clone)]
struct MemoryResource {
    name: String,
    owner: ProcessorId,
    kind: ResourceType,
    size: usize,
    /// Declared upper bound of a CUSTOM resource
    bound: Option<usize>,
    placement: Option<Placement>,
    valid: bool,
}

/// Per-pool byte counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSizes {
    bytes: [usize; 4],
}

impl PoolSizes {
    pub fn get(&self, pool: MemoryPool) -> usize {
        self.bytes[pool.index()]
    }

    pub fn total(&self) -> usize {
        self.bytes.iter().sum()
    }
}

/// Snapshot of pool usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub capacity: PoolSizes,
    pub arena_allocations: usize,
    pub n_resources: usize,
    pub n_invalid: usize,
    pub fit_errors: usize,
}

struct PlacementPlan {
    placements: Vec<(usize, Placement)>,
    misfits: Vec<(usize, usize, usize)>,
    custom_start: [usize; 4],
    required: PoolSizes,
}

/// Registration handle passed to [`Processor::register_memory`]
pub struct MemoryRegistrar<'a> {
    manager: &'a mut MemoryResourceManager,
    owner: ProcessorId,
    prefix: String,
}

impl MemoryRegistrar<'_> {
    /// Register a resource; no memory is allocated until the manager sizes the pools
    pub fn register(&mut self, name: &str, kind: ResourceType) -> MemoryResult<ResourceId> {
        let full_name = format!("{}.{}", self.prefix, name);
        kind.validate(&full_name)?;
        let id = ResourceId(self.manager.resources.len());
        tracing::trace!("Registered memory resource '{}' as {:?}", full_name, kind);
        self.manager.resources.push(MemoryResource {
            name: full_name,
            owner: self.owner,
            kind,
            size: 0,
            bound: None,
            placement: None,
            valid: true,
        });
        Ok(id)
    }

    pub fn owner(&self) -> ProcessorId {
        self.owner
    }
}

/// Owner of all pool arenas for the lifetime of a pipeline context
pub struct MemoryResourceManager {
    settings: MemorySettings,
    resources: Vec<MemoryResource>,
    processor_names: Vec<String>,
    arenas: [Option<Arena>; 4],
    custom_cursor: [usize; 4],
    fit_errors: Vec<FitError>,
    arena_allocations: usize,
}

impl MemoryResourceManager {
    pub fn new(settings: MemorySettings) -> Self {
        Self {
            settings,
            resources: Vec::new(),
            processor_names: Vec::new(),
            arenas: [None, None, None, None],
            custom_cursor: [0; 4],
            fit_errors: Vec::new(),
            arena_allocations: 0,
        }
    }

    /// Let `processor` register its resources; ids follow registration order
    pub fn register_processor(
        &mut self,
        processor: &mut dyn Processor,
    ) -> MemoryResult<ProcessorId> {
        let owner = ProcessorId(self.processor_names.len());
        let prefix = processor.name().to_string();
        self.processor_names.push(prefix.clone());
        let mut registrar = MemoryRegistrar {
            manager: self,
            owner,
            prefix,
        };
        processor.register_memory(&mut registrar)?;
        Ok(owner)
    }

    pub fn n_processors(&self) -> usize {
        self.processor_names.len()
    }

    pub fn n_resources(&self) -> usize {
        self.resources.len()
    }

    fn check_processors(&self, actual: usize) -> MemoryResult<()> {
        if actual != self.processor_names.len() {
            return Err(MemoryError::ProcessorMismatch {
                expected: self.processor_names.len(),
                actual,
            });
        }
        Ok(())
    }

    fn resource(&self, id: ResourceId) -> MemoryResult<&MemoryResource> {
        self.resources
            .get(id.0)
            .ok_or(MemoryError::UnknownResource(id.0))
    }

    fn pool_for(&self, kind: ResourceType) -> MemoryPool {
        if kind.contains(ResourceType::PERMANENT) {
            MemoryPool::DevicePersistent
        } else if kind.contains(ResourceType::OUTPUT | ResourceType::HOST)
            && self.arenas[MemoryPool::External.index()].is_some()
        {
            MemoryPool::External
        } else if kind.contains(ResourceType::GPU) {
            MemoryPool::DeviceScratch
        } else {
            MemoryPool::Host
        }
    }

    fn capacity_of(&self, pool: MemoryPool) -> usize {
        self.arenas[pool.index()]
            .as_ref()
            .map(|a| a.capacity())
            .unwrap_or(0)
    }

    /// Phase 1: run every layout callback against a placeholder base
    pub fn compute_sizes(&mut self, processors: &mut [&mut dyn Processor]) -> MemoryResult<PoolSizes> {
        self.check_processors(processors.len())?;

        for index in 0..self.resources.len() {
            let resource = &self.resources[index];
            if resource.kind.contains(ResourceType::CUSTOM) {
                let owner = resource.owner.0;
                self.resources[index].bound = processors[owner]
                    .custom_size_bound(ResourceId(index))
                    .map(|bytes| align_up(bytes, RESOURCE_ALIGNMENT));
                continue;
            }
            if resource.kind.contains(ResourceType::PERMANENT) && resource.placement.is_some() {
                continue;
            }
            let owner = resource.owner.0;
            let mut cursor = LayoutCursor::sizing();
            processors[owner].set_pointers(ResourceId(index), &mut cursor);
            self.resources[index].size = align_up(cursor.used(), RESOURCE_ALIGNMENT);
        }

        let plan = self.plan();
        tracing::debug!(
            host = plan.required.get(MemoryPool::Host),
            persistent = plan.required.get(MemoryPool::DevicePersistent),
            scratch = plan.required.get(MemoryPool::DeviceScratch),
            external = plan.required.get(MemoryPool::External),
            "Computed memory pool sizes"
        );
        Ok(plan.required)
    }

    fn plan(&self) -> PlacementPlan {
        let mut cursors = [0usize; 4];
        let mut placements = Vec::new();
        let mut misfits = Vec::new();
        let external_capacity = self.capacity_of(MemoryPool::External);

        // Permanent resources already placed keep their offsets
        for resource in &self.resources {
            if let (true, Some(p)) = (
                resource.kind.contains(ResourceType::PERMANENT),
                resource.placement,
            ) {
                let slot = &mut cursors[p.pool.index()];
                *slot = (*slot).max(p.offset + p.size);
            }
        }

        for (index, resource) in self.resources.iter().enumerate() {
            if resource
                .kind
                .intersects(ResourceType::CUSTOM | ResourceType::STACK)
            {
                continue;
            }
            if resource.kind.contains(ResourceType::PERMANENT) && resource.placement.is_some() {
                continue;
            }
            let pool = self.pool_for(resource.kind);
            let offset = align_up(cursors[pool.index()], RESOURCE_ALIGNMENT);
            if pool == MemoryPool::External && offset + resource.size > external_capacity {
                misfits.push((index, resource.size, external_capacity.saturating_sub(offset)));
                continue;
            }
            placements.push((
                index,
                Placement {
                    pool,
                    offset,
                    size: resource.size,
                },
            ));
            cursors[pool.index()] = offset + resource.size;
        }

        // Stack groups of different processors share one region
        for pool in [MemoryPool::Host, MemoryPool::DeviceScratch] {
            let stack_base = align_up(cursors[pool.index()], RESOURCE_ALIGNMENT);
            let mut stack_size = 0;
            for owner in 0..self.processor_names.len() {
                let mut group_end = stack_base;
                for (index, resource) in self.resources.iter().enumerate() {
                    if !resource.kind.contains(ResourceType::STACK)
                        || resource.owner.0 != owner
                        || self.pool_for(resource.kind) != pool
                    {
                        continue;
                    }
                    let offset = align_up(group_end, RESOURCE_ALIGNMENT);
                    placements.push((
                        index,
                        Placement {
                            pool,
                            offset,
                            size: resource.size,
                        },
                    ));
                    group_end = offset + resource.size;
                }
                stack_size = stack_size.max(group_end - stack_base);
            }
            if stack_size > 0 {
                cursors[pool.index()] = stack_base + stack_size;
            }
        }

        let mut custom_start = [0usize; 4];
        let mut required = PoolSizes::default();
        for pool in MemoryPool::ALL {
            let end = cursors[pool.index()];
            custom_start[pool.index()] = end;
            required.bytes[pool.index()] = match self.custom_reserve(pool) {
                0 => end,
                reserve => align_up(end, RESOURCE_ALIGNMENT) + reserve,
            };
        }

        PlacementPlan {
            placements,
            misfits,
            custom_start,
            required,
        }
    }

    /// Tail bytes of `pool` for CUSTOM resources: the sum of their declared bounds,
    /// plus the fixed reserve when any of them declared none
    fn custom_reserve(&self, pool: MemoryPool) -> usize {
        if pool == MemoryPool::External {
            return 0;
        }
        let mut reserve = 0;
        let mut unbounded = false;
        for resource in &self.resources {
            if !resource.kind.contains(ResourceType::CUSTOM) || self.pool_for(resource.kind) != pool {
                continue;
            }
            match resource.bound {
                Some(bound) => reserve += bound,
                None => unbounded = true,
            }
        }
        if unbounded {
            reserve += self.settings.custom_reserve_bytes;
        }
        reserve
    }

    fn ensure_capacity(&mut self, pool: MemoryPool, bytes: usize) -> MemoryResult<()> {
        let slot = pool.index();
        let current = self.capacity_of(pool);
        if self.arenas[slot].is_some() && current >= bytes {
            return Ok(());
        }
        if pool == MemoryPool::DevicePersistent
            && self
                .resources
                .iter()
                .any(|r| r.kind.contains(ResourceType::PERMANENT) && r.placement.is_some())
        {
            return Err(MemoryError::PoolCapacityExceeded {
                pool,
                requested: bytes,
                capacity: current,
            });
        }
        self.arenas[slot] = Some(Arena::new(pool, bytes)?);
        self.arena_allocations += 1;
        Ok(())
    }

    /// Phase 2: one allocation per pool, then record every placement
    pub fn allocate(&mut self) -> MemoryResult<PoolSizes> {
        let plan = self.plan();

        for pool in [
            MemoryPool::Host,
            MemoryPool::DevicePersistent,
            MemoryPool::DeviceScratch,
        ] {
            self.ensure_capacity(pool, plan.required.get(pool))?;
        }

        for (index, placement) in &plan.placements {
            let resource = &mut self.resources[*index];
            resource.placement = Some(*placement);
            resource.valid = true;
        }

        for (index, requested, available) in &plan.misfits {
            let resource = &mut self.resources[*index];
            resource.placement = None;
            resource.valid = false;
            tracing::warn!(
                "Output '{}' does not fit external memory: need {} bytes, {} available",
                resource.name,
                requested,
                available
            );
            self.fit_errors.push(FitError {
                resource: resource.name.clone(),
                requested: *requested,
                available: *available,
            });
        }

        self.custom_cursor = plan.custom_start;
        Ok(plan.required)
    }

    fn bind_one(
        &self,
        index: usize,
        processor: &mut dyn Processor,
    ) -> MemoryResult<()> {
        let resource = &self.resources[index];
        match resource.placement {
            Some(placement) => {
                let mut cursor = LayoutCursor::binding(placement.pool, placement.offset);
                processor.set_pointers(ResourceId(index), &mut cursor);
                if cursor.used() > placement.size {
                    tracing::error!(
                        "Resource '{}' requested {} bytes at bind time, {} reserved",
                        resource.name,
                        cursor.used(),
                        placement.size
                    );
                    return Err(MemoryError::AllocationSizeMismatch {
                        resource: resource.name.clone(),
                        reserved: placement.size,
                        requested: cursor.used(),
                    });
                }
            }
            None if !resource.valid => {
                processor.set_pointers(ResourceId(index), &mut LayoutCursor::null());
            }
            None => {}
        }
        Ok(())
    }

    /// Phase 3: re-run the callbacks against the real offsets
    pub fn bind(&mut self, processors: &mut [&mut dyn Processor]) -> MemoryResult<()> {
        self.check_processors(processors.len())?;
        for index in 0..self.resources.len() {
            let owner = self.resources[index].owner.0;
            self.bind_one(index, &mut *processors[owner])?;
        }
        Ok(())
    }

    /// Size, place and bind one CUSTOM resource
    ///
    /// A size beyond the bound declared through
    /// [`Processor::custom_size_bound`] is an [`MemoryError::AllocationSizeMismatch`].
    ///
    /// Returns `Ok(false)` when an OUTPUT resource did not fit external memory; the
    /// processor's handles are null in that case and a [`FitError`] is recorded.
    pub fn allocate_custom(
        &mut self,
        id: ResourceId,
        processor: &mut dyn Processor,
    ) -> MemoryResult<bool> {
        let resource = self.resource(id)?;
        if !resource.kind.contains(ResourceType::CUSTOM) {
            return Err(MemoryError::NotCustom(resource.name.clone()));
        }
        let kind = resource.kind;

        let mut cursor = LayoutCursor::sizing();
        processor.set_pointers(id, &mut cursor);
        let size = align_up(cursor.used(), RESOURCE_ALIGNMENT);
        let resource = &mut self.resources[id.0];
        resource.size = size;
        if let Some(bound) = resource.bound.filter(|&bound| size > bound) {
            tracing::error!(
                "Resource '{}' requested {} bytes, declared bound is {}",
                resource.name,
                size,
                bound
            );
            return Err(MemoryError::AllocationSizeMismatch {
                resource: resource.name.clone(),
                reserved: bound,
                requested: size,
            });
        }

        let pool = self.pool_for(kind);
        let capacity = self.capacity_of(pool);
        let offset = align_up(self.custom_cursor[pool.index()], RESOURCE_ALIGNMENT);

        if offset + size > capacity {
            if pool == MemoryPool::External {
                let resource = &mut self.resources[id.0];
                resource.valid = false;
                resource.placement = None;
                tracing::warn!(
                    "Output '{}' does not fit external memory: need {} bytes, {} available",
                    resource.name,
                    size,
                    capacity.saturating_sub(offset)
                );
                self.fit_errors.push(FitError {
                    resource: resource.name.clone(),
                    requested: size,
                    available: capacity.saturating_sub(offset),
                });
                processor.set_pointers(id, &mut LayoutCursor::null());
                return Ok(false);
            }
            return Err(MemoryError::PoolCapacityExceeded {
                pool,
                requested: offset + size,
                capacity,
            });
        }

        self.custom_cursor[pool.index()] = offset + size;
        let resource = &mut self.resources[id.0];
        resource.placement = Some(Placement { pool, offset, size });
        resource.valid = true;
        self.bind_one(id.0, processor)?;
        Ok(true)
    }

    /// Drop all non-permanent placements and null the processors' handles
    pub fn reset_pass(&mut self, processors: &mut [&mut dyn Processor]) -> MemoryResult<()> {
        self.check_processors(processors.len())?;
        for index in 0..self.resources.len() {
            if self.resources[index].kind.contains(ResourceType::PERMANENT) {
                continue;
            }
            let owner = self.resources[index].owner.0;
            let resource = &mut self.resources[index];
            resource.placement = None;
            resource.valid = true;
            processors[owner].set_pointers(ResourceId(index), &mut LayoutCursor::null());
        }
        self.custom_cursor = [0; 4];
        self.fit_errors.clear();
        Ok(())
    }

    // ========== External output memory ==========

    /// Place OUTPUT|HOST resources into caller-supplied memory from the next pass on
    pub fn attach_external_output(&mut self, arena: Arena) -> MemoryResult<()> {
        if arena.pool() != MemoryPool::External {
            return Err(MemoryError::InvalidResourceType {
                name: "external output".to_string(),
                reason: format!("arena belongs to the {} pool", arena.pool()),
            });
        }
        self.arenas[MemoryPool::External.index()] = Some(arena);
        Ok(())
    }

    /// Hand the external memory back; resources placed in it become unbound
    pub fn detach_external_output(&mut self) -> Option<Arena> {
        for resource in &mut self.resources {
            if matches!(resource.placement, Some(p) if p.pool == MemoryPool::External) {
                resource.placement = None;
            }
        }
        self.arenas[MemoryPool::External.index()].take()
    }

    pub fn external_output(&self) -> Option<&Arena> {
        self.arenas[MemoryPool::External.index()].as_ref()
    }

    // ========== Queries ==========

    pub fn placement(&self, id: ResourceId) -> Option<Placement> {
        self.resources.get(id.0).and_then(|r| r.placement)
    }

    /// False when an OUTPUT resource was marked null for lack of external memory
    pub fn is_valid(&self, id: ResourceId) -> bool {
        self.resources.get(id.0).map(|r| r.valid).unwrap_or(false)
    }

    pub fn resource_name(&self, id: ResourceId) -> Option<&str> {
        self.resources.get(id.0).map(|r| r.name.as_str())
    }

    pub fn resource_size(&self, id: ResourceId) -> Option<usize> {
        self.resources.get(id.0).map(|r| r.size)
    }

    pub fn fit_errors(&self) -> &[FitError] {
        &self.fit_errors
    }

    /// Whole resource region as bytes
    pub fn resource_bytes(&self, id: ResourceId) -> Option<ArenaSlice<u8>> {
        self.placement(id)
            .map(|p| ArenaSlice::new(Some(p.pool), p.offset, p.size))
    }

    pub fn stats(&self) -> MemoryStats {
        let mut capacity = PoolSizes::default();
        for pool in MemoryPool::ALL {
            capacity.bytes[pool.index()] = self.capacity_of(pool);
        }
        MemoryStats {
            capacity,
            arena_allocations: self.arena_allocations,
            n_resources: self.resources.len(),
            n_invalid: self.resources.iter().filter(|r| !r.valid).count(),
            fit_errors: self.fit_errors.len(),
        }
    }

    // ========== Region access ==========

    fn arena(&self, pool: MemoryPool) -> MemoryResult<&Arena> {
        self.arenas[pool.index()]
            .as_ref()
            .ok_or(MemoryError::PoolNotAllocated(pool))
    }

    fn region_ptr<T>(&self, slice: &ArenaSlice<T>) -> MemoryResult<*mut u8> {
        let pool = slice
            .pool()
            .ok_or_else(|| MemoryError::NullRegion(std::any::type_name::<T>().to_string()))?;
        let arena = self.arena(pool)?;
        arena.check_range(slice.offset(), slice.byte_len())?;
        let ptr = arena.ptr_at(slice.offset());
        if (ptr as usize) % std::mem::align_of::<T>() != 0 {
            return Err(MemoryError::Misaligned {
                offset: slice.offset(),
                reason: format!("alignment {}", std::mem::align_of::<T>()),
            });
        }
        Ok(ptr)
    }

    /// Shared typed view
    pub fn view<T: Pod>(&self, slice: ArenaSlice<T>) -> MemoryResult<&[T]> {
        let ptr = self.region_ptr(&slice)?;
        if slice.is_empty() {
            return Ok(&[]);
        }
        // SAFETY: range and alignment checked; no SharedSlice writes this region
        // while the view lives (regions of one bind never overlap)
        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, slice.byte_len()) };
        bytemuck::try_cast_slice(bytes).map_err(|e| MemoryError::Misaligned {
            offset: slice.offset(),
            reason: format!("{:?}", e),
        })
    }

    /// Exclusive typed view
    pub fn view_mut<T: Pod>(&mut self, slice: ArenaSlice<T>) -> MemoryResult<&mut [T]> {
        let ptr = self.region_ptr(&slice)?;
        if slice.is_empty() {
            return Ok(&mut []);
        }
        // SAFETY: range and alignment checked; `&mut self` excludes other views
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr, slice.byte_len()) };
        bytemuck::try_cast_slice_mut(bytes).map_err(|e| MemoryError::Misaligned {
            offset: slice.offset(),
            reason: format!("{:?}", e),
        })
    }

    /// Interior-mutable view for kernels writing disjoint elements
    pub fn shared<T: Pod>(&self, slice: ArenaSlice<T>) -> MemoryResult<SharedSlice<'_, T>> {
        let ptr = self.region_ptr(&slice)?;
        Ok(SharedSlice::from_raw(ptr as *mut T, slice.len()))
    }

    /// Atomic view of a `u32` region (counters, hit weights, flags)
    pub fn atomics_u32(&self, slice: ArenaSlice<u32>) -> MemoryResult<&[AtomicU32]> {
        let ptr = self.region_ptr(&slice)?;
        if slice.is_empty() {
            return Ok(&[]);
        }
        // SAFETY: AtomicU32 has the size and alignment of u32; alignment checked
        Ok(unsafe { std::slice::from_raw_parts(ptr as *const AtomicU32, slice.len()) })
    }

    /// Upload host data to the front of a region
    pub fn copy_from_host<T: Pod>(&mut self, slice: ArenaSlice<T>, src: &[T]) -> MemoryResult<()> {
        if src.len() > slice.len() {
            return Err(MemoryError::CopyLengthMismatch {
                region: slice.len(),
                source_len: src.len(),
            });
        }
        self.view_mut(slice)?[..src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn fill<T: Pod>(&mut self, slice: ArenaSlice<T>, value: T) -> MemoryResult<()> {
        self.view_mut(slice)?.fill(value);
        Ok(())
    }

    /// Download a region to the host
    pub fn to_vec<T: Pod>(&self, slice: ArenaSlice<T>) -> MemoryResult<Vec<T>> {
        Ok(self.view(slice)?.to_vec())
    }

    /// Copy `src` into the front of `dst`, possibly across pools; returns bytes copied
    pub fn copy_region<T: Pod>(
        &mut self,
        src: ArenaSlice<T>,
        dst: ArenaSlice<T>,
    ) -> MemoryResult<usize> {
        if src.len() > dst.len() {
            return Err(MemoryError::CopyLengthMismatch {
                region: dst.len(),
                source_len: src.len(),
            });
        }
        let src_ptr = self.region_ptr(&src)?;
        let dst_ptr = self.region_ptr(&dst)?;
        let bytes = src.byte_len();
        if bytes > 0 {
            // SAFETY: both ranges checked; `copy` tolerates overlap
            unsafe { std::ptr::copy(src_ptr as *const u8, dst_ptr, bytes) };
        }
        Ok(bytes)
    }
}

impl std::fmt::Debug for MemoryResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryResourceManager")
            .field("resources", &self.resources.len())
            .field("processors", &self.processor_names)
            .field("stats", &self.stats())
            .finish()
    }
}
