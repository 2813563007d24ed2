//! Two-phase memory protocol with hand-written processors

use trackforge::config::MemorySettings;
use trackforge::execution::ExecutionContext;
use trackforge::memory::{
    Arena, ArenaSlice, LayoutCursor, MemoryError, MemoryPool, MemoryRegistrar,
    MemoryResourceManager, MemoryResult, ResourceId, ResourceType, RESOURCE_ALIGNMENT,
};
use trackforge::processor::{EventSizes, Processor};
use trackforge::ForgeResult;

/// One resource holding `n` floats followed by `n` counters
struct Stage {
    name: String,
    kind: ResourceType,
    n: usize,
    resource: ResourceId,
    values: ArenaSlice<f32>,
    counters: ArenaSlice<u32>,
    bound: Option<usize>,
}

impl Stage {
    fn new(name: &str, kind: ResourceType, n: usize) -> Self {
        Self {
            name: name.to_string(),
            kind,
            n,
            resource: ResourceId::INVALID,
            values: ArenaSlice::null(),
            counters: ArenaSlice::null(),
            bound: None,
        }
    }
}

impl Processor for Stage {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, _ctx: &ExecutionContext) -> ForgeResult<()> {
        Ok(())
    }

    fn register_memory(&mut self, registrar: &mut MemoryRegistrar<'_>) -> MemoryResult<()> {
        self.resource = registrar.register("data", self.kind)?;
        Ok(())
    }

    fn set_max_data(&mut self, _sizes: &EventSizes) {}

    fn set_pointers(&mut self, resource: ResourceId, cursor: &mut LayoutCursor) {
        if resource == self.resource {
            self.values = cursor.reserve(self.n);
            self.counters = cursor.reserve(self.n);
        }
    }

    fn custom_size_bound(&self, resource: ResourceId) -> Option<usize> {
        (resource == self.resource).then_some(self.bound).flatten()
    }
}

fn manager() -> MemoryResourceManager {
    MemoryResourceManager::new(MemorySettings {
        custom_reserve_bytes: 4096,
        ..Default::default()
    })
}

fn prepare(memory: &mut MemoryResourceManager, stages: &mut [&mut dyn Processor]) -> MemoryResult<()> {
    memory.compute_sizes(stages)?;
    memory.allocate()?;
    memory.bind(stages)
}

#[test]
fn test_sizing_is_idempotent_and_binding_matches() -> anyhow::Result<()> {
    let mut memory = manager();
    let mut a = Stage::new("a", ResourceType::SCRATCH | ResourceType::GPU, 100);
    memory.register_processor(&mut a)?;

    let first = memory.compute_sizes(&mut [&mut a])?;
    let second = memory.compute_sizes(&mut [&mut a])?;
    assert_eq!(first, second);
    // 400 bytes of floats, padded to 448, then 400 bytes of counters
    assert_eq!(first.get(MemoryPool::DeviceScratch), 1024);

    memory.allocate()?;
    memory.bind(&mut [&mut a])?;
    assert_eq!(a.values.len(), 100);
    assert_eq!(a.values.pool(), Some(MemoryPool::DeviceScratch));
    assert_eq!(a.values.offset() % RESOURCE_ALIGNMENT, 0);
    assert_eq!(a.counters.offset() - a.values.offset(), 448);

    memory.fill(a.counters, 7)?;
    assert!(memory.view(a.counters)?.iter().all(|&c| c == 7));
    Ok(())
}

#[test]
fn test_arenas_reused_while_large_enough() -> anyhow::Result<()> {
    let mut memory = manager();
    let mut a = Stage::new("a", ResourceType::SCRATCH | ResourceType::HOST, 1000);
    memory.register_processor(&mut a)?;

    prepare(&mut memory, &mut [&mut a])?;
    let first = memory.stats().arena_allocations;
    let host = memory.stats().capacity.get(MemoryPool::Host);
    memory.reset_pass(&mut [&mut a])?;
    a.n = 10;
    prepare(&mut memory, &mut [&mut a])?;
    assert_eq!(memory.stats().arena_allocations, first);
    assert_eq!(memory.stats().capacity.get(MemoryPool::Host), host);

    memory.reset_pass(&mut [&mut a])?;
    a.n = 5000;
    prepare(&mut memory, &mut [&mut a])?;
    assert_eq!(memory.stats().arena_allocations, first + 1);
    assert!(memory.stats().capacity.get(MemoryPool::Host) > host);
    Ok(())
}

#[test]
fn test_stack_resources_alias() -> anyhow::Result<()> {
    let mut memory = manager();
    let stack = ResourceType::SCRATCH | ResourceType::GPU | ResourceType::STACK;
    let mut a = Stage::new("a", stack, 100);
    let mut b = Stage::new("b", stack, 300);
    memory.register_processor(&mut a)?;
    memory.register_processor(&mut b)?;

    let sizes = memory.compute_sizes(&mut [&mut a, &mut b])?;
    let largest = memory.resource_size(b.resource).unwrap_or(0);
    assert_eq!(sizes.get(MemoryPool::DeviceScratch), largest);

    memory.allocate()?;
    memory.bind(&mut [&mut a, &mut b])?;
    assert_eq!(a.values.offset(), b.values.offset());
    Ok(())
}

#[test]
fn test_permanent_survives_reset() -> anyhow::Result<()> {
    let mut memory = manager();
    let mut p = Stage::new("p", ResourceType::PERMANENT | ResourceType::GPU, 16);
    let mut s = Stage::new("s", ResourceType::SCRATCH | ResourceType::GPU, 16);
    memory.register_processor(&mut p)?;
    memory.register_processor(&mut s)?;

    prepare(&mut memory, &mut [&mut p, &mut s])?;
    let placed = memory.placement(p.resource);
    memory.fill(p.values, 1.5)?;

    memory.reset_pass(&mut [&mut p, &mut s])?;
    assert!(memory.placement(s.resource).is_none());
    assert!(s.values.is_null());
    assert_eq!(memory.placement(p.resource), placed);

    prepare(&mut memory, &mut [&mut p, &mut s])?;
    assert_eq!(memory.placement(p.resource), placed);
    assert!(memory.view(p.values)?.iter().all(|&v| v == 1.5));
    Ok(())
}

#[test]
fn test_external_misfit_marks_region_null() -> anyhow::Result<()> {
    let mut memory = manager();
    let mut out = Stage::new("out", ResourceType::OUTPUT | ResourceType::HOST, 1000);
    memory.register_processor(&mut out)?;
    memory.attach_external_output(Arena::new(MemoryPool::External, 1024)?)?;

    prepare(&mut memory, &mut [&mut out])?;
    assert!(!memory.is_valid(out.resource));
    assert!(out.values.is_null());
    assert_eq!(memory.fit_errors().len(), 1);
    assert_eq!(memory.fit_errors()[0].resource, "out.data");
    assert!(matches!(memory.view(out.values), Err(MemoryError::NullRegion(_))));

    memory.reset_pass(&mut [&mut out])?;
    assert!(memory.fit_errors().is_empty());
    Ok(())
}

#[test]
fn test_external_output_placed_in_caller_memory() -> anyhow::Result<()> {
    let mut memory = manager();
    let mut out = Stage::new("out", ResourceType::OUTPUT | ResourceType::HOST, 10);
    memory.register_processor(&mut out)?;
    memory.attach_external_output(Arena::new(MemoryPool::External, 4096)?)?;

    prepare(&mut memory, &mut [&mut out])?;
    assert_eq!(out.values.pool(), Some(MemoryPool::External));
    memory.fill(out.counters, 42)?;

    let arena = memory.detach_external_output().expect("attached");
    let at = out.counters.offset();
    assert_eq!(&arena.as_bytes()[at..at + 4], &42u32.to_ne_bytes());
    Ok(())
}

#[test]
fn test_custom_resource_sized_late() -> anyhow::Result<()> {
    let mut memory = manager();
    let mut c = Stage::new("c", ResourceType::OUTPUT | ResourceType::HOST | ResourceType::CUSTOM, 0);
    let mut s = Stage::new("s", ResourceType::SCRATCH | ResourceType::HOST, 8);
    memory.register_processor(&mut c)?;
    memory.register_processor(&mut s)?;

    prepare(&mut memory, &mut [&mut c, &mut s])?;
    assert!(c.values.is_null());
    assert!(memory.placement(c.resource).is_none());

    c.n = 64;
    assert!(memory.allocate_custom(c.resource, &mut c)?);
    assert_eq!(c.values.len(), 64);
    let placement = memory.placement(c.resource).expect("placed");
    let scratch = memory.placement(s.resource).expect("placed");
    assert!(placement.offset >= scratch.offset + scratch.size);

    assert!(matches!(
        memory.allocate_custom(s.resource, &mut s),
        Err(MemoryError::NotCustom(_))
    ));

    c.n = 10_000;
    assert!(matches!(
        memory.allocate_custom(c.resource, &mut c),
        Err(MemoryError::PoolCapacityExceeded { .. })
    ));
    Ok(())
}

#[test]
fn test_processor_list_must_match_registration() -> anyhow::Result<()> {
    let mut memory = manager();
    let mut a = Stage::new("a", ResourceType::SCRATCH | ResourceType::HOST, 8);
    let mut b = Stage::new("b", ResourceType::SCRATCH | ResourceType::HOST, 8);
    memory.register_processor(&mut a)?;
    memory.register_processor(&mut b)?;

    assert!(matches!(
        memory.compute_sizes(&mut [&mut a]),
        Err(MemoryError::ProcessorMismatch { expected: 2, actual: 1 })
    ));
    Ok(())
}

#[test]
fn test_invalid_resource_class_rejected() {
    let mut memory = manager();
    let mut bad = Stage::new("bad", ResourceType::SCRATCH | ResourceType::OUTPUT, 8);
    assert!(matches!(
        memory.register_processor(&mut bad),
        Err(MemoryError::InvalidResourceType { .. })
    ));
}

#[test]
fn test_custom_reserve_follows_declared_bound() -> anyhow::Result<()> {
    let mut memory = manager();
    let mut c = Stage::new("c", ResourceType::OUTPUT | ResourceType::HOST | ResourceType::CUSTOM, 0);
    c.bound = Some(100_000);
    memory.register_processor(&mut c)?;

    // the declared bound replaces the 4096-byte fallback reserve
    let sizes = memory.compute_sizes(&mut [&mut c])?;
    assert!(sizes.get(MemoryPool::Host) >= 100_000);
    assert!(sizes.get(MemoryPool::Host) < 100_000 + 2 * RESOURCE_ALIGNMENT);
    memory.allocate()?;
    memory.bind(&mut [&mut c])?;

    c.n = 10_000;
    assert!(memory.allocate_custom(c.resource, &mut c)?);
    assert_eq!(c.counters.len(), 10_000);
    memory.fill(c.counters, 3)?;

    memory.reset_pass(&mut [&mut c])?;
    prepare(&mut memory, &mut [&mut c])?;
    c.n = 20_000;
    assert!(matches!(
        memory.allocate_custom(c.resource, &mut c),
        Err(MemoryError::AllocationSizeMismatch { reserved: 100_096, .. })
    ));
    Ok(())
}
