//! Arena memory management for pipeline stages
//!
//! Devices cannot grow memory while a kernel runs, and per-structure device
//! allocation is far too expensive for the hot path. Every stage therefore
//! declares its arrays up front and receives offsets into a handful of
//! pre-sized arenas.
//!
//! # Pattern
//!
//! 1. Processors register resources tagged with a [`ResourceType`]
//! 2. Layout callbacks run against a sizing cursor to compute bytes per resource
//! 3. One allocation per pool (host, device-persistent, device-scratch)
//! 4. Layout callbacks run again against the real offsets to bind [`ArenaSlice`] handles
//! 5. At the end of the pass every non-permanent placement is dropped

pub mod arena;
pub mod layout;
pub mod manager;
pub mod types;

pub use arena::{Arena, ArenaSlice, SharedSlice};
pub use layout::{align_up, LayoutCursor, ARRAY_ALIGNMENT, RESOURCE_ALIGNMENT};
pub use manager::{
    FitError, MemoryRegistrar, MemoryResourceManager, MemoryStats, Placement, PoolSizes,
};
pub use types::{MemoryError, MemoryPool, MemoryResult, ProcessorId, ResourceId, ResourceType};
