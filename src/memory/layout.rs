//! Layout cursor for the two-phase size-then-bind protocol
//!
//! Every processor lays out its arrays through a [`LayoutCursor`]. The same
//! layout code runs twice:
//! - against a sizing cursor (placeholder base 0) to learn the byte size
//! - against a binding cursor (real pool offset) to obtain final handles
//!
//! Resource bases are aligned to [`RESOURCE_ALIGNMENT`] and arrays inside a
//! resource to [`ARRAY_ALIGNMENT`], which divides it, so the padding inserted
//! in both passes is identical.

use bytemuck::Pod;

use super::arena::{Arena, ArenaSlice};
use super::types::{MemoryError, MemoryPool, MemoryResult};

/// Alignment of every resource base offset
pub const RESOURCE_ALIGNMENT: usize = Arena::ALIGNMENT;

/// Alignment of every array inside a resource
pub const ARRAY_ALIGNMENT: usize = 64;

/// Align offset up to alignment (power of 2)
#[inline]
pub fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

/// Checked variant of [`align_up`] for user-supplied alignments
pub fn try_align_up(offset: usize, alignment: usize) -> MemoryResult<usize> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(MemoryError::InvalidAlignment(alignment));
    }
    Ok(align_up(offset, alignment))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorMode {
    Sizing,
    Binding(MemoryPool),
    Null,
}

/// Bump cursor handing out aligned, typed regions
#[derive(Debug, Clone)]
pub struct LayoutCursor {
    mode: CursorMode,
    start: usize,
    offset: usize,
    regions: usize,
}

impl LayoutCursor {
    /// Cursor over a placeholder base; handles come back null
    pub fn sizing() -> Self {
        Self {
            mode: CursorMode::Sizing,
            start: 0,
            offset: 0,
            regions: 0,
        }
    }

    /// Cursor over real memory starting at `base` inside `pool`
    pub fn binding(pool: MemoryPool, base: usize) -> Self {
        Self {
            mode: CursorMode::Binding(pool),
            start: base,
            offset: base,
            regions: 0,
        }
    }

    /// Cursor that resolves every request to a null handle
    pub fn null() -> Self {
        Self {
            mode: CursorMode::Null,
            start: 0,
            offset: 0,
            regions: 0,
        }
    }

    pub fn is_sizing(&self) -> bool {
        self.mode == CursorMode::Sizing
    }

    pub fn is_null(&self) -> bool {
        self.mode == CursorMode::Null
    }

    /// Pool the cursor binds into, if any
    pub fn pool(&self) -> Option<MemoryPool> {
        match self.mode {
            CursorMode::Binding(pool) => Some(pool),
            _ => None,
        }
    }

    /// Reserve `count` elements of `T`
    pub fn reserve<T: Pod>(&mut self, count: usize) -> ArenaSlice<T> {
        if self.is_null() {
            return ArenaSlice::null();
        }
        let alignment = ARRAY_ALIGNMENT.max(std::mem::align_of::<T>());
        self.offset = align_up(self.offset, alignment);
        let slice = ArenaSlice::new(self.pool(), self.offset, count);
        self.offset = self
            .offset
            .saturating_add(count.saturating_mul(std::mem::size_of::<T>()));
        self.regions += 1;
        slice
    }

    /// Bytes consumed since the cursor start, including alignment padding
    pub fn used(&self) -> usize {
        self.offset - self.start
    }

    /// Number of arrays reserved so far
    pub fn region_count(&self) -> usize {
        self.regions
    }
}
