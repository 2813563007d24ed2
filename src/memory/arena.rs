//! Pool arenas and typed region handles
//!
//! An [`Arena`] is a single zero-initialized allocation backing one memory pool.
//! Structures never own memory themselves: they hold [`ArenaSlice`] handles
//! (pool + byte offset + element count) resolved by the resource manager at
//! bind time.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use super::types::{MemoryError, MemoryPool, MemoryResult};

/// One contiguous allocation backing a memory pool
///
/// # Thread Safety
///
/// The arena hands out raw pointers into its allocation. Kernels running on many
/// workers write disjoint element ranges through [`SharedSlice`]; the arena itself
/// never moves or reallocates while handles are bound.
pub struct Arena {
    pool: MemoryPool,
    ptr: NonNull<u8>,
    capacity: usize,
    layout: Option<Layout>,
}

// SAFETY: the allocation is owned exclusively by the arena and only freed on drop
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Base alignment of every pool allocation
    pub const ALIGNMENT: usize = 256;

    /// Allocate a zeroed arena of `capacity` bytes for `pool`
    pub fn new(pool: MemoryPool, capacity: usize) -> MemoryResult<Self> {
        if capacity == 0 {
            return Ok(Self {
                pool,
                ptr: NonNull::dangling(),
                capacity: 0,
                layout: None,
            });
        }

        let layout = Layout::from_size_align(capacity, Self::ALIGNMENT).map_err(|_| {
            MemoryError::AllocationFailed {
                pool,
                bytes: capacity,
            }
        })?;

        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(MemoryError::AllocationFailed {
            pool,
            bytes: capacity,
        })?;

        tracing::debug!(
            "Arena created for {} pool: {} KB ({} bytes)",
            pool,
            capacity / 1024,
            capacity
        );

        Ok(Self {
            pool,
            ptr,
            capacity,
            layout: Some(layout),
        })
    }

    pub fn pool(&self) -> MemoryPool {
        self.pool
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check `[offset, offset + bytes)` lies inside the allocation
    pub(crate) fn check_range(&self, offset: usize, bytes: usize) -> MemoryResult<()> {
        let end = offset.checked_add(bytes).unwrap_or(usize::MAX);
        if end > self.capacity {
            return Err(MemoryError::OutOfBounds {
                pool: self.pool,
                offset,
                end,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Raw pointer at `offset`; caller checked the range
    pub(crate) fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.capacity);
        // SAFETY: offset is within (or one past) the allocation
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    /// Copy the byte range `[offset, offset + len)` into a new vector
    pub fn read_bytes(&self, offset: usize, len: usize) -> MemoryResult<Vec<u8>> {
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        // SAFETY: range checked; callers hold no mutable view while reading
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr_at(offset), len) };
        Ok(bytes.to_vec())
    }

    /// Whole allocation as bytes
    pub fn as_bytes(&self) -> &[u8] {
        if self.capacity == 0 {
            return &[];
        }
        // SAFETY: the allocation is `capacity` initialized bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: allocated in `new` with this exact layout
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("pool", &self.pool)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Typed handle to `len` elements of `T` at a byte offset inside a pool
///
/// A handle without a pool is null: either a size-pass placeholder or an
/// output region that did not fit.
pub struct ArenaSlice<T> {
    pool: Option<MemoryPool>,
    offset: usize,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ArenaSlice<T> {
    pub(crate) const fn new(pool: Option<MemoryPool>, offset: usize, len: usize) -> Self {
        Self {
            pool,
            offset,
            len,
            _marker: PhantomData,
        }
    }

    /// Handle that refers to no memory
    pub const fn null() -> Self {
        Self::new(None, 0, 0)
    }

    pub fn is_null(&self) -> bool {
        self.pool.is_none()
    }

    pub fn pool(&self) -> Option<MemoryPool> {
        self.pool
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// Sub-range `[start, start + len)` of this handle
    pub fn sub(&self, start: usize, len: usize) -> Option<Self> {
        if start.checked_add(len)? > self.len {
            return None;
        }
        Some(Self::new(
            self.pool,
            self.offset + start * std::mem::size_of::<T>(),
            len,
        ))
    }
}

impl<T> Clone for ArenaSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArenaSlice<T> {}

impl<T> Default for ArenaSlice<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for ArenaSlice<T> {
    fn eq(&self, other: &Self) -> bool {
        self.pool == other.pool && self.offset == other.offset && self.len == other.len
    }
}

impl<T> Eq for ArenaSlice<T> {}

impl<T> fmt::Debug for ArenaSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pool {
            Some(pool) => write!(
                f,
                "ArenaSlice<{}>({}@{}+{})",
                std::any::type_name::<T>(),
                pool,
                self.offset,
                self.len
            ),
            None => write!(f, "ArenaSlice<{}>(null)", std::any::type_name::<T>()),
        }
    }
}

/// Interior-mutable view used by kernels that write disjoint elements from many workers
///
/// Element access is `unsafe`: the caller guarantees no two workers touch the same
/// index concurrently unless both only read, which the kernels ensure by handing out
/// indices through atomic counters.
pub struct SharedSlice<'a, T> {
    ptr: NonNull<T>,
    len: usize,
    _marker: PhantomData<&'a [std::cell::UnsafeCell<T>]>,
}

// SAFETY: element access is unsafe and documented as disjoint per worker
unsafe impl<T: Send> Send for SharedSlice<'_, T> {}
unsafe impl<T: Send> Sync for SharedSlice<'_, T> {}

impl<'a, T: Copy> SharedSlice<'a, T> {
    pub(crate) fn from_raw(ptr: *mut T, len: usize) -> Self {
        let ptr = if len == 0 {
            NonNull::dangling()
        } else {
            NonNull::new(ptr).unwrap_or(NonNull::dangling())
        };
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write element `index`
    ///
    /// # Safety
    /// No other worker may access `index` concurrently.
    #[inline]
    pub unsafe fn write(&self, index: usize, value: T) {
        assert!(index < self.len, "SharedSlice write out of bounds");
        self.ptr.as_ptr().add(index).write(value);
    }

    /// Read element `index`
    ///
    /// # Safety
    /// No other worker may write `index` concurrently.
    #[inline]
    pub unsafe fn read(&self, index: usize) -> T {
        assert!(index < self.len, "SharedSlice read out of bounds");
        self.ptr.as_ptr().add(index).read()
    }

    /// Mutable sub-slice `[start, start + len)`
    ///
    /// # Safety
    /// The range must be exclusively owned by the calling worker for the
    /// lifetime of the returned slice.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, start: usize, len: usize) -> &mut [T] {
        assert!(start + len <= self.len, "SharedSlice range out of bounds");
        if len == 0 {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(start), len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_zeroed_and_aligned() {
        let arena = Arena::new(MemoryPool::Host, 1000).unwrap();
        assert_eq!(arena.capacity(), 1000);
        assert_eq!(arena.as_bytes().len(), 1000);
        assert!(arena.as_bytes().iter().all(|&b| b == 0));
        assert_eq!(arena.ptr_at(0) as usize % Arena::ALIGNMENT, 0);
    }

    #[test]
    fn test_zero_capacity_arena() {
        let arena = Arena::new(MemoryPool::DeviceScratch, 0).unwrap();
        assert_eq!(arena.capacity(), 0);
        assert!(arena.as_bytes().is_empty());
        assert!(arena.check_range(0, 0).is_ok());
        assert!(arena.check_range(0, 1).is_err());
    }

    #[test]
    fn test_check_range() {
        let arena = Arena::new(MemoryPool::Host, 512).unwrap();
        assert!(arena.check_range(256, 256).is_ok());
        let err = arena.check_range(300, 256).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfBounds { end: 556, .. }));
    }

    #[test]
    fn test_slice_sub_range() {
        let slice: ArenaSlice<u32> = ArenaSlice::new(Some(MemoryPool::Host), 256, 10);
        let sub = slice.sub(4, 3).unwrap();
        assert_eq!(sub.offset(), 256 + 16);
        assert_eq!(sub.len(), 3);
        assert!(slice.sub(8, 3).is_none());
        assert!(ArenaSlice::<u32>::null().is_null());
    }

    #[test]
    fn test_shared_slice_disjoint_writes() {
        let mut data = vec![0u32; 8];
        let shared = SharedSlice::from_raw(data.as_mut_ptr(), data.len());
        std::thread::scope(|s| {
            for worker in 0..4 {
                let shared = &shared;
                s.spawn(move || {
                    for i in (worker..8).step_by(4) {
                        unsafe { shared.write(i, i as u32 * 10) };
                    }
                });
            }
        });
        assert_eq!(data, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }
}
