//! Per-partition output buffers of the tracklet selector
//!
//! A slice output is one contiguous block:
//!
//! ```text
//! ┌──────────────────┬─────────────────────────┬─────────────────────────────┐
//! │ header (24 B)    │ n_tracks x Track (48 B) │ n_hits x ClusterRef (8 B)   │
//! └──────────────────┴─────────────────────────┴─────────────────────────────┘
//! ```
//!
//! The block comes either from a caller-owned buffer shared by all partitions
//! ([`OutputControl::external`]) or from a per-partition heap allocation that is
//! replaced every pass ([`InternalOutputMemory`]). It is a one-shot bump
//! allocation: no free lists, no resizing.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::data::{ClusterRef, Track};
use crate::error::{ForgeResult, TrackForgeError};

/// Alignment of every block handed out by [`OutputControl`]
pub const OUTPUT_ALIGNMENT: usize = 8;

/// Fixed-size head of a slice output
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SliceOutputHeader {
    pub n_tracks: u32,
    pub n_track_clusters: u32,
    pub partition: u32,
    pub reserved: u32,
    /// Total block size including this header
    pub memory_size: u64,
}

/// Caller-provided output memory shared by all partitions
///
/// Mirrors the classic output-control block: a base, a cursor that only ever
/// advances, and a size that is reset to [`OutputControl::OVERFLOW_SENTINEL`]
/// once a request did not fit. The spin lock covers only the cursor bump; the
/// acquired block is filled without holding it.
pub struct OutputControl<'a> {
    base: NonNull<u8>,
    cursor: AtomicUsize,
    size: AtomicUsize,
    lock: AtomicBool,
    capacity: usize,
    external: bool,
    _marker: PhantomData<&'a [UnsafeCell<u8>]>,
}

// SAFETY: acquired blocks are disjoint; the cursor is only advanced under `lock`
unsafe impl Send for OutputControl<'_> {}
unsafe impl Sync for OutputControl<'_> {}

impl<'a> OutputControl<'a> {
    /// Size value signalling that an acquisition failed for lack of space
    pub const OVERFLOW_SENTINEL: usize = 1;

    /// Hand out blocks of `buffer` (8-byte aligned by construction)
    pub fn external(buffer: &'a mut [u64]) -> Self {
        let bytes = std::mem::size_of_val(buffer);
        Self {
            base: NonNull::new(buffer.as_mut_ptr() as *mut u8).unwrap_or(NonNull::dangling()),
            cursor: AtomicUsize::new(0),
            size: AtomicUsize::new(bytes),
            lock: AtomicBool::new(false),
            capacity: bytes,
            external: true,
            _marker: PhantomData,
        }
    }

    /// No caller memory: every partition allocates its own block
    pub fn internal() -> Self {
        Self {
            base: NonNull::dangling(),
            cursor: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            lock: AtomicBool::new(false),
            capacity: 0,
            external: false,
            _marker: PhantomData,
        }
    }

    pub fn use_external(&self) -> bool {
        self.external
    }

    /// Bytes handed out so far
    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Size of the caller buffer
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current size field (the sentinel after an overflow)
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn overflowed(&self) -> bool {
        self.external && self.size() == Self::OVERFLOW_SENTINEL
    }

    /// Reserve `bytes` at the cursor; `None` marks the buffer as overflowed
    pub fn acquire(&self, bytes: usize) -> Option<&'a mut [u8]> {
        if !self.external {
            return None;
        }
        let bytes = crate::memory::align_up(bytes, OUTPUT_ALIGNMENT);

        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let start = self.cursor.load(Ordering::Relaxed);
        let size = self.size.load(Ordering::Relaxed);
        let fits = size.saturating_sub(start) >= bytes;
        if fits {
            self.cursor.store(start + bytes, Ordering::Relaxed);
        } else {
            self.size.store(Self::OVERFLOW_SENTINEL, Ordering::Relaxed);
        }
        self.lock.store(false, Ordering::Release);

        if !fits {
            tracing::warn!(
                "Output buffer exhausted: need {} bytes at offset {}, size {}",
                bytes,
                start,
                size
            );
            return None;
        }
        if bytes == 0 {
            return Some(&mut []);
        }
        // SAFETY: [start, start + bytes) lies inside the buffer and was handed out
        // exactly once under the lock
        Some(unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(start), bytes) })
    }
}

impl std::fmt::Debug for OutputControl<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputControl")
            .field("external", &self.external)
            .field("used", &self.used())
            .field("size", &self.size())
            .finish()
    }
}

/// Process-local block of one partition, replaced every pass
#[derive(Debug, Default)]
pub struct InternalOutputMemory {
    words: Vec<u64>,
}

impl InternalOutputMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Free the previous block, then allocate `bytes` zeroed bytes
    pub fn allocate(&mut self, bytes: usize) -> &mut [u8] {
        self.words = Vec::new();
        self.words = vec![0u64; bytes.div_ceil(8)];
        &mut bytemuck::cast_slice_mut(&mut self.words)[..bytes]
    }

    pub fn capacity_bytes(&self) -> usize {
        self.words.len() * 8
    }
}

/// Typed view over one slice output block
#[derive(Debug)]
pub struct SliceOutput<'a> {
    bytes: &'a mut [u8],
}

impl<'a> SliceOutput<'a> {
    pub const HEADER_SIZE: usize = std::mem::size_of::<SliceOutputHeader>();

    /// Exact block size for `n_tracks` tracks holding `n_track_hits` hits
    pub const fn estimate_size(n_tracks: usize, n_track_hits: usize) -> usize {
        Self::HEADER_SIZE
            + n_tracks * std::mem::size_of::<Track>()
            + n_track_hits * std::mem::size_of::<ClusterRef>()
    }

    /// Acquire a block from `control` or, without external memory, from `internal`
    ///
    /// Returns `None` when the external buffer is exhausted.
    pub fn allocate(
        control: &OutputControl<'a>,
        internal: &'a mut InternalOutputMemory,
        n_tracks: usize,
        n_track_hits: usize,
    ) -> Option<Self> {
        let size = Self::estimate_size(n_tracks, n_track_hits);
        let bytes = if control.use_external() {
            control.acquire(size)?
        } else {
            internal.allocate(size)
        };
        Some(Self { bytes })
    }

    /// Write header, tracks and hits; `bytes` must hold exactly the estimated size
    pub fn write(
        &mut self,
        partition: u32,
        tracks: &[Track],
        hits: &[ClusterRef],
    ) -> ForgeResult<()> {
        let size = Self::estimate_size(tracks.len(), hits.len());
        if self.bytes.len() < size {
            return Err(TrackForgeError::InternalError(format!(
                "slice output holds {} bytes, {} needed",
                self.bytes.len(),
                size
            )));
        }
        let header = SliceOutputHeader {
            n_tracks: tracks.len() as u32,
            n_track_clusters: hits.len() as u32,
            partition,
            reserved: 0,
            memory_size: size as u64,
        };
        let tracks_end = Self::HEADER_SIZE + std::mem::size_of_val(tracks);
        self.bytes[..Self::HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        self.bytes[Self::HEADER_SIZE..tracks_end].copy_from_slice(bytemuck::cast_slice(tracks));
        self.bytes[tracks_end..size].copy_from_slice(bytemuck::cast_slice(hits));
        Ok(())
    }

    pub fn header(&self) -> SliceOutputHeader {
        bytemuck::pod_read_unaligned(&self.bytes[..Self::HEADER_SIZE])
    }

    pub fn memory_size(&self) -> usize {
        self.header().memory_size as usize
    }

    fn tracks_range(&self) -> std::ops::Range<usize> {
        let n = self.header().n_tracks as usize;
        Self::HEADER_SIZE..Self::HEADER_SIZE + n * std::mem::size_of::<Track>()
    }

    pub fn tracks(&self) -> &[Track] {
        bytemuck::cast_slice(&self.bytes[self.tracks_range()])
    }

    pub fn cluster_refs(&self) -> &[ClusterRef] {
        let start = self.tracks_range().end;
        let n = self.header().n_track_clusters as usize;
        bytemuck::cast_slice(&self.bytes[start..start + n * std::mem::size_of::<ClusterRef>()])
    }

    /// Hits of one track
    pub fn track_hits(&self, track: &Track) -> &[ClusterRef] {
        let refs = self.cluster_refs();
        let start = (track.first_hit as usize).min(refs.len());
        let end = (start + track.n_hits as usize).min(refs.len());
        &refs[start..end]
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }
}
