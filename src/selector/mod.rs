//! Tracklet selector: parallel overlap resolution inside one partition
//!
//! Tracklets are built independently and may share clusters. The selector turns
//! them into tracks with minimal overlap in two kernels separated by a barrier:
//!
//! 1. **weights** - every tracklet records its weight on each of its clusters with
//!    `fetch_min`; afterwards a cluster's slot holds the best (lowest) claim
//! 2. **select** - one worker per tracklet (grid-stride) walks the tracklet's rows,
//!    keeps owned hits and a bounded fraction of shared ones, and cuts the scan
//!    into segments at gaps. Each long enough segment reserves a track slot and a
//!    hit range with `fetch_add` on two global counters.
//!
//! Hit membership depends only on weights, so it is deterministic. The order in
//! which tracks reserve slots is not; [`TrackletSelector::write_output`]
//! normalises it when compacting into a slice output.
//!
//! On capacity overflow the kernel raises an error through the [`ErrorSink`] and
//! the whole partition's output is dropped.

pub mod min_hits;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::ProcessingSettings;
use crate::data::{ClusterRef, Track, Tracklet, TrackletSet, NO_HIT};
use crate::error::{ErrorCode, ErrorSink, ForgeResult, TrackForgeError};
use crate::execution::ExecutionContext;
use crate::memory::{
    ArenaSlice, LayoutCursor, MemoryRegistrar, MemoryResourceManager, MemoryResult, ResourceId,
    ResourceType,
};
use crate::processor::{EventSizes, Processor};
use crate::slice_output::SliceOutput;

pub use min_hits::{CurvatureMinHits, FixedMinHits, MinHitsPolicy};

/// Slots of the persistent counter block
const COMMON_N_TRACKS: usize = 0;
const COMMON_N_TRACK_HITS: usize = 1;
const COMMON_OVERFLOW: usize = 2;
const COMMON_WORDS: usize = 4;

/// Weight of a cluster nobody claimed
const UNCLAIMED: u32 = u32::MAX;

/// Outcome of one selection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectorResult {
    pub partition: u32,
    pub n_tracks: usize,
    pub n_track_hits: usize,
    pub overflow: bool,
}

impl SelectorResult {
    /// Bytes of the slice output this result needs; an overflowed pass writes no tracks
    pub fn output_size(&self) -> usize {
        if self.overflow {
            return SliceOutput::estimate_size(0, 0);
        }
        SliceOutput::estimate_size(self.n_tracks, self.n_track_hits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SelectionCuts {
    max_shared_fraction: f32,
    max_row_gap: u32,
}

/// Selector of one partition
#[derive(Debug)]
pub struct TrackletSelector {
    name: String,
    partition: u32,
    cuts: SelectionCuts,
    min_hits: Arc<dyn MinHitsPolicy>,
    settings: ProcessingSettings,

    n_workers: usize,
    n_rows: usize,
    max_tracklets: usize,
    max_row_hits: usize,
    max_clusters: usize,
    max_tracks: usize,
    max_track_hits: usize,
    n_tracklets: usize,

    res_tracklets: ResourceId,
    res_weights: ResourceId,
    res_tracks: ResourceId,
    res_common: ResourceId,

    tracklets: ArenaSlice<Tracklet>,
    row_hits: ArenaSlice<u32>,
    row_offsets: ArenaSlice<u32>,
    hit_weights: ArenaSlice<u32>,
    staging: ArenaSlice<ClusterRef>,
    tracks: ArenaSlice<Track>,
    track_hits: ArenaSlice<ClusterRef>,
    common: ArenaSlice<u32>,
}

impl TrackletSelector {
    pub fn new(partition: u32, settings: &ProcessingSettings) -> Self {
        let min_hits: Arc<dyn MinHitsPolicy> = match settings.fixed_min_hits() {
            Some(n) => Arc::new(FixedMinHits(n)),
            None => Arc::new(settings.min_hits),
        };
        Self {
            name: format!("selector{}", partition),
            partition,
            cuts: SelectionCuts {
                max_shared_fraction: settings.max_shared_fraction,
                max_row_gap: settings.max_row_gap,
            },
            min_hits,
            settings: settings.clone(),
            n_workers: 1,
            n_rows: 0,
            max_tracklets: 0,
            max_row_hits: 0,
            max_clusters: 0,
            max_tracks: 0,
            max_track_hits: 0,
            n_tracklets: 0,
            res_tracklets: ResourceId::INVALID,
            res_weights: ResourceId::INVALID,
            res_tracks: ResourceId::INVALID,
            res_common: ResourceId::INVALID,
            tracklets: ArenaSlice::null(),
            row_hits: ArenaSlice::null(),
            row_offsets: ArenaSlice::null(),
            hit_weights: ArenaSlice::null(),
            staging: ArenaSlice::null(),
            tracks: ArenaSlice::null(),
            track_hits: ArenaSlice::null(),
            common: ArenaSlice::null(),
        }
    }

    /// Replace the minimum-hits policy
    pub fn with_min_hits_policy(mut self, policy: Arc<dyn MinHitsPolicy>) -> Self {
        self.min_hits = policy;
        self
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn max_tracks(&self) -> usize {
        self.max_tracks
    }

    pub fn max_track_hits(&self) -> usize {
        self.max_track_hits
    }

    /// Resource holding the track and track-hit arrays
    pub fn tracks_resource(&self) -> ResourceId {
        self.res_tracks
    }

    /// Copy the partition's tracklets and per-row cluster offsets into the arena
    ///
    /// `row_offsets` has `n_rows + 1` entries; the last one is the partition's
    /// cluster count.
    pub fn upload(
        &mut self,
        memory: &mut MemoryResourceManager,
        input: &TrackletSet,
        row_offsets: &[u32],
    ) -> ForgeResult<()> {
        if input.tracklets.len() > self.max_tracklets || input.row_hits.len() > self.max_row_hits {
            return Err(TrackForgeError::InvalidInput(format!(
                "partition {}: {} tracklets / {} row hits exceed the sized {} / {}",
                self.partition,
                input.tracklets.len(),
                input.row_hits.len(),
                self.max_tracklets,
                self.max_row_hits
            )));
        }
        if row_offsets.len() != self.n_rows + 1
            || row_offsets.last().copied().unwrap_or(0) as usize > self.max_clusters
        {
            return Err(TrackForgeError::InvalidInput(format!(
                "partition {}: row offsets do not match {} rows / {} clusters",
                self.partition, self.n_rows, self.max_clusters
            )));
        }
        memory.copy_from_host(self.tracklets, &input.tracklets)?;
        memory.copy_from_host(self.row_hits, &input.row_hits)?;
        memory.copy_from_host(self.row_offsets, row_offsets)?;
        memory.fill(self.common, 0)?;
        self.n_tracklets = input.tracklets.len();
        Ok(())
    }

    /// Run both kernels on the uploaded tracklets
    pub fn run(
        &self,
        ctx: &ExecutionContext,
        memory: &MemoryResourceManager,
        errors: &dyn ErrorSink,
    ) -> ForgeResult<SelectorResult> {
        let _span = tracing::debug_span!("selector", partition = self.partition).entered();
        if ctx.n_workers() != self.n_workers {
            return Err(TrackForgeError::InternalError(format!(
                "selector sized for {} workers, launched with {}",
                self.n_workers,
                ctx.n_workers()
            )));
        }

        let n_tracklets = self.n_tracklets;
        let tracklets = memory.view(self.tracklets)?;
        let row_hits = memory.view(self.row_hits)?;
        let row_offsets = memory.view(self.row_offsets)?;
        let weights = memory.atomics_u32(self.hit_weights)?;
        let common = memory.atomics_u32(self.common)?;
        let staging = memory.shared(self.staging)?;
        let tracks = memory.shared(self.tracks)?;
        let track_hits = memory.shared(self.track_hits)?;
        let n_partition_clusters = row_offsets[self.n_rows] as usize;

        let weight_slot = |row: u32, index: u32| -> usize {
            row_offsets[row as usize] as usize + index as usize
        };

        ctx.launch("selector_weights", |t| {
            let stride = t.global_stride();
            for i in (t.global_id()..n_partition_clusters).step_by(stride) {
                weights[i].store(UNCLAIMED, Ordering::Relaxed);
            }
        });

        ctx.launch("selector_claim", |t| {
            for itr in (t.global_id()..n_tracklets).step_by(t.global_stride()) {
                let tracklet = &tracklets[itr];
                if tracklet.is_empty() {
                    continue;
                }
                for (k, &hit) in tracklet_row_hits(tracklet, row_hits).iter().enumerate() {
                    if hit != NO_HIT {
                        let row = tracklet.first_row + k as u32;
                        weights[weight_slot(row, hit)].fetch_min(tracklet.hit_weight, Ordering::Relaxed);
                    }
                }
            }
        });

        let max_tracks = self.max_tracks;
        let max_track_hits = self.max_track_hits;
        let n_rows = self.n_rows;
        let cuts = self.cuts;
        let min_hits = &*self.min_hits;
        let partition = self.partition;

        ctx.launch("selector_select", |t| {
            let worker = t.global_id();
            // SAFETY: each worker owns its n_rows staging slots
            let buffer = unsafe { staging.slice_mut(worker * n_rows, n_rows) };

            for itr in (worker..n_tracklets).step_by(t.global_stride()) {
                if common[COMMON_OVERFLOW].load(Ordering::Relaxed) != 0 {
                    return;
                }
                let tracklet = &tracklets[itr];
                if tracklet.is_empty() {
                    continue;
                }
                let hits = tracklet_row_hits(tracklet, row_hits);
                let min_hits = min_hits.min_hits(&tracklet.param);

                let mut n_hits: u32 = 0;
                let mut n_shared: u32 = 0;
                let mut gap: u32 = 0;
                let mut irow = tracklet.first_row;

                while irow <= tracklet.last_row && tracklet.last_row - irow + 1 + n_hits >= min_hits {
                    gap += 1;
                    let hit = hits[(irow - tracklet.first_row) as usize];
                    if hit != NO_HIT {
                        let recorded = weights[weight_slot(irow, hit)].load(Ordering::Relaxed);
                        let own = tracklet.hit_weight <= recorded;
                        let shared_ok = (n_shared as f32) < (n_hits as f32) * cuts.max_shared_fraction;
                        if own || shared_ok {
                            if !own {
                                n_shared += 1;
                            }
                            gap = 0;
                            buffer[n_hits as usize] = ClusterRef::new(irow, hit);
                            n_hits += 1;
                        }
                    }

                    if gap > cuts.max_row_gap || irow == tracklet.last_row {
                        if n_hits > 0 && n_hits >= min_hits {
                            let segment = &buffer[..n_hits as usize];
                            let stored = store_track(
                                TrackSlot {
                                    tracklet: itr as u32,
                                    param: tracklet.param,
                                    hits: segment,
                                },
                                &StoreTarget {
                                    common,
                                    tracks: &tracks,
                                    track_hits: &track_hits,
                                    max_tracks,
                                    max_track_hits,
                                    partition,
                                    errors,
                                },
                            );
                            if !stored {
                                return;
                            }
                        }
                        n_hits = 0;
                        n_shared = 0;
                        gap = 0;
                    }
                    irow += 1;
                }
            }
        });

        let overflow = common[COMMON_OVERFLOW].load(Ordering::Acquire) != 0;
        if overflow {
            common[COMMON_N_TRACKS].store(0, Ordering::Release);
            let hits = common[COMMON_N_TRACK_HITS].load(Ordering::Acquire);
            common[COMMON_N_TRACK_HITS].store(hits.min(max_track_hits as u32), Ordering::Release);
        }
        let result = SelectorResult {
            partition,
            n_tracks: common[COMMON_N_TRACKS].load(Ordering::Acquire) as usize,
            n_track_hits: common[COMMON_N_TRACK_HITS].load(Ordering::Acquire) as usize,
            overflow,
        };
        tracing::debug!(
            "Partition {}: {} tracklets -> {} tracks, {} hits{}",
            partition,
            n_tracklets,
            result.n_tracks,
            result.n_track_hits,
            if overflow { " (overflow)" } else { "" }
        );
        Ok(result)
    }

    /// Download the selected tracks, ordered by tracklet and first row, with hits
    /// renumbered contiguously in that order
    pub fn collect_tracks(
        &self,
        memory: &MemoryResourceManager,
        result: &SelectorResult,
    ) -> ForgeResult<(Vec<Track>, Vec<ClusterRef>)> {
        if result.overflow || result.n_tracks == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let tracks = memory.view(self.tracks)?;
        let hits = memory.view(self.track_hits)?;
        let mut selected: Vec<Track> = tracks[..result.n_tracks].to_vec();
        selected.sort_by_key(|t| {
            let first_row = hits.get(t.first_hit as usize).map(|h| h.row).unwrap_or(0);
            (t.tracklet, first_row)
        });

        let mut compact_hits = Vec::with_capacity(result.n_track_hits);
        for (local_id, track) in selected.iter_mut().enumerate() {
            let start = track.first_hit as usize;
            let end = start + track.n_hits as usize;
            let range = hits.get(start..end).ok_or_else(|| {
                TrackForgeError::InternalError(format!(
                    "track {} hit range {}..{} outside {} hits",
                    local_id,
                    start,
                    end,
                    hits.len()
                ))
            })?;
            track.first_hit = compact_hits.len() as u32;
            track.local_id = local_id as u32;
            compact_hits.extend_from_slice(range);
        }
        Ok((selected, compact_hits))
    }

    /// Compact the selected tracks into `output`
    pub fn write_output(
        &self,
        memory: &MemoryResourceManager,
        result: &SelectorResult,
        output: &mut SliceOutput<'_>,
    ) -> ForgeResult<()> {
        let (tracks, hits) = self.collect_tracks(memory, result)?;
        output.write(self.partition, &tracks, &hits)
    }
}

fn tracklet_row_hits<'a>(tracklet: &Tracklet, row_hits: &'a [u32]) -> &'a [u32] {
    let start = tracklet.first_hit as usize;
    let end = (start + tracklet.n_rows() as usize).min(row_hits.len());
    &row_hits[start.min(end)..end]
}

struct TrackSlot<'a> {
    tracklet: u32,
    param: crate::data::TrackParam,
    hits: &'a [ClusterRef],
}

struct StoreTarget<'a, 'm> {
    common: &'a [AtomicU32],
    tracks: &'a crate::memory::SharedSlice<'m, Track>,
    track_hits: &'a crate::memory::SharedSlice<'m, ClusterRef>,
    max_tracks: usize,
    max_track_hits: usize,
    partition: u32,
    errors: &'a dyn ErrorSink,
}

/// Reserve a track and its hit range; false after a capacity overflow
fn store_track(slot: TrackSlot<'_>, target: &StoreTarget<'_, '_>) -> bool {
    let n_hits = slot.hits.len();
    let itrout = target.common[COMMON_N_TRACKS].fetch_add(1, Ordering::AcqRel) as usize;
    if itrout >= target.max_tracks {
        target.errors.raise_error(
            ErrorCode::TrackOverflow,
            target.partition,
            (itrout + 1) as u64,
            target.max_tracks as u64,
        );
        target.common[COMMON_OVERFLOW].store(1, Ordering::Release);
        target.common[COMMON_N_TRACKS].store(0, Ordering::Release);
        return false;
    }
    let first = target.common[COMMON_N_TRACK_HITS].fetch_add(n_hits as u32, Ordering::AcqRel) as usize;
    if first + n_hits > target.max_track_hits {
        target.errors.raise_error(
            ErrorCode::TrackHitOverflow,
            target.partition,
            (first + n_hits) as u64,
            target.max_track_hits as u64,
        );
        target.common[COMMON_OVERFLOW].store(1, Ordering::Release);
        target.common[COMMON_N_TRACKS].store(0, Ordering::Release);
        target.common[COMMON_N_TRACK_HITS].store(target.max_track_hits as u32, Ordering::Release);
        return false;
    }
    // SAFETY: slot `itrout` and hits [first, first + n_hits) were reserved by this
    // worker through the atomic counters
    unsafe {
        target
            .track_hits
            .slice_mut(first, n_hits)
            .copy_from_slice(slot.hits);
        target.tracks.write(
            itrout,
            Track {
                first_hit: first as u32,
                n_hits: n_hits as u32,
                local_id: itrout as u32,
                tracklet: slot.tracklet,
                param: slot.param,
            },
        );
    }
    true
}

impl Processor for TrackletSelector {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, ctx: &ExecutionContext) -> ForgeResult<()> {
        self.n_workers = ctx.n_workers();
        Ok(())
    }

    fn register_memory(&mut self, registrar: &mut MemoryRegistrar<'_>) -> MemoryResult<()> {
        self.res_tracklets = registrar.register("tracklets", ResourceType::SCRATCH | ResourceType::GPU)?;
        self.res_weights = registrar.register(
            "hit_weights",
            ResourceType::SCRATCH | ResourceType::GPU | ResourceType::STACK,
        )?;
        self.res_tracks = registrar.register("tracks", ResourceType::OUTPUT | ResourceType::GPU)?;
        self.res_common = registrar.register("common", ResourceType::PERMANENT | ResourceType::GPU)?;
        Ok(())
    }

    fn set_max_data(&mut self, sizes: &EventSizes) {
        let partition = sizes.partition(self.partition as usize);
        self.n_rows = sizes.n_rows;
        self.max_tracklets = partition.n_tracklets;
        self.max_row_hits = partition.n_tracklet_row_hits;
        self.max_clusters = partition.n_clusters;
        self.max_tracks = self.settings.track_capacity(partition.n_tracklets);
        self.max_track_hits = self.settings.track_hit_capacity(partition.n_tracklet_row_hits);
    }

    fn set_pointers(&mut self, resource: ResourceId, cursor: &mut LayoutCursor) {
        if resource == self.res_tracklets {
            self.tracklets = cursor.reserve(self.max_tracklets);
            self.row_hits = cursor.reserve(self.max_row_hits);
            self.row_offsets = cursor.reserve(self.n_rows + 1);
        } else if resource == self.res_weights {
            self.hit_weights = cursor.reserve(self.max_clusters);
            self.staging = cursor.reserve(self.n_workers * self.n_rows);
        } else if resource == self.res_tracks {
            self.tracks = cursor.reserve(self.max_tracks);
            self.track_hits = cursor.reserve(self.max_track_hits);
        } else if resource == self.res_common {
            self.common = cursor.reserve(COMMON_WORDS);
        }
    }
}
