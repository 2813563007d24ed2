//! Track merger: stitches partition-local tracks into global tracks
//!
//! Stages:
//! 1. **unpack** - every partition track becomes a segment with its inner state
//!    and an outer state propagated to its last row; cluster references are
//!    resolved to global cluster indices
//! 2. **candidates** - segments of neighbouring partitions (same side, adjacent in
//!    azimuth) and of facing partitions (across the central membrane) are matched
//!    at a common x in one frame; runs in parallel over partition pairs
//! 3. **link** - candidates are accepted greedily by ascending score, at most two
//!    neighbours per segment and never closing a cycle
//! 4. **collect** - every chain becomes one [`MergedTrack`]; its clusters are
//!    concatenated into the shared reference array
//!
//! Matching runs only after every partition finished selection: the merger
//! reads finalised slice outputs.

pub mod policy;

use std::collections::BTreeSet;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use crate::config::ProcessingSettings;
use crate::data::{
    ClusterNativeAccess, ClusterRef, MergedClusterRef, MergedTrack, MergedTrackFlags, Track,
    TrackParam,
};
use crate::error::{ErrorCode, ErrorSink, ForgeResult, TrackForgeError};
use crate::execution::ExecutionContext;
use crate::geometry::Geometry;
use crate::memory::{
    ArenaSlice, LayoutCursor, MemoryRegistrar, MemoryResourceManager, MemoryResult, ResourceId,
    ResourceType,
};
use crate::processor::{EventSizes, Processor};

pub use policy::{
    KinematicMergePolicy, MergePolicy, MergeTolerances, StraightLinePropagator, TrackPropagator,
};

const NO_LINK: u32 = u32::MAX;

/// Orientation of one partition, kept in device-persistent memory
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PartitionFrame {
    pub alpha: f32,
    pub cos_alpha: f32,
    pub sin_alpha: f32,
    pub c_side: u32,
}

/// Partition track prepared for matching
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct MergeSegment {
    pub inner: TrackParam,
    pub outer: TrackParam,
    pub partition: u32,
    pub track: u32,
    pub first_hit: u32,
    pub n_hits: u32,
    pub looper: u32,
}

/// Tracks and hits of one partition as written to its slice output
#[derive(Debug, Clone, Copy)]
pub struct PartitionTracks<'a> {
    pub partition: u32,
    pub tracks: &'a [Track],
    pub hits: &'a [ClusterRef],
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Link {
    score: f32,
    a: u32,
    b: u32,
}

/// Counters of one merge pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergerResult {
    pub n_segments: usize,
    pub n_candidates: usize,
    pub n_links: usize,
    pub n_tracks: usize,
    pub n_cluster_refs: usize,
    /// False when the output region did not fit external memory or overflowed
    pub output_valid: bool,
}

/// Merger processor
#[derive(Debug)]
pub struct TrackMerger {
    name: String,
    settings: ProcessingSettings,
    propagator: Arc<dyn TrackPropagator>,
    policy: Arc<dyn MergePolicy>,

    n_partitions: usize,
    max_segments: usize,
    max_segment_hits: usize,

    res_segments: ResourceId,
    res_output: ResourceId,
    res_frames: ResourceId,

    segments: ArenaSlice<MergeSegment>,
    segment_hits: ArenaSlice<MergedClusterRef>,
    merged: ArenaSlice<MergedTrack>,
    merged_refs: ArenaSlice<MergedClusterRef>,
    frames: ArenaSlice<PartitionFrame>,
    frames_ready: bool,
}

impl TrackMerger {
    pub fn new(settings: &ProcessingSettings) -> Self {
        Self {
            name: "merger".to_string(),
            settings: settings.clone(),
            propagator: Arc::new(StraightLinePropagator::default()),
            policy: Arc::new(KinematicMergePolicy::new(settings.merge)),
            n_partitions: 0,
            max_segments: 0,
            max_segment_hits: 0,
            res_segments: ResourceId::INVALID,
            res_output: ResourceId::INVALID,
            res_frames: ResourceId::INVALID,
            segments: ArenaSlice::null(),
            segment_hits: ArenaSlice::null(),
            merged: ArenaSlice::null(),
            merged_refs: ArenaSlice::null(),
            frames: ArenaSlice::null(),
            frames_ready: false,
        }
    }

    pub fn with_propagator(mut self, propagator: Arc<dyn TrackPropagator>) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn output_resource(&self) -> ResourceId {
        self.res_output
    }

    /// Run all merge stages and write the merged tracks into the output region
    pub fn run(
        &mut self,
        ctx: &ExecutionContext,
        memory: &mut MemoryResourceManager,
        geometry: &dyn Geometry,
        clusters: &ClusterNativeAccess,
        inputs: &[PartitionTracks<'_>],
        errors: &dyn ErrorSink,
    ) -> ForgeResult<MergerResult> {
        let _span = tracing::debug_span!("merger").entered();
        self.ensure_frames(memory, geometry)?;

        let (segments, hits) = self.unpack(ctx, geometry, clusters, inputs)?;
        let mut result = MergerResult {
            n_segments: segments.len(),
            ..Default::default()
        };
        if segments.len() > self.max_segments {
            errors.raise_error(
                ErrorCode::MergerTrackOverflow,
                0,
                segments.len() as u64,
                self.max_segments as u64,
            );
            return Ok(result);
        }
        if hits.len() > self.max_segment_hits {
            errors.raise_error(
                ErrorCode::MergerClusterOverflow,
                0,
                hits.len() as u64,
                self.max_segment_hits as u64,
            );
            return Ok(result);
        }
        memory.copy_from_host(self.segments, &segments)?;
        memory.copy_from_host(self.segment_hits, &hits)?;

        let n_segments = segments.len();
        let segments = memory.view(self.segments)?.get(..n_segments).ok_or_else(|| {
            TrackForgeError::InternalError("segment region shorter than uploaded".to_string())
        })?;
        let frames = memory.view(self.frames)?;
        let hits = memory.view(self.segment_hits)?;

        let links = self.find_candidates(ctx, geometry, segments, frames);
        result.n_candidates = links.len();
        let adjacency = link_segments(n_segments, &links, &mut result.n_links);
        let chains = collect_chains(&adjacency);

        let (tracks, refs) = self.build_tracks(geometry, segments, hits, frames, &chains);
        result.n_tracks = tracks.len();
        result.n_cluster_refs = refs.len();

        if !memory.is_valid(self.res_output) {
            // already recorded as a fit error by the memory manager
            tracing::warn!(
                "Merger output is null, dropping {} merged tracks",
                tracks.len()
            );
            return Ok(result);
        }
        if tracks.len() > self.merged.len() || refs.len() > self.merged_refs.len() {
            let (code, observed, capacity) = if tracks.len() > self.merged.len() {
                (ErrorCode::MergerTrackOverflow, tracks.len(), self.merged.len())
            } else {
                (ErrorCode::MergerClusterOverflow, refs.len(), self.merged_refs.len())
            };
            errors.raise_error(code, 0, observed as u64, capacity as u64);
            return Ok(result);
        }
        memory.copy_from_host(self.merged, &tracks)?;
        memory.copy_from_host(self.merged_refs, &refs)?;
        result.output_valid = true;

        tracing::debug!(
            "Merged {} segments into {} tracks ({} candidates, {} links)",
            result.n_segments,
            result.n_tracks,
            result.n_candidates,
            result.n_links
        );
        Ok(result)
    }

    /// Merged tracks written by the last [`run`](Self::run)
    pub fn merged_tracks<'m>(
        &self,
        memory: &'m MemoryResourceManager,
        result: &MergerResult,
    ) -> ForgeResult<&'m [MergedTrack]> {
        if !result.output_valid {
            return Ok(&[]);
        }
        let region = self.merged.sub(0, result.n_tracks).ok_or_else(|| {
            TrackForgeError::InternalError("merged track count exceeds region".to_string())
        })?;
        Ok(memory.view(region)?)
    }

    /// Shared cluster-reference array of the last [`run`](Self::run)
    pub fn cluster_refs<'m>(
        &self,
        memory: &'m MemoryResourceManager,
        result: &MergerResult,
    ) -> ForgeResult<&'m [MergedClusterRef]> {
        if !result.output_valid {
            return Ok(&[]);
        }
        let region = self.merged_refs.sub(0, result.n_cluster_refs).ok_or_else(|| {
            TrackForgeError::InternalError("cluster ref count exceeds region".to_string())
        })?;
        Ok(memory.view(region)?)
    }

    fn ensure_frames(
        &mut self,
        memory: &mut MemoryResourceManager,
        geometry: &dyn Geometry,
    ) -> ForgeResult<()> {
        if self.frames_ready {
            return Ok(());
        }
        let frames: Vec<PartitionFrame> = (0..self.n_partitions)
            .map(|p| {
                let alpha = geometry.partition_alpha(p);
                PartitionFrame {
                    alpha,
                    cos_alpha: alpha.cos(),
                    sin_alpha: alpha.sin(),
                    c_side: geometry.is_c_side(p) as u32,
                }
            })
            .collect();
        memory.copy_from_host(self.frames, &frames)?;
        self.frames_ready = true;
        Ok(())
    }

    fn unpack(
        &self,
        ctx: &ExecutionContext,
        geometry: &dyn Geometry,
        clusters: &ClusterNativeAccess,
        inputs: &[PartitionTracks<'_>],
    ) -> ForgeResult<(Vec<MergeSegment>, Vec<MergedClusterRef>)> {
        let per_partition: Vec<ForgeResult<(Vec<MergeSegment>, Vec<MergedClusterRef>)>> = ctx
            .install(|| {
                inputs
                    .par_iter()
                    .map(|input| self.unpack_partition(geometry, clusters, input))
                    .collect()
            });

        let mut segments = Vec::new();
        let mut hits = Vec::new();
        for part in per_partition {
            let (mut part_segments, part_hits) = part?;
            for segment in &mut part_segments {
                segment.first_hit += hits.len() as u32;
            }
            segments.extend(part_segments);
            hits.extend(part_hits);
        }
        Ok((segments, hits))
    }

    fn unpack_partition(
        &self,
        geometry: &dyn Geometry,
        clusters: &ClusterNativeAccess,
        input: &PartitionTracks<'_>,
    ) -> ForgeResult<(Vec<MergeSegment>, Vec<MergedClusterRef>)> {
        let partition = input.partition as usize;
        let mut segments = Vec::with_capacity(input.tracks.len());
        let mut hits = Vec::with_capacity(input.hits.len());

        for (i, track) in input.tracks.iter().enumerate() {
            let start = track.first_hit as usize;
            let track_hits = input
                .hits
                .get(start..start + track.n_hits as usize)
                .ok_or_else(|| {
                    TrackForgeError::InvalidInput(format!(
                        "partition {} track {} hits out of range",
                        partition, i
                    ))
                })?;
            let first_hit = hits.len() as u32;
            for hit in track_hits {
                let index = clusters
                    .global_index(partition, hit.row as usize, hit.index as usize)
                    .ok_or_else(|| {
                        TrackForgeError::InvalidInput(format!(
                            "partition {} row {} has no cluster {}",
                            partition, hit.row, hit.index
                        ))
                    })?;
                hits.push(MergedClusterRef {
                    index,
                    row: hit.row as u16,
                    partition: input.partition as u8,
                    state: 0,
                });
            }
            let last_row = track_hits.last().map(|h| h.row as usize).unwrap_or(0);
            let outer = self
                .propagator
                .propagate_to_x(&track.param, geometry.row_x(last_row))
                .unwrap_or(track.param);
            segments.push(MergeSegment {
                inner: track.param,
                outer,
                partition: input.partition,
                track: i as u32,
                first_hit,
                n_hits: track.n_hits,
                looper: self.policy.is_looper(&track.param) as u32,
            });
        }
        Ok((segments, hits))
    }

    fn find_candidates(
        &self,
        ctx: &ExecutionContext,
        geometry: &dyn Geometry,
        segments: &[MergeSegment],
        frames: &[PartitionFrame],
    ) -> Vec<Link> {
        let mut ranges = vec![0..0; self.n_partitions];
        let mut start = 0;
        while start < segments.len() {
            let partition = segments[start].partition as usize;
            let end = start
                + segments[start..]
                    .iter()
                    .take_while(|s| s.partition as usize == partition)
                    .count();
            if let Some(range) = ranges.get_mut(partition) {
                *range = start..end;
            }
            start = end;
        }

        let pairs = partition_pairs(geometry, self.n_partitions);
        let mut links: Vec<Link> = ctx.install(|| {
            pairs
                .par_iter()
                .flat_map_iter(|&(pa, pb)| {
                    let ra = ranges[pa].clone();
                    let rb = ranges[pb].clone();
                    let dalpha = frames[pa].alpha - frames[pb].alpha;
                    ra.flat_map(move |a| rb.clone().map(move |b| (a, b)))
                        .filter_map(move |(a, b)| {
                            self.match_score(&segments[a], &segments[b], dalpha)
                                .map(|score| Link {
                                    score,
                                    a: a as u32,
                                    b: b as u32,
                                })
                        })
                })
                .collect()
        });
        links.sort_by(|x, y| {
            x.score
                .total_cmp(&y.score)
                .then(x.a.cmp(&y.a))
                .then(x.b.cmp(&y.b))
        });
        links
    }

    /// Score of `b` continuing `a`; `dalpha` rotates `b` into `a`'s frame
    fn match_score(&self, a: &MergeSegment, b: &MergeSegment, dalpha: f32) -> Option<f32> {
        let b_in_a = b.inner.rotate(dalpha)?;
        let a_at = self.propagator.propagate_to_x(&a.inner, b_in_a.x)?;
        self.policy.score(&a_at, &b_in_a)
    }

    fn build_tracks(
        &self,
        geometry: &dyn Geometry,
        segments: &[MergeSegment],
        hits: &[MergedClusterRef],
        frames: &[PartitionFrame],
        chains: &[Vec<u32>],
    ) -> (Vec<MergedTrack>, Vec<MergedClusterRef>) {
        let mut tracks = Vec::with_capacity(chains.len());
        let mut refs = Vec::new();

        for chain in chains {
            let rep = *chain
                .iter()
                .min_by(|&&x, &&y| {
                    let (sx, sy) = (&segments[x as usize], &segments[y as usize]);
                    sy.n_hits
                        .cmp(&sx.n_hits)
                        .then(sx.inner.chi2_per_ndf().total_cmp(&sy.inner.chi2_per_ndf()))
                        .then(x.cmp(&y))
                })
                .unwrap_or(&chain[0]);
            let rep_segment = &segments[rep as usize];
            let rep_frame = frames[rep_segment.partition as usize];

            let outer_index = *chain
                .iter()
                .max_by(|&&x, &&y| {
                    segments[x as usize]
                        .outer
                        .x
                        .total_cmp(&segments[y as usize].outer.x)
                        .then(y.cmp(&x))
                })
                .unwrap_or(&rep);
            let outer_segment = &segments[outer_index as usize];

            let first_cluster_ref = refs.len() as u32;
            let mut n_fitted = 0u32;
            let mut n_loopers = 0u32;
            let mut a_side = false;
            let mut c_side = false;
            for &s in chain {
                let segment = &segments[s as usize];
                let fitted = s == rep
                    || self
                        .match_score(
                            rep_segment,
                            segment,
                            rep_frame.alpha - frames[segment.partition as usize].alpha,
                        )
                        .is_some();
                let start = segment.first_hit as usize;
                for hit in &hits[start..start + segment.n_hits as usize] {
                    let mut hit = *hit;
                    if fitted {
                        hit.state |= MergedClusterRef::FITTED;
                        n_fitted += 1;
                    }
                    refs.push(hit);
                }
                n_loopers += segment.looper;
                if geometry.is_c_side(segment.partition as usize) {
                    c_side = true;
                } else {
                    a_side = true;
                }
            }

            let mut flags = MergedTrackFlags::OK;
            if n_loopers > 0 {
                flags |= MergedTrackFlags::LOOPER;
            }
            if n_loopers > 1 {
                flags |= MergedTrackFlags::MERGED_LOOPER;
            }
            if a_side && c_side {
                flags |= MergedTrackFlags::CROSS_PARTITION;
            }
            if rep_frame.c_side != 0 {
                flags |= MergedTrackFlags::C_SIDE;
            }

            let mut track = MergedTrack::default();
            track.param = rep_segment.inner;
            track.outer_param = outer_segment.outer;
            track.alpha = rep_frame.alpha;
            track.outer_alpha = frames[outer_segment.partition as usize].alpha;
            track.n_clusters = refs.len() as u32 - first_cluster_ref;
            track.n_clusters_fitted = n_fitted;
            track.first_cluster_ref = first_cluster_ref;
            track.set_flags(flags);
            tracks.push(track);
        }
        (tracks, refs)
    }
}

/// Unordered partition pairs to match: azimuthal neighbours and facing partitions
fn partition_pairs(geometry: &dyn Geometry, n_partitions: usize) -> Vec<(usize, usize)> {
    let mut pairs = BTreeSet::new();
    for p in 0..n_partitions {
        for q in [geometry.next_partition(p), geometry.opposite_partition(p)]
            .into_iter()
            .flatten()
        {
            if q != p && q < n_partitions {
                pairs.insert((p.min(q), p.max(q)));
            }
        }
    }
    pairs.into_iter().collect()
}

/// Greedy acyclic linking; returns both neighbours of every segment
fn link_segments(n_segments: usize, links: &[Link], n_links: &mut usize) -> Vec<[u32; 2]> {
    let mut parent: Vec<u32> = (0..n_segments as u32).collect();
    let mut adjacency = vec![[NO_LINK; 2]; n_segments];

    fn find(parent: &mut [u32], mut x: u32) -> u32 {
        while parent[x as usize] != x {
            parent[x as usize] = parent[parent[x as usize] as usize];
            x = parent[x as usize];
        }
        x
    }

    for link in links {
        let (a, b) = (link.a as usize, link.b as usize);
        let free_a = adjacency[a].iter().position(|&n| n == NO_LINK);
        let free_b = adjacency[b].iter().position(|&n| n == NO_LINK);
        let (Some(slot_a), Some(slot_b)) = (free_a, free_b) else {
            continue;
        };
        let (root_a, root_b) = (find(&mut parent, link.a), find(&mut parent, link.b));
        if root_a == root_b {
            continue;
        }
        parent[root_a as usize] = root_b;
        adjacency[a][slot_a] = link.b;
        adjacency[b][slot_b] = link.a;
        *n_links += 1;
    }
    adjacency
}

/// Walk every path from its lower-indexed endpoint
fn collect_chains(adjacency: &[[u32; 2]]) -> Vec<Vec<u32>> {
    let mut visited = vec![false; adjacency.len()];
    let mut chains = Vec::new();
    for start in 0..adjacency.len() {
        let degree = adjacency[start].iter().filter(|&&n| n != NO_LINK).count();
        if visited[start] || degree == 2 {
            continue;
        }
        let mut chain = Vec::new();
        let mut previous = NO_LINK;
        let mut current = start as u32;
        loop {
            visited[current as usize] = true;
            chain.push(current);
            let next = adjacency[current as usize]
                .iter()
                .copied()
                .find(|&n| n != NO_LINK && n != previous && !visited[n as usize]);
            match next {
                Some(n) => {
                    previous = current;
                    current = n;
                }
                None => break,
            }
        }
        chains.push(chain);
    }
    chains
}

impl Processor for TrackMerger {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, _ctx: &ExecutionContext) -> ForgeResult<()> {
        self.settings.merge.validate()
    }

    fn register_memory(&mut self, registrar: &mut MemoryRegistrar<'_>) -> MemoryResult<()> {
        self.res_segments = registrar.register("segments", ResourceType::SCRATCH | ResourceType::GPU)?;
        self.res_output = registrar.register("output", ResourceType::OUTPUT | ResourceType::HOST)?;
        self.res_frames = registrar.register("frames", ResourceType::PERMANENT | ResourceType::GPU)?;
        Ok(())
    }

    fn set_max_data(&mut self, sizes: &EventSizes) {
        self.n_partitions = sizes.n_partitions();
        self.max_segments = sizes
            .partitions
            .iter()
            .map(|p| self.settings.track_capacity(p.n_tracklets))
            .sum();
        self.max_segment_hits = sizes
            .partitions
            .iter()
            .map(|p| self.settings.track_hit_capacity(p.n_tracklet_row_hits))
            .sum();
    }

    fn set_pointers(&mut self, resource: ResourceId, cursor: &mut LayoutCursor) {
        if resource == self.res_segments {
            self.segments = cursor.reserve(self.max_segments);
            self.segment_hits = cursor.reserve(self.max_segment_hits);
        } else if resource == self.res_output {
            self.merged = cursor.reserve(self.max_segments);
            self.merged_refs = cursor.reserve(self.max_segment_hits);
        } else if resource == self.res_frames {
            self.frames = cursor.reserve(self.n_partitions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::UniformGeometry;

    fn link(score: f32, a: u32, b: u32) -> Link {
        Link { score, a, b }
    }

    #[test]
    fn test_partition_pairs() {
        let g = UniformGeometry::new(4, 10, 80.0, 90.0).unwrap();
        let pairs = partition_pairs(&g, 4);
        assert_eq!(pairs, vec![(0, 1), (0, 2), (1, 3), (2, 3)]);

        let single = UniformGeometry::new(1, 10, 80.0, 90.0).unwrap();
        assert!(partition_pairs(&single, 1).is_empty());
    }

    #[test]
    fn test_linking_prevents_cycles_and_branches() {
        let links = [
            link(0.1, 0, 1),
            link(0.2, 1, 2),
            link(0.3, 0, 2), // would close a cycle
            link(0.4, 1, 3), // segment 1 already has two neighbours
            link(0.5, 3, 4),
        ];
        let mut n_links = 0;
        let adjacency = link_segments(5, &links, &mut n_links);
        assert_eq!(n_links, 3);
        let chains = collect_chains(&adjacency);
        assert_eq!(chains, vec![vec![0, 1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_unlinked_segments_form_single_chains() {
        let mut n_links = 0;
        let adjacency = link_segments(3, &[], &mut n_links);
        assert_eq!(collect_chains(&adjacency), vec![vec![0], vec![1], vec![2]]);
    }
}
