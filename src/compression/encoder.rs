//! Encoding kernels: one worker per track for attached clusters, one per
//! (partition, row) for unattached clusters
//!
//! Every worker writes a disjoint column range given by host-side prefix sums.

use std::sync::atomic::{AtomicU32, Ordering};

use super::compressed::ColumnViews;
use super::track_model::{quantize_q_pt, ModelPoint, TrackModel};
use crate::data::{ClusterNative, ClusterNativeAccess, MergedClusterRef, MergedTrack};

/// Per-event encoding parameters
#[derive(Debug, Clone, Copy)]
pub(crate) struct EncodeParams {
    pub track_model: bool,
    pub charge_truncation_bits: u32,
}

/// Drop the low `bits` bits of a charge
pub fn truncate_charge(q: u16, bits: u32) -> u16 {
    if bits == 0 {
        q
    } else {
        q & !((1u16 << bits) - 1)
    }
}

/// Range of one encoded track inside the attached and track columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TrackSlot {
    /// Index into the merged track list
    pub track: u32,
    /// First attached-cluster index
    pub attached: u32,
}

pub(crate) fn mark_attached(
    mask: &[AtomicU32],
    tracks: &[MergedTrack],
    refs: &[MergedClusterRef],
    track: usize,
) {
    for r in &refs[tracks[track].cluster_range()] {
        mask[r.index as usize].store(1, Ordering::Relaxed);
    }
}

pub(crate) fn count_unattached(mask: &[AtomicU32], clusters: &ClusterNativeAccess, slot: usize) -> u32 {
    let n_rows = clusters.n_rows();
    let start = clusters.offset(slot / n_rows, slot % n_rows);
    let n = clusters.n_clusters(slot / n_rows, slot % n_rows);
    mask[start..start + n]
        .iter()
        .filter(|m| m.load(Ordering::Relaxed) == 0)
        .count() as u32
}

/// Encode the clusters of one track
///
/// # Safety
/// No other worker may write the column ranges belonging to `index`.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn encode_track(
    out: &ColumnViews<'_>,
    model: &dyn TrackModel,
    params: EncodeParams,
    clusters: &ClusterNativeAccess,
    tracks: &[MergedTrack],
    refs: &[MergedClusterRef],
    slot: TrackSlot,
    index: usize,
) {
    let track = &tracks[slot.track as usize];
    let refs = &refs[track.cluster_range()];
    let all = clusters.clusters();
    let attached = slot.attached as usize;
    let reduced = attached - index;
    let bits = params.charge_truncation_bits;

    for (k, r) in refs.iter().enumerate() {
        let c = &all[r.index as usize];
        out.q_tot_a.write(attached + k, truncate_charge(c.q_tot, bits));
        out.q_max_a.write(attached + k, truncate_charge(c.q_max, bits));
        out.flags_a.write(attached + k, c.flags());
        out.sigma_pad_a.write(attached + k, c.sigma_pad_packed);
        out.sigma_time_a.write(attached + k, c.sigma_time_packed);
    }

    let first = &refs[0];
    let first_cluster = &all[first.index as usize];
    out.q_pt_a.write(index, quantize_q_pt(track.param.q_pt));
    out.row_a.write(index, first.row as u8);
    out.slice_a.write(index, first.partition);
    out.pad_a.write(index, first_cluster.pad_packed);
    out.time_a.write(index, first_cluster.time_packed());
    out.n_track_clusters.write(index, refs.len() as u32);

    let mut last = ModelPoint::new(first.row as u32, first_cluster);
    let mut before = None;
    let mut prev = first;
    for (k, r) in refs.iter().enumerate().skip(1) {
        let c = &all[r.index as usize];
        let at = reduced + k - 1;
        if params.track_model {
            let predicted = model.predict(last, before, r.row as i32);
            out.row_diff_a.write(at, (r.row as u8).wrapping_sub(prev.row as u8));
            out.slice_leg_diff_a.write(at, r.partition.wrapping_sub(prev.partition));
            out.pad_res_a.write(at, c.pad_packed.wrapping_sub(predicted.pad));
            out.time_res_a.write(
                at,
                c.time_packed().wrapping_sub(predicted.time) & ClusterNative::TIME_MASK,
            );
        } else {
            out.row_diff_a.write(at, r.row as u8);
            out.slice_leg_diff_a.write(at, r.partition);
            out.pad_res_a.write(at, c.pad_packed);
            out.time_res_a.write(at, c.time_packed());
        }
        before = Some(last);
        last = ModelPoint::new(r.row as u32, c);
        prev = r;
    }
}

/// Encode the unattached clusters of one (partition, row)
///
/// # Safety
/// No other worker may write the column ranges belonging to `slot`.
pub(crate) unsafe fn encode_row(
    out: &ColumnViews<'_>,
    params: EncodeParams,
    clusters: &ClusterNativeAccess,
    mask: &[AtomicU32],
    slot: usize,
    first_unattached: usize,
    n_unattached: u32,
) {
    let n_rows = clusters.n_rows();
    let (partition, row) = (slot / n_rows, slot % n_rows);
    let start = clusters.offset(partition, row);
    let bits = params.charge_truncation_bits;

    out.n_partition_row_clusters.write(slot, n_unattached);

    let mut at = first_unattached;
    let (mut prev_pad, mut prev_time) = (0u16, 0u32);
    for (i, c) in clusters.row(partition, row).iter().enumerate() {
        if mask[start + i].load(Ordering::Relaxed) != 0 {
            continue;
        }
        out.q_tot_u.write(at, truncate_charge(c.q_tot, bits));
        out.q_max_u.write(at, truncate_charge(c.q_max, bits));
        out.flags_u.write(at, c.flags());
        out.sigma_pad_u.write(at, c.sigma_pad_packed);
        out.sigma_time_u.write(at, c.sigma_time_packed);
        if params.track_model {
            out.pad_diff_u.write(at, c.pad_packed.wrapping_sub(prev_pad));
            out.time_diff_u.write(
                at,
                c.time_packed().wrapping_sub(prev_time) & ClusterNative::TIME_MASK,
            );
        } else {
            out.pad_diff_u.write(at, c.pad_packed);
            out.time_diff_u.write(at, c.time_packed());
        }
        prev_pad = c.pad_packed;
        prev_time = c.time_packed();
        at += 1;
    }
}
