//! Reconstruction of native clusters from a compressed event

use std::sync::Arc;

use super::compressed::CompressedClusters;
use super::track_model::{LinearTrackModel, ModelPoint, TrackModel};
use crate::data::ClusterNative;
use crate::error::{ForgeResult, TrackForgeError};

/// One cluster of a decoded track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCluster {
    pub partition: u8,
    pub row: u8,
    pub cluster: ClusterNative,
}

/// Decoded event: attached clusters in track order, unattached per (partition, row)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedClusters {
    pub n_partitions: usize,
    pub n_rows: usize,
    pub tracks: Vec<Vec<DecodedCluster>>,
    /// Partition-major, `n_partitions * n_rows` entries
    pub unattached: Vec<Vec<ClusterNative>>,
}

impl DecodedClusters {
    pub fn unattached_row(&self, partition: usize, row: usize) -> &[ClusterNative] {
        &self.unattached[partition * self.n_rows + row]
    }

    pub fn n_attached(&self) -> usize {
        self.tracks.iter().map(Vec::len).sum()
    }

    pub fn n_unattached(&self) -> usize {
        self.unattached.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ClusterDecoder {
    model: Arc<dyn TrackModel>,
}

impl Default for ClusterDecoder {
    fn default() -> Self {
        Self::new(Arc::new(LinearTrackModel))
    }
}

impl ClusterDecoder {
    /// `model` must be the model the event was encoded with
    pub fn new(model: Arc<dyn TrackModel>) -> Self {
        Self { model }
    }

    pub fn decode(&self, cc: &CompressedClusters) -> ForgeResult<DecodedClusters> {
        cc.validate()?;
        let header = &cc.header;
        let counts = header.counts();
        let track_model = header.track_model();

        let total: u64 = cc.n_track_clusters.iter().map(|&n| n as u64).sum();
        if total != counts.n_attached as u64 || cc.n_track_clusters.contains(&0) {
            return Err(TrackForgeError::CorruptCompressedData(format!(
                "track cluster counts sum to {}, header says {} attached",
                total, counts.n_attached
            )));
        }
        let total: u64 = cc.n_partition_row_clusters.iter().map(|&n| n as u64).sum();
        if total != counts.n_unattached as u64 {
            return Err(TrackForgeError::CorruptCompressedData(format!(
                "row cluster counts sum to {}, header says {} unattached",
                total, counts.n_unattached
            )));
        }

        let mut tracks = Vec::with_capacity(counts.n_tracks);
        let mut attached = 0usize;
        for t in 0..counts.n_tracks {
            let n = cc.n_track_clusters[t] as usize;
            let reduced = attached - t;
            let mut out = Vec::with_capacity(n);

            let (mut row, mut partition) = (cc.row_a[t], cc.slice_a[t]);
            let mut c = ClusterNative::from_packed(
                cc.time_a[t],
                cc.flags_a[attached],
                cc.pad_a[t],
                cc.sigma_time_a[attached],
                cc.sigma_pad_a[attached],
                cc.q_max_a[attached],
                cc.q_tot_a[attached],
            );
            out.push(DecodedCluster { partition, row, cluster: c });

            let mut last = ModelPoint::new(row as u32, &c);
            let mut before = None;
            for k in 1..n {
                let at = reduced + k - 1;
                let (pad, time);
                if track_model {
                    row = row.wrapping_add(cc.row_diff_a[at]);
                    partition = partition.wrapping_add(cc.slice_leg_diff_a[at]);
                    let predicted = self.model.predict(last, before, row as i32);
                    pad = predicted.pad.wrapping_add(cc.pad_res_a[at]);
                    time = predicted.time.wrapping_add(cc.time_res_a[at]);
                } else {
                    row = cc.row_diff_a[at];
                    partition = cc.slice_leg_diff_a[at];
                    pad = cc.pad_res_a[at];
                    time = cc.time_res_a[at];
                }
                let i = attached + k;
                c = ClusterNative::from_packed(
                    time,
                    cc.flags_a[i],
                    pad,
                    cc.sigma_time_a[i],
                    cc.sigma_pad_a[i],
                    cc.q_max_a[i],
                    cc.q_tot_a[i],
                );
                out.push(DecodedCluster { partition, row, cluster: c });
                before = Some(last);
                last = ModelPoint::new(row as u32, &c);
            }
            attached += n;
            tracks.push(out);
        }

        let mut unattached = Vec::with_capacity(counts.n_slots());
        let mut at = 0usize;
        for &n in &cc.n_partition_row_clusters {
            let mut row = Vec::with_capacity(n as usize);
            let (mut pad, mut time) = (0u16, 0u32);
            for i in at..at + n as usize {
                if track_model {
                    pad = pad.wrapping_add(cc.pad_diff_u[i]);
                    time = time.wrapping_add(cc.time_diff_u[i]);
                } else {
                    pad = cc.pad_diff_u[i];
                    time = cc.time_diff_u[i];
                }
                row.push(ClusterNative::from_packed(
                    time,
                    cc.flags_u[i],
                    pad,
                    cc.sigma_time_u[i],
                    cc.sigma_pad_u[i],
                    cc.q_max_u[i],
                    cc.q_tot_u[i],
                ));
            }
            at += n as usize;
            unattached.push(row);
        }

        Ok(DecodedClusters {
            n_partitions: counts.n_partitions,
            n_rows: counts.n_rows,
            tracks,
            unattached,
        })
    }
}
