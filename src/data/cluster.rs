//! Native cluster format and the per-event cluster index

use bytemuck::{Pod, Zeroable};

use crate::error::{ForgeResult, TrackForgeError};

/// One detector hit cluster in packed fixed-point form (12 bytes)
///
/// `time_flags_packed` holds the time in the low 24 bits (1/16 time bin) and the
/// flags in the high 8 bits.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct ClusterNative {
    pub time_flags_packed: u32,
    pub pad_packed: u16,
    pub sigma_time_packed: u8,
    pub sigma_pad_packed: u8,
    pub q_max: u16,
    pub q_tot: u16,
}

impl ClusterNative {
    pub const TIME_BITS: u32 = 24;
    pub const TIME_MASK: u32 = (1 << Self::TIME_BITS) - 1;
    pub const TIME_SCALE: f32 = 16.0;
    pub const PAD_SCALE: f32 = 64.0;
    pub const SIGMA_TIME_SCALE: f32 = 32.0;
    pub const SIGMA_PAD_SCALE: f32 = 32.0;

    /// Flag: cluster split in pad direction
    pub const FLAG_SPLIT_PAD: u8 = 0x1;
    /// Flag: cluster split in time direction
    pub const FLAG_SPLIT_TIME: u8 = 0x2;
    /// Flag: cluster at the pad-row edge
    pub const FLAG_EDGE: u8 = 0x4;
    /// Flag: single-pad cluster
    pub const FLAG_SINGLE: u8 = 0x8;

    /// Build from already-packed fields; `time_packed` is masked to 24 bits
    pub fn from_packed(
        time_packed: u32,
        flags: u8,
        pad_packed: u16,
        sigma_time_packed: u8,
        sigma_pad_packed: u8,
        q_max: u16,
        q_tot: u16,
    ) -> Self {
        Self {
            time_flags_packed: (time_packed & Self::TIME_MASK) | ((flags as u32) << Self::TIME_BITS),
            pad_packed,
            sigma_time_packed,
            sigma_pad_packed,
            q_max,
            q_tot,
        }
    }

    /// Build from physical units, rounding to the packed grid
    pub fn new(time: f32, flags: u8, pad: f32, sigma_time: f32, sigma_pad: f32, q_max: u16, q_tot: u16) -> Self {
        let pack = |v: f32, scale: f32, max: u32| (v * scale + 0.5).clamp(0.0, max as f32) as u32;
        Self::from_packed(
            pack(time, Self::TIME_SCALE, Self::TIME_MASK),
            flags,
            pack(pad, Self::PAD_SCALE, u16::MAX as u32) as u16,
            pack(sigma_time, Self::SIGMA_TIME_SCALE, u8::MAX as u32) as u8,
            pack(sigma_pad, Self::SIGMA_PAD_SCALE, u8::MAX as u32) as u8,
            q_max,
            q_tot,
        )
    }

    #[inline]
    pub fn time_packed(&self) -> u32 {
        self.time_flags_packed & Self::TIME_MASK
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        (self.time_flags_packed >> Self::TIME_BITS) as u8
    }

    pub fn time(&self) -> f32 {
        self.time_packed() as f32 / Self::TIME_SCALE
    }

    pub fn pad(&self) -> f32 {
        self.pad_packed as f32 / Self::PAD_SCALE
    }

    pub fn sigma_time(&self) -> f32 {
        self.sigma_time_packed as f32 / Self::SIGMA_TIME_SCALE
    }

    pub fn sigma_pad(&self) -> f32 {
        self.sigma_pad_packed as f32 / Self::SIGMA_PAD_SCALE
    }

    pub fn set_time_packed(&mut self, time_packed: u32) {
        self.time_flags_packed =
            (time_packed & Self::TIME_MASK) | (self.time_flags_packed & !Self::TIME_MASK);
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.time_flags_packed =
            (self.time_flags_packed & Self::TIME_MASK) | ((flags as u32) << Self::TIME_BITS);
    }
}

/// Flat cluster array of one event, grouped by (partition, row)
///
/// Within a row, clusters keep their insertion order. Index `(p, row)` slots are
/// laid out as `p * n_rows + row`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterNativeAccess {
    n_partitions: usize,
    n_rows: usize,
    clusters: Vec<ClusterNative>,
    counts: Vec<u32>,
    offsets: Vec<u32>,
}

impl ClusterNativeAccess {
    /// Event without clusters
    pub fn empty(n_partitions: usize, n_rows: usize) -> Self {
        Self {
            n_partitions,
            n_rows,
            clusters: Vec::new(),
            counts: vec![0; n_partitions * n_rows],
            offsets: vec![0; n_partitions * n_rows],
        }
    }

    /// Wrap a flat array already grouped by (partition, row) with per-slot counts
    pub fn from_grouped(
        n_partitions: usize,
        n_rows: usize,
        clusters: Vec<ClusterNative>,
        counts: Vec<u32>,
    ) -> ForgeResult<Self> {
        if counts.len() != n_partitions * n_rows {
            return Err(TrackForgeError::InvalidInput(format!(
                "expected {} row counts, got {}",
                n_partitions * n_rows,
                counts.len()
            )));
        }
        let total: u64 = counts.iter().map(|&c| c as u64).sum();
        if total != clusters.len() as u64 {
            return Err(TrackForgeError::InvalidInput(format!(
                "row counts sum to {} but {} clusters given",
                total,
                clusters.len()
            )));
        }
        let mut offsets = Vec::with_capacity(counts.len());
        let mut running = 0u32;
        for &count in &counts {
            offsets.push(running);
            running += count;
        }
        Ok(Self {
            n_partitions,
            n_rows,
            clusters,
            counts,
            offsets,
        })
    }

    pub fn n_partitions(&self) -> usize {
        self.n_partitions
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_clusters_total(&self) -> usize {
        self.clusters.len()
    }

    pub fn clusters(&self) -> &[ClusterNative] {
        &self.clusters
    }

    /// Flat `[partitions x rows]` count array
    pub fn row_counts(&self) -> &[u32] {
        &self.counts
    }

    #[inline]
    fn slot(&self, partition: usize, row: usize) -> Option<usize> {
        (partition < self.n_partitions && row < self.n_rows).then(|| partition * self.n_rows + row)
    }

    pub fn n_clusters(&self, partition: usize, row: usize) -> usize {
        self.slot(partition, row)
            .map(|s| self.counts[s] as usize)
            .unwrap_or(0)
    }

    /// Global index of the first cluster in `(partition, row)`
    pub fn offset(&self, partition: usize, row: usize) -> usize {
        self.slot(partition, row)
            .map(|s| self.offsets[s] as usize)
            .unwrap_or(self.clusters.len())
    }

    pub fn row(&self, partition: usize, row: usize) -> &[ClusterNative] {
        match self.slot(partition, row) {
            Some(s) => {
                let start = self.offsets[s] as usize;
                &self.clusters[start..start + self.counts[s] as usize]
            }
            None => &[],
        }
    }

    pub fn get(&self, partition: usize, row: usize, index: usize) -> Option<&ClusterNative> {
        self.row(partition, row).get(index)
    }

    /// Global index of cluster `index` in `(partition, row)`
    pub fn global_index(&self, partition: usize, row: usize, index: usize) -> Option<u32> {
        let s = self.slot(partition, row)?;
        if index >= self.counts[s] as usize {
            return None;
        }
        Some(self.offsets[s] + index as u32)
    }

    /// Number of clusters in one partition
    pub fn partition_clusters(&self, partition: usize) -> usize {
        (0..self.n_rows).map(|row| self.n_clusters(partition, row)).sum()
    }

    /// Start of each row relative to the partition's first cluster (`n_rows + 1` entries)
    pub fn partition_row_offsets(&self, partition: usize) -> Vec<u32> {
        let mut offsets = Vec::with_capacity(self.n_rows + 1);
        let mut running = 0u32;
        for row in 0..self.n_rows {
            offsets.push(running);
            running += self.n_clusters(partition, row) as u32;
        }
        offsets.push(running);
        offsets
    }

    /// `(partition, row, index)` of a global cluster index
    pub fn locate(&self, global: u32) -> Option<(usize, usize, usize)> {
        if global as usize >= self.clusters.len() {
            return None;
        }
        // empty slots share the offset of the next slot, so the last slot starting
        // at or before `global` is the non-empty one holding it
        let s = self.offsets.partition_point(|&o| o <= global).checked_sub(1)?;
        Some((s / self.n_rows, s % self.n_rows, (global - self.offsets[s]) as usize))
    }
}

/// Collects clusters in any order and groups them by (partition, row)
#[derive(Debug, Clone)]
pub struct ClusterNativeBuilder {
    n_partitions: usize,
    n_rows: usize,
    entries: Vec<(u32, ClusterNative)>,
    counts: Vec<u32>,
}

impl ClusterNativeBuilder {
    pub fn new(n_partitions: usize, n_rows: usize) -> Self {
        Self {
            n_partitions,
            n_rows,
            entries: Vec::new(),
            counts: vec![0; n_partitions * n_rows],
        }
    }

    pub fn with_capacity(n_partitions: usize, n_rows: usize, n_clusters: usize) -> Self {
        let mut builder = Self::new(n_partitions, n_rows);
        builder.entries.reserve(n_clusters);
        builder
    }

    /// Add a cluster; returns its index within `(partition, row)`
    pub fn push(&mut self, partition: usize, row: usize, cluster: ClusterNative) -> ForgeResult<usize> {
        if partition >= self.n_partitions || row >= self.n_rows {
            return Err(TrackForgeError::InvalidInput(format!(
                "cluster at partition {} row {} outside {}x{}",
                partition, row, self.n_partitions, self.n_rows
            )));
        }
        let slot = partition * self.n_rows + row;
        let index = self.counts[slot] as usize;
        self.counts[slot] += 1;
        self.entries.push((slot as u32, cluster));
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of clusters pushed to `(partition, row)` so far
    pub fn n_clusters(&self, partition: usize, row: usize) -> usize {
        if partition >= self.n_partitions || row >= self.n_rows {
            return 0;
        }
        self.counts[partition * self.n_rows + row] as usize
    }

    pub fn build(self) -> ClusterNativeAccess {
        let mut offsets = Vec::with_capacity(self.counts.len());
        let mut running = 0u32;
        for &count in &self.counts {
            offsets.push(running);
            running += count;
        }
        // counting sort; keeps insertion order inside a row
        let mut next = offsets.clone();
        let mut clusters = vec![ClusterNative::default(); self.entries.len()];
        for (slot, cluster) in self.entries {
            let at = &mut next[slot as usize];
            clusters[*at as usize] = cluster;
            *at += 1;
        }
        ClusterNativeAccess {
            n_partitions: self.n_partitions,
            n_rows: self.n_rows,
            clusters,
            counts: self.counts,
            offsets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_layout() {
        assert_eq!(std::mem::size_of::<ClusterNative>(), 12);
    }

    #[test]
    fn test_packing() {
        let c = ClusterNative::new(100.5, 0x3, 12.25, 1.5, 0.75, 40, 300);
        assert_eq!(c.time_packed(), 1608);
        assert_eq!(c.flags(), 0x3);
        assert_eq!(c.pad_packed, 784);
        assert!((c.time() - 100.5).abs() < 1e-6);
        assert!((c.pad() - 12.25).abs() < 1e-6);
        assert!((c.sigma_time() - 1.5).abs() < 1e-6);
        assert!((c.sigma_pad() - 0.75).abs() < 1e-6);

        let mut c2 = c;
        c2.set_time_packed(0x1FF_FFFF);
        assert_eq!(c2.time_packed(), ClusterNative::TIME_MASK);
        assert_eq!(c2.flags(), 0x3);
        c2.set_flags(0x8);
        assert_eq!(c2.flags(), 0x8);
        assert_eq!(c2.time_packed(), ClusterNative::TIME_MASK);
    }

    #[test]
    fn test_builder_groups_by_row() {
        let mut builder = ClusterNativeBuilder::new(2, 3);
        let a = ClusterNative::from_packed(1, 0, 10, 0, 0, 1, 1);
        let b = ClusterNative::from_packed(2, 0, 20, 0, 0, 2, 2);
        let c = ClusterNative::from_packed(3, 0, 30, 0, 0, 3, 3);
        assert_eq!(builder.push(1, 2, a).unwrap(), 0);
        assert_eq!(builder.push(0, 1, b).unwrap(), 0);
        assert_eq!(builder.push(1, 2, c).unwrap(), 1);
        assert!(builder.push(2, 0, a).is_err());

        let access = builder.build();
        assert_eq!(access.n_clusters_total(), 3);
        assert_eq!(access.row(0, 1), &[b]);
        assert_eq!(access.row(1, 2), &[a, c]);
        assert_eq!(access.global_index(1, 2, 1), Some(2));
        assert_eq!(access.locate(2), Some((1, 2, 1)));
        assert_eq!(access.locate(0), Some((0, 1, 0)));
        assert_eq!(access.locate(3), None);
        assert_eq!(access.partition_row_offsets(1), vec![0, 0, 0, 2]);
    }

    #[test]
    fn test_builder_counts_per_row() {
        let mut builder = ClusterNativeBuilder::with_capacity(3, 50, 60_000);
        for i in 0..60_000u32 {
            let (p, row) = ((i % 3) as usize, (i / 3 % 50) as usize);
            let index = builder.push(p, row, ClusterNative::from_packed(i, 0, 0, 0, 0, 0, 0)).unwrap();
            assert_eq!(index, (i / 150) as usize);
        }
        assert_eq!(builder.n_clusters(2, 49), 400);
        assert_eq!(builder.n_clusters(3, 0), 0);

        let access = builder.build();
        assert!(access.row_counts().iter().all(|&n| n == 400));
        // insertion order survives inside each row
        let row = access.row(1, 7);
        assert_eq!(row[0].time_packed(), 1 + 3 * 7);
        assert_eq!(row[399].time_packed(), 59_850 + 1 + 3 * 7);
        assert_eq!(access.locate(access.global_index(1, 7, 5).unwrap()), Some((1, 7, 5)));
    }

    #[test]
    fn test_locate_skips_empty_rows() {
        let mut builder = ClusterNativeBuilder::new(2, 4);
        let c = ClusterNative::default();
        builder.push(0, 0, c).unwrap();
        builder.push(1, 3, c).unwrap();
        builder.push(1, 3, c).unwrap();
        let access = builder.build();
        assert_eq!(access.locate(0), Some((0, 0, 0)));
        assert_eq!(access.locate(1), Some((1, 3, 0)));
        assert_eq!(access.locate(2), Some((1, 3, 1)));
        assert_eq!(access.locate(3), None);
    }

    #[test]
    fn test_from_grouped_validates_counts() {
        let clusters = vec![ClusterNative::default(); 3];
        assert!(ClusterNativeAccess::from_grouped(1, 2, clusters.clone(), vec![1, 1]).is_err());
        let access = ClusterNativeAccess::from_grouped(1, 2, clusters, vec![1, 2]).unwrap();
        assert_eq!(access.offset(0, 1), 1);
    }
}
