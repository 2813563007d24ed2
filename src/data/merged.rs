//! Global tracks produced by the merger

use bytemuck::{Pod, Zeroable};

use super::track::TrackParam;

bitflags::bitflags! {
    /// Status bits of a merged track
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MergedTrackFlags: u32 {
        const OK = 1 << 0;
        /// Trajectory curls back inside the detector
        const LOOPER = 1 << 1;
        /// Clusters on both detector sides
        const CROSS_PARTITION = 1 << 2;
        /// Two looper arcs merged into one track
        const MERGED_LOOPER = 1 << 3;
        /// Inner parameters refer to the C side
        const C_SIDE = 1 << 4;
    }
}

/// Global track spanning one or more partitions (88 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct MergedTrack {
    pub param: TrackParam,
    /// Snapshot at the outermost cluster
    pub outer_param: TrackParam,
    pub alpha: f32,
    pub outer_alpha: f32,
    pub n_clusters: u32,
    pub n_clusters_fitted: u32,
    pub first_cluster_ref: u32,
    flags: u32,
}

impl MergedTrack {
    pub fn flags(&self) -> MergedTrackFlags {
        MergedTrackFlags::from_bits_truncate(self.flags)
    }

    pub fn set_flags(&mut self, flags: MergedTrackFlags) {
        self.flags = flags.bits();
    }

    pub fn ok(&self) -> bool {
        self.flags().contains(MergedTrackFlags::OK)
    }

    pub fn looper(&self) -> bool {
        self.flags().contains(MergedTrackFlags::LOOPER)
    }

    pub fn cross_partition(&self) -> bool {
        self.flags().contains(MergedTrackFlags::CROSS_PARTITION)
    }

    pub fn merged_looper(&self) -> bool {
        self.flags().contains(MergedTrackFlags::MERGED_LOOPER)
    }

    /// Range of this track in the shared cluster-reference array
    pub fn cluster_range(&self) -> std::ops::Range<usize> {
        let start = self.first_cluster_ref as usize;
        start..start + self.n_clusters as usize
    }

    /// `n_clusters_fitted <= n_clusters` and the reference range lies inside `n_refs`
    pub fn is_consistent(&self, n_refs: usize) -> bool {
        self.n_clusters_fitted <= self.n_clusters && self.cluster_range().end <= n_refs
    }
}

/// Entry of the shared cluster-reference array (8 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct MergedClusterRef {
    /// Global cluster index in the event's cluster array
    pub index: u32,
    pub row: u16,
    pub partition: u8,
    pub state: u8,
}

impl MergedClusterRef {
    /// State bit: the cluster contributes to the final fit
    pub const FITTED: u8 = 0x1;

    pub fn is_fitted(&self) -> bool {
        self.state & Self::FITTED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<MergedTrack>(), 88);
        assert_eq!(std::mem::size_of::<MergedClusterRef>(), 8);
    }

    #[test]
    fn test_flags_and_consistency() {
        let mut t = MergedTrack {
            n_clusters: 10,
            n_clusters_fitted: 8,
            first_cluster_ref: 5,
            ..Default::default()
        };
        t.set_flags(MergedTrackFlags::OK | MergedTrackFlags::LOOPER);
        assert!(t.ok());
        assert!(t.looper());
        assert!(!t.cross_partition());
        assert_eq!(t.cluster_range(), 5..15);
        assert!(t.is_consistent(15));
        assert!(!t.is_consistent(14));
        t.n_clusters_fitted = 11;
        assert!(!t.is_consistent(100));
    }
}
