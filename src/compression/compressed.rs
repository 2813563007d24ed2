//! Columnar compressed-cluster format
//!
//! A compressed event is one flat block: a [`CompressedClustersHeader`] followed by
//! one array per field, every array starting on an `ARRAY_ALIGNMENT` boundary
//! relative to the block start. The same layout is used for the arena output, the
//! staging buffers and [`CompressedClusters::to_flat`], so gathering is a plain
//! byte copy.
//!
//! Columns come in five groups, each with its own length:
//!
//! | group                 | length                     |
//! |-----------------------|----------------------------|
//! | attached clusters     | `n_attached`               |
//! | reduced attached      | `n_attached - n_tracks`    |
//! | tracks                | `n_tracks`                 |
//! | unattached clusters   | `n_unattached`             |
//! | partition rows        | `n_partitions * n_rows`    |

use bytemuck::{Pod, Zeroable};

use crate::error::{ForgeResult, TrackForgeError};
use crate::memory::{
    ArenaSlice, LayoutCursor, MemoryResourceManager, MemoryResult, SharedSlice, ARRAY_ALIGNMENT,
};

/// Block magic, "TFCC" little endian
pub const COMPRESSED_MAGIC: u32 = u32::from_le_bytes(*b"TFCC");
pub const COMPRESSED_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CompressedClustersHeader {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    pub charge_truncation_bits: u32,
    pub n_partitions: u32,
    pub n_rows: u32,
    pub n_tracks: u32,
    pub n_attached: u32,
    pub n_attached_reduced: u32,
    pub n_unattached: u32,
}

impl CompressedClustersHeader {
    /// Attached residuals are relative to the track model
    pub const FLAG_TRACK_MODEL: u32 = 0x1;

    pub fn new(counts: &CompressionCounts, track_model: bool, charge_truncation_bits: u32) -> Self {
        Self {
            magic: COMPRESSED_MAGIC,
            version: COMPRESSED_VERSION,
            flags: if track_model { Self::FLAG_TRACK_MODEL } else { 0 },
            charge_truncation_bits,
            n_partitions: counts.n_partitions as u32,
            n_rows: counts.n_rows as u32,
            n_tracks: counts.n_tracks as u32,
            n_attached: counts.n_attached as u32,
            n_attached_reduced: counts.n_attached_reduced() as u32,
            n_unattached: counts.n_unattached as u32,
        }
    }

    pub fn track_model(&self) -> bool {
        self.flags & Self::FLAG_TRACK_MODEL != 0
    }

    pub fn counts(&self) -> CompressionCounts {
        CompressionCounts {
            n_partitions: self.n_partitions as usize,
            n_rows: self.n_rows as usize,
            n_tracks: self.n_tracks as usize,
            n_attached: self.n_attached as usize,
            n_unattached: self.n_unattached as usize,
        }
    }

    fn validate(&self) -> ForgeResult<()> {
        if self.magic != COMPRESSED_MAGIC {
            return Err(TrackForgeError::CorruptCompressedData(format!(
                "bad magic {:#010x}",
                self.magic
            )));
        }
        if self.version != COMPRESSED_VERSION {
            return Err(TrackForgeError::CorruptCompressedData(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.n_attached < self.n_tracks
            || self.n_attached_reduced != self.n_attached - self.n_tracks
        {
            return Err(TrackForgeError::CorruptCompressedData(format!(
                "inconsistent counts: {} attached, {} reduced, {} tracks",
                self.n_attached, self.n_attached_reduced, self.n_tracks
            )));
        }
        Ok(())
    }
}

/// Element counts that fix the column lengths of one compressed event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionCounts {
    pub n_partitions: usize,
    pub n_rows: usize,
    pub n_tracks: usize,
    pub n_attached: usize,
    pub n_unattached: usize,
}

impl CompressionCounts {
    pub fn n_tracks(&self) -> usize {
        self.n_tracks
    }

    pub fn n_attached(&self) -> usize {
        self.n_attached
    }

    /// Attached clusters minus the first cluster of every track
    pub fn n_attached_reduced(&self) -> usize {
        self.n_attached.saturating_sub(self.n_tracks)
    }

    pub fn n_unattached(&self) -> usize {
        self.n_unattached
    }

    pub fn n_slots(&self) -> usize {
        self.n_partitions * self.n_rows
    }

    /// Size of the flat block in bytes
    pub fn flat_size(&self) -> usize {
        let mut cursor = LayoutCursor::sizing();
        ColumnSet::reserve(&mut cursor, self);
        cursor.used()
    }

    /// Largest flat block any split of `n_clusters` into tracks, attached and
    /// unattached clusters can produce
    ///
    /// Without padding the block size is linear in the counts, so its maximum over
    /// `n_tracks <= n_attached`, `n_attached + n_unattached <= n_clusters` sits on a
    /// corner of that region. Padding adds less than one alignment per column.
    pub fn max_flat_size(n_partitions: usize, n_rows: usize, n_clusters: usize) -> usize {
        let corner = |n_tracks, n_attached, n_unattached| {
            CompressionCounts {
                n_partitions,
                n_rows,
                n_tracks,
                n_attached,
                n_unattached,
            }
            .flat_size()
        };
        let largest = corner(0, 0, n_clusters)
            .max(corner(0, n_clusters, 0))
            .max(corner(n_clusters, n_clusters, 0));
        largest + (ColumnSet::N_COLUMNS + 1) * ARRAY_ALIGNMENT
    }
}

fn read_column<T: Pod>(bytes: &[u8], slot: ArenaSlice<T>, name: &str) -> ForgeResult<Vec<T>> {
    let end = slot.offset() + slot.byte_len();
    let raw = bytes.get(slot.offset()..end).ok_or_else(|| {
        TrackForgeError::CorruptCompressedData(format!(
            "column {} ends at byte {}, block has {}",
            name,
            end,
            bytes.len()
        ))
    })?;
    Ok(bytemuck::pod_collect_to_vec(raw))
}

fn check_column_len(name: &str, actual: usize, expected: usize) -> ForgeResult<()> {
    if actual != expected {
        return Err(TrackForgeError::CorruptCompressedData(format!(
            "column {} has {} entries, header says {}",
            name, actual, expected
        )));
    }
    Ok(())
}

macro_rules! compressed_columns {
    ($( $(#[$doc:meta])* $name:ident : $ty:ty => $count:ident ),* $(,)?) => {
        /// Arena handles of the header and every column of one flat block
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct ColumnSet {
            pub header: ArenaSlice<CompressedClustersHeader>,
            $( pub $name: ArenaSlice<$ty>, )*
        }

        impl ColumnSet {
            /// Number of columns, header excluded
            pub const N_COLUMNS: usize = [$(stringify!($name)),*].len();

            pub fn reserve(cursor: &mut LayoutCursor, counts: &CompressionCounts) -> Self {
                let header = cursor.reserve::<CompressedClustersHeader>(1);
                $( let $name = cursor.reserve::<$ty>(counts.$count()); )*
                Self { header, $( $name, )* }
            }

            pub fn is_null(&self) -> bool {
                self.header.is_null()
            }

            /// Copy the header and each column separately; returns (copies, bytes)
            pub fn copy_fields(
                &self,
                memory: &mut MemoryResourceManager,
                dst: &ColumnSet,
            ) -> MemoryResult<(usize, usize)> {
                let mut copies = 1;
                let mut bytes = memory.copy_region(self.header, dst.header)?;
                $(
                    bytes += memory.copy_region(self.$name, dst.$name)?;
                    copies += 1;
                )*
                Ok((copies, bytes))
            }
        }

        /// Writable views of every column, for the encoding kernels
        pub(crate) struct ColumnViews<'m> {
            $( pub $name: SharedSlice<'m, $ty>, )*
        }

        impl<'m> ColumnViews<'m> {
            pub fn new(memory: &'m MemoryResourceManager, set: &ColumnSet) -> MemoryResult<Self> {
                Ok(Self { $( $name: memory.shared(set.$name)?, )* })
            }
        }

        /// Host copy of a compressed event
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct CompressedClusters {
            pub header: CompressedClustersHeader,
            $( $(#[$doc])* pub $name: Vec<$ty>, )*
        }

        impl CompressedClusters {
            /// Parse a flat block
            pub fn from_flat(bytes: &[u8]) -> ForgeResult<Self> {
                let header_size = std::mem::size_of::<CompressedClustersHeader>();
                if bytes.len() < header_size {
                    return Err(TrackForgeError::CorruptCompressedData(format!(
                        "block of {} bytes is shorter than the header",
                        bytes.len()
                    )));
                }
                let header: CompressedClustersHeader =
                    bytemuck::pod_read_unaligned(&bytes[..header_size]);
                header.validate()?;
                let counts = header.counts();

                let mut cursor = LayoutCursor::sizing();
                let slots = ColumnSet::reserve(&mut cursor, &counts);
                Ok(Self {
                    header,
                    $( $name: read_column(bytes, slots.$name, stringify!($name))?, )*
                })
            }

            /// Check every column against the header counts
            pub fn validate(&self) -> ForgeResult<()> {
                self.header.validate()?;
                let counts = self.header.counts();
                $( check_column_len(stringify!($name), self.$name.len(), counts.$count())?; )*
                Ok(())
            }

            /// Serialize to the flat layout
            pub fn to_flat(&self) -> ForgeResult<Vec<u8>> {
                self.validate()?;
                let counts = self.header.counts();
                let mut out = vec![0u8; counts.flat_size()];
                let mut cursor = LayoutCursor::sizing();
                let slots = ColumnSet::reserve(&mut cursor, &counts);

                let at = slots.header.offset();
                out[at..at + slots.header.byte_len()].copy_from_slice(bytemuck::bytes_of(&self.header));
                $(
                    let at = slots.$name.offset();
                    out[at..at + slots.$name.byte_len()]
                        .copy_from_slice(bytemuck::cast_slice(&self.$name));
                )*
                Ok(out)
            }
        }
    };
}

compressed_columns! {
    /// Total charge of every attached cluster
    q_tot_a: u16 => n_attached,
    q_max_a: u16 => n_attached,
    flags_a: u8 => n_attached,
    sigma_pad_a: u8 => n_attached,
    sigma_time_a: u8 => n_attached,

    /// Row step from the previous cluster, or the absolute row without track model
    row_diff_a: u8 => n_attached_reduced,
    /// Partition step from the previous cluster, or the absolute partition
    slice_leg_diff_a: u8 => n_attached_reduced,
    /// Pad residual to the model prediction, or the absolute packed pad
    pad_res_a: u16 => n_attached_reduced,
    /// Time residual (24 bit), or the absolute packed time
    time_res_a: u32 => n_attached_reduced,

    /// Quantized q/pt of the track
    q_pt_a: u8 => n_tracks,
    /// Row of the first cluster
    row_a: u8 => n_tracks,
    /// Partition of the first cluster
    slice_a: u8 => n_tracks,
    pad_a: u16 => n_tracks,
    time_a: u32 => n_tracks,
    n_track_clusters: u32 => n_tracks,

    q_tot_u: u16 => n_unattached,
    q_max_u: u16 => n_unattached,
    flags_u: u8 => n_unattached,
    sigma_pad_u: u8 => n_unattached,
    sigma_time_u: u8 => n_unattached,
    /// Pad step from the previous unattached cluster of the row, or the absolute pad
    pad_diff_u: u16 => n_unattached,
    /// Time step (24 bit) from the previous unattached cluster, or the absolute time
    time_diff_u: u32 => n_unattached,

    /// Unattached clusters per (partition, row), partition-major
    n_partition_row_clusters: u32 => n_slots,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts() -> CompressionCounts {
        CompressionCounts {
            n_partitions: 2,
            n_rows: 3,
            n_tracks: 1,
            n_attached: 3,
            n_unattached: 2,
        }
    }

    fn sample() -> CompressedClusters {
        let counts = counts();
        CompressedClusters {
            header: CompressedClustersHeader::new(&counts, true, 0),
            q_tot_a: vec![10, 11, 12],
            q_max_a: vec![5, 6, 7],
            flags_a: vec![0, 1, 0],
            sigma_pad_a: vec![3, 3, 3],
            sigma_time_a: vec![4, 4, 4],
            row_diff_a: vec![1, 1],
            slice_leg_diff_a: vec![0, 0],
            pad_res_a: vec![2, 65535],
            time_res_a: vec![0, 0xFF_FFFF],
            q_pt_a: vec![127],
            row_a: vec![0],
            slice_a: vec![1],
            pad_a: vec![640],
            time_a: vec![16000],
            n_track_clusters: vec![3],
            q_tot_u: vec![20, 21],
            q_max_u: vec![8, 9],
            flags_u: vec![0, 0],
            sigma_pad_u: vec![1, 2],
            sigma_time_u: vec![1, 2],
            pad_diff_u: vec![100, 4],
            time_diff_u: vec![500, 7],
            n_partition_row_clusters: vec![0, 2, 0, 0, 0, 0],
        }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(std::mem::size_of::<CompressedClustersHeader>(), 40);
        assert_eq!(ColumnSet::N_COLUMNS, 23);
    }

    #[test]
    fn test_counts() {
        let counts = counts();
        assert_eq!(counts.n_attached_reduced(), 2);
        assert_eq!(counts.n_slots(), 6);
        // header plus 23 columns, each on its own 64-byte boundary
        assert_eq!(counts.flat_size(), 23 * 64 + 24);
    }

    #[test]
    fn test_max_flat_size_covers_every_split() {
        let n = 37;
        let bound = CompressionCounts::max_flat_size(2, 3, n);
        for n_attached in 0..=n {
            for n_tracks in 0..=n_attached {
                let counts = CompressionCounts {
                    n_partitions: 2,
                    n_rows: 3,
                    n_tracks,
                    n_attached,
                    n_unattached: n - n_attached,
                };
                assert!(counts.flat_size() <= bound, "{:?}", counts);
            }
        }
    }

    #[test]
    fn test_flat_roundtrip() {
        let cc = sample();
        let flat = cc.to_flat().unwrap();
        assert_eq!(flat.len(), cc.header.counts().flat_size());
        assert_eq!(CompressedClusters::from_flat(&flat).unwrap(), cc);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut flat = sample().to_flat().unwrap();
        flat[0] ^= 0xFF;
        assert!(matches!(
            CompressedClusters::from_flat(&flat),
            Err(TrackForgeError::CorruptCompressedData(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_block() {
        let flat = sample().to_flat().unwrap();
        assert!(CompressedClusters::from_flat(&flat[..flat.len() - 8]).is_err());
        assert!(CompressedClusters::from_flat(&flat[..16]).is_err());
    }

    #[test]
    fn test_validate_column_lengths() {
        let mut cc = sample();
        cc.q_tot_a.pop();
        assert!(cc.validate().is_err());
        assert!(cc.to_flat().is_err());
    }
}
