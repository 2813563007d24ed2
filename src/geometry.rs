//! Detector geometry collaborator
//!
//! The pipeline needs only partition/row counts, the radial position of each row
//! and the orientation of each partition. Partitions `0..n/2` form the A side,
//! `n/2..n` the C side; partition `p` on one side faces `p + n/2` on the other.

use std::f32::consts::PI;
use std::fmt::Debug;

use crate::error::{ForgeResult, TrackForgeError};

pub trait Geometry: Send + Sync + Debug {
    fn n_partitions(&self) -> usize;
    fn n_rows(&self) -> usize;

    /// Radial position of a pad row
    fn row_x(&self, row: usize) -> f32;

    /// Rotation angle of a partition's local frame
    fn partition_alpha(&self, partition: usize) -> f32;

    fn partitions_per_side(&self) -> usize {
        (self.n_partitions() / 2).max(1)
    }

    fn is_c_side(&self, partition: usize) -> bool {
        self.n_partitions() >= 2 && partition >= self.n_partitions() / 2
    }

    /// Partition facing `partition` on the other side
    fn opposite_partition(&self, partition: usize) -> Option<usize> {
        if self.n_partitions() < 2 {
            return None;
        }
        let half = self.n_partitions() / 2;
        Some(if partition >= half {
            partition - half
        } else {
            partition + half
        })
    }

    /// Next partition in azimuth on the same side
    fn next_partition(&self, partition: usize) -> Option<usize> {
        let per_side = self.partitions_per_side();
        if per_side < 2 {
            return None;
        }
        let side_start = (partition / per_side) * per_side;
        Some(side_start + (partition - side_start + 1) % per_side)
    }
}

/// Equally spaced rows, evenly divided azimuth
#[derive(Debug, Clone, PartialEq)]
pub struct UniformGeometry {
    n_partitions: usize,
    n_rows: usize,
    x_min: f32,
    x_max: f32,
}

impl UniformGeometry {
    pub fn new(n_partitions: usize, n_rows: usize, x_min: f32, x_max: f32) -> ForgeResult<Self> {
        if n_partitions == 0 || n_rows == 0 {
            return Err(TrackForgeError::InvalidConfiguration(format!(
                "geometry needs at least one partition and row, got {}x{}",
                n_partitions, n_rows
            )));
        }
        if n_partitions > 1 && n_partitions % 2 != 0 {
            return Err(TrackForgeError::InvalidConfiguration(format!(
                "partitions split into two sides, got odd count {}",
                n_partitions
            )));
        }
        if n_partitions > u8::MAX as usize + 1 || n_rows > u16::MAX as usize {
            return Err(TrackForgeError::InvalidConfiguration(format!(
                "geometry {}x{} exceeds cluster reference encoding",
                n_partitions, n_rows
            )));
        }
        if !(x_min < x_max) && n_rows > 1 {
            return Err(TrackForgeError::InvalidConfiguration(format!(
                "row radii must increase: {} .. {}",
                x_min, x_max
            )));
        }
        Ok(Self {
            n_partitions,
            n_rows,
            x_min,
            x_max,
        })
    }

    /// 36 partitions (18 per side), 152 pad rows between 85 and 245 cm
    pub fn tpc() -> Self {
        Self {
            n_partitions: 36,
            n_rows: 152,
            x_min: 85.0,
            x_max: 245.0,
        }
    }
}

impl Geometry for UniformGeometry {
    fn n_partitions(&self) -> usize {
        self.n_partitions
    }

    fn n_rows(&self) -> usize {
        self.n_rows
    }

    fn row_x(&self, row: usize) -> f32 {
        if self.n_rows < 2 {
            return self.x_min;
        }
        self.x_min + (self.x_max - self.x_min) * row as f32 / (self.n_rows - 1) as f32
    }

    fn partition_alpha(&self, partition: usize) -> f32 {
        let per_side = self.partitions_per_side();
        ((partition % per_side) as f32 + 0.5) * 2.0 * PI / per_side as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tpc_geometry() {
        let g = UniformGeometry::tpc();
        assert_eq!(g.n_partitions(), 36);
        assert_eq!(g.partitions_per_side(), 18);
        assert_eq!(g.row_x(0), 85.0);
        assert_eq!(g.row_x(151), 245.0);
        assert!((g.partition_alpha(0) - 10f32.to_radians()).abs() < 1e-5);
        assert_eq!(g.partition_alpha(3), g.partition_alpha(21));
        assert!(!g.is_c_side(17));
        assert!(g.is_c_side(18));
        assert_eq!(g.opposite_partition(3), Some(21));
        assert_eq!(g.opposite_partition(21), Some(3));
        assert_eq!(g.next_partition(17), Some(0));
        assert_eq!(g.next_partition(35), Some(18));
    }

    #[test]
    fn test_single_partition() {
        let g = UniformGeometry::new(1, 10, 80.0, 90.0).unwrap();
        assert!(!g.is_c_side(0));
        assert_eq!(g.opposite_partition(0), None);
        assert_eq!(g.next_partition(0), None);
    }

    #[test]
    fn test_invalid_geometry() {
        assert!(UniformGeometry::new(0, 10, 0.0, 1.0).is_err());
        assert!(UniformGeometry::new(3, 10, 0.0, 1.0).is_err());
        assert!(UniformGeometry::new(2, 10, 5.0, 1.0).is_err());
    }
}
