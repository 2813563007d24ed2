//! Partition-local track records: fit parameters, tracklets, selected tracks

use bytemuck::{Pod, Zeroable};

use crate::error::{ForgeResult, TrackForgeError};

/// Row slot of a tracklet without a hit
pub const NO_HIT: u32 = u32::MAX;

/// Trajectory parameters in the local frame of a partition
///
/// `x` is the radial coordinate along the partition axis, `y` transverse, `z`
/// along the beam. The direction is given by `sin_phi` and `dz_ds`, curvature by
/// `q_pt` (charge over transverse momentum).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct TrackParam {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub sin_phi: f32,
    pub dz_ds: f32,
    pub q_pt: f32,
    pub chi2: f32,
    pub ndf: i32,
}

impl TrackParam {
    /// Largest |sin(phi)| accepted after a rotation
    pub const MAX_SIN_PHI: f32 = 0.999;

    pub fn new(x: f32, y: f32, z: f32, sin_phi: f32, dz_ds: f32, q_pt: f32) -> Self {
        Self {
            x,
            y,
            z,
            sin_phi,
            dz_ds,
            q_pt,
            chi2: 0.0,
            ndf: 0,
        }
    }

    pub fn with_fit_quality(mut self, chi2: f32, ndf: i32) -> Self {
        self.chi2 = chi2;
        self.ndf = ndf;
        self
    }

    #[inline]
    pub fn cos_phi(&self) -> f32 {
        (1.0 - self.sin_phi * self.sin_phi).max(0.0).sqrt()
    }

    /// Reduced chi2; infinite without degrees of freedom
    pub fn chi2_per_ndf(&self) -> f32 {
        if self.ndf > 0 {
            self.chi2 / self.ndf as f32
        } else {
            f32::INFINITY
        }
    }

    /// Express the state in a frame rotated by `alpha`
    ///
    /// Returns `None` when the direction becomes (nearly) perpendicular to the new
    /// x axis, where the local parametrisation breaks down.
    pub fn rotate(&self, alpha: f32) -> Option<TrackParam> {
        let (sin_a, cos_a) = alpha.sin_cos();
        let cos_phi = self.cos_phi();
        let new_cos = cos_phi * cos_a + self.sin_phi * sin_a;
        let new_sin = -cos_phi * sin_a + self.sin_phi * cos_a;
        if new_cos <= 0.0 || new_sin.abs() > Self::MAX_SIN_PHI {
            return None;
        }
        Some(TrackParam {
            x: self.x * cos_a + self.y * sin_a,
            y: -self.x * sin_a + self.y * cos_a,
            sin_phi: new_sin,
            ..*self
        })
    }
}

/// Candidate trajectory inside one partition (52 bytes)
///
/// Row hits live in a separate array: the slot of row `r` is
/// `first_hit + (r - first_row)` and holds the cluster index within that row,
/// or [`NO_HIT`]. A lower `hit_weight` has priority when tracklets overlap.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Tracklet {
    pub first_row: u32,
    pub last_row: u32,
    pub first_hit: u32,
    /// Number of rows with a hit; zero marks a tracklet invalidated upstream
    pub n_hits: u32,
    pub hit_weight: u32,
    pub param: TrackParam,
}

impl Tracklet {
    pub fn n_rows(&self) -> u32 {
        if self.last_row < self.first_row {
            0
        } else {
            self.last_row - self.first_row + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_hits == 0
    }
}

/// Cluster reference inside a partition: row and index within that row
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
pub struct ClusterRef {
    pub row: u32,
    pub index: u32,
}

impl ClusterRef {
    pub const fn new(row: u32, index: u32) -> Self {
        Self { row, index }
    }
}

/// Selected partition-local track (48 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Track {
    /// Index of the first hit in the track-hit array
    pub first_hit: u32,
    pub n_hits: u32,
    pub local_id: u32,
    /// Tracklet the fit parameters were taken from
    pub tracklet: u32,
    pub param: TrackParam,
}

/// Tracklets of one partition plus their row-hit array
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackletSet {
    pub tracklets: Vec<Tracklet>,
    pub row_hits: Vec<u32>,
}

impl TrackletSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tracklet covering rows `first_row..first_row + hits.len()`
    ///
    /// `hits[i]` is the cluster index in row `first_row + i` or [`NO_HIT`].
    pub fn push(&mut self, first_row: u32, hits: &[u32], weight: u32, param: TrackParam) -> ForgeResult<u32> {
        if hits.is_empty() {
            return Err(TrackForgeError::InvalidInput(
                "tracklet must cover at least one row".to_string(),
            ));
        }
        let id = self.tracklets.len() as u32;
        let n_hits = hits.iter().filter(|&&h| h != NO_HIT).count() as u32;
        self.tracklets.push(Tracklet {
            first_row,
            last_row: first_row + hits.len() as u32 - 1,
            first_hit: self.row_hits.len() as u32,
            n_hits,
            hit_weight: weight,
            param,
        });
        self.row_hits.extend_from_slice(hits);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.tracklets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracklets.is_empty()
    }

    /// Check every tracklet's rows and hits against the partition's cluster counts
    pub fn validate(&self, n_rows: usize, row_counts: impl Fn(usize) -> usize) -> ForgeResult<()> {
        for (i, t) in self.tracklets.iter().enumerate() {
            if t.n_hits == 0 {
                continue;
            }
            if t.last_row < t.first_row || t.last_row as usize >= n_rows {
                return Err(TrackForgeError::InvalidInput(format!(
                    "tracklet {} rows {}..={} outside {} rows",
                    i, t.first_row, t.last_row, n_rows
                )));
            }
            let start = t.first_hit as usize;
            let end = start + t.n_rows() as usize;
            let hits = self.row_hits.get(start..end).ok_or_else(|| {
                TrackForgeError::InvalidInput(format!("tracklet {} row hits out of range", i))
            })?;
            for (k, &hit) in hits.iter().enumerate() {
                let row = t.first_row as usize + k;
                if hit != NO_HIT && hit as usize >= row_counts(row) {
                    return Err(TrackForgeError::InvalidInput(format!(
                        "tracklet {} references cluster {} in row {} holding {}",
                        i,
                        hit,
                        row,
                        row_counts(row)
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<TrackParam>(), 32);
        assert_eq!(std::mem::size_of::<Tracklet>(), 52);
        assert_eq!(std::mem::size_of::<ClusterRef>(), 8);
        assert_eq!(std::mem::size_of::<Track>(), 48);
    }

    #[test]
    fn test_rotation_roundtrip() {
        let p = TrackParam::new(100.0, 5.0, 10.0, 0.1, 0.2, 0.5);
        let r = p.rotate(0.3).unwrap();
        let back = r.rotate(-0.3).unwrap();
        assert!((back.x - p.x).abs() < 1e-3);
        assert!((back.y - p.y).abs() < 1e-3);
        assert!((back.sin_phi - p.sin_phi).abs() < 1e-5);
        assert_eq!(back.z, p.z);
        assert!(p.rotate(2.0).is_none());
    }

    #[test]
    fn test_chi2_per_ndf() {
        let p = TrackParam::default().with_fit_quality(10.0, 5);
        assert_eq!(p.chi2_per_ndf(), 2.0);
        assert!(TrackParam::default().chi2_per_ndf().is_infinite());
    }

    #[test]
    fn test_tracklet_set() {
        let mut set = TrackletSet::new();
        set.push(2, &[0, NO_HIT, 1], 7, TrackParam::default()).unwrap();
        set.push(0, &[3], 1, TrackParam::default()).unwrap();
        assert_eq!(set.tracklets[0].n_hits, 2);
        assert_eq!(set.tracklets[0].last_row, 4);
        assert_eq!(set.tracklets[1].first_hit, 3);
        assert!(set.push(0, &[], 0, TrackParam::default()).is_err());

        assert!(set.validate(5, |_| 4).is_ok());
        assert!(set.validate(4, |_| 4).is_err());
        assert!(set.validate(5, |_| 1).is_err());
    }
}
