//! Minimum accepted hits per track segment
//!
//! Low-momentum tracks curl strongly and leave short arcs per partition, so the
//! hit requirement drops with curvature. The thresholds are a numeric policy of
//! the reference configuration and can be replaced per pipeline.

use std::fmt::Debug;

use crate::data::TrackParam;

pub trait MinHitsPolicy: Send + Sync + Debug {
    fn min_hits(&self, param: &TrackParam) -> u32;
}

/// Curvature-dependent thresholds
///
/// | `|q/pt| * q_pt_scaler` | min hits |
/// |---|---|
/// | > `high_curvature_q_pt` (10) | `high_curvature_min_hits` (10) |
/// | > `medium_curvature_q_pt` (5) | `medium_curvature_min_hits` (15) |
/// | otherwise | `default_min_hits` (29) |
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvatureMinHits {
    /// Converts stored q/pt to 1/GeV (field-strength dependent)
    pub q_pt_scaler: f32,
    pub high_curvature_q_pt: f32,
    pub high_curvature_min_hits: u32,
    pub medium_curvature_q_pt: f32,
    pub medium_curvature_min_hits: u32,
    pub default_min_hits: u32,
}

impl Default for CurvatureMinHits {
    fn default() -> Self {
        Self {
            q_pt_scaler: 1.0,
            high_curvature_q_pt: 10.0,
            high_curvature_min_hits: 10,
            medium_curvature_q_pt: 5.0,
            medium_curvature_min_hits: 15,
            default_min_hits: 29,
        }
    }
}

impl CurvatureMinHits {
    pub fn min_hits_for_q_pt(&self, q_pt: f32) -> u32 {
        let curvature = (q_pt * self.q_pt_scaler).abs();
        if curvature > self.high_curvature_q_pt {
            self.high_curvature_min_hits
        } else if curvature > self.medium_curvature_q_pt {
            self.medium_curvature_min_hits
        } else {
            self.default_min_hits
        }
    }
}

impl MinHitsPolicy for CurvatureMinHits {
    fn min_hits(&self, param: &TrackParam) -> u32 {
        self.min_hits_for_q_pt(param.q_pt)
    }
}

/// Same threshold for every track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedMinHits(pub u32);

impl MinHitsPolicy for FixedMinHits {
    fn min_hits(&self, _param: &TrackParam) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curvature_thresholds() {
        let policy = CurvatureMinHits::default();
        assert_eq!(policy.min_hits_for_q_pt(0.5), 29);
        assert_eq!(policy.min_hits_for_q_pt(5.0), 29);
        assert_eq!(policy.min_hits_for_q_pt(-6.0), 15);
        assert_eq!(policy.min_hits_for_q_pt(10.5), 10);

        let scaled = CurvatureMinHits {
            q_pt_scaler: 4.0,
            ..Default::default()
        };
        assert_eq!(scaled.min_hits_for_q_pt(2.0), 15);
    }

    #[test]
    fn test_fixed_override() {
        let p = TrackParam::new(0.0, 0.0, 0.0, 0.0, 0.0, 20.0);
        assert_eq!(FixedMinHits(5).min_hits(&p), 5);
    }
}
