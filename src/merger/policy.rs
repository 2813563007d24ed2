//! Numeric policies of the merger: propagation and match scoring
//!
//! Both are traits so the default straight-line/kinematic pair can be replaced
//! by a full field-aware propagator without touching the merge bookkeeping.

use std::fmt::Debug;

use crate::data::TrackParam;
use crate::error::{ForgeResult, TrackForgeError};

/// Moves a state along its trajectory in the local frame
pub trait TrackPropagator: Send + Sync + Debug {
    /// State at local `x`, or `None` when `x` cannot be reached
    fn propagate_to_x(&self, param: &TrackParam, x: f32) -> Option<TrackParam>;
}

/// Field-free propagation; adequate for matching at nearby boundaries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightLinePropagator {
    /// Tracks flatter than this cos(phi) are not propagated
    pub min_cos_phi: f32,
}

impl Default for StraightLinePropagator {
    fn default() -> Self {
        Self { min_cos_phi: 1e-3 }
    }
}

impl TrackPropagator for StraightLinePropagator {
    fn propagate_to_x(&self, param: &TrackParam, x: f32) -> Option<TrackParam> {
        let cos_phi = param.cos_phi();
        if cos_phi < self.min_cos_phi {
            return None;
        }
        let dx = x - param.x;
        Some(TrackParam {
            x,
            y: param.y + dx * param.sin_phi / cos_phi,
            z: param.z + dx * param.dz_ds / cos_phi,
            ..*param
        })
    }
}

/// Match windows between two segment states at a common x
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeTolerances {
    pub max_dy: f32,
    pub max_dz: f32,
    pub max_dsin_phi: f32,
    pub max_ddz_ds: f32,
    pub max_dq_pt: f32,
    /// Segments above this |q/pt| count as loopers
    pub looper_q_pt: f32,
}

impl Default for MergeTolerances {
    fn default() -> Self {
        Self {
            max_dy: 3.0,
            max_dz: 5.0,
            max_dsin_phi: 0.1,
            max_ddz_ds: 0.05,
            max_dq_pt: 0.5,
            looper_q_pt: 5.0,
        }
    }
}

impl MergeTolerances {
    pub fn validate(&self) -> ForgeResult<()> {
        let windows = [
            ("max_dy", self.max_dy),
            ("max_dz", self.max_dz),
            ("max_dsin_phi", self.max_dsin_phi),
            ("max_ddz_ds", self.max_ddz_ds),
            ("max_dq_pt", self.max_dq_pt),
            ("looper_q_pt", self.looper_q_pt),
        ];
        for (name, value) in windows {
            if !(value.is_finite() && value > 0.0) {
                return Err(TrackForgeError::InvalidConfiguration(format!(
                    "merge tolerance {} must be positive, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Decides whether two segments belong to one trajectory
pub trait MergePolicy: Send + Sync + Debug {
    /// Match score of two states in one frame at one x; lower is better,
    /// `None` means no match
    fn score(&self, a: &TrackParam, b: &TrackParam) -> Option<f32>;

    fn is_looper(&self, param: &TrackParam) -> bool;
}

/// Box cut on every parameter, chi2-like score inside the box
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KinematicMergePolicy {
    pub tolerances: MergeTolerances,
}

impl KinematicMergePolicy {
    pub fn new(tolerances: MergeTolerances) -> Self {
        Self { tolerances }
    }
}

impl MergePolicy for KinematicMergePolicy {
    fn score(&self, a: &TrackParam, b: &TrackParam) -> Option<f32> {
        let t = &self.tolerances;
        let pulls = [
            (a.y - b.y) / t.max_dy,
            (a.z - b.z) / t.max_dz,
            (a.sin_phi - b.sin_phi) / t.max_dsin_phi,
            (a.dz_ds - b.dz_ds) / t.max_ddz_ds,
            (a.q_pt - b.q_pt) / t.max_dq_pt,
        ];
        if pulls.iter().any(|p| !(p.abs() <= 1.0)) {
            return None;
        }
        Some(pulls.iter().map(|p| p * p).sum())
    }

    fn is_looper(&self, param: &TrackParam) -> bool {
        param.q_pt.abs() > self.tolerances.looper_q_pt
    }
}
