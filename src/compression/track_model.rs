//! Track model used for residual coding of attached clusters
//!
//! Encoder and decoder call the same model with the same (already decoded)
//! clusters, so any deterministic integer prediction gives a lossless transform.
//! A better prediction only shrinks the residuals.

use std::fmt::Debug;

use crate::data::ClusterNative;

/// Packed position of a cluster as seen by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPoint {
    pub row: i32,
    pub pad: i32,
    pub time: i32,
}

impl ModelPoint {
    pub fn new(row: u32, cluster: &ClusterNative) -> Self {
        Self {
            row: row as i32,
            pad: cluster.pad_packed as i32,
            time: cluster.time_packed() as i32,
        }
    }
}

/// Predicted packed pad and time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prediction {
    pub pad: u16,
    pub time: u32,
}

pub trait TrackModel: Send + Sync + Debug {
    /// Predict the cluster in `row` from the last one or two clusters of the track
    fn predict(&self, last: ModelPoint, before: Option<ModelPoint>, row: i32) -> Prediction;
}

/// Straight-line extrapolation in (row, pad) and (row, time)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinearTrackModel;

impl LinearTrackModel {
    fn extrapolate(last_row: i32, last: i32, before_row: i32, before: i32, row: i32) -> i64 {
        let dr = (last_row - before_row) as i64;
        if dr == 0 {
            return last as i64;
        }
        last as i64 + (last as i64 - before as i64) * (row - last_row) as i64 / dr
    }
}

impl TrackModel for LinearTrackModel {
    fn predict(&self, last: ModelPoint, before: Option<ModelPoint>, row: i32) -> Prediction {
        let (pad, time) = match before {
            Some(b) => (
                Self::extrapolate(last.row, last.pad, b.row, b.pad, row),
                Self::extrapolate(last.row, last.time, b.row, b.time, row),
            ),
            None => (last.pad as i64, last.time as i64),
        };
        Prediction {
            pad: pad.clamp(0, u16::MAX as i64) as u16,
            time: time.clamp(0, ClusterNative::TIME_MASK as i64) as u32,
        }
    }
}

/// q/pt in 0.1 steps within ±12.7, offset by 127
pub fn quantize_q_pt(q_pt: f32) -> u8 {
    if !q_pt.is_finite() {
        return 127;
    }
    ((q_pt.clamp(-12.7, 12.7) * 10.0).round() as i32 + 127) as u8
}

pub fn dequantize_q_pt(value: u8) -> f32 {
    (value as i32 - 127) as f32 / 10.0
}
