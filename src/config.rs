//! Processing settings
//!
//! [`ProcessingSettings`] carries every tunable of the pipeline. Settings are
//! built in code (builder methods) and may be overridden from the environment:
//!
//! - `TRACKFORGE_GATHER_MODE`: compression gather mode, 0-3
//! - `TRACKFORGE_TRACK_MODEL`: residual encoding on/off (`1`/`0`, `true`/`false`)
//! - `TRACKFORGE_MIN_TRACK_CLUSTERS`: fixed minimum hits per track, `-1` for the curvature formula
//! - `TRACKFORGE_THREADS`: dedicated worker pool size

use std::fmt;

use crate::error::{ErrorRecorder, ForgeResult, TrackForgeError};
use crate::execution::ExecutionSettings;
use crate::merger::policy::MergeTolerances;
use crate::selector::min_hits::CurvatureMinHits;

const GATHER_MODE_ENV: &str = "TRACKFORGE_GATHER_MODE";
const TRACK_MODEL_ENV: &str = "TRACKFORGE_TRACK_MODEL";
const MIN_TRACK_CLUSTERS_ENV: &str = "TRACKFORGE_MIN_TRACK_CLUSTERS";
const THREADS_ENV: &str = "TRACKFORGE_THREADS";

/// Memory path of the compression output
///
/// All modes produce byte-identical output; they differ in which staging
/// buffers exist and how many copies are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum GatherMode {
    /// Columns built in host staging memory, one bulk copy to the output
    #[default]
    HostStaging = 0,
    /// Columns built in device scratch, gathered field by field
    DeviceStaging = 1,
    /// Columns written straight into the output buffer
    Direct = 2,
    /// Columns built in one contiguous device buffer, one bulk copy
    DeviceContiguous = 3,
}

impl GatherMode {
    pub const ALL: [GatherMode; 4] = [
        GatherMode::HostStaging,
        GatherMode::DeviceStaging,
        GatherMode::Direct,
        GatherMode::DeviceContiguous,
    ];
}

impl TryFrom<u8> for GatherMode {
    type Error = TrackForgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(GatherMode::HostStaging),
            1 => Ok(GatherMode::DeviceStaging),
            2 => Ok(GatherMode::Direct),
            3 => Ok(GatherMode::DeviceContiguous),
            other => Err(TrackForgeError::InvalidConfiguration(format!(
                "gather mode must be 0-3, got {}",
                other
            ))),
        }
    }
}

impl fmt::Display for GatherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Arena manager tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySettings {
    /// Bytes reserved per pool for CUSTOM resources that declare no size bound
    pub custom_reserve_bytes: usize,
    /// Raised errors retained per pass
    pub max_errors: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            custom_reserve_bytes: 16 * 1024 * 1024,
            max_errors: ErrorRecorder::DEFAULT_MAX_ERRORS,
        }
    }
}

/// All pipeline settings
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingSettings {
    pub gather_mode: GatherMode,
    /// Store attached clusters as residuals to the track model
    pub compression_track_model: bool,
    /// Fixed minimum hits per track; `-1` selects [`CurvatureMinHits`]
    pub min_n_track_clusters: i32,
    pub min_hits: CurvatureMinHits,
    /// Shared hits accepted while `n_shared < max_shared_fraction * n_accepted`
    pub max_shared_fraction: f32,
    /// Consecutive rows without an accepted hit that close a segment
    pub max_row_gap: u32,
    /// Low bits of the charges dropped by the codec; 0 is lossless
    pub charge_truncation_bits: u8,
    /// Track capacity per partition; `None` derives it from the tracklet count
    pub max_tracks_per_partition: Option<usize>,
    /// Track-hit capacity per partition; `None` derives it from the row-hit count
    pub max_track_hits_per_partition: Option<usize>,
    pub merge: MergeTolerances,
    pub execution: ExecutionSettings,
    pub memory: MemorySettings,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            gather_mode: GatherMode::HostStaging,
            compression_track_model: true,
            min_n_track_clusters: -1,
            min_hits: CurvatureMinHits::default(),
            max_shared_fraction: 0.10,
            max_row_gap: 4,
            charge_truncation_bits: 0,
            max_tracks_per_partition: None,
            max_track_hits_per_partition: None,
            merge: MergeTolerances::default(),
            execution: ExecutionSettings::default(),
            memory: MemorySettings::default(),
        }
    }
}

impl ProcessingSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gather_mode(mut self, mode: GatherMode) -> Self {
        self.gather_mode = mode;
        self
    }

    pub fn with_track_model(mut self, enabled: bool) -> Self {
        self.compression_track_model = enabled;
        self
    }

    pub fn with_min_track_clusters(mut self, min: i32) -> Self {
        self.min_n_track_clusters = min;
        self
    }

    pub fn with_min_hits(mut self, min_hits: CurvatureMinHits) -> Self {
        self.min_hits = min_hits;
        self
    }

    pub fn with_max_shared_fraction(mut self, fraction: f32) -> Self {
        self.max_shared_fraction = fraction;
        self
    }

    pub fn with_max_row_gap(mut self, gap: u32) -> Self {
        self.max_row_gap = gap;
        self
    }

    pub fn with_charge_truncation(mut self, bits: u8) -> Self {
        self.charge_truncation_bits = bits;
        self
    }

    pub fn with_track_capacity(mut self, max_tracks: usize, max_track_hits: usize) -> Self {
        self.max_tracks_per_partition = Some(max_tracks);
        self.max_track_hits_per_partition = Some(max_track_hits);
        self
    }

    pub fn with_merge_tolerances(mut self, merge: MergeTolerances) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_execution(mut self, execution: ExecutionSettings) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_memory(mut self, memory: MemorySettings) -> Self {
        self.memory = memory;
        self
    }

    /// Fixed minimum hits, if the override is active
    pub fn fixed_min_hits(&self) -> Option<u32> {
        (self.min_n_track_clusters >= 0).then_some(self.min_n_track_clusters as u32)
    }

    /// Track capacity for a partition with `n_tracklets` tracklets
    pub fn track_capacity(&self, n_tracklets: usize) -> usize {
        self.max_tracks_per_partition
            .unwrap_or(n_tracklets * 2 + 50)
    }

    /// Track-hit capacity for a partition with `n_row_hits` tracklet row slots
    pub fn track_hit_capacity(&self, n_row_hits: usize) -> usize {
        self.max_track_hits_per_partition.unwrap_or(n_row_hits)
    }

    pub fn validate(&self) -> ForgeResult<()> {
        if self.min_n_track_clusters < -1 {
            return Err(TrackForgeError::InvalidConfiguration(format!(
                "min_n_track_clusters must be -1 or non-negative, got {}",
                self.min_n_track_clusters
            )));
        }
        if !(0.0..=1.0).contains(&self.max_shared_fraction) {
            return Err(TrackForgeError::InvalidConfiguration(format!(
                "max_shared_fraction must be within [0, 1], got {}",
                self.max_shared_fraction
            )));
        }
        if self.charge_truncation_bits >= 16 {
            return Err(TrackForgeError::InvalidConfiguration(format!(
                "charge_truncation_bits must be below 16, got {}",
                self.charge_truncation_bits
            )));
        }
        self.merge.validate()?;
        self.execution.validate()?;
        Ok(())
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> ForgeResult<Self> {
        Self::default().apply_env()
    }

    /// Apply `TRACKFORGE_*` overrides on top of `self`
    pub fn apply_env(mut self) -> ForgeResult<Self> {
        if let Some(value) = env_value(GATHER_MODE_ENV) {
            let raw: u8 = parse_env(GATHER_MODE_ENV, &value)?;
            self.gather_mode = GatherMode::try_from(raw)?;
        }
        if let Some(value) = env_value(TRACK_MODEL_ENV) {
            self.compression_track_model = match value.to_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => true,
                "0" | "false" | "off" | "no" => false,
                _ => {
                    return Err(TrackForgeError::InvalidConfiguration(format!(
                        "{} must be a boolean, got '{}'",
                        TRACK_MODEL_ENV, value
                    )))
                }
            };
        }
        if let Some(value) = env_value(MIN_TRACK_CLUSTERS_ENV) {
            self.min_n_track_clusters = parse_env(MIN_TRACK_CLUSTERS_ENV, &value)?;
        }
        if let Some(value) = env_value(THREADS_ENV) {
            self.execution.num_threads = Some(parse_env(THREADS_ENV, &value)?);
        }
        self.validate()?;
        Ok(self)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> ForgeResult<T>
where
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| {
        TrackForgeError::InvalidConfiguration(format!("{}='{}': {}", name, value, e))
    })
}
