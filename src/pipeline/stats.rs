//! Per-event pipeline statistics

use std::time::{Duration, Instant};

use crate::compression::GatherStats;
use crate::memory::MemoryStats;

/// Wall time spent per stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimings {
    /// Sizing, allocation, binding and upload
    pub setup: Duration,
    pub selection: Duration,
    pub slice_output: Duration,
    pub merging: Duration,
    pub compression: Duration,
    pub total: Duration,
}

/// Statistics of one processed event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub n_tracklets: usize,
    pub n_tracks: usize,
    pub n_track_hits: usize,
    pub n_merged_tracks: usize,
    pub n_attached_clusters: usize,
    pub n_unattached_clusters: usize,
    /// Bytes written to slice outputs, headers included
    pub slice_output_bytes: usize,
    pub compressed_bytes: usize,
    pub n_raised_errors: usize,
    pub gather: Option<GatherStats>,
    pub memory: MemoryStats,
    pub timings: StageTimings,
}

impl PipelineStats {
    /// Mean number of hits per selected track
    pub fn hits_per_track(&self) -> f64 {
        if self.n_tracks == 0 {
            return 0.0;
        }
        self.n_track_hits as f64 / self.n_tracks as f64
    }
}

/// Measures consecutive stages of one event
#[derive(Debug)]
pub(crate) struct StageClock {
    start: Instant,
    lap: Instant,
}

impl StageClock {
    pub fn start() -> Self {
        let now = Instant::now();
        Self { start: now, lap: now }
    }

    /// Time since the previous lap
    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now - self.lap;
        self.lap = now;
        elapsed
    }

    pub fn total(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hits_per_track() {
        let mut stats = PipelineStats::default();
        assert_eq!(stats.hits_per_track(), 0.0);
        stats.n_tracks = 3;
        stats.n_track_hits = 15;
        assert_eq!(stats.hits_per_track(), 5.0);
    }

    #[test]
    fn test_stage_clock_laps_sum_to_total() {
        let mut clock = StageClock::start();
        let a = clock.lap();
        let b = clock.lap();
        assert!(a + b <= clock.total());
    }
}
