//! Shared fixtures for the integration tests
//!
//! [`EventBuilder`] assembles events out of straight tracklets whose clusters are
//! created on the fly, plus optional noise clusters nobody references.

#![allow(dead_code)]

use std::sync::Arc;

use trackforge::data::{ClusterNative, ClusterNativeBuilder, TrackParam, TrackletSet, NO_HIT};
use trackforge::{EventInput, ExecutionSettings, ProcessingSettings, UniformGeometry};

pub use serial_test::serial;

/// Deterministic settings: serial execution, fixed minimum of `min_hits` hits
pub fn serial_settings(min_hits: i32) -> ProcessingSettings {
    trackforge::logging::init_logging_default();
    ProcessingSettings::new()
        .with_min_track_clusters(min_hits)
        .with_execution(ExecutionSettings::serial().with_launch_geometry(2, 4))
}

/// Same as [`serial_settings`] on the rayon pool
pub fn parallel_settings(min_hits: i32) -> ProcessingSettings {
    trackforge::logging::init_logging_default();
    ProcessingSettings::new()
        .with_min_track_clusters(min_hits)
        .with_execution(ExecutionSettings::default().with_launch_geometry(4, 8))
}

pub fn geometry(n_partitions: usize, n_rows: usize) -> Arc<UniformGeometry> {
    Arc::new(UniformGeometry::new(n_partitions, n_rows, 85.0, 245.0).expect("valid geometry"))
}

/// A cluster whose fields depend on `seed`, so distinct clusters differ
pub fn cluster(seed: u32) -> ClusterNative {
    ClusterNative::from_packed(
        1000 + seed * 37,
        (seed % 4) as u8,
        200 + (seed * 13 % 5000) as u16,
        (seed % 7) as u8 + 1,
        (seed % 5) as u8 + 1,
        (50 + seed % 200) as u16,
        (300 + seed * 3 % 2000) as u16,
    )
}

pub struct EventBuilder {
    n_partitions: usize,
    n_rows: usize,
    clusters: ClusterNativeBuilder,
    tracklets: Vec<TrackletSet>,
    seed: u32,
}

impl EventBuilder {
    pub fn new(n_partitions: usize, n_rows: usize) -> Self {
        Self {
            n_partitions,
            n_rows,
            clusters: ClusterNativeBuilder::new(n_partitions, n_rows),
            tracklets: (0..n_partitions).map(|_| TrackletSet::new()).collect(),
            seed: 0,
        }
    }

    fn next_cluster(&mut self) -> ClusterNative {
        self.seed += 1;
        cluster(self.seed)
    }

    /// Push one fresh cluster into (partition, row); returns its index in the row
    pub fn add_cluster(&mut self, partition: usize, row: usize) -> u32 {
        let c = self.next_cluster();
        self.clusters.push(partition, row, c).expect("row in range") as u32
    }

    /// Tracklet with one fresh cluster on each of `n_hits` consecutive rows
    pub fn fresh_tracklet(&mut self, partition: usize, first_row: usize, n_hits: usize, weight: u32) -> Vec<u32> {
        let hits: Vec<u32> = (first_row..first_row + n_hits)
            .map(|row| self.add_cluster(partition, row))
            .collect();
        self.tracklet(partition, first_row, &hits, weight);
        hits
    }

    /// Tracklet over explicit per-row cluster indices (`NO_HIT` for gaps)
    pub fn tracklet(&mut self, partition: usize, first_row: usize, hits: &[u32], weight: u32) {
        let index = self.tracklets[partition].len() as f32;
        let param = TrackParam::new(85.0 + first_row as f32, 40.0 * index - 60.0 * partition as f32, 10.0 * index, 0.0, 0.0, 0.5)
            .with_fit_quality(1.0, 2 * hits.len() as i32 - 5);
        self.tracklets[partition]
            .push(first_row as u32, hits, weight, param)
            .expect("valid tracklet");
    }

    /// Fresh tracklet with an explicit track state
    pub fn tracklet_with_param(
        &mut self,
        partition: usize,
        first_row: usize,
        n_hits: usize,
        param: TrackParam,
    ) -> Vec<u32> {
        let hits: Vec<u32> = (first_row..first_row + n_hits)
            .map(|row| self.add_cluster(partition, row))
            .collect();
        let param = param.with_fit_quality(1.0, 2 * n_hits as i32 - 5);
        self.tracklets[partition]
            .push(first_row as u32, &hits, 1, param)
            .expect("valid tracklet");
        hits
    }

    /// Clusters nobody references
    pub fn noise(&mut self, partition: usize, row: usize, count: usize) {
        for _ in 0..count {
            self.add_cluster(partition, row);
        }
    }

    pub fn n_partitions(&self) -> usize {
        self.n_partitions
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn build(self) -> EventInput {
        EventInput::new(self.clusters.build(), self.tracklets)
    }
}

/// Hits with a gap of `gap` rows after the first `before` rows
pub fn with_gap(hits: &[u32], before: usize, gap: usize) -> Vec<u32> {
    let mut out = hits[..before].to_vec();
    out.extend(std::iter::repeat(NO_HIT).take(gap));
    out.extend_from_slice(&hits[before..]);
    out
}
