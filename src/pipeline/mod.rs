//! Event pipeline: selection, slice outputs, merging and compression over one
//! shared memory manager
//!
//! One [`PipelineContext::process_event`] call is one pass of the two-phase
//! memory protocol:
//!
//! ```text
//! set_max_data -> compute_sizes -> allocate -> bind -> upload
//!   -> selectors (one partition at a time, parallel inside)
//!   -> slice outputs (parallel over partitions)
//!   -> merger -> compressor (custom-sized output) -> reset_pass
//! ```
//!
//! Selectors run one after the other because their stack scratch aliases.

pub mod stats;

use std::sync::Arc;

use rayon::prelude::*;

use crate::compression::{ClusterCompressor, ClusterDecoder, CompressedClusters, CompressionResult};
use crate::config::ProcessingSettings;
use crate::data::{ClusterNativeAccess, ClusterRef, MergedClusterRef, MergedTrack, Track, TrackletSet};
use crate::error::{ErrorCode, ErrorRecorder, ErrorSink, ForgeResult, RaisedError, TrackForgeError};
use crate::execution::ExecutionContext;
use crate::geometry::Geometry;
use crate::memory::{Arena, FitError, MemoryResourceManager};
use crate::merger::{MergerResult, PartitionTracks, TrackMerger};
use crate::processor::{EventSizes, PartitionSizes, Processor};
use crate::selector::{SelectorResult, TrackletSelector};
use crate::slice_output::{InternalOutputMemory, OutputControl, SliceOutput};

pub use stats::{PipelineStats, StageTimings};

use stats::StageClock;

/// Input of one event
#[derive(Debug, Clone)]
pub struct EventInput {
    pub clusters: ClusterNativeAccess,
    /// One tracklet set per partition
    pub tracklets: Vec<TrackletSet>,
}

impl EventInput {
    pub fn new(clusters: ClusterNativeAccess, tracklets: Vec<TrackletSet>) -> Self {
        Self { clusters, tracklets }
    }

    /// Maxima driving the sizing pass
    pub fn sizes(&self) -> EventSizes {
        EventSizes {
            n_rows: self.clusters.n_rows(),
            partitions: self
                .tracklets
                .iter()
                .enumerate()
                .map(|(p, set)| PartitionSizes {
                    n_tracklets: set.tracklets.len(),
                    n_tracklet_row_hits: set.row_hits.len(),
                    n_clusters: self.clusters.partition_clusters(p),
                })
                .collect(),
            n_clusters_total: self.clusters.n_clusters_total(),
        }
    }

    pub fn validate(&self, geometry: &dyn Geometry) -> ForgeResult<()> {
        if self.clusters.n_partitions() != geometry.n_partitions()
            || self.clusters.n_rows() != geometry.n_rows()
        {
            return Err(TrackForgeError::InvalidInput(format!(
                "clusters cover {} partitions x {} rows, geometry has {} x {}",
                self.clusters.n_partitions(),
                self.clusters.n_rows(),
                geometry.n_partitions(),
                geometry.n_rows()
            )));
        }
        if self.tracklets.len() != geometry.n_partitions() {
            return Err(TrackForgeError::InvalidInput(format!(
                "{} tracklet sets for {} partitions",
                self.tracklets.len(),
                geometry.n_partitions()
            )));
        }
        for (p, set) in self.tracklets.iter().enumerate() {
            set.validate(self.clusters.n_rows(), |row| self.clusters.n_clusters(p, row))
                .map_err(|e| TrackForgeError::InvalidInput(format!("partition {}: {}", p, e)))?;
        }
        Ok(())
    }
}

/// Selection outcome and slice output of one partition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionOutput {
    pub partition: u32,
    pub selector: SelectorResult,
    /// False when the external output buffer was exhausted
    pub output_valid: bool,
    /// Size of the slice output block
    pub memory_size: usize,
    pub tracks: Vec<Track>,
    pub hits: Vec<ClusterRef>,
}

/// Everything one pass produced
#[derive(Debug, Clone, Default)]
pub struct EventOutput {
    pub partitions: Vec<PartitionOutput>,
    pub merger: MergerResult,
    pub merged_tracks: Vec<MergedTrack>,
    pub merged_refs: Vec<MergedClusterRef>,
    pub compression: Option<CompressionResult>,
    /// Parsed compressed event; `None` when its output did not fit external memory
    pub compressed: Option<CompressedClusters>,
    pub errors: Vec<RaisedError>,
    pub fit_errors: Vec<FitError>,
    pub stats: PipelineStats,
}

impl EventOutput {
    pub fn has_error(&self, code: ErrorCode) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }
}

/// Owns all stages and the memory they share
#[derive(Debug)]
pub struct PipelineContext {
    settings: ProcessingSettings,
    geometry: Arc<dyn Geometry>,
    ctx: ExecutionContext,
    memory: MemoryResourceManager,
    selectors: Vec<TrackletSelector>,
    merger: TrackMerger,
    compressor: ClusterCompressor,
    internal_outputs: Vec<InternalOutputMemory>,
    errors: ErrorRecorder,
    events_processed: u64,
}

fn stage_list<'a>(
    selectors: &'a mut [TrackletSelector],
    merger: &'a mut TrackMerger,
    compressor: &'a mut ClusterCompressor,
) -> Vec<&'a mut dyn Processor> {
    let mut list: Vec<&mut dyn Processor> = selectors
        .iter_mut()
        .map(|s| s as &mut dyn Processor)
        .collect();
    list.push(merger);
    list.push(compressor);
    list
}

impl PipelineContext {
    pub fn new(settings: ProcessingSettings, geometry: Arc<dyn Geometry>) -> ForgeResult<Self> {
        settings.validate()?;
        let ctx = ExecutionContext::new(&settings.execution)?;
        let n_partitions = geometry.n_partitions();

        let selectors = (0..n_partitions)
            .map(|p| TrackletSelector::new(p as u32, &settings))
            .collect();
        let merger = TrackMerger::new(&settings);
        let compressor = ClusterCompressor::new(&settings);

        Self::with_stages(settings, geometry, ctx, selectors, merger, compressor)
    }

    /// Assemble a pipeline from pre-configured stages (custom policies or models)
    pub fn with_stages(
        settings: ProcessingSettings,
        geometry: Arc<dyn Geometry>,
        ctx: ExecutionContext,
        mut selectors: Vec<TrackletSelector>,
        mut merger: TrackMerger,
        mut compressor: ClusterCompressor,
    ) -> ForgeResult<Self> {
        if selectors.len() != geometry.n_partitions() {
            return Err(TrackForgeError::InvalidConfiguration(format!(
                "{} selectors for {} partitions",
                selectors.len(),
                geometry.n_partitions()
            )));
        }
        let mut memory = MemoryResourceManager::new(settings.memory.clone());
        for stage in stage_list(&mut selectors, &mut merger, &mut compressor) {
            stage.initialize(&ctx)?;
            memory.register_processor(stage)?;
        }
        tracing::info!(
            "Pipeline ready: {} partitions, {} rows, {} processors, {} resources, {} workers",
            geometry.n_partitions(),
            geometry.n_rows(),
            memory.n_processors(),
            memory.n_resources(),
            ctx.n_workers()
        );

        Ok(Self {
            errors: ErrorRecorder::new(settings.memory.max_errors),
            internal_outputs: (0..selectors.len()).map(|_| InternalOutputMemory::new()).collect(),
            settings,
            geometry,
            ctx,
            memory,
            selectors,
            merger,
            compressor,
            events_processed: 0,
        })
    }

    pub fn settings(&self) -> &ProcessingSettings {
        &self.settings
    }

    pub fn geometry(&self) -> &dyn Geometry {
        &*self.geometry
    }

    pub fn execution(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn memory(&self) -> &MemoryResourceManager {
        &self.memory
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Decoder matching the compressor's track model
    pub fn decoder(&self) -> ClusterDecoder {
        self.compressor.decoder()
    }

    /// Place merged tracks and compressed clusters into `arena` from the next event on
    pub fn attach_external_output(&mut self, arena: Arena) -> ForgeResult<()> {
        Ok(self.memory.attach_external_output(arena)?)
    }

    pub fn detach_external_output(&mut self) -> Option<Arena> {
        self.memory.detach_external_output()
    }

    /// Run the full pass over one event
    ///
    /// Slice outputs go to `control` when given, to per-partition heap blocks
    /// otherwise. Capacity overflows do not fail the call; they are reported in
    /// [`EventOutput::errors`] and the affected output is empty.
    pub fn process_event(
        &mut self,
        input: &EventInput,
        control: Option<&OutputControl<'_>>,
    ) -> ForgeResult<EventOutput> {
        let _span = tracing::info_span!("event", index = self.events_processed).entered();
        input.validate(&*self.geometry)?;
        self.errors.drain();

        let result = self.run_pass(input, control);
        let reset = {
            let mut stages = stage_list(&mut self.selectors, &mut self.merger, &mut self.compressor);
            self.memory.reset_pass(&mut stages)
        };
        let output = result?;
        reset?;
        self.events_processed += 1;
        Ok(output)
    }

    fn run_pass(
        &mut self,
        input: &EventInput,
        control: Option<&OutputControl<'_>>,
    ) -> ForgeResult<EventOutput> {
        let mut clock = StageClock::start();
        let mut timings = StageTimings::default();
        let sizes = input.sizes();

        {
            let mut stages = stage_list(&mut self.selectors, &mut self.merger, &mut self.compressor);
            for stage in stages.iter_mut() {
                stage.set_max_data(&sizes);
            }
            let required = self.memory.compute_sizes(&mut stages)?;
            self.memory.allocate()?;
            self.memory.bind(&mut stages)?;
            tracing::debug!("Pass needs {} bytes over all pools", required.total());
        }
        for (p, selector) in self.selectors.iter_mut().enumerate() {
            selector.upload(
                &mut self.memory,
                &input.tracklets[p],
                &input.clusters.partition_row_offsets(p),
            )?;
        }
        timings.setup = clock.lap();

        let mut results = Vec::with_capacity(self.selectors.len());
        for selector in &self.selectors {
            results.push(selector.run(&self.ctx, &self.memory, &self.errors)?);
        }
        timings.selection = clock.lap();

        let partitions = self.write_slice_outputs(&results, control)?;
        timings.slice_output = clock.lap();

        let inputs: Vec<PartitionTracks<'_>> = partitions
            .iter()
            .map(|p| PartitionTracks {
                partition: p.partition,
                tracks: &p.tracks,
                hits: &p.hits,
            })
            .collect();
        let merger = self.merger.run(
            &self.ctx,
            &mut self.memory,
            &*self.geometry,
            &input.clusters,
            &inputs,
            &self.errors,
        )?;
        let merged_tracks = self.merger.merged_tracks(&self.memory, &merger)?.to_vec();
        let merged_refs = self.merger.cluster_refs(&self.memory, &merger)?.to_vec();
        timings.merging = clock.lap();

        let compression = self.compressor.run(
            &self.ctx,
            &mut self.memory,
            &input.clusters,
            &merged_tracks,
            &merged_refs,
        )?;
        let compressed = if compression.output_valid {
            let flat = self.compressor.flat_bytes(&self.memory)?;
            Some(CompressedClusters::from_flat(&flat)?)
        } else {
            None
        };
        timings.compression = clock.lap();
        timings.total = clock.total();

        let errors = self.errors.errors();
        let stats = PipelineStats {
            n_tracklets: sizes.total_tracklets(),
            n_tracks: partitions.iter().map(|p| p.tracks.len()).sum(),
            n_track_hits: partitions.iter().map(|p| p.hits.len()).sum(),
            n_merged_tracks: merged_tracks.len(),
            n_attached_clusters: compression.counts.n_attached,
            n_unattached_clusters: compression.counts.n_unattached,
            slice_output_bytes: partitions.iter().map(|p| p.memory_size).sum(),
            compressed_bytes: if compression.output_valid { compression.flat_size } else { 0 },
            n_raised_errors: errors.len(),
            gather: compression.output_valid.then_some(compression.gather),
            memory: self.memory.stats(),
            timings,
        };
        tracing::debug!(
            "Event done: {} tracks, {} merged, {} compressed bytes in {:?}",
            stats.n_tracks,
            stats.n_merged_tracks,
            stats.compressed_bytes,
            timings.total
        );

        Ok(EventOutput {
            partitions,
            merger,
            merged_tracks,
            merged_refs,
            compression: Some(compression),
            compressed,
            errors,
            fit_errors: self.memory.fit_errors().to_vec(),
            stats,
        })
    }

    /// Acquire and fill every partition's slice output, in parallel
    fn write_slice_outputs(
        &mut self,
        results: &[SelectorResult],
        control: Option<&OutputControl<'_>>,
    ) -> ForgeResult<Vec<PartitionOutput>> {
        let internal_control = OutputControl::internal();
        let control = control.unwrap_or(&internal_control);
        let memory = &self.memory;
        let errors = &self.errors;
        let selectors = &self.selectors;
        let internals = &mut self.internal_outputs;

        let outputs: Vec<ForgeResult<PartitionOutput>> = self.ctx.install(|| {
            internals
                .par_iter_mut()
                .zip(selectors.par_iter())
                .zip(results.par_iter())
                .map(|((internal, selector), result)| {
                    let (n_tracks, n_hits) = if result.overflow {
                        (0, 0)
                    } else {
                        (result.n_tracks, result.n_track_hits)
                    };
                    let mut output = PartitionOutput {
                        partition: result.partition,
                        selector: *result,
                        ..Default::default()
                    };
                    match SliceOutput::allocate(control, internal, n_tracks, n_hits) {
                        Some(mut slice) => {
                            selector.write_output(memory, result, &mut slice)?;
                            output.output_valid = true;
                            output.memory_size = slice.memory_size();
                            output.tracks = slice.tracks().to_vec();
                            output.hits = slice.cluster_refs().to_vec();
                        }
                        None => errors.raise_error(
                            ErrorCode::SliceOutputOverflow,
                            result.partition,
                            result.output_size() as u64,
                            control.capacity() as u64,
                        ),
                    }
                    Ok(output)
                })
                .collect()
        });
        outputs.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ClusterNative, ClusterNativeBuilder, TrackParam};
    use crate::execution::ExecutionSettings;
    use crate::geometry::UniformGeometry;

    fn settings() -> ProcessingSettings {
        ProcessingSettings::new()
            .with_min_track_clusters(3)
            .with_execution(ExecutionSettings::serial().with_launch_geometry(2, 4))
    }

    fn single_track_event() -> EventInput {
        let mut builder = ClusterNativeBuilder::new(1, 8);
        for row in 0..4 {
            builder
                .push(0, row, ClusterNative::from_packed(100 + row as u32 * 16, 0, 640, 4, 4, 30, 120))
                .unwrap();
        }
        let mut set = TrackletSet::new();
        set.push(0, &[0, 0, 0, 0], 1, TrackParam::new(85.0, 0.0, 0.0, 0.0, 0.0, 0.5))
            .unwrap();
        EventInput::new(builder.build(), vec![set])
    }

    #[test]
    fn test_sizes_from_input() {
        let input = single_track_event();
        let sizes = input.sizes();
        assert_eq!(sizes.n_rows, 8);
        assert_eq!(sizes.partitions[0].n_tracklets, 1);
        assert_eq!(sizes.partitions[0].n_tracklet_row_hits, 4);
        assert_eq!(sizes.partitions[0].n_clusters, 4);
    }

    #[test]
    fn test_validate_rejects_partition_mismatch() {
        let geometry = UniformGeometry::new(2, 8, 85.0, 245.0).unwrap();
        assert!(single_track_event().validate(&geometry).is_err());
    }

    #[test]
    fn test_single_track_pass() {
        let geometry = Arc::new(UniformGeometry::new(1, 8, 85.0, 245.0).unwrap());
        let mut pipeline = PipelineContext::new(settings(), geometry).unwrap();
        let output = pipeline.process_event(&single_track_event(), None).unwrap();

        assert_eq!(output.partitions[0].tracks.len(), 1);
        assert_eq!(output.partitions[0].hits.len(), 4);
        assert_eq!(output.merged_tracks.len(), 1);
        let compressed = output.compressed.unwrap();
        assert_eq!(compressed.header.n_attached, 4);
        assert_eq!(compressed.header.n_unattached, 0);
        assert!(output.errors.is_empty());
        assert_eq!(pipeline.events_processed(), 1);
    }
}
