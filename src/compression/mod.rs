//! Columnar compression of clusters and merged tracks
//!
//! Clusters referenced by a merged track are "attached" and stored in track
//! order; every other cluster is "unattached" and stored per (partition, row).
//! The number of unattached clusters is only known after merging, so the output
//! and staging buffers are CUSTOM resources sized mid-pass:
//!
//! 1. mark attached clusters (one worker per track)
//! 2. count unattached clusters per (partition, row)
//! 3. size and bind the output and the staging buffer of the gather mode
//! 4. encode into the staging buffer (or straight into the output)
//! 5. gather the staging buffer into the output
//!
//! All gather modes produce the same bytes; they differ in where the columns are
//! built and how many copies reach the output.

pub mod compressed;
pub mod decoder;
pub mod encoder;
pub mod track_model;

use std::sync::Arc;

use crate::config::{GatherMode, ProcessingSettings};
use crate::data::{ClusterNativeAccess, MergedClusterRef, MergedTrack};
use crate::error::{ForgeResult, TrackForgeError};
use crate::execution::ExecutionContext;
use crate::memory::{
    ArenaSlice, LayoutCursor, MemoryRegistrar, MemoryResourceManager, MemoryResult, ResourceId,
    ResourceType,
};
use crate::processor::{EventSizes, Processor};

pub use compressed::{
    ColumnSet, CompressedClusters, CompressedClustersHeader, CompressionCounts, COMPRESSED_MAGIC,
    COMPRESSED_VERSION,
};
pub use decoder::{ClusterDecoder, DecodedCluster, DecodedClusters};
pub use encoder::truncate_charge;
pub use track_model::{dequantize_q_pt, quantize_q_pt, LinearTrackModel, ModelPoint, Prediction, TrackModel};

use compressed::ColumnViews;
use encoder::{EncodeParams, TrackSlot};

/// Copies made to move the columns into the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatherStats {
    pub mode: GatherMode,
    pub copies: usize,
    pub bytes_copied: usize,
}

/// Outcome of one compression pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionResult {
    pub counts: CompressionCounts,
    /// Size of the flat block
    pub flat_size: usize,
    /// False when the output did not fit external memory
    pub output_valid: bool,
    pub gather: GatherStats,
}

#[derive(Debug)]
pub struct ClusterCompressor {
    name: String,
    gather_mode: GatherMode,
    params: EncodeParams,
    model: Arc<dyn TrackModel>,

    n_partitions: usize,
    n_rows: usize,
    max_clusters: usize,
    counts: CompressionCounts,

    res_scratch: ResourceId,
    res_output: ResourceId,
    res_host_staging: ResourceId,
    res_device_staging: ResourceId,

    attached_mask: ArenaSlice<u32>,
    row_unattached: ArenaSlice<u32>,
    output: ColumnSet,
    host_staging: ColumnSet,
    device_staging: ColumnSet,
}

impl ClusterCompressor {
    pub fn new(settings: &ProcessingSettings) -> Self {
        Self {
            name: "compressor".to_string(),
            gather_mode: settings.gather_mode,
            params: EncodeParams {
                track_model: settings.compression_track_model,
                charge_truncation_bits: settings.charge_truncation_bits as u32,
            },
            model: Arc::new(LinearTrackModel),
            n_partitions: 0,
            n_rows: 0,
            max_clusters: 0,
            counts: CompressionCounts::default(),
            res_scratch: ResourceId::INVALID,
            res_output: ResourceId::INVALID,
            res_host_staging: ResourceId::INVALID,
            res_device_staging: ResourceId::INVALID,
            attached_mask: ArenaSlice::null(),
            row_unattached: ArenaSlice::null(),
            output: ColumnSet::default(),
            host_staging: ColumnSet::default(),
            device_staging: ColumnSet::default(),
        }
    }

    /// Replace the track model; the decoder must use the same one
    pub fn with_track_model(mut self, model: Arc<dyn TrackModel>) -> Self {
        self.model = model;
        self
    }

    pub fn track_model(&self) -> Arc<dyn TrackModel> {
        Arc::clone(&self.model)
    }

    /// Decoder matching this compressor's track model
    pub fn decoder(&self) -> ClusterDecoder {
        ClusterDecoder::new(self.track_model())
    }

    pub fn gather_mode(&self) -> GatherMode {
        self.gather_mode
    }

    pub fn output_resource(&self) -> ResourceId {
        self.res_output
    }

    /// Flat bytes of the last valid pass
    pub fn flat_bytes(&self, memory: &MemoryResourceManager) -> ForgeResult<Vec<u8>> {
        let bytes = self.flat_region(memory)?;
        Ok(memory.to_vec(bytes)?)
    }

    fn flat_region(&self, memory: &MemoryResourceManager) -> ForgeResult<ArenaSlice<u8>> {
        let size = self.counts.flat_size();
        memory
            .resource_bytes(self.res_output)
            .and_then(|b| b.sub(0, size))
            .ok_or_else(|| {
                TrackForgeError::InternalError("compression output is not bound".to_string())
            })
    }

    fn check_inputs(
        &self,
        clusters: &ClusterNativeAccess,
        tracks: &[MergedTrack],
        refs: &[MergedClusterRef],
    ) -> ForgeResult<()> {
        if clusters.n_partitions() != self.n_partitions || clusters.n_rows() != self.n_rows {
            return Err(TrackForgeError::InvalidInput(format!(
                "clusters cover {}x{} rows, compressor sized for {}x{}",
                clusters.n_partitions(),
                clusters.n_rows(),
                self.n_partitions,
                self.n_rows
            )));
        }
        if clusters.n_clusters_total() > self.max_clusters {
            return Err(TrackForgeError::InvalidInput(format!(
                "{} clusters exceed the sized {}",
                clusters.n_clusters_total(),
                self.max_clusters
            )));
        }
        if self.n_partitions > 256 || self.n_rows > 256 {
            return Err(TrackForgeError::InvalidConfiguration(format!(
                "compression stores partitions and rows in one byte, got {}x{}",
                self.n_partitions, self.n_rows
            )));
        }
        for (i, track) in tracks.iter().enumerate() {
            if !track.is_consistent(refs.len()) {
                return Err(TrackForgeError::InvalidInput(format!(
                    "merged track {} references clusters beyond {}",
                    i,
                    refs.len()
                )));
            }
            for r in &refs[track.cluster_range()] {
                match clusters.locate(r.index) {
                    Some((partition, row, _))
                        if partition == r.partition as usize && row == r.row as usize => {}
                    _ => {
                        return Err(TrackForgeError::InvalidInput(format!(
                            "merged track {} references cluster {} at partition {} row {} inconsistently",
                            i, r.index, r.partition, r.row
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    /// Compress the clusters of one event
    pub fn run(
        &mut self,
        ctx: &ExecutionContext,
        memory: &mut MemoryResourceManager,
        clusters: &ClusterNativeAccess,
        tracks: &[MergedTrack],
        refs: &[MergedClusterRef],
    ) -> ForgeResult<CompressionResult> {
        let _span = tracing::debug_span!("compression", mode = %self.gather_mode).entered();
        self.check_inputs(clusters, tracks, refs)?;

        let n_slots = self.n_partitions * self.n_rows;
        let n_clusters = clusters.n_clusters_total();
        let mask_region = self
            .attached_mask
            .sub(0, n_clusters)
            .ok_or_else(|| TrackForgeError::InternalError("attached mask is not bound".to_string()))?;
        memory.fill(mask_region, 0)?;

        {
            let mask = memory.atomics_u32(mask_region)?;
            let counts = memory.atomics_u32(self.row_unattached)?;
            ctx.launch("compression_mark", |t| {
                for i in (t.global_id()..tracks.len()).step_by(t.global_stride()) {
                    encoder::mark_attached(mask, tracks, refs, i);
                }
            });
            ctx.launch("compression_count", |t| {
                for s in (t.global_id()..n_slots).step_by(t.global_stride()) {
                    counts[s].store(
                        encoder::count_unattached(mask, clusters, s),
                        std::sync::atomic::Ordering::Relaxed,
                    );
                }
            });
        }

        let row_counts = memory.to_vec(self.row_unattached)?;
        let mut row_starts = Vec::with_capacity(n_slots);
        let mut n_unattached = 0usize;
        for &n in &row_counts[..n_slots] {
            row_starts.push(n_unattached);
            n_unattached += n as usize;
        }

        let mut slots = Vec::new();
        let mut n_attached = 0usize;
        for (i, track) in tracks.iter().enumerate() {
            if track.n_clusters == 0 {
                continue;
            }
            slots.push(TrackSlot {
                track: i as u32,
                attached: n_attached as u32,
            });
            n_attached += track.n_clusters as usize;
        }

        self.counts = CompressionCounts {
            n_partitions: self.n_partitions,
            n_rows: self.n_rows,
            n_tracks: slots.len(),
            n_attached,
            n_unattached,
        };
        let flat_size = self.counts.flat_size();
        tracing::debug!(
            "Compressing {} tracks, {} attached, {} unattached clusters into {} bytes",
            self.counts.n_tracks,
            n_attached,
            n_unattached,
            flat_size
        );

        let mut gather = GatherStats {
            mode: self.gather_mode,
            copies: 0,
            bytes_copied: 0,
        };
        if !memory.allocate_custom(self.res_output, self)? {
            return Ok(CompressionResult {
                counts: self.counts,
                flat_size,
                output_valid: false,
                gather,
            });
        }
        let target = match self.gather_mode {
            GatherMode::HostStaging => {
                memory.allocate_custom(self.res_host_staging, self)?;
                self.clear_resource(memory, self.res_host_staging)?;
                self.host_staging
            }
            GatherMode::DeviceStaging | GatherMode::DeviceContiguous => {
                memory.allocate_custom(self.res_device_staging, self)?;
                self.clear_resource(memory, self.res_device_staging)?;
                self.device_staging
            }
            GatherMode::Direct => self.output,
        };
        self.clear_resource(memory, self.res_output)?;

        let header = CompressedClustersHeader::new(
            &self.counts,
            self.params.track_model,
            self.params.charge_truncation_bits,
        );
        memory.view_mut(target.header)?[0] = header;
        self.encode(ctx, memory, &target, clusters, tracks, refs, &slots, &row_starts)?;

        match self.gather_mode {
            GatherMode::HostStaging | GatherMode::DeviceContiguous => {
                let staging = if self.gather_mode == GatherMode::HostStaging {
                    self.res_host_staging
                } else {
                    self.res_device_staging
                };
                let src = memory
                    .resource_bytes(staging)
                    .and_then(|b| b.sub(0, flat_size))
                    .ok_or_else(|| {
                        TrackForgeError::InternalError("staging buffer is not bound".to_string())
                    })?;
                let dst = self.flat_region(memory)?;
                gather.bytes_copied = memory.copy_region(src, dst)?;
                gather.copies = 1;
            }
            GatherMode::DeviceStaging => {
                let (copies, bytes) = target.copy_fields(memory, &self.output)?;
                gather.copies = copies;
                gather.bytes_copied = bytes;
            }
            GatherMode::Direct => {}
        }
        tracing::debug!(
            "Gathered compressed clusters: mode {}, {} copies, {} bytes",
            gather.mode,
            gather.copies,
            gather.bytes_copied
        );

        Ok(CompressionResult {
            counts: self.counts,
            flat_size,
            output_valid: true,
            gather,
        })
    }

    fn clear_resource(&self, memory: &mut MemoryResourceManager, id: ResourceId) -> ForgeResult<()> {
        if let Some(bytes) = memory.resource_bytes(id) {
            memory.fill(bytes, 0)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn encode(
        &self,
        ctx: &ExecutionContext,
        memory: &MemoryResourceManager,
        target: &ColumnSet,
        clusters: &ClusterNativeAccess,
        tracks: &[MergedTrack],
        refs: &[MergedClusterRef],
        slots: &[TrackSlot],
        row_starts: &[usize],
    ) -> ForgeResult<()> {
        let out = ColumnViews::new(memory, target)?;
        let mask = memory.atomics_u32(self.attached_mask)?;
        let row_counts = memory.view(self.row_unattached)?;
        let model = &*self.model;
        let params = self.params;

        ctx.launch("compression_attached", |t| {
            for i in (t.global_id()..slots.len()).step_by(t.global_stride()) {
                // SAFETY: track i owns attached range [slots[i].attached, +n) and
                // reduced range [slots[i].attached - i, +n-1), disjoint across tracks
                unsafe { encoder::encode_track(&out, model, params, clusters, tracks, refs, slots[i], i) };
            }
        });
        ctx.launch("compression_unattached", |t| {
            for s in (t.global_id()..row_starts.len()).step_by(t.global_stride()) {
                // SAFETY: row s owns unattached range [row_starts[s], +row_counts[s])
                unsafe {
                    encoder::encode_row(&out, params, clusters, mask, s, row_starts[s], row_counts[s])
                };
            }
        });
        Ok(())
    }
}

impl Processor for ClusterCompressor {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, _ctx: &ExecutionContext) -> ForgeResult<()> {
        if self.params.charge_truncation_bits >= 16 {
            return Err(TrackForgeError::InvalidConfiguration(format!(
                "charge truncation of {} bits leaves no charge",
                self.params.charge_truncation_bits
            )));
        }
        Ok(())
    }

    fn register_memory(&mut self, registrar: &mut MemoryRegistrar<'_>) -> MemoryResult<()> {
        self.res_scratch = registrar.register("scratch", ResourceType::SCRATCH | ResourceType::GPU)?;
        self.res_output = registrar.register(
            "output",
            ResourceType::OUTPUT | ResourceType::HOST | ResourceType::CUSTOM,
        )?;
        self.res_host_staging = registrar.register(
            "host_staging",
            ResourceType::SCRATCH | ResourceType::HOST | ResourceType::CUSTOM,
        )?;
        self.res_device_staging = registrar.register(
            "device_staging",
            ResourceType::SCRATCH | ResourceType::GPU | ResourceType::CUSTOM,
        )?;
        Ok(())
    }

    fn set_max_data(&mut self, sizes: &EventSizes) {
        self.n_partitions = sizes.n_partitions();
        self.n_rows = sizes.n_rows;
        self.max_clusters = sizes.n_clusters_total;
    }

    fn set_pointers(&mut self, resource: ResourceId, cursor: &mut LayoutCursor) {
        if resource == self.res_scratch {
            self.attached_mask = cursor.reserve(self.max_clusters);
            self.row_unattached = cursor.reserve(self.n_partitions * self.n_rows);
        } else if resource == self.res_output {
            self.output = ColumnSet::reserve(cursor, &self.counts);
        } else if resource == self.res_host_staging {
            self.host_staging = if self.gather_mode == GatherMode::HostStaging {
                ColumnSet::reserve(cursor, &self.counts)
            } else {
                ColumnSet::default()
            };
        } else if resource == self.res_device_staging {
            self.device_staging = match self.gather_mode {
                GatherMode::DeviceStaging | GatherMode::DeviceContiguous => {
                    ColumnSet::reserve(cursor, &self.counts)
                }
                _ => ColumnSet::default(),
            };
        }
    }

    fn custom_size_bound(&self, resource: ResourceId) -> Option<usize> {
        let block = CompressionCounts::max_flat_size(self.n_partitions, self.n_rows, self.max_clusters);
        let staged = if resource == self.res_output {
            true
        } else if resource == self.res_host_staging {
            self.gather_mode == GatherMode::HostStaging
        } else if resource == self.res_device_staging {
            matches!(
                self.gather_mode,
                GatherMode::DeviceStaging | GatherMode::DeviceContiguous
            )
        } else {
            return None;
        };
        Some(if staged { block } else { 0 })
    }
}
