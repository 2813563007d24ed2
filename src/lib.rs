//! TrackForge - arena-managed track reconstruction
//!
//! Turns per-partition tracklets into tracks, merges them across partition
//! boundaries and compresses the event's clusters into a columnar format. Every
//! stage declares its memory up front and works on offsets into a few pre-sized
//! arenas, so a pass never allocates on the hot path.

#![allow(clippy::too_many_arguments)] // Kernels take many views
#![allow(clippy::needless_range_loop)] // Index loops mirror the grid-stride kernels
#![allow(clippy::manual_slice_size_calculation)] // Byte sizes of arena regions

pub mod compression;
pub mod config;
pub mod data;
pub mod error;
pub mod execution;
pub mod geometry;
pub mod logging;
pub mod memory;
pub mod merger;
pub mod pipeline;
pub mod processor;
pub mod selector;
pub mod slice_output;

pub use compression::{ClusterCompressor, ClusterDecoder, CompressedClusters};
pub use config::{GatherMode, ProcessingSettings};
pub use data::{ClusterNative, ClusterNativeAccess, MergedTrack, Track, TrackletSet};
pub use error::{ErrorCategory, ErrorCode, ErrorRecorder, ErrorSink, ForgeResult, TrackForgeError};
pub use execution::{ExecutionContext, ExecutionSettings, ExecutionSpace};
pub use geometry::{Geometry, UniformGeometry};
pub use memory::MemoryResourceManager;
pub use merger::TrackMerger;
pub use pipeline::{EventInput, EventOutput, PipelineContext};
pub use processor::Processor;
pub use selector::TrackletSelector;
pub use slice_output::{OutputControl, SliceOutput};
