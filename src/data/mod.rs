//! Plain-old-data records shared by all stages
//!
//! Every record is `#[repr(C)]` and `bytemuck::Pod` so it can live in an arena
//! and be viewed without copies.

pub mod cluster;
pub mod merged;
pub mod track;

pub use cluster::{ClusterNative, ClusterNativeAccess, ClusterNativeBuilder};
pub use merged::{MergedClusterRef, MergedTrack, MergedTrackFlags};
pub use track::{ClusterRef, Track, TrackParam, Tracklet, TrackletSet, NO_HIT};
