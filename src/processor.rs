//! Pipeline stage contract
//!
//! Every stage owns its arena handles and exposes them to the
//! [`MemoryResourceManager`](crate::memory::MemoryResourceManager) through one
//! layout callback per registered resource. The same callback serves the sizing
//! pass and the binding pass, so a stage can never bind more than it reserved
//! unless its maxima changed in between.

use crate::error::ForgeResult;
use crate::execution::ExecutionContext;
use crate::memory::{LayoutCursor, MemoryRegistrar, MemoryResult, ResourceId};

/// Upper bounds for one partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionSizes {
    pub n_tracklets: usize,
    /// Row-hit slots of all tracklets (including `NO_HIT` rows)
    pub n_tracklet_row_hits: usize,
    pub n_clusters: usize,
}

/// Upper bounds for one event, set before sizing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventSizes {
    pub n_rows: usize,
    pub partitions: Vec<PartitionSizes>,
    pub n_clusters_total: usize,
}

impl EventSizes {
    pub fn n_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition(&self, partition: usize) -> PartitionSizes {
        self.partitions.get(partition).copied().unwrap_or_default()
    }

    pub fn total_tracklets(&self) -> usize {
        self.partitions.iter().map(|p| p.n_tracklets).sum()
    }

    pub fn total_row_hits(&self) -> usize {
        self.partitions.iter().map(|p| p.n_tracklet_row_hits).sum()
    }
}

/// A pipeline stage participating in the two-phase memory protocol
pub trait Processor: Send {
    /// Stable name, used as prefix of its resource names
    fn name(&self) -> &str;

    /// One-time setup once the execution context is known
    fn initialize(&mut self, ctx: &ExecutionContext) -> ForgeResult<()>;

    /// Register every resource the stage needs
    fn register_memory(&mut self, registrar: &mut MemoryRegistrar<'_>) -> MemoryResult<()>;

    /// Record the maxima that drive the next sizing pass
    fn set_max_data(&mut self, sizes: &EventSizes);

    /// Lay out the arrays of `resource`, storing the returned handles
    fn set_pointers(&mut self, resource: ResourceId, cursor: &mut LayoutCursor);

    /// Largest size in bytes a CUSTOM resource can reach under the current maxima
    ///
    /// `None` leaves the resource to the fixed custom reserve of its pool.
    fn custom_size_bound(&self, _resource: ResourceId) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_sizes_totals() {
        let sizes = EventSizes {
            n_rows: 10,
            partitions: vec![
                PartitionSizes {
                    n_tracklets: 3,
                    n_tracklet_row_hits: 30,
                    n_clusters: 12,
                },
                PartitionSizes {
                    n_tracklets: 2,
                    n_tracklet_row_hits: 8,
                    n_clusters: 5,
                },
            ],
            n_clusters_total: 17,
        };
        assert_eq!(sizes.n_partitions(), 2);
        assert_eq!(sizes.total_tracklets(), 5);
        assert_eq!(sizes.total_row_hits(), 38);
        assert_eq!(sizes.partition(7), PartitionSizes::default());
    }
}
