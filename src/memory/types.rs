//! Core types for the memory resource manager
//!
//! Error type, pool identifiers, resource classes and resource handles.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Alignment must be a non-zero power of 2, got {0}")]
    InvalidAlignment(usize),
    #[error("Invalid resource type for '{name}': {reason}")]
    InvalidResourceType { name: String, reason: String },
    #[error("Failed to allocate {bytes} bytes for {pool} pool")]
    AllocationFailed { pool: MemoryPool, bytes: usize },
    #[error("{pool} pool exhausted: need {requested} bytes, capacity {capacity}")]
    PoolCapacityExceeded {
        pool: MemoryPool,
        requested: usize,
        capacity: usize,
    },
    #[error("Resource '{resource}' bound {requested} bytes but only {reserved} were reserved")]
    AllocationSizeMismatch {
        resource: String,
        reserved: usize,
        requested: usize,
    },
    #[error("Access to null region in {0}")]
    NullRegion(String),
    #[error("Region [{offset}, {end}) exceeds {pool} pool capacity {capacity}")]
    OutOfBounds {
        pool: MemoryPool,
        offset: usize,
        end: usize,
        capacity: usize,
    },
    #[error("Region at offset {offset} is not aligned for its element type: {reason}")]
    Misaligned { offset: usize, reason: String },
    #[error("{0} pool has not been allocated")]
    PoolNotAllocated(MemoryPool),
    #[error("Unknown resource id {0}")]
    UnknownResource(usize),
    #[error("Resource '{0}' is not a CUSTOM resource")]
    NotCustom(String),
    #[error("Expected {expected} processors, got {actual}")]
    ProcessorMismatch { expected: usize, actual: usize },
    #[error("Host copy length mismatch: region holds {region}, source has {source_len}")]
    CopyLengthMismatch { region: usize, source_len: usize },
}

impl MemoryError {
    /// Fatal errors indicate a defect in layout registration and abort the pass
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MemoryError::AllocationSizeMismatch { .. }
                | MemoryError::InvalidResourceType { .. }
                | MemoryError::UnknownResource(_)
                | MemoryError::NotCustom(_)
                | MemoryError::ProcessorMismatch { .. }
                | MemoryError::Misaligned { .. }
                | MemoryError::InvalidAlignment(_)
        )
    }
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// Backing memory pools, one allocation each per pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryPool {
    /// Host heap scratch and host outputs
    Host,
    /// Device memory that survives across passes
    DevicePersistent,
    /// Device scratch and device outputs, reset every pass
    DeviceScratch,
    /// Caller-supplied output memory
    External,
}

impl MemoryPool {
    pub const ALL: [MemoryPool; 4] = [
        MemoryPool::Host,
        MemoryPool::DevicePersistent,
        MemoryPool::DeviceScratch,
        MemoryPool::External,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            MemoryPool::Host => 0,
            MemoryPool::DevicePersistent => 1,
            MemoryPool::DeviceScratch => 2,
            MemoryPool::External => 3,
        }
    }
}

impl fmt::Display for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryPool::Host => write!(f, "host"),
            MemoryPool::DevicePersistent => write!(f, "device-persistent"),
            MemoryPool::DeviceScratch => write!(f, "device-scratch"),
            MemoryPool::External => write!(f, "external"),
        }
    }
}

bitflags::bitflags! {
    /// Resource classes and placement modifiers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceType: u8 {
        /// Lives across passes
        const PERMANENT = 0b0000_0001;
        /// Transient, reusable after the pass
        const SCRATCH = 0b0000_0010;
        /// Sized by the final result, may live in caller-supplied memory
        const OUTPUT = 0b0000_0100;
        /// Placed in host memory
        const HOST = 0b0000_1000;
        /// Placed in device memory
        const GPU = 0b0001_0000;
        /// Scratch that may alias STACK regions of other processors
        const STACK = 0b0010_0000;
        /// Sized manually once a dependent stage has run
        const CUSTOM = 0b0100_0000;
    }
}

impl ResourceType {
    /// Check the class/modifier combination is one the manager can place
    pub fn validate(self, name: &str) -> MemoryResult<()> {
        let classes = [
            ResourceType::PERMANENT,
            ResourceType::SCRATCH,
            ResourceType::OUTPUT,
        ]
        .iter()
        .filter(|c| self.contains(**c))
        .count();

        let reason = if classes != 1 {
            Some("exactly one of PERMANENT, SCRATCH, OUTPUT is required")
        } else if !self.intersects(ResourceType::HOST | ResourceType::GPU) {
            Some("HOST or GPU placement is required")
        } else if self.contains(ResourceType::HOST | ResourceType::GPU) {
            Some("HOST and GPU are mutually exclusive")
        } else if self.contains(ResourceType::PERMANENT) && !self.contains(ResourceType::GPU) {
            Some("PERMANENT resources live in device-persistent memory")
        } else if self.contains(ResourceType::STACK) && !self.contains(ResourceType::SCRATCH) {
            Some("STACK applies to SCRATCH resources only")
        } else if self.contains(ResourceType::CUSTOM) && self.contains(ResourceType::STACK) {
            Some("CUSTOM resources cannot alias the stack region")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(MemoryError::InvalidResourceType {
                name: name.to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Handle of a registered memory resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) usize);

impl ResourceId {
    /// Placeholder for processors that have not registered yet
    pub const INVALID: ResourceId = ResourceId(usize::MAX);

    pub fn index(self) -> usize {
        self.0
    }
}

/// Registration index of a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessorId(pub(crate) usize);

impl ProcessorId {
    pub fn index(self) -> usize {
        self.0
    }
}
