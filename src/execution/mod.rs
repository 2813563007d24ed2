//! Execution context for kernels
//!
//! Kernels are written against a block/thread index space, the same way they
//! would be on an accelerator. On the host the index space is emulated: serially
//! for debugging and determinism, or on a rayon pool.
//!
//! Every [`ExecutionContext::launch`] returns only after all workers finished, so
//! consecutive launches are separated by a full barrier.

use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{ForgeResult, TrackForgeError};

/// Where kernels run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionSpace {
    Serial,
    #[default]
    Parallel,
}

/// Launch geometry and thread pool selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSettings {
    pub space: ExecutionSpace,
    pub n_blocks: usize,
    pub n_threads: usize,
    /// Dedicated pool size; `None` uses the global rayon pool
    pub num_threads: Option<usize>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            space: ExecutionSpace::Parallel,
            n_blocks: 8,
            n_threads: 32,
            num_threads: None,
        }
    }
}

impl ExecutionSettings {
    pub fn serial() -> Self {
        Self {
            space: ExecutionSpace::Serial,
            n_blocks: 1,
            n_threads: 4,
            num_threads: None,
        }
    }

    pub fn with_space(mut self, space: ExecutionSpace) -> Self {
        self.space = space;
        self
    }

    pub fn with_launch_geometry(mut self, n_blocks: usize, n_threads: usize) -> Self {
        self.n_blocks = n_blocks;
        self.n_threads = n_threads;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn validate(&self) -> ForgeResult<()> {
        if self.n_blocks == 0 || self.n_threads == 0 {
            return Err(TrackForgeError::InvalidConfiguration(format!(
                "launch geometry must be non-empty, got {} blocks x {} threads",
                self.n_blocks, self.n_threads
            )));
        }
        if self.num_threads == Some(0) {
            return Err(TrackForgeError::InvalidConfiguration(
                "num_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Position of one worker in the launch grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadIndex {
    pub block: usize,
    pub thread: usize,
    pub n_blocks: usize,
    pub n_threads: usize,
}

impl ThreadIndex {
    #[inline]
    pub fn global_id(&self) -> usize {
        self.block * self.n_threads + self.thread
    }

    /// Stride of a grid-stride loop
    #[inline]
    pub fn global_stride(&self) -> usize {
        self.n_blocks * self.n_threads
    }
}

/// Capability handed to every stage that launches kernels
#[derive(Clone)]
pub struct ExecutionContext {
    space: ExecutionSpace,
    n_blocks: usize,
    n_threads: usize,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl ExecutionContext {
    pub fn new(settings: &ExecutionSettings) -> ForgeResult<Self> {
        settings.validate()?;
        let pool = match (settings.space, settings.num_threads) {
            (ExecutionSpace::Parallel, Some(n)) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("trackforge-worker-{}", i))
                    .build()
                    .map_err(|e| {
                        TrackForgeError::InvalidConfiguration(format!(
                            "failed to build thread pool: {}",
                            e
                        ))
                    })?;
                Some(Arc::new(pool))
            }
            _ => None,
        };
        tracing::debug!(
            "Execution context: {:?}, {} blocks x {} threads",
            settings.space,
            settings.n_blocks,
            settings.n_threads
        );
        Ok(Self {
            space: settings.space,
            n_blocks: settings.n_blocks,
            n_threads: settings.n_threads,
            pool,
        })
    }

    /// Single worker, no pool
    pub fn serial() -> Self {
        Self {
            space: ExecutionSpace::Serial,
            n_blocks: 1,
            n_threads: 1,
            pool: None,
        }
    }

    pub fn space(&self) -> ExecutionSpace {
        self.space
    }

    pub fn n_blocks(&self) -> usize {
        self.n_blocks
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Total number of workers per launch
    pub fn n_workers(&self) -> usize {
        self.n_blocks * self.n_threads
    }

    /// Run `kernel` once per worker and wait for all of them
    pub fn launch<F>(&self, name: &str, kernel: F)
    where
        F: Fn(ThreadIndex) + Send + Sync,
    {
        let _span = tracing::trace_span!("kernel", name).entered();
        let n_blocks = self.n_blocks;
        let n_threads = self.n_threads;
        let index = move |global: usize| ThreadIndex {
            block: global / n_threads,
            thread: global % n_threads,
            n_blocks,
            n_threads,
        };
        let total = n_blocks * n_threads;

        match self.space {
            ExecutionSpace::Serial => (0..total).for_each(|g| kernel(index(g))),
            ExecutionSpace::Parallel => {
                let run = || (0..total).into_par_iter().for_each(|g| kernel(index(g)));
                match &self.pool {
                    Some(pool) => pool.install(run),
                    None => run(),
                }
            }
        }
    }

    /// Run `f` inside this context's pool (for rayon iterators outside kernels)
    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("space", &self.space)
            .field("n_blocks", &self.n_blocks)
            .field("n_threads", &self.n_threads)
            .field("dedicated_pool", &self.pool.is_some())
            .finish()
    }
}
