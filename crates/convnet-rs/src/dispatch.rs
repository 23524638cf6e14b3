//! Batch-parallel task dispatch over an explicitly owned worker pool.
//!
//! Every parallel phase of a training step submits exactly one unit of work
//! per batch-sample index and blocks until all of them have finished. Units
//! of work never depend on execution order; each one owns the sample-indexed
//! slice it writes.

use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::ThreadPool;

/// Handle to a fixed-size worker pool.
///
/// Constructed once and passed to whoever needs it; there is no process-wide
/// singleton, so lifetime and shutdown follow the handle.
pub struct Dispatcher {
    pool: ThreadPool,
}

impl Dispatcher {
    /// Builds a pool with `num_threads` workers (0 lets the pool pick).
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .context("failed to build worker pool")?;
        Ok(Dispatcher { pool })
    }

    /// Builds a pool sized to the host's available parallelism.
    pub fn with_host_parallelism() -> Result<Self> {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(threads)
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs one unit of work per index in `0..count` and returns after every
    /// unit has completed, surfacing the first failure.
    pub fn batch<F>(&self, count: usize, job: F) -> Result<()>
    where
        F: Fn(usize) -> Result<()> + Sync + Send,
    {
        self.pool
            .install(|| (0..count).into_par_iter().try_for_each(|n| job(n)))
    }

    /// Splits `data` into disjoint per-sample rows of `row_len` elements and
    /// runs one unit of work per row. Rows never alias, so units of work can
    /// write concurrently without synchronization.
    pub fn batch_rows<F>(&self, data: &mut [f32], row_len: usize, job: F) -> Result<()>
    where
        F: Fn(usize, &mut [f32]) -> Result<()> + Sync + Send,
    {
        if data.is_empty() || row_len == 0 {
            return Ok(());
        }
        self.pool.install(|| {
            data.par_chunks_mut(row_len)
                .enumerate()
                .try_for_each(|(n, row)| job(n, row))
        })
    }

    /// Folds one unit of work per index into per-worker partial accumulators
    /// and merges them after the barrier.
    ///
    /// Each fold owns a private accumulator created by `identity`; `merge`
    /// combines two accumulators. Shared gradient buffers are reduced through
    /// this instead of being written concurrently.
    pub fn batch_sum<T, I, F, M>(&self, count: usize, identity: I, job: F, merge: M) -> Result<T>
    where
        T: Send,
        I: Fn() -> T + Sync + Send,
        F: Fn(&mut T, usize) -> Result<()> + Sync + Send,
        M: Fn(T, T) -> T + Sync + Send,
    {
        self.pool.install(|| {
            (0..count)
                .into_par_iter()
                .try_fold(&identity, |mut acc, n| {
                    job(&mut acc, n)?;
                    Ok(acc)
                })
                .try_reduce(&identity, |a, b| Ok(merge(a, b)))
        })
    }
}
