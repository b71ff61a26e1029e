//! Vectorized CPU backend
//!
//! Tight loop over zipped column slices so the compiler can auto-vectorize the
//! arithmetic. With the `rayon` feature, row ranges of [`CHUNK_ROWS`] are
//! spread across the rayon pool; each chunk writes only its own output range,
//! so output order always matches input order.

use super::{BatchKernel, ColumnBatch, Method};
use crate::formula::haversine;
use crate::Result;

/// Rows per parallel work unit (4 input columns * 8 KiB rows = 256 KiB)
pub const CHUNK_ROWS: usize = 8 * 1024;

/// Auto-vectorized, optionally multi-threaded batch kernel
#[derive(Debug, Clone, Copy)]
pub struct VectorizedKernel {
    parallel: bool,
}

impl VectorizedKernel {
    /// Create a kernel (parallel when the `rayon` feature is enabled)
    #[must_use]
    pub const fn new() -> Self {
        Self {
            parallel: cfg!(feature = "rayon"),
        }
    }

    /// Force single-threaded execution
    #[must_use]
    pub const fn sequential() -> Self {
        Self { parallel: false }
    }

    /// True if row ranges are spread across threads
    #[must_use]
    pub const fn is_parallel(&self) -> bool {
        self.parallel
    }
}

impl Default for VectorizedKernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute one contiguous range; `out.len() == batch.len()`
#[inline]
fn compute_range(batch: &ColumnBatch<'_>, out: &mut [f64]) {
    let rows = batch
        .x0()
        .iter()
        .zip(batch.y0())
        .zip(batch.x1())
        .zip(batch.y1())
        .zip(out.iter_mut());
    for ((((&x0, &y0), &x1), &y1), slot) in rows {
        *slot = haversine(x0, y0, x1, y1);
    }
}

impl BatchKernel for VectorizedKernel {
    fn method(&self) -> Method {
        Method::Vectorized
    }

    fn compute(&self, batch: &ColumnBatch<'_>, out: &mut [f64]) -> Result<()> {
        batch.check_output(out)?;

        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;

            if self.parallel && batch.len() > CHUNK_ROWS {
                out.par_chunks_mut(CHUNK_ROWS)
                    .enumerate()
                    .for_each(|(i, chunk)| {
                        let rows = batch.slice(i * CHUNK_ROWS, chunk.len());
                        compute_range(&rows, chunk);
                    });
                return Ok(());
            }
        }

        compute_range(batch, out);
        Ok(())
    }
}
