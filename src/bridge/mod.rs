//! Batch execution bridge
//!
//! Exposes a batch kernel to the query engine as a vectorized function with
//! four `Float64` inputs and one `Float64` output.
//!
//! Per batch:
//! 1. borrow the engine's value buffers as `&[f64]` (no copy)
//! 2. run the kernel into a fresh `Vec<f64>`
//! 3. move that vector into the result array's value buffer (no copy)
//! 4. attach the union of the four input validity bitmaps
//!
//! Kernels never see null bitmaps; slots under a null are computed from
//! whatever the engine left in the value buffer and masked afterwards.

use crate::backend::{BatchKernel, ColumnBatch, Method};
use crate::observe::{BatchEvent, ExecutionObserver, NoopObserver};
use crate::query::expr::as_f64;
use crate::query::{Signature, VectorizedFunction};
use crate::{Error, Result};
use arrow::array::{Array, ArrayRef, Float64Array};
use arrow::buffer::{NullBuffer, ScalarBuffer};
use std::sync::Arc;
use std::time::Instant;

/// Default name of the registered distance function
pub const DEFAULT_FUNCTION_NAME: &str = "haversine_dist";

/// Distance kernel registered as a query-engine function
pub struct DistanceFunction {
    name: String,
    kernel: Arc<dyn BatchKernel>,
    observer: Arc<dyn ExecutionObserver>,
}

impl DistanceFunction {
    /// Wrap `kernel` under `name` with no observer
    #[must_use]
    pub fn new(name: impl Into<String>, kernel: Arc<dyn BatchKernel>) -> Self {
        Self {
            name: name.into(),
            kernel,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Report every batch to `observer`
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Backend behind this function
    #[must_use]
    pub fn method(&self) -> Method {
        self.kernel.method()
    }

    /// Run the kernel over four equal-length columns
    ///
    /// # Errors
    /// - `DataShapeError` if the columns differ in length
    /// - whatever the kernel returns (`CompilationFailure`, `DeviceError`, ...)
    pub fn compute(
        &self,
        x0: &Float64Array,
        y0: &Float64Array,
        x1: &Float64Array,
        y1: &Float64Array,
    ) -> Result<Float64Array> {
        let batch = ColumnBatch::try_new(x0.values(), y0.values(), x1.values(), y1.values())?;
        let rows = batch.len();

        let nulls = [x0.nulls(), y0.nulls(), x1.nulls(), y1.nulls()]
            .into_iter()
            .fold(None, |acc: Option<NullBuffer>, n| NullBuffer::union(acc.as_ref(), n));

        let started = Instant::now();
        let mut out = vec![0.0; rows];
        if rows > 0 {
            self.kernel.compute(&batch, &mut out)?;
        }
        let elapsed = started.elapsed();

        let null_rows = nulls.as_ref().map_or(0, NullBuffer::null_count);
        tracing::debug!(
            method = %self.kernel.method(),
            rows,
            nulls = null_rows,
            elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            "distance batch"
        );
        self.observer.on_batch(&BatchEvent {
            method: self.kernel.method(),
            rows,
            nulls: null_rows,
            thread: std::thread::current().id(),
            elapsed,
        });

        Ok(Float64Array::try_new(ScalarBuffer::from(out), nulls)?)
    }
}

impl VectorizedFunction for DistanceFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> Signature {
        Signature::float64(4)
    }

    fn invoke(&self, args: &[ArrayRef]) -> Result<ArrayRef> {
        let [x0, y0, x1, y1] = args else {
            return Err(Error::InvalidInput(format!(
                "{} expects 4 arguments (x0, y0, x1, y1), got {}",
                self.name,
                args.len()
            )));
        };
        let result = self.compute(
            as_f64(x0, &self.name)?,
            as_f64(y0, &self.name)?,
            as_f64(x1, &self.name)?,
            as_f64(y1, &self.name)?,
        )?;
        Ok(Arc::new(result))
    }
}
