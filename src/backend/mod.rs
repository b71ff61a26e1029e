//! Compute backends for the distance function
//!
//! Every backend realizes [`crate::formula::haversine`] under one of two call
//! shapes:
//! - [`ScalarKernel`]: one call per row, adapted to batches by the dispatcher
//! - [`BatchKernel`]: one call per [`ColumnBatch`], free to parallelize as long
//!   as output order matches input order
//!
//! Compiled backends build their artifact lazily through an [`ArtifactCache`]:
//! the first batch pays for compilation, every later batch reuses the result.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

pub mod interpreted;
#[cfg(feature = "jit")]
pub mod jit;
pub mod native;
pub mod registry;
pub mod vectorized;

pub use registry::{Dispatch, Registry};

/// Method identifiers known to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    /// Tree-walking interpreter, one row per call (baseline reference)
    Scalar,
    /// JIT-compiled single-row function
    ScalarCompiled,
    /// Chunked CPU loop, auto-vectorized, parallel across row ranges
    Vectorized,
    /// JIT-compiled loop over whole column buffers
    VectorizedCompiled,
    /// One GPU invocation per row
    Gpu,
    /// Precompiled kernel behind a versioned C ABI
    NativeFfi,
    /// Formula expressed in the engine's own SQL (no custom function)
    Sql,
}

impl Method {
    /// Every known method, in probe order
    pub const ALL: [Self; 7] = [
        Self::Scalar,
        Self::ScalarCompiled,
        Self::Vectorized,
        Self::VectorizedCompiled,
        Self::Gpu,
        Self::NativeFfi,
        Self::Sql,
    ];

    /// Identifier used on the command surface
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::ScalarCompiled => "scalar_compiled",
            Self::Vectorized => "vectorized",
            Self::VectorizedCompiled => "vectorized_compiled",
            Self::Gpu => "gpu",
            Self::NativeFfi => "native_ffi",
            Self::Sql => "sql",
        }
    }

    /// Calling convention of the backend behind this method
    #[must_use]
    pub const fn call_shape(self) -> CallShape {
        match self {
            Self::Scalar | Self::ScalarCompiled => CallShape::Scalar,
            Self::Vectorized | Self::VectorizedCompiled | Self::Gpu | Self::NativeFfi => {
                CallShape::Batch
            }
            Self::Sql => CallShape::Expression,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::UnknownMethod {
                method: s.to_string(),
                available: Self::ALL.map(Self::as_str).join(", "),
            })
    }
}

/// Calling convention of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    /// `(x0, y0, x1, y1) -> f64`, once per row
    Scalar,
    /// `(x0[], y0[], x1[], y1[]) -> f64[]`, once per batch
    Batch,
    /// Evaluated by the query engine itself
    Expression,
}

/// Static description of a backend and its runtime prerequisite
#[derive(Debug, Clone, Copy)]
pub struct BackendDescriptor {
    /// Method identifier
    pub method: Method,
    /// Calling convention
    pub call_shape: CallShape,
    /// Whether the prerequisite (GPU device, JIT target, ...) is present
    pub availability: fn() -> bool,
}

impl BackendDescriptor {
    /// Descriptor using the method's default call shape
    #[must_use]
    pub const fn new(method: Method, availability: fn() -> bool) -> Self {
        Self {
            method,
            call_shape: method.call_shape(),
            availability,
        }
    }

    /// Run the availability probe
    #[must_use]
    pub fn is_available(&self) -> bool {
        (self.availability)()
    }
}

/// Borrowed view of one batch of coordinate pairs
///
/// Four contiguous `f64` columns of equal length, usually pointing straight
/// into the engine's Arrow value buffers.
///
/// Fields are private: [`ColumnBatch::try_new`] is the only constructor, so
/// every batch a kernel sees has four columns of exactly [`ColumnBatch::len`]
/// rows. Kernels that hand raw pointers to compiled or foreign code rely on it.
///
/// ```compile_fail
/// use haversine_udf::backend::ColumnBatch;
/// let short = [0.0];
/// let long = [0.0; 4];
/// let _ = ColumnBatch { x0: &long, y0: &long, x1: &long, y1: &short };
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ColumnBatch<'a> {
    x0: &'a [f64],
    y0: &'a [f64],
    x1: &'a [f64],
    y1: &'a [f64],
}

impl<'a> ColumnBatch<'a> {
    /// Create a batch view, checking the equal-length contract
    ///
    /// # Errors
    /// Returns `DataShapeError` if the four columns differ in length
    pub fn try_new(x0: &'a [f64], y0: &'a [f64], x1: &'a [f64], y1: &'a [f64]) -> Result<Self> {
        let len = x0.len();
        if y0.len() != len || x1.len() != len || y1.len() != len {
            return Err(Error::DataShapeError(format!(
                "column lengths differ: x0={}, y0={}, x1={}, y1={}",
                x0.len(),
                y0.len(),
                x1.len(),
                y1.len()
            )));
        }
        Ok(Self { x0, y0, x1, y1 })
    }

    /// Longitudes of point A
    #[must_use]
    pub const fn x0(&self) -> &'a [f64] {
        self.x0
    }

    /// Latitudes of point A
    #[must_use]
    pub const fn y0(&self) -> &'a [f64] {
        self.y0
    }

    /// Longitudes of point B
    #[must_use]
    pub const fn x1(&self) -> &'a [f64] {
        self.x1
    }

    /// Latitudes of point B
    #[must_use]
    pub const fn y1(&self) -> &'a [f64] {
        self.y1
    }

    /// Check that `out` has one slot per row
    ///
    /// # Errors
    /// Returns `DataShapeError` if `out.len() != self.len()`
    pub fn check_output(&self, out: &[f64]) -> Result<()> {
        if out.len() == self.len() {
            Ok(())
        } else {
            Err(Error::DataShapeError(format!(
                "output length {} != batch length {}",
                out.len(),
                self.len()
            )))
        }
    }

    /// Number of rows
    #[must_use]
    pub const fn len(&self) -> usize {
        self.x0.len()
    }

    /// True for a zero-row batch
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.x0.is_empty()
    }

    /// Row `i` as a four-element array
    ///
    /// # Panics
    /// Panics if `i >= self.len()`
    #[inline]
    #[must_use]
    pub fn row(&self, i: usize) -> [f64; 4] {
        [self.x0[i], self.y0[i], self.x1[i], self.y1[i]]
    }

    /// Sub-range of rows `[start, start + len)`
    ///
    /// # Panics
    /// Panics if the range is out of bounds
    #[must_use]
    pub fn slice(&self, start: usize, len: usize) -> Self {
        let end = start + len;
        Self {
            x0: &self.x0[start..end],
            y0: &self.y0[start..end],
            x1: &self.x1[start..end],
            y1: &self.y1[start..end],
        }
    }
}

/// Row function handed out by a scalar kernel
pub type RowFn = Arc<dyn Fn(f64, f64, f64, f64) -> f64 + Send + Sync>;

/// Backend with the scalar call shape
pub trait ScalarKernel: Send + Sync {
    /// Method this kernel implements
    fn method(&self) -> Method;

    /// Obtain the per-row function, compiling it on first use
    ///
    /// # Errors
    /// Returns `CompilationFailure` if a compiled kernel cannot be built
    fn row_fn(&self) -> Result<RowFn>;
}

/// Backend with the batch call shape
pub trait BatchKernel: Send + Sync {
    /// Method this kernel implements
    fn method(&self) -> Method;

    /// Compute one distance per row into `out`
    ///
    /// `out.len()` equals `batch.len()`; `out[i]` must correspond to row `i`.
    ///
    /// # Errors
    /// Returns `CompilationFailure`, `DeviceError` or `DataShapeError`
    fn compute(&self, batch: &ColumnBatch<'_>, out: &mut [f64]) -> Result<()>;
}

/// Write-once cache for a compiled artifact
///
/// Compilation runs at most once per successful build; concurrent callers
/// block on the first build and then share the result. A failed build is not
/// cached, the error goes to the caller that triggered it.
pub struct ArtifactCache<T> {
    cell: OnceLock<Arc<T>>,
    init: Mutex<()>,
    compiles: AtomicUsize,
}

impl<T> ArtifactCache<T> {
    /// Create an empty cache
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            init: Mutex::new(()),
            compiles: AtomicUsize::new(0),
        }
    }

    /// Return the cached artifact or build it with `compile`
    ///
    /// # Errors
    /// Propagates the error returned by `compile`
    pub fn get_or_compile<F>(&self, compile: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        if let Some(artifact) = self.cell.get() {
            return Ok(Arc::clone(artifact));
        }

        let _guard = self
            .init
            .lock()
            .map_err(|_| Error::Other("artifact cache lock poisoned".to_string()))?;
        if let Some(artifact) = self.cell.get() {
            return Ok(Arc::clone(artifact));
        }

        self.compiles.fetch_add(1, Ordering::Relaxed);
        let artifact = Arc::new(compile()?);
        Ok(Arc::clone(self.cell.get_or_init(|| artifact)))
    }

    /// True once an artifact has been built
    #[must_use]
    pub fn is_compiled(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Number of compilation attempts so far
    #[must_use]
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }
}

impl<T> Default for ArtifactCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
