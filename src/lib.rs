//! # haversine-udf: Mean Great-Circle Distance over Columnar Data
//!
//! One haversine formula, seven interchangeable ways to run it, all plugged
//! into a small vectorized query engine as a registered batch function:
//!
//! | method | shape | realization |
//! |---|---|---|
//! | `scalar` | per row | tree-walking interpreter |
//! | `scalar_compiled` | per row | Cranelift JIT (feature `jit`) |
//! | `vectorized` | batch | chunked loop, rayon across row ranges |
//! | `vectorized_compiled` | batch | Cranelift JIT of the whole loop (feature `jit`) |
//! | `gpu` | batch | wgpu compute shader in f64 (feature `gpu`) |
//! | `native_ffi` | batch | versioned `extern "C"` function table, linked or loaded from a shared library |
//! | `sql` | expression | formula written in SQL, no custom function |
//!
//! ## Design Principles
//!
//! - **Zero-copy bridge**: Arrow value buffers go to kernels as `&[f64]`, and
//!   the output `Vec<f64>` becomes the result buffer
//! - **Null propagation**: output validity is the union of input validities,
//!   whatever the backend
//! - **Graceful degradation**: backends missing on this host are excluded
//!   at startup, never silently substituted at run time
//! - **Backend equivalence**: every backend agrees with `scalar` within 1e-9
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use haversine_udf::session::Session;
//!
//! let session = Session::builder().build();
//! let avg = session.calc_file("vectorized", "data/points.parquet")?;
//! println!("avg distance: {avg:.3} km");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod backend;
pub mod bridge;
pub mod error;
pub mod formula;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod observe;
pub mod query;
pub mod session;
pub mod storage;
pub mod telemetry;

pub use backend::{Method, Registry};
pub use error::{Error, Result};
pub use formula::{haversine, CoordinatePair, EARTH_RADIUS_KM};
pub use session::{Session, SessionConfig};
pub use storage::StorageEngine;
