//! Precompiled native backend behind a versioned C ABI
//!
//! The kernel is exported as a plain `extern "C"` function table
//! ([`HaversineAbi`]). The core only ever sees a [`NativeProvider`] handing out
//! that table; how the provider obtained it (linked into this binary, loaded
//! from a shared object, ...) stays outside the core.
//!
//! When the crate is built as a `cdylib` the three `haversine_udf_*` symbols
//! below are the public entry points for other runtimes. With the `dylib`
//! feature, [`SharedLibraryProvider`] loads such a library at runtime and
//! calls across that boundary.

use super::{BatchKernel, ColumnBatch, Method};
use crate::formula::haversine;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Exported symbol returning the [`HaversineAbi`] table
pub const ABI_SYMBOL: &[u8] = b"haversine_udf_abi\0";

/// ABI revision understood by this build
pub const ABI_VERSION: u32 = 1;

/// Status returned by [`haversine_udf_batch`] on success
pub const STATUS_OK: i32 = 0;

/// Status returned by [`haversine_udf_batch`] when a pointer is null
pub const STATUS_NULL_POINTER: i32 = 1;

/// Function table exported by a native kernel
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HaversineAbi {
    /// Must equal [`ABI_VERSION`]
    pub version: u32,
    /// Single-row distance
    pub scalar: extern "C" fn(f64, f64, f64, f64) -> f64,
    /// `(x0, y0, x1, y1, len, out) -> status`
    pub batch: unsafe extern "C" fn(
        *const f64,
        *const f64,
        *const f64,
        *const f64,
        usize,
        *mut f64,
    ) -> i32,
}

/// Distance for one row
#[no_mangle]
pub extern "C" fn haversine_udf_scalar(x0: f64, y0: f64, x1: f64, y1: f64) -> f64 {
    haversine(x0, y0, x1, y1)
}

/// Distances for `len` rows
///
/// Returns [`STATUS_OK`], or [`STATUS_NULL_POINTER`] if any pointer is null
/// and `len > 0`.
///
/// # Safety
/// Each non-null input pointer must be valid for `len` reads of `f64` and
/// `out` valid for `len` writes; `out` must not overlap the inputs.
#[no_mangle]
pub unsafe extern "C" fn haversine_udf_batch(
    x0: *const f64,
    y0: *const f64,
    x1: *const f64,
    y1: *const f64,
    len: usize,
    out: *mut f64,
) -> i32 {
    if len == 0 {
        return STATUS_OK;
    }
    if x0.is_null() || y0.is_null() || x1.is_null() || y1.is_null() || out.is_null() {
        return STATUS_NULL_POINTER;
    }

    let x0 = std::slice::from_raw_parts(x0, len);
    let y0 = std::slice::from_raw_parts(y0, len);
    let x1 = std::slice::from_raw_parts(x1, len);
    let y1 = std::slice::from_raw_parts(y1, len);
    let out = std::slice::from_raw_parts_mut(out, len);

    let rows = x0.iter().zip(y0).zip(x1).zip(y1).zip(out.iter_mut());
    for ((((&x0, &y0), &x1), &y1), slot) in rows {
        *slot = haversine(x0, y0, x1, y1);
    }
    STATUS_OK
}

static LINKED_ABI: HaversineAbi = HaversineAbi {
    version: ABI_VERSION,
    scalar: haversine_udf_scalar,
    batch: haversine_udf_batch,
};

/// Function table of the kernel linked into this library
#[no_mangle]
pub extern "C" fn haversine_udf_abi() -> *const HaversineAbi {
    &LINKED_ABI
}

/// Source of a native function table
pub trait NativeProvider: Send + Sync {
    /// Human-readable provider name, used in error messages
    fn name(&self) -> &str;

    /// The function table
    ///
    /// # Errors
    /// Returns `BackendUnavailable` if the provider cannot supply a table
    fn abi(&self) -> Result<&HaversineAbi>;
}

/// Provider for the kernel statically linked into this crate
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkedProvider;

impl NativeProvider for LinkedProvider {
    fn name(&self) -> &str {
        "linked"
    }

    fn abi(&self) -> Result<&HaversineAbi> {
        // SAFETY: haversine_udf_abi returns a pointer to a 'static table
        unsafe { haversine_udf_abi().as_ref() }
            .ok_or_else(|| unavailable("linked provider returned a null function table".to_string()))
    }
}

fn unavailable(reason: String) -> Error {
    Error::BackendUnavailable {
        method: Method::NativeFfi.to_string(),
        reason,
    }
}

/// Provider for a separately built shared library exporting `haversine_udf_abi`
///
/// The library stays loaded as long as the provider; the kernel holds the
/// provider, so function pointers copied out of the table never dangle.
#[cfg(feature = "dylib")]
pub struct SharedLibraryProvider {
    name: String,
    abi: HaversineAbi,
    _library: libloading::Library,
}

#[cfg(feature = "dylib")]
impl SharedLibraryProvider {
    /// Load `path` and resolve its function table
    ///
    /// # Errors
    /// Returns `BackendUnavailable` if the library cannot be opened, does not
    /// export `haversine_udf_abi`, or returns a null table
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let name = path.display().to_string();

        // SAFETY: loading runs the library's initializers; callers point this
        // at a haversine-udf cdylib (or another library honoring the ABI)
        let library = unsafe { libloading::Library::new(&path) }
            .map_err(|e| unavailable(format!("cannot load '{name}': {e}")))?;

        let abi = {
            // SAFETY: `haversine_udf_abi` is declared as
            // `extern "C" fn() -> *const HaversineAbi`
            let entry: libloading::Symbol<'_, unsafe extern "C" fn() -> *const HaversineAbi> =
                unsafe { library.get(ABI_SYMBOL) }
                    .map_err(|e| unavailable(format!("'{name}' does not export haversine_udf_abi: {e}")))?;
            // SAFETY: the table is 'static inside the loaded library, which
            // outlives the copy through `_library`
            unsafe { entry().as_ref() }
                .copied()
                .ok_or_else(|| unavailable(format!("'{name}' returned a null function table")))?
        };

        tracing::info!(library = %name, version = abi.version, "loaded native kernel");
        Ok(Self {
            name,
            abi,
            _library: library,
        })
    }
}

#[cfg(feature = "dylib")]
impl NativeProvider for SharedLibraryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn abi(&self) -> Result<&HaversineAbi> {
        Ok(&self.abi)
    }
}

/// Where the `native_ffi` function table comes from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeSource {
    /// The kernel linked into this crate
    #[default]
    Linked,
    /// A shared library loaded at runtime (needs the `dylib` feature)
    Library(PathBuf),
}

/// `native_ffi`: batch kernel calling through a [`HaversineAbi`] table
pub struct NativeKernel {
    provider: Arc<dyn NativeProvider>,
    abi: HaversineAbi,
}

impl NativeKernel {
    /// Kernel over the statically linked provider
    ///
    /// # Errors
    /// Returns `BackendUnavailable` on an ABI version mismatch
    pub fn linked() -> Result<Self> {
        Self::from_provider(Arc::new(LinkedProvider))
    }

    /// Kernel over the provider named by `source`
    ///
    /// # Errors
    /// Returns `BackendUnavailable` if the library cannot be loaded, the
    /// `dylib` feature is off, or the ABI version differs
    pub fn open(source: &NativeSource) -> Result<Self> {
        match source {
            NativeSource::Linked => Self::linked(),
            #[cfg(feature = "dylib")]
            NativeSource::Library(path) => {
                Self::from_provider(Arc::new(SharedLibraryProvider::open(path.clone())?))
            }
            #[cfg(not(feature = "dylib"))]
            NativeSource::Library(path) => Err(unavailable(format!(
                "cannot load '{}': built without the dylib feature",
                path.display()
            ))),
        }
    }

    /// Kernel over an arbitrary provider, checking its ABI version
    ///
    /// # Errors
    /// Returns `BackendUnavailable` if the provider has no table or its
    /// version differs from [`ABI_VERSION`]
    pub fn from_provider(provider: Arc<dyn NativeProvider>) -> Result<Self> {
        let abi = *provider.abi()?;
        if abi.version != ABI_VERSION {
            return Err(unavailable(format!(
                "provider '{}' exports ABI version {}, expected {}",
                provider.name(),
                abi.version,
                ABI_VERSION
            )));
        }
        Ok(Self { provider, abi })
    }

    /// Name of the provider backing this kernel
    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Single-row call through the table
    #[must_use]
    pub fn scalar(&self, x0: f64, y0: f64, x1: f64, y1: f64) -> f64 {
        (self.abi.scalar)(x0, y0, x1, y1)
    }
}

impl BatchKernel for NativeKernel {
    fn method(&self) -> Method {
        Method::NativeFfi
    }

    fn compute(&self, batch: &ColumnBatch<'_>, out: &mut [f64]) -> Result<()> {
        batch.check_output(out)?;

        // SAFETY: all inputs and `out` hold exactly `batch.len()` elements
        // (ColumnBatch can only be built through try_new, `out` checked above)
        let status = unsafe {
            (self.abi.batch)(
                batch.x0().as_ptr(),
                batch.y0().as_ptr(),
                batch.x1().as_ptr(),
                batch.y1().as_ptr(),
                batch.len(),
                out.as_mut_ptr(),
            )
        };
        if status == STATUS_OK {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "native provider '{}' returned status {status}",
                self.provider.name()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FutureProvider(HaversineAbi);

    impl NativeProvider for FutureProvider {
        fn name(&self) -> &str {
            "future"
        }

        fn abi(&self) -> Result<&HaversineAbi> {
            Ok(&self.0)
        }
    }

    #[test]
    fn test_linked_kernel_matches_formula() {
        let kernel = NativeKernel::linked().unwrap();
        assert_eq!(kernel.provider_name(), "linked");

        let x0 = [0.0, -86.67, 10.0];
        let y0 = [0.0, 36.12, 10.0];
        let x1 = [0.0, -118.40, 10.0];
        let y1 = [1.0, 33.94, 10.0];
        let batch = ColumnBatch::try_new(&x0, &y0, &x1, &y1).unwrap();
        let mut out = [f64::NAN; 3];
        kernel.compute(&batch, &mut out).unwrap();

        for i in 0..3 {
            assert_eq!(out[i], haversine(x0[i], y0[i], x1[i], y1[i]));
        }
        assert_eq!(out[2], 0.0);
        assert_eq!(kernel.scalar(0.0, 0.0, 0.0, 1.0), out[0]);
    }

    #[test]
    fn test_version_mismatch_is_unavailable() {
        let mut abi = LINKED_ABI;
        abi.version = ABI_VERSION + 1;
        let err = NativeKernel::from_provider(Arc::new(FutureProvider(abi)))
            .err()
            .unwrap();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("ABI version 2"));
    }

    #[test]
    fn test_batch_entry_rejects_null_pointers() {
        let mut out = [0.0; 2];
        let x = [1.0, 2.0];
        // SAFETY: null inputs are checked before any read
        let status = unsafe {
            haversine_udf_batch(
                std::ptr::null(),
                x.as_ptr(),
                x.as_ptr(),
                x.as_ptr(),
                2,
                out.as_mut_ptr(),
            )
        };
        assert_eq!(status, STATUS_NULL_POINTER);

        // zero rows never dereference
        let status = unsafe {
            haversine_udf_batch(
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
                0,
                std::ptr::null_mut(),
            )
        };
        assert_eq!(status, STATUS_OK);
    }

    #[test]
    fn test_linked_source_opens_linked_kernel() {
        let kernel = NativeKernel::open(&NativeSource::Linked).unwrap();
        assert_eq!(kernel.provider_name(), "linked");
    }

    #[test]
    fn test_missing_library_is_unavailable() {
        let source = NativeSource::Library(PathBuf::from("/definitely/not/libhaversine_udf.so"));
        let err = NativeKernel::open(&source).err().unwrap();
        assert!(matches!(err, Error::BackendUnavailable { .. }), "{err}");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("/definitely/not"));
    }

    #[test]
    fn test_short_output_rejected() {
        let kernel = NativeKernel::linked().unwrap();
        let col = [1.0, 2.0, 3.0];
        let batch = ColumnBatch::try_new(&col, &col, &col, &col).unwrap();
        let mut out = [0.0; 2];
        let err = kernel.compute(&batch, &mut out).unwrap_err();
        assert!(matches!(err, Error::DataShapeError(_)));
    }

    #[test]
    fn test_exported_table_is_current_version() {
        // SAFETY: static table
        let abi = unsafe { &*haversine_udf_abi() };
        assert_eq!(abi.version, ABI_VERSION);
        assert_eq!((abi.scalar)(1.0, 1.0, 1.0, 1.0), 0.0);
    }
}
