//! Backend registry and dispatcher
//!
//! Probed once at startup: every backend whose prerequisite is missing is
//! logged and left out. The string surface ends here; past [`Registry::dispatch`]
//! everything is a [`Method`] or a trait object.
//!
//! Kernel instances (and therefore their compiled-artifact caches) live as
//! long as the registry, so a compiled backend builds at most once per registry.

use super::interpreted::InterpretedKernel;
use super::native::{NativeKernel, NativeSource};
use super::vectorized::VectorizedKernel;
use super::{BackendDescriptor, BatchKernel, ColumnBatch, Method, ScalarKernel};
use crate::{Error, Result};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// What the bridge should do for a resolved method
#[derive(Clone)]
pub enum Dispatch {
    /// Register this kernel as the distance function
    Udf(Arc<dyn BatchKernel>),
    /// Evaluate the formula with the engine's own SQL functions
    NativeSql,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udf(kernel) => f.debug_tuple("Udf").field(&kernel.method()).finish(),
            Self::NativeSql => f.write_str("NativeSql"),
        }
    }
}

/// Wraps a scalar kernel in a per-row loop so it has the batch call shape
pub struct ScalarAdapter {
    kernel: Arc<dyn ScalarKernel>,
}

impl ScalarAdapter {
    /// Adapt `kernel`
    #[must_use]
    pub fn new(kernel: Arc<dyn ScalarKernel>) -> Self {
        Self { kernel }
    }
}

impl BatchKernel for ScalarAdapter {
    fn method(&self) -> Method {
        self.kernel.method()
    }

    fn compute(&self, batch: &ColumnBatch<'_>, out: &mut [f64]) -> Result<()> {
        batch.check_output(out)?;
        let row = self.kernel.row_fn()?;
        for (i, slot) in out.iter_mut().enumerate() {
            let [x0, y0, x1, y1] = batch.row(i);
            *slot = row(x0, y0, x1, y1);
        }
        Ok(())
    }
}

const fn always() -> bool {
    true
}

fn jit_available() -> bool {
    #[cfg(feature = "jit")]
    {
        super::jit::is_available()
    }
    #[cfg(not(feature = "jit"))]
    {
        false
    }
}

fn gpu_available() -> bool {
    #[cfg(feature = "gpu")]
    {
        crate::gpu::is_available()
    }
    #[cfg(not(feature = "gpu"))]
    {
        false
    }
}

/// Descriptors for every backend this crate knows about
#[must_use]
pub fn default_descriptors() -> Vec<BackendDescriptor> {
    Method::ALL
        .into_iter()
        .map(|method| {
            let probe: fn() -> bool = match method {
                Method::ScalarCompiled | Method::VectorizedCompiled => jit_available,
                Method::Gpu => gpu_available,
                Method::Scalar | Method::Vectorized | Method::NativeFfi | Method::Sql => always,
            };
            BackendDescriptor::new(method, probe)
        })
        .collect()
}

fn build_kernel(method: Method, native: &NativeSource) -> Result<Option<Arc<dyn BatchKernel>>> {
    let kernel: Arc<dyn BatchKernel> = match method {
        Method::Scalar => Arc::new(ScalarAdapter::new(Arc::new(InterpretedKernel::new()))),
        #[cfg(feature = "jit")]
        Method::ScalarCompiled => Arc::new(ScalarAdapter::new(Arc::new(
            super::jit::CompiledScalarKernel::new(),
        ))),
        Method::Vectorized => Arc::new(VectorizedKernel::new()),
        #[cfg(feature = "jit")]
        Method::VectorizedCompiled => Arc::new(super::jit::CompiledVectorizedKernel::new()),
        #[cfg(feature = "gpu")]
        Method::Gpu => Arc::new(crate::gpu::GpuKernel::new()),
        Method::NativeFfi => Arc::new(NativeKernel::open(native)?),
        Method::Sql => return Ok(None),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(Error::BackendUnavailable {
                method: method.to_string(),
                reason: "backend not compiled into this build".to_string(),
            })
        }
    };
    Ok(Some(kernel))
}

/// Method id → backend mapping for this process
pub struct Registry {
    available: Vec<Method>,
    kernels: FxHashMap<Method, Arc<dyn BatchKernel>>,
}

impl Registry {
    /// Probe every known backend on this host
    #[must_use]
    pub fn probe() -> Self {
        Self::from_descriptors(&default_descriptors())
    }

    /// Probe every known backend, taking `native_ffi` from `native`
    #[must_use]
    pub fn probe_with(native: &NativeSource) -> Self {
        Self::with_native(&default_descriptors(), native)
    }

    /// Build a registry from explicit descriptors
    ///
    /// Descriptors whose availability probe fails, or whose kernel cannot be
    /// constructed, are excluded with a warning.
    #[must_use]
    pub fn from_descriptors(descriptors: &[BackendDescriptor]) -> Self {
        Self::with_native(descriptors, &NativeSource::Linked)
    }

    /// Same as [`Registry::from_descriptors`] with an explicit native source
    ///
    /// A library that fails to load excludes `native_ffi`; it never falls
    /// back to the linked kernel.
    #[must_use]
    pub fn with_native(descriptors: &[BackendDescriptor], native: &NativeSource) -> Self {
        let mut available = Vec::with_capacity(descriptors.len());
        let mut kernels = FxHashMap::default();

        for descriptor in descriptors {
            let method = descriptor.method;
            if !descriptor.is_available() {
                tracing::warn!(method = %method, "backend prerequisite missing, excluded");
                continue;
            }
            match build_kernel(method, native) {
                Ok(Some(kernel)) => {
                    kernels.insert(method, kernel);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(method = %method, error = %e, "backend excluded");
                    continue;
                }
            }
            available.push(method);
        }
        available.sort_unstable();
        available.dedup();

        tracing::info!(
            methods = %available.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(","),
            "backend registry ready"
        );

        Self { available, kernels }
    }

    /// Install `kernel` for its method, replacing the built-in one
    ///
    /// The method becomes available even if its probe failed.
    #[must_use]
    pub fn with_kernel(mut self, kernel: Arc<dyn BatchKernel>) -> Self {
        let method = kernel.method();
        tracing::info!(method = %method, "custom kernel installed");
        self.kernels.insert(method, kernel);
        if let Err(pos) = self.available.binary_search(&method) {
            self.available.insert(pos, method);
        }
        self
    }

    /// Methods selectable on this host, in canonical order
    #[must_use]
    pub fn available_methods(&self) -> &[Method] {
        &self.available
    }

    /// True if `method` passed its probe
    #[must_use]
    pub fn is_available(&self, method: Method) -> bool {
        self.available.binary_search(&method).is_ok()
    }

    fn available_list(&self) -> String {
        self.available
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Map an identifier to an available method
    ///
    /// # Errors
    /// - `UnknownMethod` if `id` names no backend
    /// - `BackendUnavailable` if the backend was excluded at startup
    pub fn resolve(&self, id: &str) -> Result<Method> {
        let method = id.parse::<Method>().map_err(|_| Error::UnknownMethod {
            method: id.to_string(),
            available: self.available_list(),
        })?;

        if !self.is_available(method) {
            return Err(Error::BackendUnavailable {
                method: method.to_string(),
                reason: format!(
                    "excluded at startup; available methods: {}",
                    self.available_list()
                ),
            });
        }
        Ok(method)
    }

    /// Resolve `id` to what the bridge should register
    ///
    /// # Errors
    /// Same as [`Registry::resolve`]
    pub fn dispatch(&self, id: &str) -> Result<Dispatch> {
        let method = self.resolve(id)?;
        let dispatch = if method == Method::Sql {
            Dispatch::NativeSql
        } else {
            Dispatch::Udf(self.kernel(method)?)
        };
        tracing::info!(method = %method, shape = ?method.call_shape(), "resolved method");
        Ok(dispatch)
    }

    /// Batch-shaped kernel for an available method
    ///
    /// # Errors
    /// Returns `BackendUnavailable` for unavailable methods and for `sql`,
    /// which has no kernel
    pub fn kernel(&self, method: Method) -> Result<Arc<dyn BatchKernel>> {
        self.kernels
            .get(&method)
            .cloned()
            .ok_or_else(|| Error::BackendUnavailable {
                method: method.to_string(),
                reason: "no batch kernel registered for this method".to_string(),
            })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::probe()
    }
}
