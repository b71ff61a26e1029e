//! Function catalog
//!
//! Case-insensitive name → vectorized function. Built-in math functions are
//! always present; the batch execution bridge registers the distance
//! function alongside them.

use super::expr::as_f64;
use crate::{Error, Result};
use arrow::array::{ArrayRef, Float64Array};
use arrow::compute::kernels::arity::binary;
use arrow::datatypes::{DataType, Float64Type};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Declared argument and result types of a function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    /// Exactly these argument types
    Exact(Vec<DataType>),
    /// At least `min` arguments of one type
    Variadic {
        /// Argument type
        arg: DataType,
        /// Minimum argument count
        min: usize,
    },
}

impl Signature {
    /// `n` `Float64` arguments
    #[must_use]
    pub fn float64(n: usize) -> Self {
        Self::Exact(vec![DataType::Float64; n])
    }

    /// True if a call with `n` arguments is well-formed
    #[must_use]
    pub fn accepts(&self, n: usize) -> bool {
        match self {
            Self::Exact(args) => args.len() == n,
            Self::Variadic { min, .. } => n >= *min,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Exact(args) => format!("{} argument(s)", args.len()),
            Self::Variadic { min, .. } => format!("at least {min} argument(s)"),
        }
    }
}

/// Function that maps whole columns to a whole column
pub trait VectorizedFunction: Send + Sync {
    /// Name the function is registered under
    fn name(&self) -> &str;

    /// Declared argument types
    fn signature(&self) -> Signature;

    /// Result type
    fn return_type(&self) -> DataType {
        DataType::Float64
    }

    /// Apply to one batch of argument columns (all of equal length)
    ///
    /// # Errors
    /// Implementation-defined; surfaced to the query caller unchanged
    fn invoke(&self, args: &[ArrayRef]) -> Result<ArrayRef>;
}

#[derive(Clone, Copy)]
enum MathKind {
    Unary(fn(f64) -> f64),
    Binary(fn(f64, f64) -> f64),
    Fold(fn(f64, f64) -> f64),
}

/// Built-in `f64` math function
struct MathFunction {
    name: &'static str,
    kind: MathKind,
}

impl VectorizedFunction for MathFunction {
    fn name(&self) -> &str {
        self.name
    }

    fn signature(&self) -> Signature {
        match self.kind {
            MathKind::Unary(_) => Signature::float64(1),
            MathKind::Binary(_) => Signature::float64(2),
            MathKind::Fold(_) => Signature::Variadic {
                arg: DataType::Float64,
                min: 1,
            },
        }
    }

    fn invoke(&self, args: &[ArrayRef]) -> Result<ArrayRef> {
        if !self.signature().accepts(args.len()) {
            return Err(Error::InvalidInput(format!(
                "function {} called with {} argument(s)",
                self.name,
                args.len()
            )));
        }
        let out: Float64Array = match self.kind {
            MathKind::Unary(f) => as_f64(&args[0], self.name)?.unary::<_, Float64Type>(f),
            MathKind::Binary(f) => {
                binary(as_f64(&args[0], self.name)?, as_f64(&args[1], self.name)?, f)?
            }
            MathKind::Fold(f) => {
                let mut acc = as_f64(&args[0], self.name)?.clone();
                for arg in &args[1..] {
                    acc = binary(&acc, as_f64(arg, self.name)?, f)?;
                }
                acc
            }
        };
        Ok(Arc::new(out))
    }
}

fn least(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

fn greatest(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

const BUILTINS: [(&str, MathKind); 12] = [
    ("radians", MathKind::Unary(f64::to_radians)),
    ("degrees", MathKind::Unary(f64::to_degrees)),
    ("sin", MathKind::Unary(f64::sin)),
    ("cos", MathKind::Unary(f64::cos)),
    ("asin", MathKind::Unary(f64::asin)),
    ("sqrt", MathKind::Unary(f64::sqrt)),
    ("abs", MathKind::Unary(f64::abs)),
    ("pow", MathKind::Binary(f64::powf)),
    ("power", MathKind::Binary(f64::powf)),
    ("atan2", MathKind::Binary(f64::atan2)),
    ("least", MathKind::Fold(least)),
    ("greatest", MathKind::Fold(greatest)),
];

/// Registered functions, keyed by lower-cased name
pub struct FunctionCatalog {
    functions: FxHashMap<String, Arc<dyn VectorizedFunction>>,
}

impl FunctionCatalog {
    /// Catalog without any function
    #[must_use]
    pub fn empty() -> Self {
        Self {
            functions: FxHashMap::default(),
        }
    }

    /// Catalog with the built-in math functions
    ///
    /// `least`/`greatest` return NULL if any argument is NULL and NaN if any
    /// argument is NaN, so a missing coordinate never turns into a bound.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut catalog = Self::empty();
        for (name, kind) in BUILTINS {
            catalog
                .functions
                .insert(name.to_string(), Arc::new(MathFunction { name, kind }));
        }
        catalog
    }

    /// Register a function under its own name
    ///
    /// # Errors
    /// Returns `InvalidInput` if the name is taken or the signature declares
    /// no arguments
    pub fn register(&mut self, function: Arc<dyn VectorizedFunction>) -> Result<()> {
        let key = function.name().to_lowercase();
        if key.is_empty() {
            return Err(Error::InvalidInput("function name must not be empty".to_string()));
        }
        if let Signature::Exact(args) = function.signature() {
            if args.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "function {key} must declare at least one argument"
                )));
            }
        }
        if self.functions.contains_key(&key) {
            return Err(Error::InvalidInput(format!(
                "function {key} is already registered"
            )));
        }

        tracing::debug!(function = %key, signature = ?function.signature(), "registered function");
        self.functions.insert(key, function);
        Ok(())
    }

    /// Look up a function (case-insensitive)
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn VectorizedFunction>> {
        self.functions.get(&name.to_lowercase())
    }

    /// Resolve `name` and check that it accepts `arity` arguments
    ///
    /// # Errors
    /// Returns `InvalidInput` for unknown functions or wrong arity
    pub fn check_call(&self, name: &str, arity: usize) -> Result<&Arc<dyn VectorizedFunction>> {
        let function = self
            .get(name)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown function: {name}")))?;
        let signature = function.signature();
        if !signature.accepts(arity) {
            return Err(Error::InvalidInput(format!(
                "function {name} expects {}, got {arity}",
                signature.describe()
            )));
        }
        Ok(function)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for FunctionCatalog {
    fn default() -> Self {
        Self::with_builtins()
    }
}
