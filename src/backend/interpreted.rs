//! Interpreted scalar backend (baseline reference)
//!
//! Walks [`crate::formula::Expr`] once per row. Slow by construction; every
//! other backend is checked against it.

use super::{Method, RowFn, ScalarKernel};
use crate::formula::{haversine_expr, Expr};
use crate::Result;
use std::sync::Arc;

/// Tree-walking interpreter over the haversine expression
pub struct InterpretedKernel {
    expr: Arc<Expr>,
}

impl InterpretedKernel {
    /// Create an interpreter for the haversine formula
    #[must_use]
    pub fn new() -> Self {
        Self::with_expr(haversine_expr())
    }

    /// Create an interpreter for an arbitrary formula tree
    #[must_use]
    pub fn with_expr(expr: Expr) -> Self {
        Self {
            expr: Arc::new(expr),
        }
    }

    /// Evaluate one row
    #[must_use]
    pub fn eval(&self, x0: f64, y0: f64, x1: f64, y1: f64) -> f64 {
        self.expr.eval(&[x0, y0, x1, y1])
    }
}

impl Default for InterpretedKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalarKernel for InterpretedKernel {
    fn method(&self) -> Method {
        Method::Scalar
    }

    fn row_fn(&self) -> Result<RowFn> {
        let expr = Arc::clone(&self.expr);
        Ok(Arc::new(move |x0, y0, x1, y1| expr.eval(&[x0, y0, x1, y1])))
    }
}
