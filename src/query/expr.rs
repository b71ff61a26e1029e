//! Scalar expressions over `Float64` columns
//!
//! Converted from the sqlparser AST and evaluated column-at-a-time with Arrow
//! compute kernels. Nulls propagate through every operator and function.

use super::functions::FunctionCatalog;
use crate::{Error, Result};
use arrow::array::{Array, ArrayRef, Float64Array};
use arrow::compute::kernels::numeric;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, UnaryOperator, Value,
};
use std::fmt;
use std::sync::Arc;

/// Arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
}

impl ArithmeticOp {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }
}

/// Expression producing one `f64` per row
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    /// Column reference
    Column(String),
    /// Numeric literal
    Literal(f64),
    /// `left op right`
    Binary {
        /// Left operand
        left: Box<ScalarExpr>,
        /// Operator
        op: ArithmeticOp,
        /// Right operand
        right: Box<ScalarExpr>,
    },
    /// `-expr`
    Negate(Box<ScalarExpr>),
    /// Call of a catalog function
    Function {
        /// Function name as written
        name: String,
        /// Arguments
        args: Vec<ScalarExpr>,
    },
}

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(name) => f.write_str(name),
            Self::Literal(v) => write!(f, "{v}"),
            Self::Binary { left, op, right } => write!(f, "({left} {} {right})", op.symbol()),
            Self::Negate(e) => write!(f, "-{e}"),
            Self::Function { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Positional, unnamed expression arguments of a function call
///
/// # Errors
/// Returns `ParseError` for named, wildcard or DISTINCT arguments
pub(crate) fn function_args(args: &FunctionArguments) -> Result<Vec<&Expr>> {
    match args {
        FunctionArguments::None => Ok(Vec::new()),
        FunctionArguments::Subquery(_) => Err(Error::ParseError(
            "Subquery arguments not supported".to_string(),
        )),
        FunctionArguments::List(list) => {
            if list.duplicate_treatment.is_some() {
                return Err(Error::ParseError(
                    "DISTINCT/ALL in function arguments not supported".to_string(),
                ));
            }
            list.args
                .iter()
                .map(|arg| match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Ok(e),
                    other => Err(Error::ParseError(format!(
                        "Unsupported function argument: {other}"
                    ))),
                })
                .collect()
        }
    }
}

impl ScalarExpr {
    /// Convert a sqlparser expression
    ///
    /// # Errors
    /// Returns `ParseError` for anything outside arithmetic, numeric literals,
    /// column references and plain function calls
    pub fn from_sql(expr: &Expr) -> Result<Self> {
        match expr {
            Expr::Identifier(ident) => Ok(Self::Column(ident.value.clone())),
            Expr::CompoundIdentifier(parts) => parts
                .last()
                .map(|ident| Self::Column(ident.value.clone()))
                .ok_or_else(|| Error::ParseError("Empty identifier".to_string())),
            Expr::Value(Value::Number(n, _)) => n
                .parse::<f64>()
                .map(Self::Literal)
                .map_err(|e| Error::ParseError(format!("Invalid numeric literal {n}: {e}"))),
            Expr::Nested(inner) => Self::from_sql(inner),
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => Ok(match Self::from_sql(expr)? {
                Self::Literal(v) => Self::Literal(-v),
                e => Self::Negate(Box::new(e)),
            }),
            Expr::UnaryOp {
                op: UnaryOperator::Plus,
                expr,
            } => Self::from_sql(expr),
            Expr::BinaryOp { left, op, right } => {
                let op = match op {
                    BinaryOperator::Plus => ArithmeticOp::Add,
                    BinaryOperator::Minus => ArithmeticOp::Sub,
                    BinaryOperator::Multiply => ArithmeticOp::Mul,
                    BinaryOperator::Divide => ArithmeticOp::Div,
                    other => {
                        return Err(Error::ParseError(format!(
                            "Unsupported operator: {other}"
                        )))
                    }
                };
                Ok(Self::Binary {
                    left: Box::new(Self::from_sql(left)?),
                    op,
                    right: Box::new(Self::from_sql(right)?),
                })
            }
            Expr::Function(func) => {
                if func.over.is_some() || func.filter.is_some() {
                    return Err(Error::ParseError(format!(
                        "Window/FILTER clauses not supported: {func}"
                    )));
                }
                let args = function_args(&func.args)?
                    .into_iter()
                    .map(Self::from_sql)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::Function {
                    name: func.name.to_string(),
                    args,
                })
            }
            other => Err(Error::ParseError(format!(
                "Unsupported expression: {other}"
            ))),
        }
    }

    /// Check function names and argument counts against `catalog`
    ///
    /// # Errors
    /// Returns `InvalidInput` for unknown functions or wrong arity
    pub fn validate(&self, catalog: &FunctionCatalog) -> Result<()> {
        match self {
            Self::Column(_) | Self::Literal(_) => Ok(()),
            Self::Negate(e) => e.validate(catalog),
            Self::Binary { left, right, .. } => {
                left.validate(catalog)?;
                right.validate(catalog)
            }
            Self::Function { name, args } => {
                catalog.check_call(name, args.len())?;
                args.iter().try_for_each(|a| a.validate(catalog))
            }
        }
    }

    /// Evaluate against one record batch
    ///
    /// # Errors
    /// Returns `InvalidInput` for missing or non-`Float64` columns and
    /// propagates function failures
    pub fn evaluate(&self, batch: &RecordBatch, catalog: &FunctionCatalog) -> Result<ArrayRef> {
        match self {
            Self::Column(name) => {
                let column = batch
                    .column_by_name(name)
                    .ok_or_else(|| Error::InvalidInput(format!("Column not found: {name}")))?;
                if column.data_type() != &DataType::Float64 {
                    return Err(Error::InvalidInput(format!(
                        "Column {name} has type {}, expected Float64",
                        column.data_type()
                    )));
                }
                Ok(Arc::clone(column))
            }
            Self::Literal(v) => Ok(Arc::new(Float64Array::from_value(*v, batch.num_rows()))),
            Self::Negate(e) => {
                let v = e.evaluate(batch, catalog)?;
                Ok(numeric::neg(&v)?)
            }
            Self::Binary { left, op, right } => {
                let l = left.evaluate(batch, catalog)?;
                let r = right.evaluate(batch, catalog)?;
                let out = match op {
                    ArithmeticOp::Add => numeric::add(&l, &r)?,
                    ArithmeticOp::Sub => numeric::sub(&l, &r)?,
                    ArithmeticOp::Mul => numeric::mul(&l, &r)?,
                    ArithmeticOp::Div => numeric::div(&l, &r)?,
                };
                Ok(out)
            }
            Self::Function { name, args } => {
                let function = catalog.check_call(name, args.len())?;
                let args = args
                    .iter()
                    .map(|a| a.evaluate(batch, catalog))
                    .collect::<Result<Vec<_>>>()?;
                let out = function.invoke(&args)?;
                if out.len() != batch.num_rows() {
                    return Err(Error::DataShapeError(format!(
                        "function {name} returned {} rows for a batch of {}",
                        out.len(),
                        batch.num_rows()
                    )));
                }
                Ok(out)
            }
        }
    }
}

/// Downcast an evaluated argument to `Float64Array`
///
/// # Errors
/// Returns `InvalidInput` if the array is not `Float64`
pub fn as_f64<'a>(array: &'a ArrayRef, context: &str) -> Result<&'a Float64Array> {
    array
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "{context}: expected Float64 argument, got {}",
                array.data_type()
            ))
        })
}
