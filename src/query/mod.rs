//! Query parsing and execution
//!
//! ## SQL Subset
//!
//! Single-table analytics over `Float64` columns:
//! - `SELECT <items> FROM <table>`
//! - items are either all aggregates (`AVG`, `SUM`, `COUNT`, `COUNT(*)`) or
//!   all scalar expressions (one output row per input row)
//! - scalar expressions: column references, numeric literals, `+ - * /`,
//!   unary minus, calls of catalog functions
//!
//! WHERE, GROUP BY, HAVING, ORDER BY, LIMIT, DISTINCT and JOINs are rejected
//! with `ParseError`.
//!
//! References:
//! - sqlparser-rs: <https://docs.rs/sqlparser>

pub mod aggregate;
pub mod executor;
pub mod expr;
pub mod functions;

pub use aggregate::{AggregateFunction, AggregateState};
pub use executor::QueryExecutor;
pub use expr::ScalarExpr;
pub use functions::{FunctionCatalog, Signature, VectorizedFunction};

use crate::{Error, Result};
use sqlparser::ast::{Expr, GroupByExpr, Query, Select, SelectItem, SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// One aggregate in the SELECT list
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateItem {
    /// Aggregation function
    pub function: AggregateFunction,
    /// Argument, `None` for `COUNT(*)`
    pub arg: Option<ScalarExpr>,
    /// Output column name
    pub name: String,
}

/// One scalar expression in the SELECT list
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionItem {
    /// Expression
    pub expr: ScalarExpr,
    /// Output column name
    pub name: String,
}

/// What the SELECT list computes
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// One output row reduced over the whole relation
    Aggregates(Vec<AggregateItem>),
    /// One output row per input row
    Scalars(Vec<ProjectionItem>),
}

/// Parsed SQL query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Table name
    pub table: String,
    /// SELECT list
    pub projection: Projection,
}

impl QueryPlan {
    /// Check that the query reads `table` (case-insensitive)
    ///
    /// # Errors
    /// Returns `InvalidInput` naming both tables
    pub fn check_table(&self, table: &str) -> Result<()> {
        if self.table.eq_ignore_ascii_case(table) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "Table not found: {} (registered table: {table})",
                self.table
            )))
        }
    }

    /// Validate every function call against `catalog`
    ///
    /// # Errors
    /// Returns `InvalidInput` for unknown functions or wrong arity
    pub fn validate(&self, catalog: &FunctionCatalog) -> Result<()> {
        match &self.projection {
            Projection::Aggregates(items) => items
                .iter()
                .filter_map(|item| item.arg.as_ref())
                .try_for_each(|e| e.validate(catalog)),
            Projection::Scalars(items) => items.iter().try_for_each(|i| i.expr.validate(catalog)),
        }
    }
}

/// SQL parser
pub struct QueryEngine {
    dialect: GenericDialect,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryEngine {
    /// Create a new query engine
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dialect: GenericDialect {},
        }
    }

    /// Parse SQL query into query plan
    ///
    /// # Errors
    /// Returns `ParseError` if:
    /// - SQL syntax is invalid
    /// - Query uses unsupported features (filters, grouping, JOINs, ...)
    /// - Multiple statements provided
    ///
    /// # Example
    /// ```
    /// use haversine_udf::query::{Projection, QueryEngine};
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let engine = QueryEngine::new();
    /// let plan = engine.parse("SELECT AVG(x0 - x1) AS d FROM points")?;
    /// assert_eq!(plan.table, "points");
    /// assert!(matches!(plan.projection, Projection::Aggregates(_)));
    /// # Ok(())
    /// # }
    /// ```
    pub fn parse(&self, sql: &str) -> Result<QueryPlan> {
        let statements = Parser::parse_sql(&self.dialect, sql)
            .map_err(|e| Error::ParseError(format!("SQL parse error: {e}")))?;

        if statements.len() != 1 {
            return Err(Error::ParseError(
                "Only single statements supported".to_string(),
            ));
        }

        let Statement::Query(query) = &statements[0] else {
            return Err(Error::ParseError("Only SELECT queries supported".to_string()));
        };

        Self::parse_select_query(query)
    }

    fn parse_select_query(query: &Query) -> Result<QueryPlan> {
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(Error::ParseError("Only SELECT queries supported".to_string()));
        };

        let unsupported =
            |what: &str| -> Result<QueryPlan> { Err(Error::ParseError(format!("{what} not supported"))) };
        if query.with.is_some() {
            return unsupported("WITH");
        }
        if query.order_by.is_some() {
            return unsupported("ORDER BY");
        }
        if query.limit.is_some() || query.offset.is_some() || query.fetch.is_some() {
            return unsupported("LIMIT/OFFSET");
        }
        if select.distinct.is_some() {
            return unsupported("DISTINCT");
        }
        if select.selection.is_some() {
            return unsupported("WHERE");
        }
        if select.having.is_some() {
            return unsupported("HAVING");
        }
        match &select.group_by {
            GroupByExpr::Expressions(exprs, _) if exprs.is_empty() => {}
            _ => return unsupported("GROUP BY"),
        }

        let table = Self::extract_table_name(select)?;
        let projection = Self::extract_projection(&select.projection)?;
        Ok(QueryPlan { table, projection })
    }

    fn extract_table_name(select: &Select) -> Result<String> {
        match select.from.as_slice() {
            [] => Err(Error::ParseError("FROM clause required".to_string())),
            [table_with_joins] => {
                if !table_with_joins.joins.is_empty() {
                    return Err(Error::ParseError("JOINs not supported".to_string()));
                }
                Ok(table_with_joins.relation.to_string())
            }
            _ => Err(Error::ParseError("Multiple tables not supported".to_string())),
        }
    }

    fn extract_projection(items: &[SelectItem]) -> Result<Projection> {
        let mut aggregates = Vec::new();
        let mut scalars = Vec::new();

        for item in items {
            let (expr, alias) = match item {
                SelectItem::UnnamedExpr(expr) => (expr, None),
                SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.clone())),
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {
                    return Err(Error::ParseError(
                        "Wildcards not supported; list the expressions".to_string(),
                    ))
                }
            };
            let name = alias.unwrap_or_else(|| expr.to_string());

            if let Some((function, arg)) = Self::extract_aggregate(expr)? {
                aggregates.push(AggregateItem {
                    function,
                    arg,
                    name,
                });
            } else {
                scalars.push(ProjectionItem {
                    expr: ScalarExpr::from_sql(expr)?,
                    name,
                });
            }
        }

        match (aggregates.is_empty(), scalars.is_empty()) {
            (false, true) => Ok(Projection::Aggregates(aggregates)),
            (true, false) => Ok(Projection::Scalars(scalars)),
            (false, false) => Err(Error::ParseError(
                "Mixing aggregates and per-row expressions requires GROUP BY (not supported)"
                    .to_string(),
            )),
            (true, true) => Err(Error::ParseError("Empty SELECT list".to_string())),
        }
    }

    fn extract_aggregate(expr: &Expr) -> Result<Option<(AggregateFunction, Option<ScalarExpr>)>> {
        let Expr::Function(func) = expr else {
            return Ok(None);
        };
        let Some(function) = AggregateFunction::from_name(&func.name.to_string()) else {
            return Ok(None);
        };
        if func.over.is_some() || func.filter.is_some() {
            return Err(Error::ParseError(format!(
                "Window/FILTER clauses not supported: {func}"
            )));
        }

        // COUNT(*)
        if let sqlparser::ast::FunctionArguments::List(list) = &func.args {
            if let [sqlparser::ast::FunctionArg::Unnamed(sqlparser::ast::FunctionArgExpr::Wildcard)] =
                list.args.as_slice()
            {
                return if function == AggregateFunction::Count {
                    Ok(Some((function, None)))
                } else {
                    Err(Error::ParseError(format!("{func}: only COUNT accepts *")))
                };
            }
        }

        let args = expr::function_args(&func.args)?;
        let [arg] = args.as_slice() else {
            return Err(Error::ParseError(format!(
                "{func}: aggregates take exactly one argument"
            )));
        };
        if matches!(arg, Expr::Function(inner) if AggregateFunction::from_name(&inner.name.to_string()).is_some())
        {
            return Err(Error::ParseError(format!("Nested aggregates not supported: {func}")));
        }
        Ok(Some((function, Some(ScalarExpr::from_sql(arg)?))))
    }
}
