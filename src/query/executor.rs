//! Query execution engine
//!
//! Pulls record batches from a [`BatchSource`] and evaluates a [`QueryPlan`]:
//! - aggregates: one [`AggregateState`] per item per batch, merged into the
//!   final row
//! - scalar projections: one output batch per input batch, concatenated in
//!   input order
//!
//! Sequential execution streams batch by batch and merges left to right, so
//! results are bitwise reproducible. Parallel execution (rayon) drains the
//! source first, then evaluates batches on the pool and merges partial states
//! as a tree; the average then only agrees up to floating-point rounding.

use super::{AggregateFunction, AggregateItem, AggregateState, FunctionCatalog, Projection, ProjectionItem, QueryPlan};
use crate::query::expr::as_f64;
use crate::storage::BatchSource;
use crate::{Error, Result};
use arrow::array::{ArrayRef, Float64Array, Int64Array, RecordBatch};
use arrow::compute;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use std::sync::Arc;
use std::time::Instant;

/// Query executor for parsed SQL queries
pub struct QueryExecutor<'a> {
    catalog: &'a FunctionCatalog,
    parallel: bool,
}

impl<'a> QueryExecutor<'a> {
    /// Create a sequential executor resolving functions in `catalog`
    #[must_use]
    pub const fn new(catalog: &'a FunctionCatalog) -> Self {
        Self {
            catalog,
            parallel: false,
        }
    }

    /// Evaluate batches on the rayon pool (no effect without the `rayon` feature)
    #[must_use]
    pub const fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Execute a query plan against a batch source
    ///
    /// Function names and arities are checked before the first batch is read.
    ///
    /// # Returns
    /// One row for aggregate queries, one row per input row otherwise
    ///
    /// # Errors
    /// Returns error if:
    /// - a function is unknown or called with the wrong arity
    /// - a column is missing or not `Float64`
    /// - the source or a function fails
    ///
    /// # Example
    /// ```rust
    /// use haversine_udf::query::{FunctionCatalog, QueryEngine, QueryExecutor};
    /// use haversine_udf::storage::StorageEngine;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let storage = StorageEngine::from_columns(
    ///     vec![0.0, 2.0], vec![0.0, 0.0], vec![1.0, 4.0], vec![0.0, 0.0],
    /// )?;
    /// let catalog = FunctionCatalog::with_builtins();
    /// let plan = QueryEngine::new().parse("SELECT AVG(x1 - x0) AS d FROM points")?;
    /// let result = QueryExecutor::new(&catalog).execute(&plan, &mut storage.morsels())?;
    /// assert_eq!(result.num_rows(), 1);
    /// # Ok(())
    /// # }
    /// ```
    pub fn execute(&self, plan: &QueryPlan, source: &mut dyn BatchSource) -> Result<RecordBatch> {
        plan.validate(self.catalog)?;
        let started = Instant::now();

        let result = match &plan.projection {
            Projection::Aggregates(items) => self.execute_aggregates(items, source)?,
            Projection::Scalars(items) => self.execute_projection(items, source)?,
        };

        tracing::debug!(
            table = %plan.table,
            parallel = self.parallel,
            output_rows = result.num_rows(),
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "query executed"
        );
        Ok(result)
    }

    fn drain(source: &mut dyn BatchSource) -> Result<Vec<RecordBatch>> {
        let mut batches = Vec::new();
        while let Some(batch) = source.next_batch()? {
            batches.push(batch);
        }
        Ok(batches)
    }

    fn use_pool(&self) -> bool {
        if self.parallel && !cfg!(feature = "rayon") {
            tracing::debug!("parallel execution requested without rayon, running sequentially");
        }
        self.parallel && cfg!(feature = "rayon")
    }

    /// Partial states of every aggregate over one batch
    fn partial_states(&self, items: &[AggregateItem], batch: &RecordBatch) -> Result<Vec<AggregateState>> {
        items
            .iter()
            .map(|item| {
                let mut state = AggregateState::new();
                match &item.arg {
                    None => state.update_rows(batch.num_rows()),
                    Some(expr) => {
                        let values = expr.evaluate(batch, self.catalog)?;
                        state.update(as_f64(&values, &item.name)?);
                    }
                }
                Ok(state)
            })
            .collect()
    }

    fn merge_states(left: Vec<AggregateState>, right: Vec<AggregateState>) -> Vec<AggregateState> {
        left.into_iter().zip(right).map(|(l, r)| l.merge(r)).collect()
    }

    fn execute_aggregates(&self, items: &[AggregateItem], source: &mut dyn BatchSource) -> Result<RecordBatch> {
        let identity = vec![AggregateState::new(); items.len()];

        let states = if self.use_pool() {
            let batches = Self::drain(source)?;
            self.parallel_states(items, &batches, identity)?
        } else {
            let mut states = identity;
            while let Some(batch) = source.next_batch()? {
                states = Self::merge_states(states, self.partial_states(items, &batch)?);
            }
            states
        };

        Self::finish_aggregates(items, &states)
    }

    #[cfg(feature = "rayon")]
    fn parallel_states(
        &self,
        items: &[AggregateItem],
        batches: &[RecordBatch],
        identity: Vec<AggregateState>,
    ) -> Result<Vec<AggregateState>> {
        use rayon::prelude::*;

        batches
            .par_iter()
            .map(|batch| self.partial_states(items, batch))
            .try_reduce(|| identity.clone(), |l, r| Ok(Self::merge_states(l, r)))
    }

    #[cfg(not(feature = "rayon"))]
    fn parallel_states(
        &self,
        items: &[AggregateItem],
        batches: &[RecordBatch],
        identity: Vec<AggregateState>,
    ) -> Result<Vec<AggregateState>> {
        batches.iter().try_fold(identity, |states, batch| {
            Ok(Self::merge_states(states, self.partial_states(items, batch)?))
        })
    }

    fn finish_aggregates(items: &[AggregateItem], states: &[AggregateState]) -> Result<RecordBatch> {
        let mut fields = Vec::with_capacity(items.len());
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(items.len());

        for (item, state) in items.iter().zip(states) {
            match item.function {
                AggregateFunction::Avg => {
                    fields.push(Field::new(&item.name, DataType::Float64, false));
                    columns.push(Arc::new(Float64Array::from(vec![state.mean()])));
                }
                AggregateFunction::Sum => {
                    // SQL: SUM over zero values is NULL
                    let sum = (state.count > 0).then_some(state.sum);
                    fields.push(Field::new(&item.name, DataType::Float64, true));
                    columns.push(Arc::new(Float64Array::from(vec![sum])));
                }
                AggregateFunction::Count => {
                    let count = i64::try_from(state.count).map_err(|_| {
                        Error::Other(format!("COUNT overflow: {}", state.count))
                    })?;
                    fields.push(Field::new(&item.name, DataType::Int64, false));
                    columns.push(Arc::new(Int64Array::from(vec![count])));
                }
            }
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
            .map_err(|e| Error::StorageError(format!("Failed to create result batch: {e}")))
    }

    fn projection_schema(items: &[ProjectionItem]) -> SchemaRef {
        Arc::new(Schema::new(
            items
                .iter()
                .map(|item| Field::new(&item.name, DataType::Float64, true))
                .collect::<Vec<_>>(),
        ))
    }

    fn project(&self, items: &[ProjectionItem], schema: &SchemaRef, batch: &RecordBatch) -> Result<RecordBatch> {
        let columns = items
            .iter()
            .map(|item| item.expr.evaluate(batch, self.catalog))
            .collect::<Result<Vec<_>>>()?;
        RecordBatch::try_new(Arc::clone(schema), columns)
            .map_err(|e| Error::StorageError(format!("Failed to project columns: {e}")))
    }

    fn execute_projection(&self, items: &[ProjectionItem], source: &mut dyn BatchSource) -> Result<RecordBatch> {
        let schema = Self::projection_schema(items);

        let outputs = if self.use_pool() {
            let batches = Self::drain(source)?;
            self.parallel_project(items, &schema, &batches)?
        } else {
            let mut outputs = Vec::new();
            while let Some(batch) = source.next_batch()? {
                outputs.push(self.project(items, &schema, &batch)?);
            }
            outputs
        };

        compute::concat_batches(&schema, &outputs)
            .map_err(|e| Error::StorageError(format!("Failed to combine batches: {e}")))
    }

    #[cfg(feature = "rayon")]
    fn parallel_project(
        &self,
        items: &[ProjectionItem],
        schema: &SchemaRef,
        batches: &[RecordBatch],
    ) -> Result<Vec<RecordBatch>> {
        use rayon::prelude::*;

        batches
            .par_iter()
            .map(|batch| self.project(items, schema, batch))
            .collect()
    }

    #[cfg(not(feature = "rayon"))]
    fn parallel_project(
        &self,
        items: &[ProjectionItem],
        schema: &SchemaRef,
        batches: &[RecordBatch],
    ) -> Result<Vec<RecordBatch>> {
        batches
            .iter()
            .map(|batch| self.project(items, schema, batch))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryEngine;
    use crate::storage::StorageEngine;
    use arrow::array::Array;

    #[allow(clippy::cast_precision_loss)]
    fn storage(n: usize) -> StorageEngine {
        StorageEngine::from_columns(
            (0..n).map(|i| i as f64).collect(),
            (0..n).map(|i| (i % 7) as f64).collect(),
            (0..n).map(|i| (i * 2) as f64).collect(),
            vec![1.0; n],
        )
        .unwrap()
    }

    fn run(sql: &str, storage: &StorageEngine, morsel: usize, parallel: bool) -> Result<RecordBatch> {
        let catalog = FunctionCatalog::with_builtins();
        let plan = QueryEngine::new().parse(sql)?;
        QueryExecutor::new(&catalog)
            .with_parallel(parallel)
            .execute(&plan, &mut storage.morsels_with_rows(morsel))
    }

    fn f64_at(batch: &RecordBatch, col: usize) -> f64 {
        batch
            .column(col)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap()
            .value(0)
    }

    struct Untouchable;

    impl BatchSource for Untouchable {
        fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
            panic!("source must not be read");
        }
    }

    #[test]
    fn test_avg_sum_count_across_morsels() {
        let data = storage(1000);
        let sql = "SELECT AVG(x0) AS a, SUM(x1) AS s, COUNT(*) AS n, COUNT(y0) AS c FROM points";
        let result = run(sql, &data, 64, false).unwrap();

        assert_eq!(f64_at(&result, 0), 499.5);
        assert_eq!(f64_at(&result, 1), 2.0 * 499_500.0);
        let n = result.column(2).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(n.value(0), 1000);
        let c = result.column(3).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(c.value(0), 1000);
    }

    #[test]
    fn test_morsel_size_does_not_change_result() {
        let data = storage(3000);
        let sql = "SELECT AVG(SQRT(x0 * x0 + x1)) AS a FROM points";
        let whole = f64_at(&run(sql, &data, 3000, false).unwrap(), 0);
        for morsel in [1, 7, 512] {
            let split = f64_at(&run(sql, &data, morsel, false).unwrap(), 0);
            assert!((whole - split).abs() <= 1e-9 * whole.abs());
        }
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let data = storage(10_000);
        let sql = "SELECT AVG(SIN(x0) + COS(y1)) AS a FROM points";
        let seq = f64_at(&run(sql, &data, 333, false).unwrap(), 0);
        let par = f64_at(&run(sql, &data, 333, true).unwrap(), 0);
        assert!((seq - par).abs() <= 1e-12);
    }

    #[test]
    fn test_empty_relation() {
        let data = StorageEngine::new(vec![]);
        let result = run("SELECT AVG(x0) AS a, SUM(x0) AS s, COUNT(*) AS n FROM points", &data, 8, false)
            .unwrap();
        assert!(f64_at(&result, 0).is_nan());
        assert!(result.column(1).is_null(0));
        let n = result.column(2).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(n.value(0), 0);
    }

    #[test]
    fn test_aggregates_skip_nulls() {
        let batch = RecordBatch::try_new(
            crate::storage::points_schema(),
            vec![
                Arc::new(Float64Array::from(vec![Some(2.0), None, Some(4.0)])),
                Arc::new(Float64Array::from(vec![0.0, 0.0, 0.0])),
                Arc::new(Float64Array::from(vec![0.0, 0.0, 0.0])),
                Arc::new(Float64Array::from(vec![0.0, 0.0, 0.0])),
            ],
        )
        .unwrap();
        let data = StorageEngine::new(vec![batch]);
        let result = run("SELECT AVG(x0 + y0) AS a, COUNT(x0) AS c FROM points", &data, 2, false).unwrap();
        assert_eq!(f64_at(&result, 0), 3.0);
        let c = result.column(1).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(c.value(0), 2);
    }

    #[test]
    fn test_projection_preserves_order() {
        let data = storage(100);
        for parallel in [false, true] {
            let result = run("SELECT x1 - x0 AS d FROM points", &data, 9, parallel).unwrap();
            assert_eq!(result.num_rows(), 100);
            let d = result.column(0).as_any().downcast_ref::<Float64Array>().unwrap();
            for i in 0..100 {
                #[allow(clippy::cast_precision_loss)]
                let expected = i as f64;
                assert_eq!(d.value(i), expected);
            }
        }
    }

    #[test]
    fn test_projection_of_empty_relation() {
        let data = StorageEngine::new(vec![]);
        let result = run("SELECT x0 AS a FROM points", &data, 8, false).unwrap();
        assert_eq!(result.num_rows(), 0);
        assert_eq!(result.schema().field(0).name(), "a");
    }

    #[test]
    fn test_unknown_function_fails_before_reading() {
        let catalog = FunctionCatalog::with_builtins();
        let plan = QueryEngine::new()
            .parse("SELECT AVG(haversine_dist(x0, y0, x1, y1)) FROM points")
            .unwrap();
        let err = QueryExecutor::new(&catalog)
            .execute(&plan, &mut Untouchable)
            .unwrap_err();
        assert!(err.to_string().contains("haversine_dist"));
    }

    #[test]
    fn test_non_float_column_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new("x0", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1]))]).unwrap();
        let data = StorageEngine::new(vec![batch]);
        let err = run("SELECT AVG(x0) FROM points", &data, 8, false).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
