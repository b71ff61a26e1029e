//! Integration tests for SQL query execution
//!
//! These tests validate the complete query pipeline:
//! SQL → Parser → Executor (with registered distance function) → Results

use arrow::array::{Array, Float64Array, Int64Array, RecordBatch};
use haversine_udf::backend::vectorized::VectorizedKernel;
use haversine_udf::bridge::{DistanceFunction, DEFAULT_FUNCTION_NAME};
use haversine_udf::formula::haversine;
use haversine_udf::query::{FunctionCatalog, QueryEngine, QueryExecutor};
use haversine_udf::session::SQL_DISTANCE_EXPR;
use haversine_udf::storage::StorageEngine;
use haversine_udf::Error;
use std::sync::Arc;

/// Helper function to create test data
fn create_test_data() -> StorageEngine {
    let mut storage = StorageEngine::new(vec![]);
    let first = StorageEngine::from_columns(
        vec![0.0, 10.0, -86.67],
        vec![0.0, 10.0, 36.12],
        vec![0.0, 10.0, -118.40],
        vec![1.0, 11.0, 33.94],
    )
    .unwrap();
    let second = StorageEngine::from_columns(vec![5.0, 5.0], vec![5.0, 5.0], vec![5.0, 6.0], vec![5.0, 5.0]).unwrap();
    for batch in first.batches().iter().chain(second.batches()) {
        storage.append_batch(batch.clone()).unwrap();
    }
    storage
}

fn catalog() -> FunctionCatalog {
    let mut catalog = FunctionCatalog::with_builtins();
    catalog
        .register(Arc::new(DistanceFunction::new(
            DEFAULT_FUNCTION_NAME,
            Arc::new(VectorizedKernel::sequential()),
        )))
        .unwrap();
    catalog
}

fn run(sql: &str, storage: &StorageEngine, morsel_rows: usize) -> haversine_udf::Result<RecordBatch> {
    let catalog = catalog();
    let plan = QueryEngine::new().parse(sql)?;
    QueryExecutor::new(&catalog).execute(&plan, &mut storage.morsels_with_rows(morsel_rows))
}

fn f64_column(batch: &RecordBatch, index: usize) -> &Float64Array {
    batch.column(index).as_any().downcast_ref::<Float64Array>().unwrap()
}

fn expected_distances() -> Vec<f64> {
    vec![
        haversine(0.0, 0.0, 0.0, 1.0),
        haversine(10.0, 10.0, 10.0, 11.0),
        haversine(-86.67, 36.12, -118.40, 33.94),
        0.0,
        haversine(5.0, 5.0, 6.0, 5.0),
    ]
}

#[test]
fn test_udf_average_across_appended_batches() {
    let storage = create_test_data();
    let expected = expected_distances().iter().sum::<f64>() / 5.0;

    for morsel_rows in [1, 2, 3, 1024] {
        let result = run(
            "SELECT AVG(haversine_dist(x0, y0, x1, y1)) AS avg_dist FROM points",
            &storage,
            morsel_rows,
        )
        .unwrap();
        assert_eq!(result.num_rows(), 1);
        assert_eq!(result.schema().field(0).name(), "avg_dist");
        assert!((f64_column(&result, 0).value(0) - expected).abs() < 1e-9);
    }
}

#[test]
fn test_sum_and_count_together() {
    let storage = create_test_data();
    let result = run(
        "SELECT SUM(haversine_dist(x0, y0, x1, y1)) AS total, COUNT(*) AS n FROM points",
        &storage,
        2,
    )
    .unwrap();

    let total: f64 = expected_distances().iter().sum();
    assert!((f64_column(&result, 0).value(0) - total).abs() < 1e-9);
    let n = result.column(1).as_any().downcast_ref::<Int64Array>().unwrap();
    assert_eq!(n.value(0), 5);
}

#[test]
fn test_projection_keeps_input_order() {
    let storage = create_test_data();
    let result = run("SELECT haversine_dist(x0, y0, x1, y1) AS d, x0 FROM points", &storage, 2).unwrap();

    assert_eq!(result.num_rows(), 5);
    assert_eq!(result.num_columns(), 2);
    let d = f64_column(&result, 0);
    for (row, expected) in expected_distances().into_iter().enumerate() {
        assert_eq!(d.value(row), expected);
    }
    assert_eq!(f64_column(&result, 1).value(2), -86.67);
}

#[test]
fn test_sql_expression_matches_udf() {
    let storage = create_test_data();
    let sql = format!("SELECT {SQL_DISTANCE_EXPR} AS d FROM points");
    let result = run(&sql, &storage, 3).unwrap();

    let d = f64_column(&result, 0);
    for (row, expected) in expected_distances().into_iter().enumerate() {
        assert!((d.value(row) - expected).abs() <= 1e-9 * expected.max(1.0), "row {row}");
    }
}

#[test]
fn test_function_names_are_case_insensitive() {
    let storage = create_test_data();
    let result = run("SELECT AVG(HAVERSINE_DIST(x0, y0, x1, y1)) AS a FROM points", &storage, 8).unwrap();
    assert!(f64_column(&result, 0).value(0) > 0.0);
}

#[test]
fn test_wrong_arity_is_rejected() {
    let storage = create_test_data();
    let err = run("SELECT AVG(haversine_dist(x0, y0, x1)) FROM points", &storage, 8).unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{err}");
}

#[test]
fn test_unregistered_function_is_rejected() {
    let storage = create_test_data();
    let err = run("SELECT AVG(vincenty(x0, y0, x1, y1)) FROM points", &storage, 8).unwrap_err();
    assert!(err.to_string().contains("vincenty"), "{err}");
}

#[test]
fn test_missing_column_is_reported() {
    let storage = create_test_data();
    let err = run("SELECT AVG(haversine_dist(x0, y0, x1, z1)) FROM points", &storage, 8).unwrap_err();
    assert!(err.to_string().contains("z1"), "{err}");
}

#[test]
fn test_unsupported_clause() {
    let storage = create_test_data();
    let err = run("SELECT AVG(x0) FROM points WHERE x0 > 0", &storage, 8).unwrap_err();
    assert!(matches!(err, Error::ParseError(_)));
}
