//! Tests for error types

use haversine_udf::Error;

#[test]
fn test_unknown_method_error() {
    let error = Error::UnknownMethod {
        method: "numba".to_string(),
        available: "scalar, vectorized".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Unknown method 'numba'"));
    assert!(error_str.contains("Available methods: scalar, vectorized"));
    assert!(error.is_not_found());
    assert_eq!(error.exit_code(), 2);
}

#[test]
fn test_backend_unavailable_error() {
    let error = Error::BackendUnavailable {
        method: "gpu".to_string(),
        reason: "no adapter".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("'gpu'"));
    assert!(error_str.contains("no adapter"));
    assert!(error.is_not_found());
    assert_eq!(error.exit_code(), 2);
}

#[test]
fn test_compilation_failure_error() {
    let error = Error::CompilationFailure {
        method: "scalar_compiled".to_string(),
        reason: "verifier error".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Compilation failed"));
    assert!(error_str.contains("No fallback"));
    assert!(!error.is_not_found());
    assert_eq!(error.exit_code(), 1);
}

#[test]
fn test_device_error() {
    let error = Error::DeviceError("buffer map failed".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("GPU device error"));
    assert!(error_str.contains("buffer map failed"));
}

#[test]
fn test_data_shape_error() {
    let error = Error::DataShapeError("x0=3, y0=2".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Data shape error"));
    assert!(error_str.contains("x0=3, y0=2"));
}

#[test]
fn test_schema_error() {
    let error = Error::SchemaError("missing column 'y1'".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("missing column 'y1'"));
    assert!(error_str.contains("x0, y0, x1, y1"));
    assert_eq!(error.exit_code(), 3);
}

#[test]
fn test_parse_error() {
    let error = Error::ParseError("invalid SQL".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("SQL parse error"));
    assert!(error_str.contains("invalid SQL"));
}

#[test]
fn test_storage_error() {
    let error = Error::StorageError("corrupt footer".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Storage error"));
    assert_eq!(error.exit_code(), 3);
}

#[test]
fn test_invalid_input_error() {
    let error = Error::InvalidInput("haversine_dist expects 4 arguments".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Invalid input"));
    assert!(error_str.contains("4 arguments"));
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let error: Error = io_error.into();
    let error_str = format!("{error}");
    assert!(error_str.contains("IO error"));
    assert_eq!(error.exit_code(), 3);
}

#[test]
fn test_arrow_error_conversion() {
    let arrow_error = arrow::error::ArrowError::InvalidArgumentError("bad length".to_string());
    let error: Error = arrow_error.into();
    assert!(format!("{error}").contains("bad length"));
}

#[test]
fn test_other_error() {
    let error = Error::Other("custom error message".to_string());
    let error_str = format!("{error}");
    assert_eq!(error_str, "custom error message");
    assert_eq!(error.exit_code(), 1);
}

#[test]
fn test_result_type_alias_error() {
    fn returns_error() -> haversine_udf::Result<i32> {
        Err(Error::Other("test error".to_string()))
    }

    let result = returns_error();
    assert!(result.is_err());
}
