//! Storage backend (Arrow/Parquet)
//!
//! Holds the coordinate-pair relation as Arrow record batches and hands it to
//! the query engine in morsels (Leis et al. 2014, morsel-driven parallelism).
//!
//! Every source checks the points schema before the first batch leaves it:
//! four `Float64` columns named `x0`, `y0`, `x1`, `y1`. Extra columns are
//! carried along and ignored by the distance query.

use crate::formula::CoordinatePair;
use crate::{Error, Result};
use arrow::array::Float64Array;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Morsel size for out-of-core execution (128MB chunks)
/// Based on: Leis et al. (2014) morsel-driven parallelism
pub const MORSEL_SIZE_BYTES: usize = 128 * 1024 * 1024; // 128MB

/// Columns of the points relation, in order
pub const POINT_COLUMNS: [&str; 4] = ["x0", "y0", "x1", "y1"];

/// Schema of the points relation (nullable `Float64` columns)
#[must_use]
pub fn points_schema() -> SchemaRef {
    Arc::new(Schema::new(
        POINT_COLUMNS
            .iter()
            .map(|name| Field::new(*name, DataType::Float64, true))
            .collect::<Vec<_>>(),
    ))
}

/// Check that `schema` carries the four coordinate columns as `Float64`
///
/// # Errors
/// Returns `SchemaError` naming the first missing or mistyped column
pub fn validate_points_schema(schema: &Schema) -> Result<()> {
    for name in POINT_COLUMNS {
        let field = schema
            .field_with_name(name)
            .map_err(|_| Error::SchemaError(format!("missing column '{name}'")))?;
        if field.data_type() != &DataType::Float64 {
            return Err(Error::SchemaError(format!(
                "column '{name}' has type {}, expected Float64",
                field.data_type()
            )));
        }
    }
    Ok(())
}

/// Pull-based producer of record batches
pub trait BatchSource {
    /// Next batch, or `None` once the source is exhausted
    ///
    /// # Errors
    /// Returns `StorageError` if reading fails
    fn next_batch(&mut self) -> Result<Option<RecordBatch>>;
}

/// Storage engine for Arrow/Parquet data
#[derive(Debug)]
pub struct StorageEngine {
    batches: Vec<RecordBatch>,
}

impl StorageEngine {
    /// Create a new storage engine from existing batches
    ///
    /// Useful for testing and benchmarking
    #[must_use]
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self { batches }
    }

    /// Build a single-batch points relation from four columns
    ///
    /// # Errors
    /// Returns `DataShapeError` if the columns differ in length
    pub fn from_columns(x0: Vec<f64>, y0: Vec<f64>, x1: Vec<f64>, y1: Vec<f64>) -> Result<Self> {
        if y0.len() != x0.len() || x1.len() != x0.len() || y1.len() != x0.len() {
            return Err(Error::DataShapeError(format!(
                "column lengths differ: x0={}, y0={}, x1={}, y1={}",
                x0.len(),
                y0.len(),
                x1.len(),
                y1.len()
            )));
        }
        let batch = RecordBatch::try_new(
            points_schema(),
            vec![
                Arc::new(Float64Array::from(x0)),
                Arc::new(Float64Array::from(y0)),
                Arc::new(Float64Array::from(x1)),
                Arc::new(Float64Array::from(y1)),
            ],
        )?;
        Ok(Self::new(vec![batch]))
    }

    /// Build a single-batch points relation from coordinate pairs
    ///
    /// # Errors
    /// Returns `Arrow` error if the batch cannot be assembled
    pub fn from_pairs(pairs: &[CoordinatePair]) -> Result<Self> {
        Self::from_columns(
            pairs.iter().map(|p| p.x0).collect(),
            pairs.iter().map(|p| p.y0).collect(),
            pairs.iter().map(|p| p.x1).collect(),
            pairs.iter().map(|p| p.y1).collect(),
        )
    }

    /// Load table from Parquet file
    ///
    /// The file schema is validated before any row group is decoded.
    ///
    /// # Errors
    /// - `Io` if the file cannot be opened
    /// - `SchemaError` if the coordinate columns are missing or mistyped
    /// - `StorageError` if the file cannot be parsed
    pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut source = ParquetSource::open(path)?;
        let mut batches = Vec::new();
        while let Some(batch) = source.next_batch()? {
            batches.push(batch);
        }

        tracing::info!(
            batches = batches.len(),
            rows = batches.iter().map(RecordBatch::num_rows).sum::<usize>(),
            "loaded Parquet dataset"
        );
        Ok(Self { batches })
    }

    /// Get all record batches
    #[must_use]
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Total row count
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// Check every stored batch against the points schema
    ///
    /// # Errors
    /// Returns `SchemaError` on the first non-conforming batch
    pub fn validate(&self) -> Result<()> {
        self.batches
            .iter()
            .try_for_each(|batch| validate_points_schema(&batch.schema()))
    }

    /// Create iterator over morsels (128MB chunks)
    #[must_use]
    pub fn morsels(&self) -> MorselIterator<'_> {
        MorselIterator::new(&self.batches)
    }

    /// Create iterator over morsels of at most `rows` rows
    #[must_use]
    pub fn morsels_with_rows(&self, rows: usize) -> MorselIterator<'_> {
        MorselIterator::new(&self.batches).with_morsel_rows(rows)
    }

    /// Append batches to storage (append-only)
    ///
    /// # Errors
    ///
    /// Returns error if batch schema doesn't match existing batches
    pub fn append_batch(&mut self, batch: RecordBatch) -> Result<()> {
        if let Some(first) = self.batches.first() {
            let existing_schema = first.schema();
            if batch.schema() != existing_schema {
                return Err(Error::StorageError(format!(
                    "Schema mismatch: expected {:?}, got {:?}",
                    existing_schema,
                    batch.schema()
                )));
            }
        }

        self.batches.push(batch);
        Ok(())
    }
}

/// Iterator over 128MB morsels of data
pub struct MorselIterator<'a> {
    batches: &'a [RecordBatch],
    current_batch_idx: usize,
    current_offset: usize,
    morsel_rows: Option<usize>,
}

impl<'a> MorselIterator<'a> {
    fn new(batches: &'a [RecordBatch]) -> Self {
        Self {
            batches,
            current_batch_idx: 0,
            current_offset: 0,
            morsel_rows: None,
        }
    }

    /// Override the morsel size with a fixed row count (minimum 1)
    #[must_use]
    pub fn with_morsel_rows(mut self, rows: usize) -> Self {
        self.morsel_rows = Some(rows.max(1));
        self
    }

    /// Calculate how many rows fit in a 128MB morsel
    fn calculate_morsel_rows(batch: &RecordBatch) -> usize {
        let num_rows = batch.num_rows();
        if num_rows == 0 {
            return 1;
        }

        let bytes_per_row = batch.get_array_memory_size() / num_rows;
        if bytes_per_row == 0 {
            return num_rows;
        }

        (MORSEL_SIZE_BYTES / bytes_per_row).max(1)
    }
}

impl Iterator for MorselIterator<'_> {
    type Item = RecordBatch;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let current_batch = self.batches.get(self.current_batch_idx)?;

            if self.current_offset >= current_batch.num_rows() {
                self.current_batch_idx += 1;
                self.current_offset = 0;
                continue;
            }

            let morsel_rows = self
                .morsel_rows
                .unwrap_or_else(|| Self::calculate_morsel_rows(current_batch));
            let remaining_rows = current_batch.num_rows() - self.current_offset;
            let slice_length = remaining_rows.min(morsel_rows);

            let morsel = current_batch.slice(self.current_offset, slice_length);
            self.current_offset += slice_length;
            return Some(morsel);
        }
    }
}

impl BatchSource for MorselIterator<'_> {
    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        Ok(self.next())
    }
}

/// Streaming Parquet reader over the points relation
pub struct ParquetSource {
    reader: ParquetRecordBatchReader,
    schema: SchemaRef,
}

impl ParquetSource {
    /// Open `path` and validate its schema
    ///
    /// # Errors
    /// - `Io` if the file cannot be opened
    /// - `SchemaError` if the coordinate columns are missing or mistyped
    /// - `StorageError` if the Parquet footer cannot be parsed
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;

        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| Error::StorageError(format!("Failed to parse Parquet file: {e}")))?;
        validate_points_schema(builder.schema())?;
        let schema = Arc::clone(builder.schema());

        let reader = builder
            .build()
            .map_err(|e| Error::StorageError(format!("Failed to create Parquet reader: {e}")))?;

        Ok(Self { reader, schema })
    }

    /// Schema of the file
    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }
}

impl BatchSource for ParquetSource {
    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        self.reader
            .next()
            .transpose()
            .map_err(|e| Error::StorageError(format!("Failed to read record batch: {e}")))
    }
}
