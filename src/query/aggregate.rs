//! Partial aggregate state
//!
//! One [`AggregateState`] per aggregate per partition. Partitions are merged
//! with [`AggregateState::merge`], which is associative and commutative up to
//! floating-point rounding.

use arrow::array::{Array, Float64Array};
use serde::{Deserialize, Serialize};

/// Supported aggregation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunction {
    /// Sum of non-null values
    Sum,
    /// Mean of non-null values (NaN over zero values)
    Avg,
    /// Count of non-null values, or of rows for `COUNT(*)`
    Count,
}

impl AggregateFunction {
    /// Parse an SQL function name (case-insensitive)
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "SUM" => Some(Self::Sum),
            "AVG" => Some(Self::Avg),
            "COUNT" => Some(Self::Count),
            _ => None,
        }
    }
}

/// Running `{sum, count}` over the values seen so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    /// Sum of non-null values
    pub sum: f64,
    /// Number of non-null values
    pub count: u64,
}

impl AggregateState {
    /// Empty state
    #[must_use]
    pub const fn new() -> Self {
        Self { sum: 0.0, count: 0 }
    }

    /// Fold one column of values into the state, skipping nulls
    pub fn update(&mut self, values: &Float64Array) {
        if values.null_count() == 0 {
            self.sum += values.values().iter().sum::<f64>();
            self.count += values.len() as u64;
        } else {
            for v in values.iter().flatten() {
                self.sum += v;
                self.count += 1;
            }
        }
    }

    /// Count `rows` rows without values (`COUNT(*)`)
    pub fn update_rows(&mut self, rows: usize) {
        self.count += rows as u64;
    }

    /// Combine with another partition's state
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            sum: self.sum + other.sum,
            count: self.count + other.count,
        }
    }

    /// `sum / count`, NaN when no value was seen
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.sum / self.count as f64
        }
    }
}
