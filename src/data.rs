//! Column oriented data used to build models and to hold summary tables.
//!
//! Columns are either numeric (`f64`, missing values are `NaN`) or
//! categorical (strings). Frames convert to and from Arrow record batches.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array,
    LargeStringArray, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use itertools::Itertools;

use crate::error::DataError;

/// A single cell, used for grids and user supplied covariate values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Level(String),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(x) => Some(*x),
            Value::Level(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(x) => write!(f, "{}", x),
            Value::Level(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Level(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Level(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Vec<f64>),
    Categorical(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Categorical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Column::Numeric(_))
    }

    pub fn as_numeric(&self) -> Option<&[f64]> {
        match self {
            Column::Numeric(v) => Some(v),
            Column::Categorical(_) => None,
        }
    }

    pub fn as_categorical(&self) -> Option<&[String]> {
        match self {
            Column::Categorical(v) => Some(v),
            Column::Numeric(_) => None,
        }
    }

    pub fn value(&self, row: usize) -> Value {
        match self {
            Column::Numeric(v) => Value::Number(v[row]),
            Column::Categorical(v) => Value::Level(v[row].clone()),
        }
    }

    /// Cell rendered as a categorical level. Numbers use their shortest
    /// decimal form so that `C(x)` on `1.0` yields the level `"1"`.
    pub fn level(&self, row: usize) -> String {
        match self {
            Column::Numeric(v) => format_number(v[row]),
            Column::Categorical(v) => v[row].clone(),
        }
    }

    pub fn take(&self, rows: &[usize]) -> Column {
        match self {
            Column::Numeric(v) => Column::Numeric(rows.iter().map(|&i| v[i]).collect()),
            Column::Categorical(v) => {
                Column::Categorical(rows.iter().map(|&i| v[i].clone()).collect())
            }
        }
    }

    /// Builds a column from cells. All cells must share the same variant.
    pub fn from_values(name: &str, values: &[Value]) -> Result<Column, DataError> {
        if values.iter().all(|v| matches!(v, Value::Number(_))) {
            Ok(Column::Numeric(
                values.iter().filter_map(Value::as_number).collect(),
            ))
        } else if values.iter().all(|v| matches!(v, Value::Level(_))) {
            Ok(Column::Categorical(
                values.iter().map(|v| v.to_string()).collect(),
            ))
        } else {
            Err(DataError::UnsupportedType {
                name: name.to_string(),
                dtype: "mixed numeric and categorical values".to_string(),
            })
        }
    }

    /// Sorted distinct levels. Numeric columns sort numerically.
    pub fn unique(&self) -> Vec<Value> {
        match self {
            Column::Numeric(v) => {
                let mut values: Vec<f64> = v.iter().copied().filter(|x| !x.is_nan()).collect();
                values.sort_by(f64::total_cmp);
                values.dedup();
                values.into_iter().map(Value::Number).collect()
            }
            Column::Categorical(v) => v
                .iter()
                .cloned()
                .sorted()
                .dedup()
                .map(Value::Level)
                .collect(),
        }
    }

    /// Sorted distinct levels rendered as strings.
    pub fn unique_levels(&self) -> Vec<String> {
        match self {
            Column::Numeric(_) => self.unique().iter().map(|v| v.to_string()).collect(),
            Column::Categorical(v) => v.iter().cloned().sorted().dedup().collect(),
        }
    }

    /// Most frequent value. Ties resolve to the smallest value, numerically
    /// for numeric columns and lexicographically for categorical ones.
    pub fn mode(&self) -> Option<Value> {
        match self {
            Column::Numeric(v) => {
                let mut counts: Vec<(f64, usize)> = Vec::new();
                for x in v.iter().copied().filter(|x| !x.is_nan()).sorted_by(f64::total_cmp) {
                    match counts.last_mut() {
                        Some((last, n)) if *last == x => *n += 1,
                        _ => counts.push((x, 1)),
                    }
                }
                let max = counts.iter().map(|(_, n)| *n).max()?;
                counts
                    .into_iter()
                    .find(|(_, n)| *n == max)
                    .map(|(x, _)| Value::Number(x))
            }
            Column::Categorical(v) => {
                let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
                for level in v {
                    *counts.entry(level.as_str()).or_default() += 1;
                }
                let max = counts.values().copied().max()?;
                counts
                    .into_iter()
                    .find(|(_, n)| *n == max)
                    .map(|(level, _)| Value::Level(level.to_string()))
            }
        }
    }

    pub fn has_missing(&self) -> bool {
        match self {
            Column::Numeric(v) => v.iter().any(|x| x.is_nan()),
            Column::Categorical(_) => false,
        }
    }

    fn dtype(&self) -> DataType {
        match self {
            Column::Numeric(_) => DataType::Float64,
            Column::Categorical(_) => DataType::Utf8,
        }
    }

    fn to_arrow(&self) -> ArrayRef {
        match self {
            Column::Numeric(v) => Arc::new(Float64Array::from(v.clone())),
            Column::Categorical(v) => Arc::new(StringArray::from(v.clone())),
        }
    }

    fn from_arrow(name: &str, array: &ArrayRef) -> Result<Column, DataError> {
        let any = array.as_any();
        if let Some(values) = any.downcast_ref::<Float64Array>() {
            return Ok(Column::Numeric(
                values.iter().map(|x| x.unwrap_or(f64::NAN)).collect(),
            ));
        }
        if let Some(values) = any.downcast_ref::<Float32Array>() {
            return Ok(Column::Numeric(
                values
                    .iter()
                    .map(|x| x.map(f64::from).unwrap_or(f64::NAN))
                    .collect(),
            ));
        }
        if let Some(values) = any.downcast_ref::<Int64Array>() {
            return Ok(Column::Numeric(
                values
                    .iter()
                    .map(|x| x.map(|x| x as f64).unwrap_or(f64::NAN))
                    .collect(),
            ));
        }
        if let Some(values) = any.downcast_ref::<Int32Array>() {
            return Ok(Column::Numeric(
                values
                    .iter()
                    .map(|x| x.map(f64::from).unwrap_or(f64::NAN))
                    .collect(),
            ));
        }
        if let Some(values) = any.downcast_ref::<BooleanArray>() {
            return Ok(Column::Numeric(
                values
                    .iter()
                    .map(|x| x.map(|b| if b { 1.0 } else { 0.0 }).unwrap_or(f64::NAN))
                    .collect(),
            ));
        }
        if let Some(values) = any.downcast_ref::<StringArray>() {
            return values
                .iter()
                .map(|x| {
                    x.map(str::to_string)
                        .ok_or_else(|| DataError::MissingValues(name.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Column::Categorical);
        }
        if let Some(values) = any.downcast_ref::<LargeStringArray>() {
            return values
                .iter()
                .map(|x| {
                    x.map(str::to_string)
                        .ok_or_else(|| DataError::MissingValues(name.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Column::Categorical);
        }
        Err(DataError::UnsupportedType {
            name: name.to_string(),
            dtype: array.data_type().to_string(),
        })
    }
}

/// An ordered collection of equally long named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataFrame {
    names: Vec<String>,
    columns: Vec<Column>,
}

impl DataFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_columns<S: Into<String>>(
        columns: impl IntoIterator<Item = (S, Column)>,
    ) -> Result<Self, DataError> {
        let mut frame = DataFrame::new();
        for (name, column) in columns {
            frame.insert(name, column)?;
        }
        Ok(frame)
    }

    /// Adds a column, replacing any existing column with the same name.
    pub fn insert(&mut self, name: impl Into<String>, column: Column) -> Result<(), DataError> {
        let name = name.into();
        if let Some(idx) = self.position(&name) {
            if self.columns.len() > 1 && column.len() != self.nrows() {
                return Err(DataError::LengthMismatch {
                    name,
                    expected: self.nrows(),
                    found: column.len(),
                });
            }
            self.columns[idx] = column;
            return Ok(());
        }
        if !self.columns.is_empty() && column.len() != self.nrows() {
            return Err(DataError::LengthMismatch {
                name,
                expected: self.nrows(),
                found: column.len(),
            });
        }
        self.names.push(name);
        self.columns.push(column);
        Ok(())
    }

    /// Adds a column in front of the existing ones.
    pub fn insert_first(
        &mut self,
        name: impl Into<String>,
        column: Column,
    ) -> Result<(), DataError> {
        let name = name.into();
        self.remove(&name);
        if !self.columns.is_empty() && column.len() != self.nrows() {
            return Err(DataError::LengthMismatch {
                name,
                expected: self.nrows(),
                found: column.len(),
            });
        }
        self.names.insert(0, name);
        self.columns.insert(0, column);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Column> {
        let idx = self.position(name)?;
        self.names.remove(idx);
        Some(self.columns.remove(idx))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn nrows(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.position(name).map(|i| &self.columns[i])
    }

    pub fn column(&self, name: &str) -> Result<&Column, DataError> {
        self.get(name)
            .ok_or_else(|| DataError::MissingColumn(name.to_string()))
    }

    pub fn numeric(&self, name: &str) -> Result<&[f64], DataError> {
        self.column(name)?
            .as_numeric()
            .ok_or_else(|| DataError::NotNumeric(name.to_string()))
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.columns.iter())
    }

    pub fn take_rows(&self, rows: &[usize]) -> DataFrame {
        DataFrame {
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c.take(rows)).collect(),
        }
    }

    pub fn select(&self, names: &[String]) -> Result<DataFrame, DataError> {
        let mut out = DataFrame::new();
        for name in names {
            out.insert(name.clone(), self.column(name)?.clone())?;
        }
        Ok(out)
    }

    /// Concatenates frames with identical column names row-wise.
    pub fn vstack(frames: &[DataFrame]) -> Result<DataFrame, DataError> {
        let Some(first) = frames.first() else {
            return Ok(DataFrame::new());
        };
        let mut columns = first.columns.clone();
        for frame in &frames[1..] {
            for (name, column) in first.names.iter().zip(columns.iter_mut()) {
                match (column, frame.column(name)?) {
                    (Column::Numeric(acc), Column::Numeric(other)) => acc.extend(other),
                    (Column::Categorical(acc), Column::Categorical(other)) => {
                        acc.extend(other.iter().cloned())
                    }
                    _ => {
                        return Err(DataError::UnsupportedType {
                            name: name.clone(),
                            dtype: "mixed numeric and categorical values".to_string(),
                        })
                    }
                }
            }
        }
        Ok(DataFrame {
            names: first.names.clone(),
            columns,
        })
    }

    /// Row indices without missing values in any of `names`.
    pub fn complete_rows(&self, names: &[String]) -> Result<Vec<usize>, DataError> {
        let columns = names
            .iter()
            .map(|n| self.column(n))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((0..self.nrows())
            .filter(|&row| {
                columns.iter().all(|c| match c {
                    Column::Numeric(v) => !v[row].is_nan(),
                    Column::Categorical(_) => true,
                })
            })
            .collect())
    }

    pub fn from_record_batch(batch: &RecordBatch) -> Result<DataFrame, DataError> {
        let schema = batch.schema();
        let mut frame = DataFrame::new();
        for (field, array) in schema.fields().iter().zip(batch.columns()) {
            frame.insert(field.name().clone(), Column::from_arrow(field.name(), array)?)?;
        }
        Ok(frame)
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch, DataError> {
        let fields: Vec<Field> = self
            .columns()
            .map(|(name, column)| Field::new(name, column.dtype(), false))
            .collect();
        let arrays: Vec<ArrayRef> = self.columns.iter().map(Column::to_arrow).collect();
        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }
}

impl fmt::Display for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.names.join("\t"))?;
        for row in 0..self.nrows() {
            let cells = self.columns.iter().map(|c| c.value(row).to_string()).join("\t");
            writeln!(f, "{}", cells)?;
        }
        Ok(())
    }
}

pub(crate) fn format_number(x: f64) -> String {
    format!("{}", x)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation, as `numpy.std` with `ddof=0`.
pub fn std(values: &[f64]) -> f64 {
    let m = mean(values);
    let var = values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

pub fn min(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

pub fn max(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// Quantile with linear interpolation between order statistics.
pub fn quantile(values: &[f64], q: f64) -> f64 {
    let sorted: Vec<f64> = values.iter().copied().sorted_by(f64::total_cmp).collect();
    quantile_sorted(&sorted, q)
}

pub(crate) fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// `n` evenly spaced values from `start` to `stop`, both included.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn frame() -> DataFrame {
        DataFrame::from_columns([
            ("x", Column::Numeric(vec![1.0, 2.0, f64::NAN, 4.0])),
            (
                "g",
                Column::Categorical(vec!["b".into(), "a".into(), "b".into(), "a".into()]),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn mode_breaks_ties_lexicographically() {
        let df = frame();
        assert_eq!(df.column("g").unwrap().mode(), Some(Value::Level("a".into())));
        let x = Column::Numeric(vec![3.0, 1.0, 3.0, 1.0, 2.0]);
        assert_eq!(x.mode(), Some(Value::Number(1.0)));
    }

    #[test]
    fn complete_rows_skip_nan() {
        let df = frame();
        assert_eq!(df.complete_rows(&["x".into(), "g".into()]).unwrap(), vec![0, 1, 3]);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut df = frame();
        let err = df.insert("z", Column::Numeric(vec![1.0])).unwrap_err();
        assert!(matches!(err, DataError::LengthMismatch { expected: 4, found: 1, .. }));
    }

    #[test]
    fn record_batch_conversion() {
        let df = frame();
        let batch = df.to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 4);
        let back = DataFrame::from_record_batch(&batch).unwrap();
        assert_eq!(back.names(), df.names());
        assert_eq!(back.column("g").unwrap(), df.column("g").unwrap());
    }

    #[test]
    fn vstack_appends_rows() {
        let df = frame();
        let stacked = DataFrame::vstack(&[df.clone(), df]).unwrap();
        assert_eq!(stacked.nrows(), 8);
    }

    #[test]
    fn quantile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&v, 0.5), 2.5);
        assert_eq!(quantile(&v, 0.0), 1.0);
        assert_eq!(quantile(&v, 1.0), 4.0);
    }

    proptest! {
        #[test]
        fn linspace_spans_bounds(a in -100f64..100., width in 0.1f64..50., n in 2usize..80) {
            let b = a + width;
            let grid = linspace(a, b, n);
            prop_assert_eq!(grid.len(), n);
            prop_assert_eq!(grid[0], a);
            prop_assert_eq!(grid[n - 1], b);
            prop_assert!(grid.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
