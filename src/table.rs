//! Columnar time-point table keyed by (device id, timestamp).
//!
//! Every value is an `Option<f64>`: `None` is the undefined marker and is never
//! conflated with `0.0`. Per-device computations run over [`DevicePartition`]s and
//! write their output back into the partition's own row range.

use std::collections::HashMap;
use std::ops::Range;

use chrono::NaiveDateTime;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub device_id: String,
    pub timestamp: NaiveDateTime,
}

impl RowKey {
    pub fn new(device_id: impl Into<String>, timestamp: NaiveDateTime) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePartition {
    pub device_id: String,
    pub rows: Range<usize>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("column {0} already exists")]
    DuplicateColumn(String),
    #[error("column {0} not found")]
    MissingColumn(String),
    #[error("column {name} has {found} values but the table has {expected} rows")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("undefined value in column {column} at row {row}")]
    UndefinedValue { column: String, row: usize },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    keys: Vec<RowKey>,
    columns: Vec<Column>,
    index: HashMap<String, usize>,
}

impl FeatureTable {
    pub fn new(keys: Vec<RowKey>) -> Self {
        Self {
            keys,
            columns: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[RowKey] {
        &self.keys
    }

    pub fn key(&self, row: usize) -> &RowKey {
        &self.keys[row]
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.index
            .get(name)
            .map(|idx| self.columns[*idx].values.as_slice())
    }

    pub fn require(&self, name: &str) -> Result<&[Option<f64>], TableError> {
        self.column(name)
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))
    }

    /// Appends a column. Non-finite values are stored as undefined.
    pub fn add_column(
        &mut self,
        name: impl Into<String>,
        values: Vec<Option<f64>>,
    ) -> Result<(), TableError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(TableError::DuplicateColumn(name));
        }
        if values.len() != self.keys.len() {
            return Err(TableError::LengthMismatch {
                name,
                expected: self.keys.len(),
                found: values.len(),
            });
        }

        let values = values
            .into_iter()
            .map(|v| v.filter(|x| x.is_finite()))
            .collect();
        self.index.insert(name.clone(), self.columns.len());
        self.columns.push(Column { name, values });
        Ok(())
    }

    /// Values of a fully defined column, failing on the first undefined row.
    pub fn defined_values(&self, name: &str) -> Result<Vec<f64>, TableError> {
        self.require(name)?
            .iter()
            .enumerate()
            .map(|(row, v)| {
                v.ok_or_else(|| TableError::UndefinedValue {
                    column: name.to_string(),
                    row,
                })
            })
            .collect()
    }

    /// New table holding `rows` in the given order, with every column.
    pub fn take(&self, rows: &[usize]) -> FeatureTable {
        let keys = rows.iter().map(|r| self.keys[*r].clone()).collect();
        let columns = self
            .columns
            .iter()
            .map(|c| Column {
                name: c.name.clone(),
                values: rows.iter().map(|r| c.values[*r]).collect(),
            })
            .collect();
        FeatureTable {
            keys,
            columns,
            index: self.index.clone(),
        }
    }

    pub fn is_device_time_sorted(&self) -> bool {
        self.keys.windows(2).all(|w| w[0] <= w[1])
    }

    /// Groups rows by device and orders each device chronologically.
    pub fn sort_by_device_time(&mut self) {
        if self.is_device_time_sorted() {
            return;
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|a, b| self.keys[*a].cmp(&self.keys[*b]));
        *self = self.take(&order);
    }

    /// Orders rows by timestamp across all devices; ties fall back to device id.
    pub fn sort_by_time(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|a, b| {
            let ka = &self.keys[*a];
            let kb = &self.keys[*b];
            ka.timestamp
                .cmp(&kb.timestamp)
                .then_with(|| ka.device_id.cmp(&kb.device_id))
        });
        *self = self.take(&order);
    }

    /// Contiguous device runs. Meaningful once the table is device/time sorted.
    pub fn partitions(&self) -> Vec<DevicePartition> {
        let mut out: Vec<DevicePartition> = Vec::new();
        for (row, key) in self.keys.iter().enumerate() {
            match out.last_mut() {
                Some(last) if last.device_id == key.device_id => last.rows.end = row + 1,
                _ => out.push(DevicePartition {
                    device_id: key.device_id.clone(),
                    rows: row..row + 1,
                }),
            }
        }
        out
    }

    /// Runs `f` over each device's slice of `source` and reassembles the
    /// results into the owning rows.
    pub fn map_partitions<F>(&mut self, source: &str, f: F) -> Result<Vec<Option<f64>>, TableError>
    where
        F: Fn(&[Option<f64>]) -> Vec<Option<f64>> + Sync,
    {
        self.sort_by_device_time();
        let values = self.require(source)?;
        let pieces: Vec<(Range<usize>, Vec<Option<f64>>)> = self
            .partitions()
            .into_par_iter()
            .map(|p| {
                let piece = f(&values[p.rows.clone()]);
                (p.rows, piece)
            })
            .collect();

        let mut out = vec![None; self.len()];
        for (rows, piece) in pieces {
            out[rows].copy_from_slice(&piece);
        }
        Ok(out)
    }

    pub fn row_is_complete(&self, row: usize) -> bool {
        self.columns.iter().all(|c| c.values[row].is_some())
    }

    /// Copy without any row that has an undefined value; also returns the
    /// number of rows dropped.
    pub fn drop_incomplete_rows(&self) -> (FeatureTable, usize) {
        let keep: Vec<usize> = (0..self.len())
            .filter(|row| self.row_is_complete(*row))
            .collect();
        let dropped = self.len() - keep.len();
        (self.take(&keep), dropped)
    }
}
