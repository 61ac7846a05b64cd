use std::fmt;

use serde::{Deserialize, Serialize};
use tessera_error::{EngineError, Result};

use crate::column::Column;
use crate::value::Value;

/// Borrowed view of one row alongside the column names.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [Column],
    values: &'a [Value],
}

impl<'a> Row<'a> {
    pub fn new(columns: &'a [Column], values: &'a [Value]) -> Self {
        Row { columns, values }
    }

    pub fn empty() -> Row<'static> {
        Row {
            columns: &[],
            values: &[],
        }
    }

    pub fn value(&self, column: &Column) -> Option<&'a Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    pub fn columns(&self) -> &'a [Column] {
        self.columns
    }
}

/// Materialized table.
///
/// Column names are unique (case insensitive) and every row has exactly one
/// value per column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Raster {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Raster {
    pub fn empty() -> Self {
        Raster::default()
    }

    pub fn try_new(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Result<Self> {
        validate_columns(&columns)?;
        let mut raster = Raster {
            columns,
            rows: Vec::with_capacity(rows.len()),
        };
        raster.push_rows(rows)?;
        Ok(raster)
    }

    /// Build a raster from rows of anything convertible into values.
    pub fn from_rows<V: Into<Value>>(
        columns: Vec<Column>,
        rows: impl IntoIterator<Item = Vec<V>>,
    ) -> Result<Self> {
        let rows = rows
            .into_iter()
            .map(|r| r.into_iter().map(Into::into).collect())
            .collect();
        Self::try_new(columns, rows)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, column: &Column) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn row(&self, idx: usize) -> Option<Row<'_>> {
        self.rows.get(idx).map(|r| Row::new(&self.columns, r))
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(|r| Row::new(&self.columns, r))
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(EngineError::new("Row length does not match column count")
                .with_field("row_len", row.len())
                .with_field("column_count", self.columns.len()));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn push_rows(&mut self, rows: impl IntoIterator<Item = Vec<Value>>) -> Result<()> {
        for row in rows {
            self.push_row(row)?;
        }
        Ok(())
    }

    /// Append columns, filling existing rows with `Empty`.
    pub fn add_columns(&mut self, columns: impl IntoIterator<Item = Column>) -> Result<()> {
        let mut new_columns = self.columns.clone();
        new_columns.extend(columns);
        validate_columns(&new_columns)?;

        let added = new_columns.len() - self.columns.len();
        for row in &mut self.rows {
            row.extend(std::iter::repeat_n(Value::Empty, added));
        }
        self.columns = new_columns;
        Ok(())
    }

    pub fn into_parts(self) -> (Vec<Column>, Vec<Vec<Value>>) {
        (self.columns, self.rows)
    }

    /// Compare shape and content. Unlike value equality, two invalid cells in
    /// the same position are considered the same.
    pub fn same_content(&self, other: &Raster) -> bool {
        if self.columns != other.columns || self.rows.len() != other.rows.len() {
            return false;
        }
        self.rows.iter().zip(&other.rows).all(|(a, b)| {
            a.len() == b.len()
                && a.iter().zip(b).all(|(x, y)| match (x, y) {
                    (Value::Invalid, Value::Invalid) => true,
                    _ => x == y,
                })
        })
    }
}

impl PartialEq for Raster {
    fn eq(&self, other: &Self) -> bool {
        self.same_content(other)
    }
}

fn validate_columns(columns: &[Column]) -> Result<()> {
    for (idx, column) in columns.iter().enumerate() {
        if columns[..idx].contains(column) {
            return Err(EngineError::new("Duplicate column name").with_field("column", column));
        }
    }
    Ok(())
}

impl fmt::Display for Raster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header: Vec<String> = self.columns.iter().map(|c| c.to_string()).collect();
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|r| r.iter().map(|v| v.to_string()).collect())
            .collect();

        let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
        for row in &cells {
            for (idx, cell) in row.iter().enumerate() {
                widths[idx] = widths[idx].max(cell.chars().count());
            }
        }

        let write_line = |f: &mut fmt::Formatter<'_>, items: &[String]| -> fmt::Result {
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    write!(f, " | ")?;
                }
                write!(f, "{item:<width$}", width = widths[idx])?;
            }
            writeln!(f)
        };

        write_line(f, &header)?;
        let sep: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        write_line(f, &sep)?;
        for row in &cells {
            write_line(f, row)?;
        }
        Ok(())
    }
}
