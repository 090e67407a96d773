//! Flat tabular representation of upstream records.
//!
//! Upstream account records are loosely typed and differ in shape by user
//! type, so rows are stored as maps of flattened JSON: nested objects become
//! dot-separated columns (`primaryContact.firstName`). The table keeps
//! columns in first-seen order so CSV output is stable across runs.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::CrmError;

/// One flattened record.
pub type Row = BTreeMap<String, Value>;

/// Flatten a JSON object into dot-separated columns. Arrays and scalars are
/// stored as-is; only objects recurse.
pub fn flatten(record: &Value) -> Row {
    let mut row = Row::new();
    flatten_into("", record, &mut row);
    row
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Row) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let column = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(&column, child, out);
            }
        }
        other => {
            if !prefix.is_empty() {
                out.insert(prefix.to_string(), other.clone());
            }
        }
    }
}

/// Parse an id that the API serializes inconsistently as either a JSON
/// number or a numeric string.
pub fn parse_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A column-ordered collection of flattened rows.
#[derive(Debug, Clone, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Append a row, registering any columns not seen before.
    pub fn push_row(&mut self, row: Row) {
        for column in row.keys() {
            if !self.columns.iter().any(|c| c == column) {
                self.columns.push(column.clone());
            }
        }
        self.rows.push(row);
    }

    /// Read the value of `column` in row `index`, if present and non-null.
    pub fn get(&self, index: usize, column: &str) -> Option<&Value> {
        self.rows
            .get(index)
            .and_then(|row| row.get(column))
            .filter(|v| !v.is_null())
    }

    /// Set `column` to the same value on every row.
    pub fn set_column(&mut self, column: &str, value: Value) {
        if !self.columns.iter().any(|c| c == column) {
            self.columns.push(column.to_string());
        }
        for row in &mut self.rows {
            row.insert(column.to_string(), value.clone());
        }
    }

    /// The `accountId` of every row, in row order. A row without a parseable
    /// id is a join-key violation: it could never be matched back after
    /// enrichment.
    pub fn account_ids(&self) -> Result<Vec<i64>, CrmError> {
        self.rows
            .iter()
            .map(|row| {
                row.get("accountId").and_then(parse_id).ok_or_else(|| {
                    CrmError::JoinKeyViolation(
                        "row is missing a parseable accountId".to_string(),
                    )
                })
            })
            .collect()
    }

    /// Attach per-account columns produced by an enrichment fan-out.
    ///
    /// `by_id` must cover every row exactly once (outer join, one-to-one).
    /// When `fill_only` is set, an incoming value only lands where the row
    /// has no value yet — the base listing wins on shared columns.
    pub fn merge_by_account_id(
        &mut self,
        by_id: &BTreeMap<i64, Row>,
        fill_only: bool,
    ) -> Result<(), CrmError> {
        let ids = self.account_ids()?;
        for (row, id) in self.rows.iter_mut().zip(&ids) {
            let incoming = by_id.get(id).ok_or_else(|| {
                CrmError::JoinKeyViolation(format!(
                    "no enrichment result for account {}",
                    id
                ))
            })?;
            for (column, value) in incoming {
                let occupied = row
                    .get(column)
                    .map(|existing| !existing.is_null())
                    .unwrap_or(false);
                if fill_only && occupied {
                    continue;
                }
                row.insert(column.clone(), value.clone());
            }
        }
        // Register columns after merging so ordering follows the incoming maps.
        let new_columns: Vec<String> = by_id
            .values()
            .flat_map(|row| row.keys().cloned())
            .collect();
        for column in new_columns {
            if !self.columns.iter().any(|c| c == &column) {
                self.columns.push(column);
            }
        }
        Ok(())
    }

    /// Remove the named columns where they exist. Missing names are ignored,
    /// matching the hand-maintained drop lists which cover both user types.
    pub fn drop_columns(&mut self, names: &[&str]) {
        self.columns.retain(|c| !names.contains(&c.as_str()));
        for row in &mut self.rows {
            for name in names {
                row.remove(*name);
            }
        }
    }

    /// Remove columns that hold no data in any row (absent, null, or empty
    /// string everywhere).
    pub fn drop_empty_columns(&mut self) {
        let rows = &self.rows;
        self.columns.retain(|column| {
            rows.iter().any(|row| match row.get(column) {
                None | Some(Value::Null) => false,
                Some(Value::String(s)) => !s.is_empty(),
                Some(Value::Array(a)) => !a.is_empty(),
                Some(_) => true,
            })
        });
        let kept: Vec<String> = self.columns.clone();
        for row in &mut self.rows {
            row.retain(|column, _| kept.iter().any(|c| c == column));
        }
    }

    /// A new table holding only the rows that satisfy `keep`, with the same
    /// column order.
    pub fn filter_rows<F: Fn(&Row) -> bool>(&self, keep: F) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }

    /// Write the table as CSV: header from the column order, one record per
    /// row. Missing and null cells render empty; arrays render as JSON.
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<(), CrmError> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(&self.columns)?;
        for row in &self.rows {
            let record: Vec<String> = self
                .columns
                .iter()
                .map(|column| render_cell(row.get(column)))
                .collect();
            csv.write_record(&record)?;
        }
        csv.flush()?;
        Ok(())
    }
}

fn render_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}
