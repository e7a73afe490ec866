//! In-memory result tables.
//!
//! Every materialized CTE, backlink resolution, and recomposition result is
//! a [`Table`]: named, typed columns plus rows of [`Value`]s. Tables are
//! persisted as CSV with a header row plus a [`Schema`] sidecar carrying the
//! column types and which empty cells are empty strings rather than NULL.
//! With the sidecar, a table reloaded from cache is equal to the one that was
//! stored. Without it (hand-placed bank files), one [`ColumnType`] per column
//! is inferred from the cells.

use std::io::{Read, Write};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::DecomposerError;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Text,
    Date,
    Timestamp,
    /// Every value in the column is NULL (or the table has no rows).
    Null,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Bool => "BOOLEAN",
            ColumnType::Int => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Null => "NULL",
        }
    }

    /// Map a declared SQL type name back to a column type.
    pub fn from_decl(decl: &str) -> Option<Self> {
        let upper = decl.trim().to_ascii_uppercase();
        match upper.as_str() {
            "BOOLEAN" | "BOOL" => Some(ColumnType::Bool),
            "INTEGER" | "INT" | "BIGINT" => Some(ColumnType::Int),
            "REAL" | "FLOAT" | "DOUBLE" => Some(ColumnType::Float),
            "TEXT" => Some(ColumnType::Text),
            "DATE" => Some(ColumnType::Date),
            "TIMESTAMP" => Some(ColumnType::Timestamp),
            _ => None,
        }
    }
}

/// A single cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::Null,
            Value::Bool(_) => ColumnType::Bool,
            Value::Int(_) => ColumnType::Int,
            Value::Float(_) => ColumnType::Float,
            Value::Text(_) => ColumnType::Text,
            Value::Date(_) => ColumnType::Date,
            Value::Timestamp(_) => ColumnType::Timestamp,
        }
    }

    /// Text form used in CSV cells. NULL is the empty cell.
    pub fn to_cell(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format!("{f:?}"),
            Value::Text(s) => s.clone(),
            Value::Date(d) => d.format(DATE_FORMAT).to_string(),
            Value::Timestamp(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Persisted description of a table's columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    /// Rows holding `''`; every other empty cell is NULL.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub empty_text_rows: Vec<usize>,
}

impl Schema {
    /// Whether this schema describes a CSV with the given header.
    pub fn matches(&self, header: &[String]) -> bool {
        self.columns.len() == header.len()
            && self.columns.iter().zip(header).all(|(c, h)| c.name == *h)
    }
}

/// A resolved result table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Append a row. The row must have one value per column.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), DecomposerError> {
        if row.len() != self.columns.len() {
            return Err(DecomposerError::Internal(format!(
                "row has {} values, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Stack tables vertically. Column names and types come from the first
    /// table; every table must have the same number of columns.
    pub fn concat<'a>(
        tables: impl IntoIterator<Item = (&'a str, &'a Table)>,
    ) -> Result<Table, DecomposerError> {
        let mut out: Option<Table> = None;
        for (label, table) in tables {
            match out.as_mut() {
                None => out = Some(table.clone()),
                Some(acc) => {
                    if acc.width() != table.width() {
                        return Err(DecomposerError::SchemaMismatch {
                            step: label.to_string(),
                            expected: acc.width(),
                            found: table.width(),
                        });
                    }
                    for (col, other) in acc.columns.iter_mut().zip(&table.columns) {
                        if col.ty == ColumnType::Null {
                            col.ty = other.ty;
                        }
                    }
                    acc.rows.extend(table.rows.iter().cloned());
                }
            }
        }
        Ok(out.unwrap_or_default())
    }

    // ── CSV ────────────────────────────────────────────────────────────

    /// Write the table as CSV with a header row.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(self.columns.iter().map(|c| c.name.as_str()))?;
        for row in &self.rows {
            wtr.write_record(row.iter().map(Value::to_cell))?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Column types and empty-string positions of this table.
    pub fn schema(&self) -> Schema {
        let columns = self
            .columns
            .iter()
            .enumerate()
            .map(|(idx, col)| ColumnSchema {
                name: col.name.clone(),
                ty: col.ty,
                empty_text_rows: self
                    .rows
                    .iter()
                    .enumerate()
                    .filter(|(_, row)| matches!(row.get(idx), Some(Value::Text(s)) if s.is_empty()))
                    .map(|(i, _)| i)
                    .collect(),
            })
            .collect();
        Schema { columns }
    }

    /// Read a CSV with a header row.
    ///
    /// Column types come from `schema` when it matches the header; otherwise
    /// one type per column is inferred from the cells.
    pub fn read_csv<R: Read>(reader: R, schema: Option<&Schema>) -> Result<Table, csv::Error> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(reader);
        let names: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();

        let mut raw: Vec<Vec<String>> = Vec::new();
        for record in rdr.records() {
            let record = record?;
            raw.push(record.iter().map(str::to_string).collect());
        }

        let schema = schema.filter(|s| s.matches(&names));
        let types: Vec<ColumnType> = match schema {
            Some(schema) => schema.columns.iter().map(|c| c.ty).collect(),
            None => (0..names.len())
                .map(|idx| infer_column(raw.iter().map(|r| r[idx].as_str())))
                .collect(),
        };

        let mut rows: Vec<Vec<Value>> = raw
            .iter()
            .map(|r| {
                r.iter()
                    .zip(&types)
                    .map(|(cell, ty)| parse_cell(cell, *ty))
                    .collect()
            })
            .collect();
        if let Some(schema) = schema {
            for (idx, col) in schema.columns.iter().enumerate() {
                for &row in &col.empty_text_rows {
                    if let Some(cell) = rows.get_mut(row).and_then(|r| r.get_mut(idx)) {
                        *cell = Value::Text(String::new());
                    }
                }
            }
        }

        let columns = names
            .into_iter()
            .zip(types)
            .map(|(name, ty)| Column { name, ty })
            .collect();
        Ok(Table { columns, rows })
    }
}

// ── Type inference ─────────────────────────────────────────────────────────

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn parse_float(s: &str) -> Option<f64> {
    // `f64::from_str` also accepts "inf" and "NaN", which are text here.
    if !s.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<f64>().ok()
}

/// Pick the narrowest type that parses every non-empty cell.
fn infer_column<'a>(cells: impl Iterator<Item = &'a str> + Clone) -> ColumnType {
    let mut non_empty = cells.filter(|c| !c.is_empty()).peekable();
    if non_empty.peek().is_none() {
        return ColumnType::Null;
    }
    let all = |pred: &dyn Fn(&str) -> bool| non_empty.clone().all(pred);

    if all(&|c| parse_bool(c).is_some()) {
        ColumnType::Bool
    } else if all(&|c| c.parse::<i64>().is_ok()) {
        ColumnType::Int
    } else if all(&|c| parse_float(c).is_some()) {
        ColumnType::Float
    } else if all(&|c| parse_date(c).is_some()) {
        ColumnType::Date
    } else if all(&|c| parse_timestamp(c).is_some()) {
        ColumnType::Timestamp
    } else {
        ColumnType::Text
    }
}

/// Parse one cell as the given type. Cells that do not parse stay text.
pub fn parse_cell(cell: &str, ty: ColumnType) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    let parsed = match ty {
        ColumnType::Bool => parse_bool(cell).map(Value::Bool),
        ColumnType::Int => cell.parse().ok().map(Value::Int),
        ColumnType::Float => parse_float(cell).map(Value::Float),
        ColumnType::Date => parse_date(cell).map(Value::Date),
        ColumnType::Timestamp => parse_timestamp(cell).map(Value::Timestamp),
        ColumnType::Text | ColumnType::Null => None,
    };
    parsed.unwrap_or_else(|| Value::Text(cell.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_name_table() -> Table {
        Table::with_rows(
            vec![
                Column::new("id", ColumnType::Int),
                Column::new("name", ColumnType::Text),
            ],
            vec![
                vec![Value::Int(1), Value::Text("a".into())],
                vec![Value::Int(2), Value::Null],
            ],
        )
    }

    #[test]
    fn test_csv_roundtrip_keeps_types() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        let table = Table::with_rows(
            vec![
                Column::new("d", ColumnType::Date),
                Column::new("ts", ColumnType::Timestamp),
                Column::new("f", ColumnType::Float),
                Column::new("ok", ColumnType::Bool),
            ],
            vec![vec![
                Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
                Value::Timestamp(ts),
                Value::Float(1.0),
                Value::Bool(true),
            ]],
        );
        let mut buf = Vec::new();
        table.write_csv(&mut buf).unwrap();
        let back = Table::read_csv(buf.as_slice(), None).unwrap();
        assert_eq!(back, table);
    }

    fn lookalike_text() -> Table {
        Table::with_rows(
            vec![
                Column::new("code", ColumnType::Text),
                Column::new("label", ColumnType::Text),
            ],
            vec![
                vec![Value::Text("007".into()), Value::Text(String::new())],
                vec![Value::Text("2024-01-01".into()), Value::Null],
                vec![Value::Text("true".into()), Value::Text("x".into())],
            ],
        )
    }

    #[test]
    fn test_schema_keeps_text_that_looks_typed() {
        let table = lookalike_text();
        let schema = table.schema();
        assert_eq!(schema.columns[1].empty_text_rows, vec![0]);
        assert!(schema.columns[0].empty_text_rows.is_empty());

        let mut buf = Vec::new();
        table.write_csv(&mut buf).unwrap();
        let back = Table::read_csv(buf.as_slice(), Some(&schema)).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_schema_json_shape() {
        let json = serde_json::to_value(lookalike_text().schema()).unwrap();
        assert_eq!(json["columns"][0]["type"], "text");
        assert!(json["columns"][0].get("empty_text_rows").is_none());
        assert_eq!(json["columns"][1]["empty_text_rows"][0], 0);
    }

    #[test]
    fn test_mismatched_schema_falls_back_to_inference() {
        let mut buf = Vec::new();
        lookalike_text().write_csv(&mut buf).unwrap();
        let stale = Schema {
            columns: vec![ColumnSchema {
                name: "other".into(),
                ty: ColumnType::Text,
                empty_text_rows: vec![],
            }],
        };
        let back = Table::read_csv(buf.as_slice(), Some(&stale)).unwrap();
        assert_eq!(back.column_names(), vec!["code", "label"]);
        assert_eq!(back.rows[1][1], Value::Null);
        assert_eq!(back.rows[0][1], Value::Null);
    }

    #[test]
    fn test_read_csv_empty_cells_are_null() {
        let mut buf = Vec::new();
        id_name_table().write_csv(&mut buf).unwrap();
        let back = Table::read_csv(buf.as_slice(), None).unwrap();
        assert_eq!(back.rows[1][1], Value::Null);
        assert_eq!(back.columns[1].ty, ColumnType::Text);
    }

    #[test]
    fn test_read_csv_header_only() {
        let back = Table::read_csv("a,b\n".as_bytes(), None).unwrap();
        assert_eq!(back.column_names(), vec!["a", "b"]);
        assert!(back.is_empty());
        assert_eq!(back.columns[0].ty, ColumnType::Null);
    }

    #[test]
    fn test_infer_column_prefers_narrow_types() {
        assert_eq!(infer_column(["1", "2"].into_iter()), ColumnType::Int);
        assert_eq!(infer_column(["1", "2.5"].into_iter()), ColumnType::Float);
        assert_eq!(infer_column(["inf"].into_iter()), ColumnType::Text);
        assert_eq!(
            infer_column(["2024-01-01", "2024-01-02"].into_iter()),
            ColumnType::Date
        );
        assert_eq!(
            infer_column(["2024-01-01 10:00:00"].into_iter()),
            ColumnType::Timestamp
        );
        assert_eq!(infer_column(["", ""].into_iter()), ColumnType::Null);
    }

    #[test]
    fn test_push_row_rejects_wrong_width() {
        let mut table = Table::new(vec![Column::new("a", ColumnType::Int)]);
        assert!(table.push_row(vec![Value::Int(1)]).is_ok());
        assert!(table.push_row(vec![Value::Int(1), Value::Int(2)]).is_err());
    }

    #[test]
    fn test_concat_stacks_rows() {
        let a = id_name_table();
        let b = id_name_table();
        let both = Table::concat([("part_1", &a), ("part_2", &b)]).unwrap();
        assert_eq!(both.len(), 4);
        assert_eq!(both.columns, a.columns);
    }

    #[test]
    fn test_concat_width_mismatch() {
        let a = id_name_table();
        let b = Table::new(vec![Column::new("x", ColumnType::Int)]);
        let err = Table::concat([("part_1", &a), ("part_2", &b)]).unwrap_err();
        assert!(matches!(err, DecomposerError::SchemaMismatch { found: 1, .. }));
    }

    #[test]
    fn test_concat_nothing_is_empty() {
        let out = Table::concat(std::iter::empty()).unwrap();
        assert!(out.is_empty());
        assert_eq!(out.width(), 0);
    }
}
