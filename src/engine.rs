//! Embedded SQL engine.
//!
//! A [`Sandbox`] is an in-memory SQLite database used for everything that
//! runs in-process: evaluating backlink queries against a sibling's
//! materialized table (registered as `self`) and recomposing all
//! materialized tables with a step's trailing query.
//!
//! SQLite has no date or timestamp storage class. Temporal values are stored
//! as ISO-8601 text in columns declared `DATE` / `TIMESTAMP`, and the declared
//! type of each result column is used to turn them back into typed values.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, params_from_iter};

use crate::error::DecomposerError;
use crate::literal::quote_ident;
use crate::table::{Column, ColumnType, Table, Value, parse_cell};

/// Name under which a backlink's target table is visible to its query.
pub const SELF_TABLE: &str = "self";

fn recomposition_err(err: rusqlite::Error) -> DecomposerError {
    DecomposerError::Recomposition(err.to_string())
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Date(d) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(ts) => SqlValue::Text(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>, declared: Option<ColumnType>) -> Value {
    match (value, declared) {
        (ValueRef::Null, _) => Value::Null,
        (ValueRef::Integer(i), Some(ColumnType::Bool)) => Value::Bool(i != 0),
        (ValueRef::Integer(i), _) => Value::Int(i),
        (ValueRef::Real(f), _) => Value::Float(f),
        (ValueRef::Text(bytes), declared) => {
            let text = String::from_utf8_lossy(bytes);
            match declared {
                Some(ty @ (ColumnType::Date | ColumnType::Timestamp)) => parse_cell(&text, ty),
                _ => Value::Text(text.into_owned()),
            }
        }
        (ValueRef::Blob(bytes), _) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Column type for a result column without a usable declared type: the type
/// of its values, with integers promoted when floats are mixed in.
fn infer_result_type(rows: &[Vec<Value>], idx: usize) -> ColumnType {
    let mut ty = ColumnType::Null;
    for row in rows {
        match (ty, row[idx].column_type()) {
            (_, ColumnType::Null) => {}
            (ColumnType::Null, found) => ty = found,
            (ColumnType::Int, ColumnType::Float) => ty = ColumnType::Float,
            _ => {}
        }
    }
    ty
}

/// In-memory SQL engine over registered tables.
pub struct Sandbox {
    conn: Connection,
}

impl Sandbox {
    pub fn new() -> Result<Self, DecomposerError> {
        let conn = Connection::open_in_memory().map_err(recomposition_err)?;
        Ok(Self { conn })
    }

    /// Register `table` under `name`, replacing any previous table of that name.
    pub fn register(&mut self, name: &str, table: &Table) -> Result<(), DecomposerError> {
        if table.width() == 0 {
            return Err(DecomposerError::Recomposition(format!(
                "table '{name}' has no columns"
            )));
        }
        let ident = quote_ident(name);
        let column_defs: Vec<String> = table
            .columns
            .iter()
            .map(|c| match c.ty {
                ColumnType::Null => quote_ident(&c.name),
                ty => format!("{} {}", quote_ident(&c.name), ty.as_str()),
            })
            .collect();
        let placeholders = vec!["?"; table.width()].join(", ");

        let tx = self.conn.transaction().map_err(recomposition_err)?;
        tx.execute(&format!("DROP TABLE IF EXISTS {ident}"), [])
            .map_err(recomposition_err)?;
        tx.execute(
            &format!("CREATE TABLE {ident} ({})", column_defs.join(", ")),
            [],
        )
        .map_err(recomposition_err)?;
        {
            let mut insert = tx
                .prepare(&format!("INSERT INTO {ident} VALUES ({placeholders})"))
                .map_err(recomposition_err)?;
            for row in &table.rows {
                insert
                    .execute(params_from_iter(row.iter().map(to_sql_value)))
                    .map_err(recomposition_err)?;
            }
        }
        tx.commit().map_err(recomposition_err)
    }

    /// Run `sql` over the registered tables.
    pub fn execute(&self, sql: &str) -> Result<Table, DecomposerError> {
        let mut stmt = self.conn.prepare(sql).map_err(recomposition_err)?;
        let described: Vec<(String, Option<ColumnType>)> = stmt
            .columns()
            .iter()
            .map(|c| {
                (
                    c.name().to_string(),
                    c.decl_type().and_then(ColumnType::from_decl),
                )
            })
            .collect();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([]).map_err(recomposition_err)?;
        while let Some(row) = cursor.next().map_err(recomposition_err)? {
            let mut values = Vec::with_capacity(described.len());
            for (idx, (_, declared)) in described.iter().enumerate() {
                let value = row.get_ref(idx).map_err(recomposition_err)?;
                values.push(from_sql_value(value, *declared));
            }
            rows.push(values);
        }

        let columns: Vec<Column> = described
            .into_iter()
            .enumerate()
            .map(|(idx, (name, declared))| {
                let ty = declared.unwrap_or_else(|| infer_result_type(&rows, idx));
                Column { name, ty }
            })
            .collect();

        for (idx, col) in columns.iter().enumerate() {
            if col.ty == ColumnType::Float {
                for row in rows.iter_mut() {
                    if let Value::Int(i) = row[idx] {
                        row[idx] = Value::Float(i as f64);
                    }
                }
            }
        }
        Ok(Table { columns, rows })
    }
}

/// Evaluate `query` against `table` registered as `self`.
pub fn evaluate_on(table: &Table, query: &str) -> Result<Table, DecomposerError> {
    let mut sandbox = Sandbox::new()?;
    sandbox.register(SELF_TABLE, table)?;
    sandbox.execute(query)
}
