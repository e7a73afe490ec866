//! Remote database boundary.
//!
//! Materialization only needs "run this SQL text, give me a typed table".
//! [`RemoteDatabase`] captures that, with one distinguished failure:
//! [`RemoteError::TooComplex`] for statement shapes the server refuses
//! outright (SQLSTATE `54001`). Everything else is [`RemoteError::Other`].
//!
//! [`PgRemote`] is the production implementation over the synchronous
//! `postgres` client. One handle serves one query at a time.

use std::error::Error;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use postgres::error::SqlState;
use postgres::types::{FromSql, Type};
use postgres::{Client, NoTls, Row};

use crate::config::DatabaseSettings;
use crate::error::DecomposerError;
use crate::table::{Column, ColumnType, Table, Value};

/// Failure reported by a remote database.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The server refused the statement shape.
    #[error("statement too complex: {0}")]
    TooComplex(String),
    /// Any other failure, with the full server text.
    #[error("{0}")]
    Other(String),
}

/// A connection that executes SQL text and returns a typed table.
pub trait RemoteDatabase {
    fn fetch(&mut self, sql: &str) -> Result<Table, RemoteError>;
}

// ── PostgreSQL ─────────────────────────────────────────────────────────────

/// Remote database over a blocking PostgreSQL connection.
pub struct PgRemote {
    client: Client,
}

impl PgRemote {
    pub fn connect(settings: &DatabaseSettings) -> Result<Self, DecomposerError> {
        let mut config = postgres::Config::new();
        config
            .host(&settings.host)
            .port(settings.port)
            .user(&settings.user)
            .dbname(&settings.dbname);
        if !settings.password.is_empty() {
            config.password(&settings.password);
        }
        let client = config.connect(NoTls).map_err(|e| {
            let text = e.to_string();
            DecomposerError::Connection(text.lines().next().unwrap_or_default().to_string())
        })?;
        Ok(Self { client })
    }
}

fn classify(err: postgres::Error) -> RemoteError {
    let message = err
        .as_db_error()
        .map(|db| db.to_string())
        .unwrap_or_else(|| err.to_string());
    if err.code() == Some(&SqlState::STATEMENT_TOO_COMPLEX) {
        RemoteError::TooComplex(message)
    } else {
        RemoteError::Other(message)
    }
}

impl RemoteDatabase for PgRemote {
    fn fetch(&mut self, sql: &str) -> Result<Table, RemoteError> {
        let stmt = self.client.prepare(sql).map_err(classify)?;
        let columns = stmt
            .columns()
            .iter()
            .map(|c| {
                column_type_for(c.type_())
                    .map(|ty| Column::new(c.name(), ty))
                    .ok_or_else(|| {
                        RemoteError::Other(format!(
                            "column '{}' has unsupported type {}",
                            c.name(),
                            c.type_()
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let rows = self.client.query(&stmt, &[]).map_err(classify)?;
        let mut table = Table::new(columns);
        for row in &rows {
            let values = decode_row(row, &table.columns)?;
            table
                .push_row(values)
                .map_err(|e| RemoteError::Other(e.to_string()))?;
        }
        Ok(table)
    }
}

/// Map a PostgreSQL column type to the table column type it decodes into.
fn column_type_for(ty: &Type) -> Option<ColumnType> {
    let mapped = match *ty {
        Type::BOOL => ColumnType::Bool,
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => ColumnType::Int,
        Type::FLOAT4 | Type::FLOAT8 | Type::NUMERIC => ColumnType::Float,
        Type::DATE => ColumnType::Date,
        Type::TIMESTAMP | Type::TIMESTAMPTZ => ColumnType::Timestamp,
        Type::JSON | Type::JSONB => ColumnType::Text,
        ref other if <String as FromSql>::accepts(other) => ColumnType::Text,
        _ => return None,
    };
    Some(mapped)
}

fn decode_row(row: &Row, columns: &[Column]) -> Result<Vec<Value>, RemoteError> {
    let mut values = Vec::with_capacity(columns.len());
    for idx in 0..columns.len() {
        values.push(decode_cell(row, idx).map_err(|e| {
            RemoteError::Other(format!("decoding column '{}': {e}", columns[idx].name))
        })?);
    }
    Ok(values)
}

fn decode_cell(row: &Row, idx: usize) -> Result<Value, postgres::Error> {
    let ty = row.columns()[idx].type_().clone();
    let value = match ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Int(v.into())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| Value::Int(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|v| Value::Int(v.into())),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| Value::Float(v.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<PgNumeric>>(idx)?
            .map(|v| Value::Float(v.0)),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(Value::Date),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(Value::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| Value::Timestamp(v.naive_utc())),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|v| Value::Text(v.to_string())),
        _ => row.try_get::<_, Option<String>>(idx)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}

// ── NUMERIC ────────────────────────────────────────────────────────────────

/// A `numeric` value decoded (lossily) to `f64`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PgNumeric(pub f64);

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Decode the binary wire format of `numeric`: a header of `ndigits`,
/// `weight`, `sign`, `dscale` (all 16-bit) followed by base-10000 digits.
pub fn decode_numeric(raw: &[u8]) -> Result<f64, Box<dyn Error + Sync + Send>> {
    if raw.len() < 8 {
        return Err("numeric header truncated".into());
    }
    let word = |i: usize| u16::from_be_bytes([raw[2 * i], raw[2 * i + 1]]);
    let ndigits = word(0) as usize;
    let weight = word(1) as i16;
    let sign = word(2);

    match sign {
        NUMERIC_NAN => return Ok(f64::NAN),
        NUMERIC_PINF => return Ok(f64::INFINITY),
        NUMERIC_NINF => return Ok(f64::NEG_INFINITY),
        _ => {}
    }
    if raw.len() < 8 + 2 * ndigits {
        return Err("numeric digits truncated".into());
    }

    let mut value = 0.0_f64;
    for i in 0..ndigits {
        let digit = f64::from(word(4 + i));
        let exponent = i32::from(weight) - i as i32;
        value += digit * 10_000_f64.powi(exponent);
    }
    Ok(if sign == NUMERIC_NEG { -value } else { value })
}

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        decode_numeric(raw).map(PgNumeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}
