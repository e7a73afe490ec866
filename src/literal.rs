//! Literal table serializer.
//!
//! Turns a resolved [`Table`] into a `VALUES` table expression that can be
//! injected as a CTE into SQL text sent to a *different* system than the one
//! that produced the rows. Every literal is therefore rendered explicitly,
//! including casts for temporal values.
//!
//! Duplicate rows are emitted once: the injected table is used as a lookup
//! set, not as a relation with multiplicity.

use std::collections::HashSet;

use crate::table::{ColumnType, Table, Value};

/// Render one value as a SQL literal.
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => format!("{f:?}"),
        Value::Float(f) => format!("'{f}'::double precision"),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Date(d) => format!("'{}'::date", d.format("%Y-%m-%d")),
        Value::Timestamp(ts) => format!("'{}'::timestamp", ts.format("%Y-%m-%d %H:%M:%S")),
    }
}

/// Placeholder value for one column of an empty table.
pub fn dummy_literal(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Timestamp => "'1970-01-01 00:00:00'::timestamp",
        ColumnType::Date => "'1970-01-01'::date",
        ColumnType::Text => "'dummy'",
        ColumnType::Int | ColumnType::Float => "-1",
        ColumnType::Bool => "FALSE",
        ColumnType::Null => "NULL",
    }
}

/// Quote a SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Comma-separated list of quoted column names.
fn col_list(table: &Table) -> String {
    table
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Distinct rows of `table` rendered as `(v1, v2, …)`, in first-seen order.
fn distinct_rows(table: &Table) -> Vec<String> {
    let mut seen = HashSet::new();
    table
        .rows
        .iter()
        .map(|row| {
            let rendered: Vec<String> = row.iter().map(sql_literal).collect();
            format!("({})", rendered.join(", "))
        })
        .filter(|row| seen.insert(row.clone()))
        .collect()
}

/// Serialize `table` as a named table expression:
///
/// ```sql
/// backlink_0 as (
///     select * from ( VALUES
///         (1, 'a'),
///         (2, 'b')
///     ) as t("id", "name")
/// )
/// ```
///
/// An empty table yields a single row of typed dummy values so the generated
/// SQL stays valid.
pub fn serialize_table(table: &Table, name: &str) -> String {
    let rows = if table.is_empty() {
        let dummies: Vec<&str> = table.columns.iter().map(|c| dummy_literal(c.ty)).collect();
        vec![format!("({})", dummies.join(", "))]
    } else {
        distinct_rows(table)
    };
    format!(
        "{name} as (\n    select * from ( VALUES\n        {}\n    ) as t({})\n)",
        rows.join(",\n        "),
        col_list(table)
    )
}

/// Prefix `body` with a `WITH` clause chaining the given table expressions.
/// Returns `body` unchanged when there are none.
pub fn inject(expressions: &[String], body: &str) -> String {
    if expressions.is_empty() {
        return body.to_string();
    }
    format!("with {}\n{body}", expressions.join(",\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Column;
    use chrono::NaiveDate;

    fn id_name(rows: Vec<(i64, &str)>) -> Table {
        Table::with_rows(
            vec![
                Column::new("id", ColumnType::Int),
                Column::new("name", ColumnType::Text),
            ],
            rows.into_iter()
                .map(|(id, name)| vec![Value::Int(id), Value::Text(name.to_string())])
                .collect(),
        )
    }

    #[test]
    fn test_duplicate_rows_collapse() {
        let sql = serialize_table(&id_name(vec![(1, "a"), (1, "a")]), "backlink_0");
        assert_eq!(sql.matches("(1, 'a')").count(), 1);
        assert!(sql.contains("as t(\"id\", \"name\")"));
        assert!(sql.starts_with("backlink_0 as ("));
    }

    #[test]
    fn test_first_seen_order_kept() {
        let sql = serialize_table(&id_name(vec![(2, "b"), (1, "a"), (2, "b")]), "x");
        let b = sql.find("(2, 'b')").unwrap();
        let a = sql.find("(1, 'a')").unwrap();
        assert!(b < a);
    }

    #[test]
    fn test_temporal_literals_are_cast() {
        let d = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let ts = d.and_hms_opt(8, 5, 3).unwrap();
        assert_eq!(sql_literal(&Value::Date(d)), "'2024-02-29'::date");
        assert_eq!(
            sql_literal(&Value::Timestamp(ts)),
            "'2024-02-29 08:05:03'::timestamp"
        );
    }

    #[test]
    fn test_text_escaping_and_scalars() {
        assert_eq!(sql_literal(&Value::Text("o'brien".into())), "'o''brien'");
        assert_eq!(sql_literal(&Value::Null), "NULL");
        assert_eq!(sql_literal(&Value::Bool(true)), "TRUE");
        assert_eq!(sql_literal(&Value::Float(2.5)), "2.5");
        assert_eq!(sql_literal(&Value::Float(3.0)), "3.0");
        assert_eq!(
            sql_literal(&Value::Float(f64::NAN)),
            "'NaN'::double precision"
        );
    }

    #[test]
    fn test_empty_table_one_dummy_per_column() {
        let table = Table::new(vec![
            Column::new("id", ColumnType::Int),
            Column::new("name", ColumnType::Text),
            Column::new("day", ColumnType::Date),
            Column::new("at", ColumnType::Timestamp),
        ]);
        let sql = serialize_table(&table, "backlink_1");
        assert!(sql.contains(
            "(-1, 'dummy', '1970-01-01'::date, '1970-01-01 00:00:00'::timestamp)"
        ));
        assert!(sql.contains("as t(\"id\", \"name\", \"day\", \"at\")"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("customer_id"), "\"customer_id\"");
        assert_eq!(quote_ident("Customer"), "\"Customer\"");
        assert_eq!(quote_ident("count(*)"), "\"count(*)\"");
        assert_eq!(quote_ident("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_reserved_word_columns_are_quoted() {
        let table = Table::with_rows(
            vec![
                Column::new("user", ColumnType::Text),
                Column::new("order", ColumnType::Int),
            ],
            vec![vec![Value::Text("ada".into()), Value::Int(1)]],
        );
        let sql = serialize_table(&table, "backlink_0");
        assert!(sql.contains("as t(\"user\", \"order\")"));
    }

    #[test]
    fn test_inject_prefix() {
        assert_eq!(inject(&[], "select 1"), "select 1");
        let injected = inject(
            &["a as (select 1)".to_string(), "b as (select 2)".to_string()],
            "select * from a",
        );
        assert_eq!(injected, "with a as (select 1),\nb as (select 2)\nselect * from a");
    }
}
