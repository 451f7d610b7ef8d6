//! INSERT/UPDATE/DELETE/SELECT builders over a column → value mapping.
//!
//! Each builder produces a [`DmlQuery`] holding both a parameterized form
//! (`$n` placeholders plus values, what [`Connection`] executes) and an
//! inline form with escaped literals for callers that want the SQL text.
//! Identifiers are always quoted, so names are case sensitive.

use crate::connection::Connection;
use crate::error::{PgError, PgResult};
use crate::escape::escape_identifier;
use crate::result::QueryResult;
use crate::types::PgValue;

/// Column name and value pairs, in column order.
pub type Row<'a> = [(&'a str, PgValue)];

/// A built DML statement.
#[derive(Debug, Clone, PartialEq)]
pub struct DmlQuery {
    sql: String,
    inline: String,
    params: Vec<PgValue>,
}

impl DmlQuery {
    /// SQL with `$1..$n` placeholders.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[PgValue] {
        &self.params
    }

    /// SQL with every value inlined as an escaped literal.
    pub fn to_inline_sql(&self) -> &str {
        &self.inline
    }

    pub fn into_parts(self) -> (String, Vec<PgValue>) {
        (self.sql, self.params)
    }
}

/// Appends the same text to both renderings.
#[derive(Default)]
struct Builder {
    sql: String,
    inline: String,
    params: Vec<PgValue>,
}

impl Builder {
    fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self.inline.push_str(text);
        self
    }

    fn value(&mut self, value: &PgValue) -> &mut Self {
        self.params.push(value.clone());
        self.sql.push_str(&format!("${}", self.params.len()));
        self.inline.push_str(&value.to_sql_literal());
        self
    }

    /// `a = $1 <sep> b = $2`; NULL compares with `IS NULL` in conditions.
    fn assignments(&mut self, pairs: &Row<'_>, sep: &str, condition: bool) -> &mut Self {
        for (i, (column, value)) in pairs.iter().enumerate() {
            if i > 0 {
                self.push(sep);
            }
            self.push(&escape_identifier(column));
            if condition && value.is_null() {
                self.push(" IS NULL");
            } else {
                self.push(" = ").value(value);
            }
        }
        self
    }

    fn where_clause(&mut self, condition: &Row<'_>) -> &mut Self {
        if !condition.is_empty() {
            self.push(" WHERE ").assignments(condition, " AND ", true);
        }
        self
    }

    fn finish(&mut self) -> DmlQuery {
        let mut builder = std::mem::take(self);
        builder.inline.push(';');
        DmlQuery {
            sql: builder.sql,
            inline: builder.inline,
            params: builder.params,
        }
    }
}

/// Quote a possibly schema-qualified table name part by part.
fn table_name(table: &str) -> PgResult<String> {
    if table.is_empty() || table.split('.').any(str::is_empty) {
        return Err(PgError::InvalidInput(format!(
            "Invalid table name \"{}\"",
            table
        )));
    }
    Ok(table
        .split('.')
        .map(escape_identifier)
        .collect::<Vec<_>>()
        .join("."))
}

/// `INSERT INTO table (cols) VALUES (...)`, or `DEFAULT VALUES` for no data.
pub fn insert(table: &str, data: &Row<'_>) -> PgResult<DmlQuery> {
    let mut b = Builder::default();
    b.push("INSERT INTO ").push(&table_name(table)?);

    if data.is_empty() {
        b.push(" DEFAULT VALUES");
        return Ok(b.finish());
    }

    let columns: Vec<String> = data.iter().map(|(c, _)| escape_identifier(c)).collect();
    b.push(" (").push(&columns.join(",")).push(") VALUES (");
    for (i, (_, value)) in data.iter().enumerate() {
        if i > 0 {
            b.push(",");
        }
        b.value(value);
    }
    b.push(")");

    Ok(b.finish())
}

/// `UPDATE table SET ... WHERE ...`. Both mappings must be non-empty.
pub fn update(table: &str, data: &Row<'_>, condition: &Row<'_>) -> PgResult<DmlQuery> {
    if data.is_empty() {
        return Err(PgError::InvalidInput("No columns to update".to_string()));
    }
    if condition.is_empty() {
        return Err(PgError::InvalidInput(
            "Update requires a condition".to_string(),
        ));
    }

    let mut b = Builder::default();
    b.push("UPDATE ")
        .push(&table_name(table)?)
        .push(" SET ")
        .assignments(data, ", ", false)
        .where_clause(condition);
    Ok(b.finish())
}

/// `DELETE FROM table WHERE ...`. An empty condition is refused.
pub fn delete(table: &str, condition: &Row<'_>) -> PgResult<DmlQuery> {
    if condition.is_empty() {
        return Err(PgError::InvalidInput(
            "Delete requires a condition".to_string(),
        ));
    }

    let mut b = Builder::default();
    b.push("DELETE FROM ")
        .push(&table_name(table)?)
        .where_clause(condition);
    Ok(b.finish())
}

/// `SELECT * FROM table WHERE ...`; no condition selects every row.
pub fn select(table: &str, condition: &Row<'_>) -> PgResult<DmlQuery> {
    let mut b = Builder::default();
    b.push("SELECT * FROM ")
        .push(&table_name(table)?)
        .where_clause(condition);
    Ok(b.finish())
}

impl Connection {
    /// Insert one row.
    pub async fn insert(&mut self, table: &str, data: &Row<'_>) -> PgResult<QueryResult> {
        self.execute_dml(insert(table, data)?).await
    }

    pub async fn update(
        &mut self,
        table: &str,
        data: &Row<'_>,
        condition: &Row<'_>,
    ) -> PgResult<QueryResult> {
        self.execute_dml(update(table, data, condition)?).await
    }

    pub async fn delete(&mut self, table: &str, condition: &Row<'_>) -> PgResult<QueryResult> {
        self.execute_dml(delete(table, condition)?).await
    }

    /// Rows of `table` matching every condition.
    pub async fn select(&mut self, table: &str, condition: &Row<'_>) -> PgResult<QueryResult> {
        self.execute_dml(select(table, condition)?).await
    }

    /// Run a built statement with its parameters.
    pub async fn execute_dml(&mut self, query: DmlQuery) -> PgResult<QueryResult> {
        let (sql, params) = query.into_parts();
        self.query_params(&sql, &params).await
    }
}
