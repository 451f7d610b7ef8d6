//! Buffered query results.
//!
//! A [`QueryResult`] holds every row of one command's response in text
//! format, plus the column metadata captured from RowDescription. Rows are
//! accessed randomly or through an internal cursor that the `fetch_*` calls
//! advance.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{DbError, ErrorField, PgError, PgResult};
use crate::protocol::FieldDescription;
use crate::statement::SharedColumns;
use crate::types::{Oid, PgValue};

/// Terminal status of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultStatus {
    /// The query string was empty
    EmptyQuery,
    /// A command that returns no rows completed
    CommandOk,
    /// A command returning rows completed (possibly zero rows)
    TuplesOk,
    /// COPY TO STDOUT has started
    CopyOut,
    /// COPY FROM STDIN has started
    CopyIn,
    /// The server's response was not understood
    BadResponse,
    NonfatalError,
    FatalError,
}

/// A column addressed by position or by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRef<'a> {
    Index(usize),
    Name(&'a str),
}

impl From<usize> for FieldRef<'_> {
    fn from(index: usize) -> Self {
        FieldRef::Index(index)
    }
}

impl<'a> From<&'a str> for FieldRef<'a> {
    fn from(name: &'a str) -> Self {
        FieldRef::Name(name)
    }
}

/// Result of one command.
#[derive(Debug, Clone)]
pub struct QueryResult {
    status: ResultStatus,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    command_tag: String,
    columns: SharedColumns,
    rows: Vec<Vec<Option<Bytes>>>,
    /// Next row returned by a cursor fetch; always in `0..=rows.len()`
    cursor: usize,
    error: Option<DbError>,
}

impl QueryResult {
    pub(crate) fn new(status: ResultStatus) -> Self {
        Self {
            status,
            command_tag: String::new(),
            columns: Arc::new(Vec::new()),
            rows: Vec::new(),
            cursor: 0,
            error: None,
        }
    }

    /// A completed command. Results carrying a row description are
    /// `TuplesOk` even when no rows came back.
    pub(crate) fn completed(
        columns: SharedColumns,
        rows: Vec<Vec<Option<Bytes>>>,
        command_tag: String,
    ) -> Self {
        let status = if columns.is_empty() {
            ResultStatus::CommandOk
        } else {
            ResultStatus::TuplesOk
        };
        Self {
            status,
            command_tag,
            columns,
            rows,
            cursor: 0,
            error: None,
        }
    }

    pub(crate) fn failed(error: DbError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(ResultStatus::FatalError)
        }
    }

    #[inline]
    pub fn status(&self) -> ResultStatus {
        self.status
    }

    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    /// The backend error of a `FatalError` result.
    pub fn error(&self) -> Option<&DbError> {
        self.error.as_ref()
    }

    pub fn error_field(&self, field: ErrorField) -> Option<&str> {
        self.error.as_ref().and_then(|e| e.field(field))
    }

    pub fn columns(&self) -> &[FieldDescription] {
        &self.columns
    }

    // ========================================================================
    // Command tag
    // ========================================================================

    /// Rows touched by INSERT, UPDATE, DELETE, MERGE, COPY, MOVE or FETCH.
    ///
    /// SELECT-shaped results report 0.
    pub fn affected_rows(&self) -> u64 {
        let mut words = self.command_tag.split_whitespace();
        match words.next() {
            Some("INSERT" | "UPDATE" | "DELETE" | "MERGE" | "COPY" | "MOVE" | "FETCH") => words
                .last()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// OID of the inserted row for a single-row INSERT into a table with OIDs.
    pub fn last_oid(&self) -> Option<Oid> {
        let mut words = self.command_tag.split_whitespace();
        if words.next() != Some("INSERT") {
            return None;
        }
        match words.next()?.parse::<u32>().ok()? {
            0 => None,
            oid => Some(Oid(oid)),
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn num_fields(&self) -> usize {
        self.columns.len()
    }

    pub fn field_name(&self, index: usize) -> PgResult<&str> {
        self.column(index).map(|c| c.name.as_str())
    }

    /// Position of the named column, or -1.
    pub fn field_num(&self, name: &str) -> i32 {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .map_or(-1, |i| i as i32)
    }

    /// Type name of a builtin type, `"unknown"` for anything else.
    pub fn field_type(&self, index: usize) -> PgResult<&'static str> {
        let column = self.column(index)?;
        Ok(column.type_oid.type_name().unwrap_or("unknown"))
    }

    pub fn field_type_oid(&self, index: usize) -> PgResult<Oid> {
        self.column(index).map(|c| c.type_oid)
    }

    /// Internal storage size of the column's type; -1 for variable length.
    pub fn field_size(&self, index: usize) -> PgResult<i16> {
        self.column(index).map(|c| c.type_size)
    }

    /// OID of the table the column comes from; 0 for computed columns.
    pub fn field_table_oid(&self, index: usize) -> PgResult<Oid> {
        self.column(index).map(|c| c.table_oid)
    }

    /// Whether a field is NULL. Without a row, the cursor row is checked
    /// and the cursor does not move.
    pub fn field_is_null<'a>(
        &self,
        field: impl Into<FieldRef<'a>>,
        row: Option<usize>,
    ) -> PgResult<bool> {
        let row = self.check_row(row.unwrap_or(self.cursor))?;
        let col = self.resolve(field.into())?;
        Ok(self.rows[row][col].is_none())
    }

    /// Length in bytes of a field's text; 0 for NULL.
    pub fn field_prtlen<'a>(
        &self,
        field: impl Into<FieldRef<'a>>,
        row: Option<usize>,
    ) -> PgResult<usize> {
        let row = self.check_row(row.unwrap_or(self.cursor))?;
        let col = self.resolve(field.into())?;
        Ok(self.rows[row][col].as_ref().map_or(0, Bytes::len))
    }

    // ========================================================================
    // Cursor
    // ========================================================================

    /// Move the cursor to `offset`. Returns `false` and leaves the cursor
    /// alone unless `0 <= offset < num_rows`.
    pub fn seek(&mut self, offset: i64) -> bool {
        match usize::try_from(offset) {
            Ok(row) if row < self.rows.len() => {
                self.cursor = row;
                true
            }
            _ => false,
        }
    }

    /// Row the next cursor fetch will return.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    /// Fetch a row as text. With `None` the cursor row is fetched; either way
    /// the cursor ends up after the fetched row.
    pub fn fetch_row(&mut self, row: Option<usize>) -> PgResult<Vec<Option<String>>> {
        let row = self.advance(row)?;
        Ok(self.rows[row].iter().map(|v| v.as_deref().map(text)).collect())
    }

    /// Fetch one field as text. Without a row the cursor row is read and the
    /// cursor advances; an explicit row leaves the cursor alone.
    pub fn fetch_result<'a>(
        &mut self,
        field: impl Into<FieldRef<'a>>,
        row: Option<usize>,
    ) -> PgResult<Option<String>> {
        let (row, col) = self.locate(field.into(), row)?;
        Ok(self.rows[row][col].as_deref().map(text))
    }

    /// Like [`fetch_result`](Self::fetch_result), parsed according to the
    /// column type.
    pub fn fetch_value<'a>(
        &mut self,
        field: impl Into<FieldRef<'a>>,
        row: Option<usize>,
    ) -> PgResult<PgValue> {
        let (row, col) = self.locate(field.into(), row)?;
        match self.rows[row][col] {
            Some(ref data) => PgValue::decode_text(self.columns[col].type_oid, data),
            None => Ok(PgValue::Null),
        }
    }

    /// Deserialize a row into `T`, keyed by column name. Use
    /// `serde_json::Value` for a generic object. Cursor handling as in
    /// [`fetch_row`](Self::fetch_row).
    pub fn fetch_object<T: DeserializeOwned>(&mut self, row: Option<usize>) -> PgResult<T> {
        let row = self.advance(row)?;
        let object = self.row_object(row)?;
        serde_json::from_value(Value::Object(object))
            .map_err(|e| PgError::TypeError(format!("Cannot map row {}: {}", row, e)))
    }

    /// Every row as text. The cursor does not move.
    pub fn fetch_all(&self) -> Vec<Vec<Option<String>>> {
        self.rows
            .iter()
            .map(|r| r.iter().map(|v| v.as_deref().map(text)).collect())
            .collect()
    }

    /// One column of every row as text.
    pub fn fetch_all_columns(&self, column: usize) -> PgResult<Vec<Option<String>>> {
        self.column(column)?;
        Ok(self
            .rows
            .iter()
            .map(|r| r[column].as_deref().map(text))
            .collect())
    }

    /// Release the buffered rows.
    pub fn free(self) {}

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn column(&self, index: usize) -> PgResult<&FieldDescription> {
        self.columns
            .get(index)
            .ok_or_else(|| PgError::InvalidColumnError(format!("index {}", index)))
    }

    fn resolve(&self, field: FieldRef<'_>) -> PgResult<usize> {
        match field {
            FieldRef::Index(i) => self.column(i).map(|_| i),
            FieldRef::Name(name) => usize::try_from(self.field_num(name))
                .map_err(|_| PgError::InvalidColumnError(format!("\"{}\"", name))),
        }
    }

    fn check_row(&self, row: usize) -> PgResult<usize> {
        if row >= self.rows.len() {
            return Err(PgError::RowNotFoundError {
                row,
                rows: self.rows.len(),
            });
        }
        Ok(row)
    }

    /// Pick the row for a row-level fetch and move the cursor past it.
    fn advance(&mut self, row: Option<usize>) -> PgResult<usize> {
        let row = self.check_row(row.unwrap_or(self.cursor))?;
        self.cursor = row + 1;
        Ok(row)
    }

    /// Pick row and column for a field-level fetch.
    fn locate(&mut self, field: FieldRef<'_>, row: Option<usize>) -> PgResult<(usize, usize)> {
        let col = self.resolve(field)?;
        let row = match row {
            Some(row) => self.check_row(row)?,
            None => self.advance(None)?,
        };
        Ok((row, col))
    }

    fn row_object(&self, row: usize) -> PgResult<Map<String, Value>> {
        let mut object = Map::with_capacity(self.columns.len());
        for (column, value) in self.columns.iter().zip(&self.rows[row]) {
            let value = match value {
                Some(data) => PgValue::decode_text(column.type_oid, data)?.to_json(),
                None => Value::Null,
            };
            object.insert(column.name.clone(), value);
        }
        Ok(object)
    }
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}
