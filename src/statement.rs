//! Prepared statement management.
//!
//! This module provides:
//! - `PreparedStatement`: Represents a server-side prepared statement
//! - `StatementRegistry`: the per-connection map of statement names

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{PgError, PgResult};
use crate::protocol::FieldDescription;
use crate::types::Oid;

/// Shared column descriptions - wrapped in Arc so results reuse a
/// statement's columns without cloning them.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

// ============================================================================
// Prepared Statement
// ============================================================================

/// A prepared statement that has been parsed by PostgreSQL.
///
/// Prepared statements are created via the Parse message and can be
/// executed multiple times with different parameters via Bind + Execute.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-side name; empty for the unnamed statement
    pub name: String,
    /// The SQL query text
    pub query: String,
    /// Parameter type OIDs (from ParameterDescription)
    pub param_types: Vec<Oid>,
    /// Result column descriptions (from RowDescription)
    pub columns: SharedColumns,
}

impl PreparedStatement {
    pub fn new(name: String, query: String) -> Self {
        Self {
            name,
            query,
            param_types: Vec::new(),
            columns: Arc::new(Vec::new()),
        }
    }

    /// Set the parameter types after receiving ParameterDescription.
    pub fn set_param_types(&mut self, types: Vec<Oid>) {
        self.param_types = types;
    }

    /// Set the column descriptions after receiving RowDescription.
    pub fn set_columns(&mut self, columns: SharedColumns) {
        self.columns = columns;
    }

    /// Number of `$n` placeholders the server found in the query.
    #[inline]
    pub fn param_count(&self) -> usize {
        self.param_types.len()
    }

    /// Check if this statement returns rows.
    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    #[inline]
    pub fn is_unnamed(&self) -> bool {
        self.name.is_empty()
    }
}

// ============================================================================
// Statement Registry
// ============================================================================

/// Named prepared statements of one connection.
///
/// Names are unique except for the unnamed statement (`""`), which every new
/// unnamed Parse silently replaces on the server and therefore here as well.
#[derive(Debug, Default)]
pub struct StatementRegistry {
    statements: HashMap<String, Arc<PreparedStatement>>,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail if `name` is a named statement that is already registered.
    pub fn check_available(&self, name: &str) -> PgResult<()> {
        if !name.is_empty() && self.statements.contains_key(name) {
            return Err(PgError::StatementExistsError(name.to_string()));
        }
        Ok(())
    }

    /// Register a statement the server has acknowledged.
    pub fn register(&mut self, statement: PreparedStatement) -> Arc<PreparedStatement> {
        let statement = Arc::new(statement);
        self.statements
            .insert(statement.name.clone(), Arc::clone(&statement));
        statement
    }

    pub fn lookup(&self, name: &str) -> PgResult<Arc<PreparedStatement>> {
        self.statements
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| PgError::UnknownStatementError(name.to_string()))
    }

    /// Look up `name` and check that `given` parameters fit it.
    pub fn validate(&self, name: &str, given: usize) -> PgResult<Arc<PreparedStatement>> {
        let statement = self.lookup(name)?;
        if statement.param_count() != given {
            return Err(PgError::ParameterCountError {
                name: name.to_string(),
                expected: statement.param_count(),
                given,
            });
        }
        Ok(statement)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.statements.contains_key(name)
    }

    /// Forget the unnamed statement; the server replaces it on the next
    /// unnamed Parse.
    pub fn evict_unnamed(&mut self) -> Option<Arc<PreparedStatement>> {
        self.statements.remove("")
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<PreparedStatement>> {
        self.statements.remove(name)
    }

    pub fn clear(&mut self) {
        self.statements.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.statements.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
