//! Catalog lookups: table definitions, value conversion against them, and
//! result column → table resolution.

use serde::Serialize;
use tracing::debug;

use crate::connection::Connection;
use crate::dml::Row;
use crate::error::{PgError, PgResult};
use crate::escape::{escape_identifier, escape_literal};
use crate::result::QueryResult;
use crate::types::{Oid, PgValue};

/// Column definitions of a table.
const META_QUERY: &str = r#"
SELECT
    a.attname,
    a.attnum,
    t.typname,
    a.attlen,
    a.attnotnull,
    a.atthasdef,
    a.attndims,
    t.typtype = 'e' AS is_enum
FROM pg_class c
JOIN pg_attribute a ON a.attrelid = c.oid
JOIN pg_type t ON a.atttypid = t.oid
JOIN pg_namespace n ON c.relnamespace = n.oid
WHERE a.attnum > 0
  AND NOT a.attisdropped
  AND c.relname = $1
  AND n.nspname = $2
ORDER BY a.attnum
"#;

/// Same as [`META_QUERY`], plus type kind and column comments.
const META_EXTENDED_QUERY: &str = r#"
SELECT
    a.attname,
    a.attnum,
    t.typname,
    a.attlen,
    a.attnotnull,
    a.atthasdef,
    a.attndims,
    t.typtype = 'e' AS is_enum,
    t.typtype = 'b' AS is_base,
    t.typtype = 'c' AS is_composite,
    t.typtype = 'p' AS is_pseudo,
    d.description
FROM pg_class c
JOIN pg_attribute a ON a.attrelid = c.oid
JOIN pg_type t ON a.atttypid = t.oid
JOIN pg_namespace n ON c.relnamespace = n.oid
LEFT JOIN pg_description d ON d.objoid = a.attrelid AND d.objsubid = a.attnum
WHERE a.attnum > 0
  AND NOT a.attisdropped
  AND c.relname = $1
  AND n.nspname = $2
ORDER BY a.attnum
"#;

const TABLE_NAME_QUERY: &str = "SELECT relname FROM pg_class WHERE oid = $1";

/// Definition of one table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    /// Attribute number, starting at 1
    pub num: i16,
    pub type_name: String,
    /// Storage size; -1 for variable length
    pub len: i16,
    pub not_null: bool,
    pub has_default: bool,
    pub array_dims: i32,
    pub is_enum: bool,
    /// Present when requested with `extended`
    pub extended: Option<ExtendedMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtendedMeta {
    pub is_base: bool,
    pub is_composite: bool,
    pub is_pseudo: bool,
    pub description: Option<String>,
}

/// Table a result column comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldTable {
    Oid(Oid),
    Name(String),
}

impl Connection {
    /// Column definitions of `table` (`schema.table`, default schema
    /// `public`), in attribute order.
    pub async fn meta_data(&mut self, table: &str, extended: bool) -> PgResult<Vec<ColumnMeta>> {
        let (schema, name) = match table.split_once('.') {
            Some((schema, name)) => (schema, name),
            None => ("public", table),
        };
        let sql = if extended {
            META_EXTENDED_QUERY
        } else {
            META_QUERY
        };

        let result = self
            .query_params(sql, &[PgValue::from(name), PgValue::from(schema)])
            .await?;
        if result.num_rows() == 0 {
            return Err(PgError::InvalidInput(format!(
                "Table \"{}\" does not exist",
                table
            )));
        }

        result
            .fetch_all()
            .into_iter()
            .map(|row| column_meta(&row, extended))
            .collect()
    }

    /// Check a column → value mapping against the definition of `table` and
    /// render each pair as an escaped identifier and SQL literal.
    pub async fn convert(&mut self, table: &str, data: &Row<'_>) -> PgResult<Vec<(String, String)>> {
        let columns = self.meta_data(table, false).await?;

        data.iter()
            .map(|(name, value)| -> PgResult<(String, String)> {
                let column = columns.iter().find(|c| c.name == *name).ok_or_else(|| {
                    PgError::InvalidInput(format!(
                        "Column \"{}\" does not exist in table \"{}\"",
                        name, table
                    ))
                })?;
                Ok((escape_identifier(name), convert_value(column, value)?))
            })
            .collect()
    }

    /// Table of result column `index`: its OID with `oid_only`, its name
    /// otherwise. `None` for columns that are not table columns.
    pub async fn field_table(
        &mut self,
        result: &QueryResult,
        index: usize,
        oid_only: bool,
    ) -> PgResult<Option<FieldTable>> {
        let oid = result.field_table_oid(index)?;
        if oid == Oid::UNSPECIFIED {
            return Ok(None);
        }
        if oid_only {
            return Ok(Some(FieldTable::Oid(oid)));
        }

        let param = PgValue::Raw {
            oid: Oid::OID_TYPE,
            text: oid.as_u32().to_string(),
        };
        let mut names = self.query_params(TABLE_NAME_QUERY, &[param]).await?;
        if names.num_rows() == 0 {
            debug!("no table with oid {}", oid.as_u32());
            return Ok(None);
        }

        Ok(names.fetch_result(0usize, Some(0))?.map(FieldTable::Name))
    }
}

fn column_meta(row: &[Option<String>], extended: bool) -> PgResult<ColumnMeta> {
    let text = |i: usize| -> PgResult<&str> {
        row.get(i)
            .and_then(Option::as_deref)
            .ok_or_else(|| PgError::ProtocolError(format!("Missing catalog field {}", i)))
    };
    let flag = |i: usize| text(i).map(|v| v == "t");
    let number = |i: usize| -> PgResult<i32> {
        text(i)?
            .parse()
            .map_err(|_| PgError::ProtocolError(format!("Invalid catalog number in field {}", i)))
    };

    let extended = if extended {
        Some(ExtendedMeta {
            is_base: flag(8)?,
            is_composite: flag(9)?,
            is_pseudo: flag(10)?,
            description: row.get(11).cloned().flatten(),
        })
    } else {
        None
    };

    Ok(ColumnMeta {
        name: text(0)?.to_string(),
        num: number(1)? as i16,
        type_name: text(2)?.to_string(),
        len: number(3)? as i16,
        not_null: flag(4)?,
        has_default: flag(5)?,
        array_dims: number(6)?,
        is_enum: flag(7)?,
        extended,
    })
}

/// Render `value` as a literal fit for `column`.
fn convert_value(column: &ColumnMeta, value: &PgValue) -> PgResult<String> {
    let Some(text) = value.to_text() else {
        if column.not_null && !column.has_default {
            return Err(PgError::InvalidInput(format!(
                "Column \"{}\" does not accept NULL",
                column.name
            )));
        }
        return Ok("NULL".to_string());
    };

    let invalid = || {
        PgError::InvalidInput(format!(
            "Invalid value {:?} for column \"{}\" of type {}",
            text, column.name, column.type_name
        ))
    };

    if column.array_dims > 0 {
        return Ok(escape_literal(&text));
    }

    match column.type_name.as_str() {
        "int2" | "int4" | "int8" | "oid" => {
            text.trim().parse::<i64>().map_err(|_| invalid())?;
            Ok(text.trim().to_string())
        }
        "float4" | "float8" | "numeric" => {
            let trimmed = text.trim();
            match trimmed.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(trimmed.to_string()),
                // NaN and the infinities are only valid quoted
                Ok(_) => Ok(escape_literal(trimmed)),
                Err(_) => Err(invalid()),
            }
        }
        "bool" => match text.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "y" | "yes" | "on" | "1" => Ok("TRUE".to_string()),
            "f" | "false" | "n" | "no" | "off" | "0" => Ok("FALSE".to_string()),
            _ => Err(invalid()),
        },
        _ => Ok(escape_literal(&text)),
    }
}
