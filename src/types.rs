//! PostgreSQL type identifiers and values.
//!
//! Every value crosses the wire in text format: parameters are rendered with
//! [`PgValue::to_text`] and result fields are parsed with
//! [`PgValue::decode_text`] according to the column's type OID.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use uuid::Uuid;

use crate::error::{PgError, PgResult};
use crate::escape;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Oid(pub u32);

impl Oid {
    /// Let the server infer the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const REGPROC: Oid = Oid(24);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const XML: Oid = Oid(142);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const MONEY: Oid = Oid(790);
    pub const MACADDR: Oid = Oid(829);
    pub const INET: Oid = Oid(869);
    pub const CIDR: Oid = Oid(650);
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);
    pub const BIT: Oid = Oid(1560);
    pub const VARBIT: Oid = Oid(1562);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID_TYPE)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }

    /// Catalog name (`pg_type.typname`) of a builtin type.
    pub fn type_name(self) -> Option<&'static str> {
        let name = match self {
            Oid::BOOL => "bool",
            Oid::BYTEA => "bytea",
            Oid::CHAR => "char",
            Oid::NAME => "name",
            Oid::INT8 => "int8",
            Oid::INT2 => "int2",
            Oid::INT4 => "int4",
            Oid::REGPROC => "regproc",
            Oid::TEXT => "text",
            Oid::OID_TYPE => "oid",
            Oid::JSON => "json",
            Oid::XML => "xml",
            Oid::FLOAT4 => "float4",
            Oid::FLOAT8 => "float8",
            Oid::UNKNOWN => "unknown",
            Oid::MONEY => "money",
            Oid::MACADDR => "macaddr",
            Oid::INET => "inet",
            Oid::CIDR => "cidr",
            Oid::BOOL_ARRAY => "_bool",
            Oid::INT2_ARRAY => "_int2",
            Oid::INT4_ARRAY => "_int4",
            Oid::TEXT_ARRAY => "_text",
            Oid::VARCHAR_ARRAY => "_varchar",
            Oid::INT8_ARRAY => "_int8",
            Oid::FLOAT8_ARRAY => "_float8",
            Oid::BPCHAR => "bpchar",
            Oid::VARCHAR => "varchar",
            Oid::DATE => "date",
            Oid::TIME => "time",
            Oid::TIMESTAMP => "timestamp",
            Oid::TIMESTAMPTZ => "timestamptz",
            Oid::INTERVAL => "interval",
            Oid::TIMETZ => "timetz",
            Oid::BIT => "bit",
            Oid::VARBIT => "varbit",
            Oid::NUMERIC => "numeric",
            Oid::UUID => "uuid",
            Oid::JSONB => "jsonb",
            _ => return None,
        };
        Some(name)
    }
}

impl From<u32> for Oid {
    fn from(oid: u32) -> Self {
        Oid(oid)
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const TIMESTAMPTZ_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%#z";

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Arbitrary precision, kept as its decimal text.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Json(serde_json::Value),
    /// A type without a dedicated variant, in its text representation.
    Raw { oid: Oid, text: String },
}

impl PgValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Render in PostgreSQL text format. `None` is SQL NULL.
    pub fn to_text(&self) -> Option<String> {
        let text = match self {
            PgValue::Null => return None,
            PgValue::Bool(v) => (if *v { "t" } else { "f" }).to_string(),
            PgValue::Int2(v) => v.to_string(),
            PgValue::Int4(v) => v.to_string(),
            PgValue::Int8(v) => v.to_string(),
            PgValue::Float4(v) if v.is_finite() => v.to_string(),
            PgValue::Float4(v) => float_text(f64::from(*v)),
            PgValue::Float8(v) => float_text(*v),
            PgValue::Numeric(v) => v.clone(),
            PgValue::Text(v) => v.clone(),
            PgValue::Bytea(v) => escape::escape_bytea(v),
            PgValue::Uuid(v) => v.hyphenated().to_string(),
            PgValue::Date(v) => v.format(DATE_FORMAT).to_string(),
            PgValue::Time(v) => v.format(TIME_FORMAT).to_string(),
            PgValue::Timestamp(v) => v.format(TIMESTAMP_FORMAT).to_string(),
            PgValue::TimestampTz(v) => v.to_rfc3339(),
            PgValue::Json(v) => v.to_string(),
            PgValue::Raw { text, .. } => text.clone(),
        };
        Some(text)
    }

    /// Render as an SQL literal for inline use (`NULL` or an escaped literal).
    pub fn to_sql_literal(&self) -> String {
        match self.to_text() {
            None => "NULL".to_string(),
            Some(text) => escape::escape_literal(&text),
        }
    }

    /// Parse a text-format field of the given type.
    ///
    /// Date and time values outside chrono's range (`infinity`, BC dates) fall
    /// back to [`PgValue::Raw`].
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| PgError::TypeError(format!("Invalid UTF-8 in field: {}", e)))?;

        let raw = || PgValue::Raw {
            oid,
            text: text.to_string(),
        };

        match oid {
            Oid::BOOL => match text {
                "t" | "true" => Ok(PgValue::Bool(true)),
                "f" | "false" => Ok(PgValue::Bool(false)),
                _ => Err(PgError::TypeError(format!("Invalid BOOL: {}", text))),
            },

            Oid::INT2 => text
                .parse::<i16>()
                .map(PgValue::Int2)
                .map_err(|e| PgError::TypeError(format!("Invalid INT2: {}", e))),

            Oid::INT4 => text
                .parse::<i32>()
                .map(PgValue::Int4)
                .map_err(|e| PgError::TypeError(format!("Invalid INT4: {}", e))),

            Oid::INT8 | Oid::OID_TYPE => text
                .parse::<i64>()
                .map(PgValue::Int8)
                .map_err(|e| PgError::TypeError(format!("Invalid INT8: {}", e))),

            Oid::FLOAT4 => text
                .parse::<f32>()
                .map(PgValue::Float4)
                .map_err(|e| PgError::TypeError(format!("Invalid FLOAT4: {}", e))),

            Oid::FLOAT8 => text
                .parse::<f64>()
                .map(PgValue::Float8)
                .map_err(|e| PgError::TypeError(format!("Invalid FLOAT8: {}", e))),

            Oid::NUMERIC => Ok(PgValue::Numeric(text.to_string())),

            Oid::BYTEA => escape::unescape_bytea(text).map(PgValue::Bytea),

            Oid::UUID => Uuid::parse_str(text)
                .map(PgValue::Uuid)
                .map_err(|e| PgError::TypeError(format!("Invalid UUID: {}", e))),

            Oid::DATE => Ok(NaiveDate::parse_from_str(text, DATE_FORMAT)
                .map(PgValue::Date)
                .unwrap_or_else(|_| raw())),

            Oid::TIME => Ok(NaiveTime::parse_from_str(text, TIME_FORMAT)
                .map(PgValue::Time)
                .unwrap_or_else(|_| raw())),

            Oid::TIMESTAMP => Ok(NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
                .map(PgValue::Timestamp)
                .unwrap_or_else(|_| raw())),

            Oid::TIMESTAMPTZ => Ok(DateTime::parse_from_str(text, TIMESTAMPTZ_FORMAT)
                .map(PgValue::TimestampTz)
                .unwrap_or_else(|_| raw())),

            Oid::JSON | Oid::JSONB => serde_json::from_str(text)
                .map(PgValue::Json)
                .map_err(|e| PgError::TypeError(format!("Invalid JSON: {}", e))),

            _ if oid.is_text_like() => Ok(PgValue::Text(text.to_string())),

            _ => Ok(raw()),
        }
    }

    /// Convert to a JSON value, used when mapping rows onto objects.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;

        match self {
            PgValue::Null => Value::Null,
            PgValue::Bool(v) => Value::Bool(*v),
            PgValue::Int2(v) => Value::from(*v),
            PgValue::Int4(v) => Value::from(*v),
            PgValue::Int8(v) => Value::from(*v),
            // Non-finite floats have no JSON number, so they become null.
            PgValue::Float4(v) => Value::from(f64::from(*v)),
            PgValue::Float8(v) => Value::from(*v),
            PgValue::Json(v) => v.clone(),
            PgValue::Bytea(v) => Value::Array(v.iter().map(|b| Value::from(*b)).collect()),
            other => other.to_text().map(Value::String).unwrap_or(Value::Null),
        }
    }
}

fn float_text(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        (if v > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
    } else {
        v.to_string()
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for PgValue {
                fn from(v: $ty) -> Self {
                    PgValue::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    &str => Text,
    Vec<u8> => Bytea,
    &[u8] => Bytea,
    Uuid => Uuid,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    DateTime<FixedOffset> => TimestampTz,
    serde_json::Value => Json,
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(PgValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(Oid::INT8.is_integer());
        assert!(!Oid::FLOAT8.is_integer());

        assert!(Oid::FLOAT4.is_float());
        assert!(!Oid::INT4.is_float());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Oid::INT4.type_name(), Some("int4"));
        assert_eq!(Oid::TIMESTAMPTZ.type_name(), Some("timestamptz"));
        assert_eq!(Oid(424242).type_name(), None);
    }

    #[test]
    fn test_text_rendering() {
        assert_eq!(PgValue::Bool(true).to_text().as_deref(), Some("t"));
        assert_eq!(PgValue::Int8(-7).to_text().as_deref(), Some("-7"));
        assert_eq!(PgValue::Float8(f64::NAN).to_text().as_deref(), Some("NaN"));
        assert_eq!(
            PgValue::Float8(f64::NEG_INFINITY).to_text().as_deref(),
            Some("-Infinity")
        );
        assert_eq!(
            PgValue::Bytea(vec![0xde, 0xad]).to_text().as_deref(),
            Some("\\xdead")
        );
        assert_eq!(PgValue::Null.to_text(), None);
        assert_eq!(PgValue::Null.to_sql_literal(), "NULL");
        assert_eq!(PgValue::from("it's").to_sql_literal(), "'it''s'");
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(
            PgValue::decode_text(Oid::INT4, b"42").unwrap(),
            PgValue::Int4(42)
        );
        assert_eq!(
            PgValue::decode_text(Oid::BOOL, b"f").unwrap(),
            PgValue::Bool(false)
        );
        assert_eq!(
            PgValue::decode_text(Oid::NUMERIC, b"12.50").unwrap(),
            PgValue::Numeric("12.50".to_string())
        );
        assert_eq!(
            PgValue::decode_text(Oid::VARCHAR, b"hello").unwrap(),
            PgValue::Text("hello".to_string())
        );
        assert!(PgValue::decode_text(Oid::INT2, b"70000").is_err());
    }

    #[test]
    fn test_decode_dates() {
        let ts = PgValue::decode_text(Oid::TIMESTAMP, b"2024-03-01 12:30:00.5").unwrap();
        assert_eq!(
            ts,
            PgValue::Timestamp(
                NaiveDate::from_ymd_opt(2024, 3, 1)
                    .unwrap()
                    .and_hms_milli_opt(12, 30, 0, 500)
                    .unwrap()
            )
        );

        let tz = PgValue::decode_text(Oid::TIMESTAMPTZ, b"2024-03-01 12:30:00+02").unwrap();
        match tz {
            PgValue::TimestampTz(v) => assert_eq!(v.offset().local_minus_utc(), 7200),
            other => panic!("Expected TimestampTz, got {:?}", other),
        }

        assert_eq!(
            PgValue::decode_text(Oid::DATE, b"infinity").unwrap(),
            PgValue::Raw {
                oid: Oid::DATE,
                text: "infinity".to_string()
            }
        );
    }

    #[test]
    fn test_decode_uuid_and_json() {
        let v = PgValue::decode_text(Oid::UUID, b"550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            v.to_text().as_deref(),
            Some("550e8400-e29b-41d4-a716-446655440000")
        );

        let j = PgValue::decode_text(Oid::JSONB, br#"{"a": [1, 2]}"#).unwrap();
        assert_eq!(j, PgValue::Json(serde_json::json!({"a": [1, 2]})));
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(PgValue::from(None::<i32>), PgValue::Null);
        assert_eq!(PgValue::from(Some(5i32)), PgValue::Int4(5));
    }
}
