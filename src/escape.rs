//! Escaping helpers for building SQL text by hand.
//!
//! The executor never escapes implicitly: callers either pass values as
//! bound parameters or run them through these functions first.

use crate::error::{PgError, PgResult};

/// Quote an identifier (table, column name): `my "table"` → `"my ""table"""`.
pub fn escape_identifier(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for c in ident.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Quote a string literal.
///
/// When the text contains backslashes the literal is written in the
/// ` E'...'` form, so the result is valid whatever `standard_conforming_strings`
/// is set to.
pub fn escape_literal(text: &str) -> String {
    let has_backslash = text.contains('\\');
    let mut out = String::with_capacity(text.len() + 4);

    if has_backslash {
        out.push_str(" E");
    }
    out.push('\'');
    for c in text.chars() {
        if c == '\'' || c == '\\' {
            out.push(c);
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Escape text for use between quotes, without adding the quotes.
///
/// Backslashes are only doubled when the server does not use standard
/// conforming strings.
pub fn escape_string(text: &str, standard_conforming_strings: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\'' || (c == '\\' && !standard_conforming_strings) {
            out.push(c);
        }
        out.push(c);
    }
    out
}

/// Encode binary data in the bytea hex format (`\x0102ff`).
pub fn escape_bytea(data: &[u8]) -> String {
    format!("\\x{}", hex::encode(data))
}

/// Decode a bytea value in either the hex or the legacy escape format.
pub fn unescape_bytea(encoded: &str) -> PgResult<Vec<u8>> {
    if let Some(digits) = encoded.strip_prefix("\\x") {
        return hex::decode(digits)
            .map_err(|e| PgError::TypeError(format!("Invalid bytea hex data: {}", e)));
    }

    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        i += 1;
        match bytes.get(i..i + 3) {
            Some(&[a @ b'0'..=b'3', b @ b'0'..=b'7', c @ b'0'..=b'7']) => {
                out.push(((a - b'0') << 6) | ((b - b'0') << 3) | (c - b'0'));
                i += 3;
            }
            _ if bytes.get(i) == Some(&b'\\') => {
                out.push(b'\\');
                i += 1;
            }
            // Unrecognized escape: the backslash is dropped and the next
            // byte is emitted as ordinary data.
            _ => {}
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_identifier() {
        assert_eq!(escape_identifier("users"), "\"users\"");
        assert_eq!(escape_identifier("my \"table\""), "\"my \"\"table\"\"\"");
    }

    #[test]
    fn test_escape_literal() {
        assert_eq!(escape_literal("plain"), "'plain'");
        assert_eq!(escape_literal("O'Reilly"), "'O''Reilly'");
        assert_eq!(escape_literal("C:\\temp"), " E'C:\\\\temp'");
        assert_eq!(escape_literal(""), "''");
    }

    #[test]
    fn test_escape_string() {
        assert_eq!(escape_string("it's", true), "it''s");
        assert_eq!(escape_string("a\\b", true), "a\\b");
        assert_eq!(escape_string("a\\b", false), "a\\\\b");
    }

    #[test]
    fn test_bytea_hex() {
        let data = vec![0u8, 1, 0x7f, 0xff];
        let encoded = escape_bytea(&data);
        assert_eq!(encoded, "\\x00017fff");
        assert_eq!(unescape_bytea(&encoded).unwrap(), data);
        assert!(unescape_bytea("\\xzz").is_err());
    }

    #[test]
    fn test_bytea_escape_format() {
        assert_eq!(unescape_bytea("abc").unwrap(), b"abc");
        assert_eq!(unescape_bytea("a\\\\b").unwrap(), b"a\\b");
        assert_eq!(unescape_bytea("\\000\\377").unwrap(), vec![0u8, 255]);
        assert_eq!(unescape_bytea("\\q").unwrap(), b"q");
    }
}
