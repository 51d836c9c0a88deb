//! Identifier handling: the 63-byte limit the backing database imposes
//! on names, deterministic truncation for generated constraint names,
//! and SQL quoting helpers used by every emitter in the workspace.

use crate::error::{Error, Result};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

/// Reject identifiers whose UTF-8 encoding exceeds 63 bytes.
///
/// `prefix` names the kind of identifier being checked, e.g. "Column",
/// and leads the error message.
pub fn enforce_63byte_id(s: &str, prefix: &str) -> Result<()> {
    if s.len() > 63 {
        return Err(Error::BadData(format!(
            "{} \"{}\" exceeded 63-byte limit when encoded as UTF-8.",
            prefix, s
        )));
    }
    Ok(())
}

// Parts at or below this length are kept verbatim; longer parts share
// the remaining budget and may be replaced by a hash.
const TRUNCATE_THRESHOLD: usize = 4;

/// Build a database identifier of at most 63 bytes by concatenating
/// `parts` in order.
///
/// Short connector parts (separators like "_") are preserved verbatim.
/// Each long part either fits its share of the remaining budget or is
/// replaced by a base64-encoded MD5 digest truncated to that share, so
/// equal inputs always yield equal output.
pub fn truncated_identifier(parts: &[&str]) -> String {
    let len_static: usize = parts
        .iter()
        .filter(|p| p.len() <= TRUNCATE_THRESHOLD)
        .map(|p| p.len())
        .sum();
    let num_components = parts.iter().filter(|p| p.len() > TRUNCATE_THRESHOLD).count();
    let max_component_len = (63usize.saturating_sub(len_static)) / num_components.max(1);

    parts
        .iter()
        .map(|p| {
            if p.len() <= max_component_len || p.len() <= TRUNCATE_THRESHOLD {
                (*p).to_string()
            } else {
                let digest = md5::compute(p.as_bytes());
                let mut hashed = base64::encode(digest.0);
                hashed.truncate(max_component_len);
                hashed
            }
        })
        .collect()
}

/// Quote `s` as a SQL identifier, doubling embedded double quotes.
pub fn sql_identifier(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Quote `s` as a SQL text literal, doubling embedded single quotes.
pub fn sql_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Percent-encode one component of a resource display name.
pub fn display_quote(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn id_byte_limit() {
        let ok = "a".repeat(63);
        assert!(enforce_63byte_id(&ok, "Column").is_ok());

        let long = "a".repeat(64);
        match enforce_63byte_id(&long, "Column") {
            Err(crate::Error::BadData(msg)) => assert!(msg.contains("63-byte")),
            other => panic!("expected BadData, got {:?}", other),
        }

        // 32 two-byte characters are 64 bytes encoded.
        let wide = "\u{00e9}".repeat(32);
        assert_eq!(wide.chars().count(), 32);
        assert!(enforce_63byte_id(&wide, "Table").is_err());
    }

    #[test]
    fn truncation_is_deterministic_and_bounded() {
        let parts = ["table_with_a_very_long_name", "_", "col", "_key"];
        let a = truncated_identifier(&parts);
        let b = truncated_identifier(&parts);
        assert_eq!(a, b);
        assert!(a.len() <= 63);

        let huge = "x".repeat(200);
        let out = truncated_identifier(&[&huge, "_", &huge, "_key"]);
        assert!(out.len() <= 63, "{} bytes", out.len());

        // Short inputs are passed through unchanged.
        assert_eq!(truncated_identifier(&["t1", "_", "id", "_key"]), "t1_id_key");
    }

    #[test]
    fn quoting() {
        assert_eq!(sql_identifier("plain"), "\"plain\"");
        assert_eq!(sql_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(sql_literal("it's"), "'it''s'");
    }
}
