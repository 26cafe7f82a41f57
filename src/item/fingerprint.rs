//! Business fingerprint used for idempotent ingestion
//!
//! The fingerprint is the MD5 hex digest of the trimmed fields joined with
//! `||`. It is a deduplication key, not a security primitive.

use md5::{Digest, Md5};

/// Separator placed between fields before hashing
pub const FIELD_SEPARATOR: &str = "||";

/// Computes the fingerprint of an ordered field tuple
///
/// Each field is trimmed; a missing field contributes the empty string.
///
/// # Arguments
///
/// * `fields` - The canonical fields, in order
///
/// # Returns
///
/// A 32-character lowercase hex string
pub fn fingerprint<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut hasher = Md5::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            hasher.update(FIELD_SEPARATOR.as_bytes());
        }
        hasher.update(field.unwrap_or("").trim().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Returns true if `value` looks like a fingerprint
pub fn is_fingerprint(value: &str) -> bool {
    value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        let id = fingerprint([
            Some("协和医院"),
            Some("阿莫西林"),
            Some("胶囊"),
            Some("0.25g"),
            Some("24粒/盒"),
            Some("某某制药"),
        ]);
        assert_eq!(id, "b488baff355fcffe99f8ce5e39fcba1c");
    }

    #[test]
    fn test_all_missing_fields() {
        let id = fingerprint([None; 6]);
        assert_eq!(id, "58f422b0439783eaccc97bcc232168d6");
    }

    #[test]
    fn test_whitespace_is_trimmed() {
        let padded = fingerprint([Some("  协和医院\t"), Some(" 阿莫西林 "), None]);
        let clean = fingerprint([Some("协和医院"), Some("阿莫西林"), Some("")]);
        assert_eq!(padded, clean);
    }

    #[test]
    fn test_missing_equals_empty() {
        assert_eq!(
            fingerprint([Some("a"), None, Some("b")]),
            fingerprint([Some("a"), Some(""), Some("b")])
        );
    }

    #[test]
    fn test_separator_prevents_boundary_collision() {
        let left = fingerprint([Some("ab"), Some("c")]);
        let right = fingerprint([Some("a"), Some("bc")]);
        assert_ne!(left, right);
        assert_eq!(fingerprint([Some("a"), Some("b")]), "8e4350bbfbeaae12c71013d7e16e6603");
    }

    #[test]
    fn test_any_field_change_changes_digest() {
        let base = [Some("h"), Some("d"), Some("f"), Some("s"), Some("p"), Some("m")];
        let original = fingerprint(base);
        for i in 0..base.len() {
            let mut changed = base;
            changed[i] = Some("x");
            assert_ne!(fingerprint(changed), original, "field {} ignored", i);
        }
    }

    #[test]
    fn test_is_fingerprint() {
        assert!(is_fingerprint("d41d8cd98f00b204e9800998ecf8427e"));
        assert!(!is_fingerprint("d41d8cd98f00b204e9800998ecf8427"));
        assert!(!is_fingerprint("z41d8cd98f00b204e9800998ecf8427e"));
    }
}
