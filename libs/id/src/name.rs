//! Validation for user-visible names.
//!
//! Node pools, workload identities and actions share the rule
//! `^[a-zA-Z0-9-_]{1,128}$`.

use crate::IdError;

/// Maximum length of a user-visible name.
pub const MAX_NAME_LENGTH: usize = 128;

/// Returns true if `name` satisfies the name rules.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Validates a user-visible name.
pub fn validate_name(name: &str) -> Result<(), IdError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(IdError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("default"));
        assert!(is_valid_name("gpu-pool_2"));
        assert!(is_valid_name(&"a".repeat(MAX_NAME_LENGTH)));
    }

    #[test]
    fn test_invalid_names() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name("../etc/passwd"));
        assert!(!is_valid_name("dot.name"));
        assert!(!is_valid_name(&"a".repeat(MAX_NAME_LENGTH + 1)));
    }

    #[test]
    fn test_validate_name_error_names_input() {
        let err = validate_name("bad/name").unwrap_err();
        assert_eq!(err.to_string(), r#"invalid name "bad/name""#);
    }

    proptest! {
        #[test]
        fn prop_allowed_alphabet_is_valid(name in "[a-zA-Z0-9_-]{1,128}") {
            prop_assert!(is_valid_name(&name));
        }

        #[test]
        fn prop_any_slash_is_invalid(prefix in "[a-z]{0,10}", suffix in "[a-z]{0,10}") {
            let name = format!("{prefix}/{suffix}");
            prop_assert!(!is_valid_name(&name));
        }
    }
}
