use bigdecimal::BigDecimal;
use std::fmt;

pub const REFERENCE_MAX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = Result<(), ValidationError>;

/// Trims the value and collapses every whitespace run to a single space.
pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rejects control characters anywhere in the value. Tabs and newlines are
/// only tolerated as surrounding whitespace, which is trimmed away.
pub fn validate_no_control_chars(field: &'static str, value: &str) -> ValidationResult {
    if value.trim().chars().any(char::is_control) {
        return Err(ValidationError::new(
            field,
            "must not contain control characters",
        ));
    }

    Ok(())
}

pub fn validate_max_len(field: &'static str, value: &str, max_len: usize) -> ValidationResult {
    if value.chars().count() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", max_len),
        ));
    }

    Ok(())
}

pub fn is_positive_amount(amount: &BigDecimal) -> bool {
    amount > &BigDecimal::from(0)
}

/// Normalizes an idempotency reference. Blank references collapse to `None`.
///
/// Only surrounding whitespace and internal space runs are rewritten, so two
/// references that differ in any other character never normalize to the
/// same key.
pub fn normalize_reference(reference: Option<&str>) -> Result<Option<String>, ValidationError> {
    let reference = match reference {
        Some(raw) => {
            validate_no_control_chars("reference", raw)?;
            collapse_whitespace(raw)
        }
        None => return Ok(None),
    };

    if reference.is_empty() {
        return Ok(None);
    }

    validate_max_len("reference", &reference, REFERENCE_MAX_LEN)?;
    Ok(Some(reference))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn validates_max_len() {
        assert!(validate_max_len("field", "abc", 3).is_ok());
        assert!(validate_max_len("field", "abcd", 3).is_err());
    }

    #[test]
    fn collapses_whitespace() {
        assert_eq!(collapse_whitespace("  hello   world  "), "hello world");
        assert_eq!(collapse_whitespace("single"), "single");
        assert_eq!(collapse_whitespace(" \n "), "");
    }

    #[test]
    fn rejects_inner_control_chars() {
        assert!(validate_no_control_chars("field", " \tok\n").is_ok());
        assert!(validate_no_control_chars("field", "a\tb").is_err());
        assert!(validate_no_control_chars("field", "ab\u{0000}cd").is_err());
        assert!(validate_no_control_chars("field", "ab\u{0007}").is_err());
    }

    #[test]
    fn detects_positive_amount() {
        let positive = BigDecimal::from_str("49.99").expect("valid decimal");
        let tiny = BigDecimal::from_str("0.0001").expect("valid decimal");

        assert!(is_positive_amount(&positive));
        assert!(is_positive_amount(&tiny));
        assert!(!is_positive_amount(&BigDecimal::from(0)));
        assert!(!is_positive_amount(&BigDecimal::from(-1)));
    }

    #[test]
    fn normalizes_references() {
        assert_eq!(normalize_reference(None).unwrap(), None);
        assert_eq!(normalize_reference(Some("   ")).unwrap(), None);
        assert_eq!(
            normalize_reference(Some(" TXN-100\n")).unwrap().as_deref(),
            Some("TXN-100")
        );

        assert_eq!(
            normalize_reference(Some("TXN   100")).unwrap().as_deref(),
            Some("TXN 100")
        );

        for aliased in ["TXN\t100", "TXN\u{0}100", "TXN\n100"] {
            let err = normalize_reference(Some(aliased)).unwrap_err();
            assert_eq!(err.field, "reference");
        }

        let too_long = "R".repeat(REFERENCE_MAX_LEN + 1);
        let err = normalize_reference(Some(&too_long)).unwrap_err();
        assert_eq!(err.field, "reference");
    }
}
