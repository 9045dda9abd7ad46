//! E.164 phone number normalization

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{NotifyError, Result};

static E164: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+[1-9]\d{9,14}$").expect("valid regex"));

/// Normalize a phone number to E.164.
///
/// Formatting characters (spaces, dashes, dots, parentheses) are stripped.
/// A bare 10-digit number is treated as North American, and an 11-digit
/// number starting with `1` gains its `+`.
pub fn normalize(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let has_plus = trimmed.starts_with('+');

    let digits: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')' | '+'))
        .collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(NotifyError::invalid_phone(raw));
    }

    let candidate = if has_plus {
        format!("+{}", digits)
    } else if digits.len() == 10 {
        format!("+1{}", digits)
    } else if digits.len() == 11 && digits.starts_with('1') {
        format!("+{}", digits)
    } else {
        return Err(NotifyError::invalid_phone(raw));
    };

    if E164.is_match(&candidate) {
        Ok(candidate)
    } else {
        Err(NotifyError::invalid_phone(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("+15551234567", "+15551234567")]
    #[case("(555) 123-4567", "+15551234567")]
    #[case("555.123.4567", "+15551234567")]
    #[case("1 555 123 4567", "+15551234567")]
    #[case("+52 55 1234 5678", "+525512345678")]
    fn test_normalizes_valid_numbers(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("12345")]
    #[case("not-a-number")]
    #[case("+0123456789")]
    #[case("555-CALL-NOW")]
    #[case("+1234567890123456")]
    fn test_rejects_invalid_numbers(#[case] input: &str) {
        let err = normalize(input).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PHONE_NUMBER");
    }
}
