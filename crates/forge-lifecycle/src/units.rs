//! Memory and disk quota strings such as `512M` or `2GB`

use crate::ForgeError;
use regex::Regex;
use std::sync::OnceLock;

const KILOBYTE: i64 = 1024;
const MEGABYTE: i64 = 1024 * KILOBYTE;
const GIGABYTE: i64 = 1024 * MEGABYTE;
const TERABYTE: i64 = 1024 * GIGABYTE;

fn bytes_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^(-?\d+)([KMGT])B?$").expect("valid byte unit pattern"))
}

/// Parse `<integer><K|M|G|T>[B]` (case-insensitive) into whole megabytes
pub fn to_megabytes(s: &str) -> Result<i64, ForgeError> {
    let parts = bytes_pattern()
        .captures(s.trim())
        .ok_or_else(|| ForgeError::InvalidByteUnit(s.to_string()))?;

    let value: i64 = parts[1]
        .parse()
        .map_err(|_| ForgeError::InvalidByteNumber(s.to_string()))?;

    let unit = match parts[2].to_ascii_uppercase().as_str() {
        "T" => TERABYTE,
        "G" => GIGABYTE,
        "M" => MEGABYTE,
        _ => KILOBYTE,
    };

    let bytes = value
        .checked_mul(unit)
        .ok_or_else(|| ForgeError::InvalidByteNumber(s.to_string()))?;
    Ok(bytes / MEGABYTE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units() {
        assert_eq!(to_megabytes("512M").unwrap(), 512);
        assert_eq!(to_megabytes("2G").unwrap(), 2048);
        assert_eq!(to_megabytes("1T").unwrap(), 1_048_576);
        assert_eq!(to_megabytes("1024K").unwrap(), 1);
        assert_eq!(to_megabytes("512K").unwrap(), 0);
    }

    #[test]
    fn test_suffix_is_case_insensitive_and_trimmed() {
        assert_eq!(to_megabytes("1024m").unwrap(), 1024);
        assert_eq!(to_megabytes("1gb").unwrap(), 1024);
        assert_eq!(to_megabytes("  256MB \n").unwrap(), 256);
    }

    #[test]
    fn test_negative_magnitude_is_accepted() {
        assert_eq!(to_megabytes("-1G").unwrap(), -1024);
    }

    #[test]
    fn test_malformed_input() {
        for input in ["", "512", "0.5M", "12X", "M", "1 G", "1GiB"] {
            let err = to_megabytes(input).unwrap_err();
            assert!(
                matches!(err, ForgeError::InvalidByteUnit(_)),
                "{:?} should be rejected, got {:?}",
                input,
                err
            );
        }
        assert_eq!(
            to_megabytes("0.5M").unwrap_err().to_string(),
            "invalid byte unit format: 0.5M"
        );
    }

    #[test]
    fn test_overflowing_magnitude() {
        let err = to_megabytes("99999999999999999999M").unwrap_err();
        assert!(matches!(err, ForgeError::InvalidByteNumber(_)));

        let err = to_megabytes("9999999999T").unwrap_err();
        assert!(matches!(err, ForgeError::InvalidByteNumber(_)));
    }
}
