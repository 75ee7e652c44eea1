//! Parsing and formatting of orchestrator resource quantities.
//!
//! CPU is tracked in millicores and memory in bytes. Fractional results are
//! rounded up so a request is never under-counted.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity {raw:?}")]
    Invalid { raw: String },
}

const BINARY_SUFFIXES: &[(&str, u64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: &[(&str, u64)] = &[
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Parses `"2"`, `"1.5"` or `"500m"` into millicores.
pub fn parse_cpu_millis(raw: &str) -> Result<u64, QuantityError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(QuantityError::Empty);
    }

    if let Some(millis) = trimmed.strip_suffix('m') {
        return millis.parse::<u64>().map_err(|_| invalid(raw));
    }

    scaled(trimmed, 1_000).ok_or_else(|| invalid(raw))
}

/// Parses `"8Gi"`, `"256Mi"`, `"1G"` or a plain byte count into bytes.
pub fn parse_memory_bytes(raw: &str) -> Result<u64, QuantityError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(QuantityError::Empty);
    }

    for (suffix, factor) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES) {
        if let Some(number) = trimmed.strip_suffix(suffix) {
            return scaled(number, *factor).ok_or_else(|| invalid(raw));
        }
    }

    scaled(trimmed, 1).ok_or_else(|| invalid(raw))
}

pub fn format_cpu(millis: u64) -> String {
    if millis % 1_000 == 0 {
        (millis / 1_000).to_string()
    } else {
        format!("{millis}m")
    }
}

pub fn format_memory(bytes: u64) -> String {
    for (suffix, factor) in BINARY_SUFFIXES.iter().rev() {
        if bytes >= *factor && bytes % factor == 0 {
            return format!("{}{}", bytes / factor, suffix);
        }
    }
    bytes.to_string()
}

fn scaled(number: &str, factor: u64) -> Option<u64> {
    if number.is_empty() || number.starts_with('-') {
        return None;
    }

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(factor);
    }

    let value = number.parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let product = (value * factor as f64).ceil();
    if product > u64::MAX as f64 {
        return None;
    }
    Some(product as u64)
}

fn invalid(raw: &str) -> QuantityError {
    QuantityError::Invalid {
        raw: raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_accepts_cores_and_millicores() {
        assert_eq!(parse_cpu_millis("4").unwrap(), 4_000);
        assert_eq!(parse_cpu_millis("500m").unwrap(), 500);
        assert_eq!(parse_cpu_millis("0.25").unwrap(), 250);
        assert_eq!(parse_cpu_millis(" 1 ").unwrap(), 1_000);
    }

    #[test]
    fn cpu_rejects_garbage() {
        assert_eq!(parse_cpu_millis(""), Err(QuantityError::Empty));
        assert!(matches!(
            parse_cpu_millis("fast"),
            Err(QuantityError::Invalid { .. })
        ));
        assert!(parse_cpu_millis("-1").is_err());
        assert!(parse_cpu_millis("1.5m").is_err());
    }

    #[test]
    fn memory_handles_binary_and_decimal_suffixes() {
        assert_eq!(parse_memory_bytes("8Gi").unwrap(), 8 * (1 << 30));
        assert_eq!(parse_memory_bytes("256Mi").unwrap(), 256 * (1 << 20));
        assert_eq!(parse_memory_bytes("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_memory_bytes("1024").unwrap(), 1_024);
        assert_eq!(parse_memory_bytes("1.5Gi").unwrap(), 3 * (1 << 29));
    }

    #[test]
    fn memory_rejects_unknown_suffix() {
        assert!(parse_memory_bytes("12Qi").is_err());
        assert!(parse_memory_bytes("Gi").is_err());
    }

    #[test]
    fn formatting_prefers_whole_units() {
        assert_eq!(format_cpu(4_000), "4");
        assert_eq!(format_cpu(1_500), "1500m");
        assert_eq!(format_memory(8 * (1 << 30)), "8Gi");
        assert_eq!(format_memory(1_536 * (1 << 20)), "1536Mi");
        assert_eq!(format_memory(1_000), "1000");
    }
}
