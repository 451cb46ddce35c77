//! Kubernetes quantity parsing for storage sizes and CPU amounts.
//!
//! Byte quantities support the suffixes used for storage: binary
//! (`Ki`..`Ei`), decimal (`k`..`E`) and plain byte counts. CPU quantities
//! are whole or fractional cores, or millicores with the `m` suffix.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid quantity {0:?}")]
    Invalid(String),

    #[error("quantity {0:?} overflows")]
    Overflow(String),
}

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

/// Parses a storage quantity such as "10Gi" into a byte count.
pub fn parse_quantity_bytes(quantity: &str) -> Result<u64, QuantityError> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (number, multiplier) = split_suffix(quantity)?;
    let value: u64 = number
        .parse()
        .map_err(|_| QuantityError::Invalid(quantity.to_string()))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| QuantityError::Overflow(quantity.to_string()))
}

fn split_suffix(quantity: &str) -> Result<(&str, u64), QuantityError> {
    for (suffix, exp) in BINARY_SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return Ok((number, 1024u64.pow(exp)));
        }
    }
    for (suffix, exp) in DECIMAL_SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return Ok((number, 1000u64.pow(exp)));
        }
    }
    if quantity.chars().all(|c| c.is_ascii_digit()) {
        return Ok((quantity, 1));
    }
    Err(QuantityError::Invalid(quantity.to_string()))
}

/// Parses a CPU quantity such as "500m" or "1.5" into millicores.
pub fn parse_cpu_millis(quantity: &str) -> Result<u64, QuantityError> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return Err(QuantityError::Empty);
    }
    let invalid = || QuantityError::Invalid(quantity.to_string());

    if let Some(millis) = quantity.strip_suffix('m') {
        return millis.parse().map_err(|_| invalid());
    }

    let (whole, fraction) = quantity.split_once('.').unwrap_or((quantity, ""));
    if (whole.is_empty() && fraction.is_empty())
        || fraction.len() > 3
        || !whole.chars().all(|c| c.is_ascii_digit())
        || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }
    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let fraction: u64 = if fraction.is_empty() {
        0
    } else {
        format!("{:0<3}", fraction).parse().map_err(|_| invalid())?
    };
    whole
        .checked_mul(1000)
        .and_then(|millis| millis.checked_add(fraction))
        .ok_or_else(|| QuantityError::Overflow(quantity.to_string()))
}

/// Formats a byte count using the largest binary suffix that divides it exactly.
pub fn format_quantity_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (suffix, exp) in BINARY_SUFFIXES.iter().rev() {
        let unit = 1024u64.pow(*exp);
        if bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}
