//! Kubernetes resource.Quantity parsing, just enough for quota comparisons.
//!
//! CPU quantities resolve to millicores (`500m` = 500, `1` = 1000,
//! `0.5` = 500). Memory quantities resolve to bytes and understand both
//! binary (`Ki`..`Ei`) and decimal (`k`..`E`) suffixes. The fractional part
//! is kept exact (as numerator over a power of ten) until after the suffix
//! multiplier is applied, then the result rounds up once, so a fractional
//! quantity is never under-counted and never off by more than the final
//! ceiling.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid quantity {0:?}")]
pub struct QuantityError(pub String);

/// Fraction digits beyond this are folded into a round-up of the last kept
/// digit; keeps the integer arithmetic inside u128.
const MAX_FRAC_DIGITS: usize = 18;

/// Parse the numeric part into `int + frac/denom` plus the suffix.
fn split(raw: &str) -> Result<(u128, u128, u128, &str), QuantityError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(QuantityError(raw.into()));
    }
    let digits_end = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(digits_end);
    if number.is_empty() {
        return Err(QuantityError(raw.into()));
    }

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(QuantityError(raw.into()));
    }
    if !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return Err(QuantityError(raw.into()));
    }

    let int: u128 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|_| QuantityError(raw.into()))?
    };

    // Trailing zeros change nothing; digits past the precision cap fold into
    // a round-up so a cap is never under-counted.
    let frac_digits = frac_part.trim_end_matches('0');
    let (kept, dropped) = if frac_digits.len() > MAX_FRAC_DIGITS {
        frac_digits.split_at(MAX_FRAC_DIGITS)
    } else {
        (frac_digits, "")
    };

    let mut frac: u128 = 0;
    let mut denom: u128 = 1;
    for ch in kept.chars() {
        let digit = ch.to_digit(10).expect("validated above") as u128;
        frac = frac * 10 + digit;
        denom *= 10;
    }
    if dropped.chars().any(|c| c != '0') {
        frac += 1;
    }

    Ok((int, frac, denom, suffix))
}

/// Compute `ceil((int + frac/denom) * multiplier)` without losing precision.
fn scale_ceil(
    int: u128,
    frac: u128,
    denom: u128,
    multiplier: u128,
    raw: &str,
) -> Result<u64, QuantityError> {
    let scaled = int
        .checked_mul(denom)
        .and_then(|v| v.checked_add(frac))
        .and_then(|v| v.checked_mul(multiplier))
        .ok_or_else(|| QuantityError(raw.into()))?;
    let out = scaled.div_ceil(denom);
    u64::try_from(out).map_err(|_| QuantityError(raw.into()))
}

/// Parse a CPU quantity to millicores.
pub fn parse_cpu_millis(raw: &str) -> Result<u64, QuantityError> {
    let (int, frac, denom, suffix) = split(raw)?;
    let multiplier = match suffix {
        // Fractional millicores round up.
        "m" => 1,
        "" => 1000,
        _ => return Err(QuantityError(raw.into())),
    };
    scale_ceil(int, frac, denom, multiplier, raw)
}

fn memory_multiplier(suffix: &str) -> Option<u128> {
    Some(match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => return None,
    })
}

/// Parse a memory quantity to bytes.
pub fn parse_memory_bytes(raw: &str) -> Result<u64, QuantityError> {
    let (int, frac, denom, suffix) = split(raw)?;
    let multiplier = memory_multiplier(suffix).ok_or_else(|| QuantityError(raw.into()))?;
    scale_ceil(int, frac, denom, multiplier, raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_millicores() {
        assert_eq!(parse_cpu_millis("500m").unwrap(), 500);
        assert_eq!(parse_cpu_millis("1").unwrap(), 1000);
        assert_eq!(parse_cpu_millis("0.5").unwrap(), 500);
        assert_eq!(parse_cpu_millis("2.25").unwrap(), 2250);
        assert_eq!(parse_cpu_millis("0.0001").unwrap(), 1);
    }

    #[test]
    fn fractional_millicores_round_up() {
        assert_eq!(parse_cpu_millis("500.5m").unwrap(), 501);
        assert_eq!(parse_cpu_millis("0.1m").unwrap(), 1);
    }

    #[test]
    fn memory_binary_suffixes() {
        assert_eq!(parse_memory_bytes("1Ki").unwrap(), 1024);
        assert_eq!(parse_memory_bytes("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("1.5Gi").unwrap(), 3 * (1 << 30) / 2);
        assert_eq!(parse_memory_bytes("256Mi").unwrap(), 256 << 20);
    }

    #[test]
    fn memory_decimal_suffixes() {
        assert_eq!(parse_memory_bytes("512M").unwrap(), 512_000_000);
        assert_eq!(parse_memory_bytes("1k").unwrap(), 1000);
        assert_eq!(parse_memory_bytes("64").unwrap(), 64);
    }

    #[test]
    fn gi_is_1024_mi() {
        assert_eq!(
            parse_memory_bytes("1Gi").unwrap(),
            1024 * parse_memory_bytes("1Mi").unwrap()
        );
    }

    #[test]
    fn fraction_is_exact_under_binary_suffixes() {
        // 1.0001Gi = 10001 * 2^30 / 10^4 = 1073849198.1824, ceiled.
        assert_eq!(parse_memory_bytes("1.0001Gi").unwrap(), 1_073_849_199);
        // 0.3Gi = 3 * 2^30 / 10 = 322122547.2, ceiled.
        assert_eq!(parse_memory_bytes("0.3Gi").unwrap(), 322_122_548);
    }

    #[test]
    fn fraction_is_exact_under_decimal_suffixes() {
        // 1.0000001G lands exactly on 1_000_000_100 bytes.
        assert_eq!(parse_memory_bytes("1.0000001G").unwrap(), 1_000_000_100);
        assert_eq!(parse_memory_bytes("0.000001Ti").unwrap(), 1_099_512);
    }

    #[test]
    fn rejects_garbage() {
        for raw in ["", "m", "1X", "1.2.3", "-1", "1 Gi", "Gi"] {
            assert!(parse_memory_bytes(raw).is_err(), "{raw:?} should fail");
        }
        assert!(parse_cpu_millis("1Gi").is_err());
    }

    #[test]
    fn rejects_overflowing_quantities() {
        assert!(parse_memory_bytes("999999999999999999999Ei").is_err());
    }

    #[test]
    fn fractional_bytes_round_up() {
        // 0.0015k = 1.5 bytes -> 2.
        assert_eq!(parse_memory_bytes("0.0015k").unwrap(), 2);
    }

    #[test]
    fn excess_precision_folds_into_a_round_up() {
        // Nineteen nines: within one byte of 1k, never below it.
        assert_eq!(
            parse_memory_bytes("0.9999999999999999999k").unwrap(),
            1000
        );
    }
}
