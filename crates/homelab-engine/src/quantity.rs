//! Kubernetes resource quantities compared by value.
//!
//! The API server stores quantities in canonical form (`0.5` reads back as
//! `500m`, `1024Mi` as `1Gi`), so desired and observed strings are compared
//! after parsing into nano-units.

use std::collections::BTreeMap;

/// Value of a quantity in nano-units, `None` when it isn't a valid quantity
pub fn parse_quantity(text: &str) -> Option<i128> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);

    let (negative, number) = match number.as_bytes().first() {
        Some(b'-') => (true, &number[1..]),
        Some(b'+') => (false, &number[1..]),
        _ => (false, number),
    };
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    // mantissa scaled so that `mantissa / 10^scale` is the written number
    let digits = format!("{}{}", whole, fraction);
    let mut mantissa: i128 = if digits.is_empty() { 0 } else { digits.parse().ok()? };
    let mut scale = i32::try_from(fraction.len()).ok()?;

    match suffix {
        "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" => {
            let power = match suffix {
                "Ki" => 1,
                "Mi" => 2,
                "Gi" => 3,
                "Ti" => 4,
                "Pi" => 5,
                _ => 6,
            };
            mantissa = mantissa.checked_mul(1024i128.checked_pow(power)?)?;
        }
        _ => scale -= decimal_exponent(suffix)?,
    }

    // to nano-units: multiply by 10^(9 - scale)
    let shift = 9 - scale;
    let value = if shift >= 0 {
        mantissa.checked_mul(10i128.checked_pow(u32::try_from(shift).ok()?)?)?
    } else {
        // finer than a nano-unit; the server rounds these up
        let divisor = 10i128.checked_pow(u32::try_from(-shift).ok()?)?;
        (mantissa + divisor - 1) / divisor
    };
    Some(if negative { -value } else { value })
}

fn decimal_exponent(suffix: &str) -> Option<i32> {
    Some(match suffix {
        "" => 0,
        "n" => -9,
        "u" => -6,
        "m" => -3,
        "k" => 3,
        "M" => 6,
        "G" => 9,
        "T" => 12,
        "P" => 15,
        "E" => 18,
        _ => {
            let exponent = suffix.strip_prefix(['e', 'E'])?;
            exponent.parse().ok()?
        }
    })
}

/// Whether two quantity maps hold the same keys with equal values.
///
/// Strings that don't parse fall back to exact comparison.
pub fn same_quantities(
    desired: &BTreeMap<String, String>,
    observed: &BTreeMap<String, String>,
) -> bool {
    desired.len() == observed.len()
        && desired.iter().all(|(key, want)| {
            observed.get(key).is_some_and(|have| {
                match (parse_quantity(want), parse_quantity(have)) {
                    (Some(a), Some(b)) => a == b,
                    _ => want == have,
                }
            })
        })
}
