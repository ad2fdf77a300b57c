use rust_decimal::Decimal;

pub fn now_ms() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_millis() as i64
}

/// True when `price` is an integer multiple of `tick`. `tick` is always a
/// power-of-10 decimal strictly between 0 and 1 (spec.md GLOSSARY).
pub fn is_tick_aligned(price: Decimal, tick: Decimal) -> bool {
    if tick.is_zero() {
        return false;
    }
    (price / tick).fract().is_zero()
}

pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick.is_zero() {
        return price;
    }
    (price / tick).round() * tick
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn tick_alignment() {
        assert!(is_tick_aligned(d("0.45"), d("0.01")));
        assert!(!is_tick_aligned(d("0.455"), d("0.01")));
        assert!(is_tick_aligned(d("0.000"), d("0.001")));
    }

    #[test]
    fn round_trip() {
        assert_eq!(round_to_tick(d("0.4551"), d("0.01")), d("0.46"));
    }
}
