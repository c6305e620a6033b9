//! Numeric classification and coercion

/// 2^52 + 2^51. Adding it to a double of magnitude below 2^31 leaves the
/// rounded integer in the low 32 bits of the mantissa.
const MAGIC: f64 = 6_755_399_441_055_744.0;

/// A numeric value after classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Integer(i64),
    Number(f64),
}

/// A number is an integer when it survives a round trip through `i64`.
pub fn classify(n: f64) -> Numeric {
    // 2^63 is exactly representable; anything at or beyond it overflows.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if n.fract() == 0.0 && (-LIMIT..LIMIT).contains(&n) {
        Numeric::Integer(n as i64)
    } else {
        Numeric::Number(n)
    }
}

/// Rounds half to even using the magic-constant trick.
///
/// Only the low 32 bits are kept, so the result is meaningful for
/// magnitudes below 2^31 and wraps outside that range.
pub fn to_integer(n: f64) -> i64 {
    // `to_bits` is independent of host byte order, so the low word is
    // always the integer part.
    i64::from((n + MAGIC).to_bits() as u32 as i32)
}

/// Formats a float the way `tostring` does: integral values keep a `.0`
/// suffix and very large or small magnitudes use exponent notation.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let magnitude = n.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let formatted = format!("{n:e}");
        return match formatted.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => formatted,
        };
    }
    if n.fract() == 0.0 {
        format!("{n:.1}")
    } else {
        format!("{n}")
    }
}
