//! Numeric rounding and display formatting.
//!
//! Every number shown to a client goes through [`nice`] (decimal rounding
//! to a number of significant digits) and then [`format_g`] (shortest
//! `%g`-style rendering), so the same value always displays the same way
//! regardless of binary representation noise.

/// Significant digits used for parameter values and bounds.
pub const VALUE_PRECISION: u32 = 6;

/// Significant digits used for chi-squared summaries.
pub const CHISQ_PRECISION: u32 = 4;

/// Round `value` to `digits` significant decimal digits.
///
/// Rounds half away from zero on the decimal significand, so
/// `nice(2.5, 1) == 3.0` and `nice(-2.5, 1) == -3.0`. Zero, non-finite and
/// subnormal values too small to scale are returned unchanged.
pub fn nice(value: f64, digits: u32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let digits = i32::try_from(digits.max(1)).unwrap_or(i32::MAX);
    // Finite non-zero f64 magnitudes have decimal exponents within [-324, 308].
    #[allow(clippy::cast_possible_truncation)]
    let place = value.abs().log10().floor() as i32;
    let scale = 10f64.powi(place.saturating_sub(digits.saturating_sub(1)));
    // Subnormal inputs can push the scale below the smallest f64.
    if scale == 0.0 {
        return value;
    }
    let rounded = value.signum() * (value.abs() / scale + 0.5).floor() * scale;
    if rounded.is_finite() { rounded } else { value }
}

/// Format `value` like C's `%.<precision>g`.
///
/// Uses scientific notation when the decimal exponent is below -4 or at
/// least `precision`, fixed notation otherwise, and strips trailing zeros
/// in both cases. Non-finite values render as `inf`, `-inf` and `nan`.
pub fn format_g(value: f64, precision: u32) -> String {
    if value.is_nan() {
        return "nan".to_owned();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_owned();
    }

    let precision = usize::try_from(precision.max(1)).unwrap_or(usize::MAX);
    let scientific = format!("{:.*e}", precision.saturating_sub(1), value);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let Ok(exponent) = exponent.parse::<i64>() else {
        return scientific;
    };

    let precision_exp = i64::try_from(precision).unwrap_or(i64::MAX);
    if exponent < -4 || exponent >= precision_exp {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{sign}{:02}",
            trim_fraction(mantissa),
            exponent.unsigned_abs()
        )
    } else {
        let decimals = usize::try_from(precision_exp.saturating_sub(1).saturating_sub(exponent))
            .unwrap_or(0);
        trim_fraction(&format!("{value:.decimals$}")).to_owned()
    }
}

/// Round to [`VALUE_PRECISION`] digits and format for display.
pub fn format_value(value: f64) -> String {
    format_g(nice(value, VALUE_PRECISION), VALUE_PRECISION)
}

/// Normalized chi-squared (`2 * nllf / dof`) formatted for display.
///
/// Degrees of freedom below one are clamped to one so a saturated model
/// still reports a finite value.
pub fn format_chisq(value: f64, dof: f64) -> String {
    let chisq = 2.0 * value / dof.max(1.0);
    format_g(nice(chisq, CHISQ_PRECISION), CHISQ_PRECISION)
}

/// Strip trailing zeros (and a trailing decimal point) from a fraction.
fn trim_fraction(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}
