//! Rounding of decoded values to what their scale factor can express
//!
//! `569922 * 0.1` is `56992.200000000004` in binary floating point; the
//! odometer it came from only has one decimal.

/// Most decimals any scale is rounded to
const MAX_DECIMALS: u8 = 6;

/// Decimals implied by a scale factor: `1` → 0, `0.1` → 1, `0.25` → 2
pub fn decimals_for_scale(scale: f64) -> u8 {
    let scale = scale.abs();
    if scale == 0.0 || !scale.is_finite() {
        return MAX_DECIMALS;
    }

    (0..MAX_DECIMALS)
        .find(|&decimals| {
            let shifted = scale * 10_f64.powi(i32::from(decimals));
            (shifted - shifted.round()).abs() < 1e-9
        })
        .unwrap_or(MAX_DECIMALS)
}

/// Round `value` to the decimals of the `scale` that produced it
pub fn round_for_scale(value: f64, scale: f64) -> f64 {
    match decimals_for_scale(scale) {
        0 => value.round(),
        decimals => {
            let factor = 10_f64.powi(i32::from(decimals));
            (value * factor).round() / factor
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimals_for_scale() {
        assert_eq!(decimals_for_scale(1.0), 0);
        assert_eq!(decimals_for_scale(16.0), 0);
        assert_eq!(decimals_for_scale(0.1), 1);
        assert_eq!(decimals_for_scale(0.25), 2);
        assert_eq!(decimals_for_scale(0.001), 3);
        assert_eq!(decimals_for_scale(-0.5), 1);
        assert_eq!(decimals_for_scale(0.0), MAX_DECIMALS);
    }

    #[test]
    fn test_obd_values_lose_float_noise() {
        // odometer, 0.1 km
        assert_eq!(round_for_scale(569922.0 * 0.1, 0.1), 56992.2);
        // engine speed, 0.25 rpm
        assert_eq!(round_for_scale(3301.0 * 0.25, 0.25), 825.25);
        // coolant, whole degrees
        assert_eq!(round_for_scale(92.0000001, 1.0), 92.0);
    }
}
