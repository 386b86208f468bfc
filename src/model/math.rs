/// Normal CDF via the Abramowitz–Stegun 7.1.26 erf approximation.
///
/// Replay fidelity depends on every deployment computing the exact same
/// probabilities, so the approximation is pinned here instead of deferring
/// to a platform `erf` whose rounding may differ across targets. Maximum
/// absolute error of the approximation is 1.5e-7, far below anything the
/// rating update can observe.
const P: f64 = 0.327_591_1;
const A1: f64 = 0.254_829_592;
const A2: f64 = -0.284_496_736;
const A3: f64 = 1.421_413_741;
const A4: f64 = -1.453_152_027;
const A5: f64 = 1.061_405_429;

pub fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + P * x);
    let poly = t * (A1 + t * (A2 + t * (A3 + t * (A4 + t * A5))));

    sign * (1.0 - poly * (-x * x).exp())
}

/// Standard normal CDF, Φ(x) = (1 + erf(x / √2)) / 2.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_erf_reference_values() {
        assert_abs_diff_eq!(erf(0.0), 0.0, epsilon = 1e-7);
        assert_abs_diff_eq!(erf(0.5), 0.5204999, epsilon = 1e-6);
        assert_abs_diff_eq!(erf(1.0), 0.8427008, epsilon = 1e-6);
        assert_abs_diff_eq!(erf(2.0), 0.9953223, epsilon = 1e-6);
        assert_abs_diff_eq!(erf(-1.0), -0.8427008, epsilon = 1e-6);
    }

    #[test]
    fn test_normal_cdf_reference_values() {
        assert_abs_diff_eq!(normal_cdf(0.0), 0.5, epsilon = 1e-7);
        assert_abs_diff_eq!(normal_cdf(1.0), 0.8413447, epsilon = 1e-6);
        assert_abs_diff_eq!(normal_cdf(-1.0), 0.1586553, epsilon = 1e-6);
        assert_abs_diff_eq!(normal_cdf(1.96), 0.9750021, epsilon = 1e-6);
    }

    #[test]
    fn test_cdf_is_monotonic_and_bounded() {
        let mut prev = 0.0;
        for i in -400..=400 {
            let p = normal_cdf(i as f64 / 100.0);
            assert!((0.0..=1.0).contains(&p));
            assert!(p >= prev);
            prev = p;
        }
    }

    #[test]
    fn test_expected_win_example() {
        // 200-point gap at tennis beta, the canonical sanity check.
        let p = normal_cdf(200.0 / (std::f64::consts::SQRT_2 * 230.0));
        assert_abs_diff_eq!(p, 0.731, epsilon = 0.002);
    }
}
