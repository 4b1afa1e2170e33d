/// Robust Normalizer
///
/// Maps one window's raw hot scores onto `[0, 1]` with a median/MAD z-score.
///
/// # Algorithm
/// 1. Clip every value to the 5th/95th percentile of the candidate set
/// 2. `m` = median of the clipped values, `s` = median absolute deviation
/// 3. `z = clamp((x - m) / (1.4826 * s + eps), -3, 3)`
/// 4. `norm = (z + 3) / 6`
///
/// A handful of viral posts cannot stretch the scale of the whole window, which a
/// min-max normalization would allow.
use std::collections::HashMap;

/// Consistency constant that makes MAD estimate the standard deviation of a normal
/// distribution.
const MAD_SCALE: f64 = 1.4826;

#[derive(Debug, Clone)]
pub struct RobustNormalizer {
    clip_low: f64,
    clip_high: f64,
    z_limit: f64,
    epsilon: f64,
}

impl Default for RobustNormalizer {
    fn default() -> Self {
        Self {
            clip_low: 0.05,
            clip_high: 0.95,
            z_limit: 3.0,
            epsilon: 1e-9,
        }
    }
}

impl RobustNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize raw values keyed by item id. Empty input yields an empty map.
    pub fn normalize(&self, raw: &HashMap<String, f64>) -> HashMap<String, f64> {
        if raw.is_empty() {
            return HashMap::new();
        }

        let mut sorted: Vec<f64> = raw.values().map(|v| sanitize(*v)).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let low = percentile(&sorted, self.clip_low);
        let high = percentile(&sorted, self.clip_high);

        // Clipping is monotonic, so the clipped values stay sorted
        let clipped: Vec<f64> = sorted.iter().map(|v| v.clamp(low, high)).collect();
        let m = median(&clipped);

        let mut deviations: Vec<f64> = clipped.iter().map(|v| (v - m).abs()).collect();
        deviations.sort_by(|a, b| a.total_cmp(b));
        let s = median(&deviations);
        let spread = MAD_SCALE * s + self.epsilon;

        raw.iter()
            .map(|(id, value)| {
                let x = sanitize(*value).clamp(low, high);
                let z = ((x - m) / spread).clamp(-self.z_limit, self.z_limit);
                let norm = (z + self.z_limit) / (2.0 * self.z_limit);
                (id.clone(), norm.clamp(0.0, 1.0))
            })
            .collect()
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Linear-interpolated percentile over an ascending slice (`percentile_cont`).
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = p.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let frac = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * frac
        }
    }
}

/// Median of an ascending slice.
pub fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn raw(values: &[(&str, f64)]) -> HashMap<String, f64> {
        values.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_empty_input_is_noop() {
        let normalizer = RobustNormalizer::new();
        assert!(normalizer.normalize(&HashMap::new()).is_empty());
    }

    #[test]
    fn test_single_candidate_is_midpoint() {
        let normalizer = RobustNormalizer::new();
        let out = normalizer.normalize(&raw(&[("a", 1234.0)]));
        assert_eq!(out["a"], 0.5);
    }

    #[test]
    fn test_identical_values_are_exactly_half() {
        let normalizer = RobustNormalizer::new();
        let out = normalizer.normalize(&raw(&[("a", 7.0), ("b", 7.0), ("c", 7.0), ("d", 7.0)]));
        assert!(out.values().all(|v| *v == 0.5));
    }

    #[test]
    fn test_viral_outlier_does_not_flatten_the_rest() {
        let normalizer = RobustNormalizer::new();
        let mut values: Vec<(String, f64)> =
            (0..20).map(|i| (format!("p{}", i), 10.0 + i as f64)).collect();
        values.push(("viral".to_string(), 1_000_000.0));
        let out = normalizer.normalize(&values.into_iter().collect());

        // The regular posts still spread over a useful part of the scale
        assert!(out["p19"] - out["p0"] > 0.3);
        // The outlier is clipped to the 95th percentile, not given its own scale
        assert_eq!(out["viral"], out["p19"]);
        assert!(out["viral"] < 1.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [0.0, 10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&sorted, 0.5), 20.0);
        assert!((percentile(&sorted, 0.05) - 2.0).abs() < 1e-9);
        assert!((percentile(&sorted, 0.95) - 38.0).abs() < 1e-9);
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
    }

    proptest! {
        #[test]
        fn normalized_values_stay_in_unit_interval(
            values in proptest::collection::vec(-1.0e9f64..1.0e9, 1..60)
        ) {
            let input: HashMap<String, f64> = values
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("item{}", i), *v))
                .collect();
            let out = RobustNormalizer::new().normalize(&input);
            prop_assert_eq!(out.len(), input.len());
            for v in out.values() {
                prop_assert!((0.0..=1.0).contains(v));
            }
        }

        #[test]
        fn normalization_preserves_order(
            values in proptest::collection::vec(0.0f64..1.0e6, 2..40)
        ) {
            let input: HashMap<String, f64> = values
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("item{}", i), *v))
                .collect();
            let out = RobustNormalizer::new().normalize(&input);
            for (a, va) in &input {
                for (b, vb) in &input {
                    if va <= vb {
                        prop_assert!(out[a] <= out[b]);
                    }
                }
            }
        }

        #[test]
        fn identical_values_always_map_to_half(value in -1.0e6f64..1.0e6, n in 1usize..30) {
            let input: HashMap<String, f64> =
                (0..n).map(|i| (format!("item{}", i), value)).collect();
            let out = RobustNormalizer::new().normalize(&input);
            prop_assert!(out.values().all(|v| *v == 0.5));
        }
    }
}
