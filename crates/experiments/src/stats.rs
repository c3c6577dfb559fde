//! Two-proportion z-test for two-variant experiments.

/// z thresholds and the confidence levels they map to.
const CONFIDENCE_LADDER: [(f64, f64); 4] = [
    (2.58, 0.99),
    (1.96, 0.95),
    (1.64, 0.90),
    (1.28, 0.80),
];

/// Pooled two-proportion z statistic. Returns 0 when either sample is
/// empty or the pooled standard error collapses (all or no conversions),
/// so dashboards degrade to "no signal" instead of erroring.
pub fn two_proportion_z(x1: u64, n1: u64, x2: u64, n2: u64) -> f64 {
    if n1 == 0 || n2 == 0 {
        return 0.0;
    }
    let p1 = x1 as f64 / n1 as f64;
    let p2 = x2 as f64 / n2 as f64;
    let pooled = (x1 + x2) as f64 / (n1 + n2) as f64;
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 as f64 + 1.0 / n2 as f64)).sqrt();
    if se == 0.0 {
        return 0.0;
    }
    (p1 - p2).abs() / se
}

/// Map a z statistic onto the discrete confidence ladder, with a
/// continuous `z / 2.58` fallback below the lowest rung.
pub fn confidence_level(z: f64) -> f64 {
    for (threshold, confidence) in CONFIDENCE_LADDER {
        if z > threshold {
            return confidence;
        }
    }
    z / 2.58
}

/// An experiment result is significant above the 95% confidence level.
pub fn is_significant(confidence: f64) -> bool {
    confidence > 0.95
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_computation() {
        // Known reference: 10% vs 15% conversion at n=1000 each is a
        // clearly significant difference.
        let z = two_proportion_z(100, 1000, 150, 1000);
        assert!(z > 2.58, "z was {z}");
        assert!(z < 3.6, "z was {z}");
        let confidence = confidence_level(z);
        assert_eq!(confidence, 0.99);
        assert!(is_significant(confidence));
    }

    #[test]
    fn test_empty_sample_guard() {
        assert_eq!(two_proportion_z(0, 0, 10, 100), 0.0);
        assert_eq!(two_proportion_z(10, 100, 0, 0), 0.0);
    }

    #[test]
    fn test_degenerate_standard_error_guard() {
        // All conversions on both sides: pooled variance is zero.
        assert_eq!(two_proportion_z(100, 100, 50, 50), 0.0);
        assert_eq!(two_proportion_z(0, 100, 0, 50), 0.0);
    }

    #[test]
    fn test_confidence_ladder() {
        assert_eq!(confidence_level(3.0), 0.99);
        assert_eq!(confidence_level(2.0), 0.95);
        assert_eq!(confidence_level(1.7), 0.90);
        assert_eq!(confidence_level(1.3), 0.80);
        assert!((confidence_level(1.0) - 1.0 / 2.58).abs() < 1e-12);
        assert_eq!(confidence_level(0.0), 0.0);
    }

    #[test]
    fn test_ladder_boundaries_fall_through() {
        // Exactly at a rung the next lower mapping applies.
        assert_eq!(confidence_level(2.58), 0.95);
        assert_eq!(confidence_level(1.96), 0.90);
    }

    #[test]
    fn test_significance_threshold_is_strict() {
        assert!(!is_significant(0.95));
        assert!(is_significant(0.99));
    }

    #[test]
    fn test_identical_proportions_not_significant() {
        let z = two_proportion_z(100, 1000, 100, 1000);
        assert_eq!(z, 0.0);
        assert!(!is_significant(confidence_level(z)));
    }
}
