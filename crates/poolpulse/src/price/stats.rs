//! Outlier rejection and priority-weighted averaging over price samples.

/// Arithmetic mean. Zero for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mu = mean(values);
    let variance = values.iter().map(|v| (v - mu) * (v - mu)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Drop samples further than 2σ from the mean.
///
/// Sequences of at most two samples pass through unchanged, and if the
/// filter would reject everything the original sequence is returned.
pub fn reject_outliers(values: &[f64]) -> Vec<f64> {
    if values.len() <= 2 {
        return values.to_vec();
    }
    let mu = mean(values);
    let sigma = std_dev(values);
    let retained: Vec<f64> = values
        .iter()
        .copied()
        .filter(|v| (v - mu).abs() <= 2.0 * sigma)
        .collect();
    if retained.is_empty() {
        values.to_vec()
    } else {
        retained
    }
}

/// Weighted average where each sample contributes weight `1/priority`.
/// Lower priority numbers are stronger.
pub fn priority_weighted(samples: &[(f64, u32)]) -> f64 {
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for (value, priority) in samples {
        let weight = 1.0 / (*priority).max(1) as f64;
        weighted_sum += value * weight;
        weight_total += weight;
    }
    if weight_total == 0.0 {
        0.0
    } else {
        weighted_sum / weight_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_sequences_pass_through() {
        assert_eq!(reject_outliers(&[]), Vec::<f64>::new());
        assert_eq!(reject_outliers(&[5.0]), vec![5.0]);
        assert_eq!(reject_outliers(&[5.0, 500.0]), vec![5.0, 500.0]);
    }

    #[test]
    fn test_outlier_dropped() {
        // Tight cluster plus one sample far outside 2σ of the six.
        let input = [100.0, 101.0, 99.0, 100.0, 100.5, 100_000.0];
        let out = reject_outliers(&input);
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|v| *v < 1000.0));
    }

    #[test]
    fn test_boundary_sample_retained() {
        // With a single extreme value among five, σ is inflated enough that
        // the extreme sits just inside 2σ and everything is retained.
        let input = [100.0, 101.0, 99.0, 100.0, 5000.0];
        let out = reject_outliers(&input);
        assert_eq!(out, input.to_vec());
    }

    #[test]
    fn test_output_is_subset_and_never_empty() {
        let inputs: [&[f64]; 4] = [
            &[1.0, 1.0, 1.0, 1.0],
            &[1.0, 2.0, 3.0, 4.0, 5.0],
            &[0.0, 0.0, 1e9],
            &[42.0],
        ];
        for input in inputs {
            let out = reject_outliers(input);
            assert!(!out.is_empty());
            for v in &out {
                assert!(input.contains(v));
            }
        }
    }

    #[test]
    fn test_priority_weighting() {
        // Priority 1 counts twice as much as priority 2.
        let avg = priority_weighted(&[(100.0, 1), (400.0, 2)]);
        let expected = (100.0 + 400.0 / 2.0) / 1.5;
        assert!((avg - expected).abs() < 1e-9);

        // Equal priorities reduce to the arithmetic mean.
        let avg = priority_weighted(&[(10.0, 3), (20.0, 3)]);
        assert!((avg - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_priority_weighted_empty() {
        assert_eq!(priority_weighted(&[]), 0.0);
    }
}
