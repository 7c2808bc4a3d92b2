use ndarray::Array1;
use tracing::debug;

use crate::search::nearest_floor;
use crate::{Curve, OptimisationProfile, Settings};

pub const BANDWIDTH_COUNT: usize = 25;

fn fast_normal(x: f64) -> f64 {
    (-x * x).exp()
}

pub fn normal_pdf(x: f64, mean: f64, variance: f64) -> f64 {
    let m = variance.sqrt() * (2.0 * std::f64::consts::PI).sqrt();
    let e = (-(x - mean).powi(2) / (2.0 * variance)).exp();
    e / m
}

/// Bucket sorted `(timestamp, weight)` events into `n_buckets` fixed-width
/// bins over `[first, last)`.
///
/// Returns bucket centers and summed weights, skipping buckets that received no
/// events. The input cursor only moves forward.
pub fn histogram(events: &[(f64, f64)], n_buckets: usize, window: (f64, f64)) -> (Vec<f64>, Vec<f64>) {
    let (first, last) = window;
    let mut centers = Vec::new();
    let mut weights = Vec::new();
    if n_buckets == 0 || !(last > first) {
        return (centers, weights);
    }
    let interval = (last - first) / n_buckets as f64;
    let mut j = 0usize;
    for i in 0..n_buckets {
        let edge = if i + 1 == n_buckets {
            last
        } else {
            first + interval * (i + 1) as f64
        };
        let mut value = 0.0;
        let mut hits = 0usize;
        while j < events.len() && events[j].0 < edge {
            if events[j].0 >= first {
                value += events[j].1;
                hits += 1;
            }
            j += 1;
        }
        if hits > 0 {
            centers.push(edge - interval / 2.0);
            weights.push(value);
        }
    }
    (centers, weights)
}

/// Density of `events` at each sample using a single bandwidth.
///
/// Only histogram buckets within `bandwidth * normal_bandwidth` of a sample are
/// visited; the window bounds are located with [`nearest_floor`].
pub fn kde(
    events: &[(f64, f64)],
    samples: &[f64],
    bandwidth: f64,
    profile: &OptimisationProfile,
) -> Curve {
    let (first, last) = match (samples.first(), samples.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => return Curve::default(),
    };
    let (bucket_times, bucket_weights) = histogram(
        events,
        samples.len() * profile.histogram_resolution,
        (first, last),
    );
    let reach = bandwidth * profile.normal_bandwidth;
    let values = samples
        .iter()
        .map(|&sample| {
            let (start, end) = match (
                nearest_floor(&bucket_times, sample - reach),
                nearest_floor(&bucket_times, sample + reach),
            ) {
                (Some(start), Some(end)) => (start, end),
                _ => return 0.0,
            };
            let density: f64 = (start..=end)
                .map(|i| {
                    // Empty-weight buckets still count once.
                    let weight = match bucket_weights[i] {
                        w if w == 0.0 || w.is_nan() => 1.0,
                        w => w,
                    };
                    fast_normal((sample - bucket_times[i]) / bandwidth) * weight
                })
                .sum();
            if density.is_finite() && density > 0.0 {
                density
            } else {
                0.0
            }
        })
        .collect();
    Curve::new(samples.to_vec(), values)
}

pub fn bandwidths(base: f64, count: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(count);
    let mut value = base;
    for _ in 0..count {
        out.push(value);
        value /= 2.0;
    }
    out
}

pub fn mixture_weights(count: usize, bias: f64, variance: f64) -> Vec<f64> {
    if count < 2 {
        return vec![1.0; count];
    }
    (0..count)
        .map(|i| normal_pdf((i as f64 / (count - 1) as f64) * 2.0 - 1.0, bias, variance))
        .collect()
}

pub fn time_ticks(start: f64, end: f64, count: usize) -> Vec<f64> {
    if count == 0 {
        return Vec::new();
    }
    if count == 1 {
        return vec![start];
    }
    let interval = ((end - start) / (count - 1) as f64).ceil().max(1.0);
    (0..count).map(|i| start + interval * i as f64).collect()
}

/// `base_bandwidth` is the widest bandwidth, normally the padded span of the
/// whole chat. The weights are not normalized.
pub fn mixed_density(
    events: &[(f64, f64)],
    samples: &[f64],
    base_bandwidth: f64,
    settings: &Settings,
    profile: &OptimisationProfile,
) -> Curve {
    let weights = mixture_weights(
        BANDWIDTH_COUNT,
        settings.bandwidth_bias,
        settings.effective_bandwidth_variance(),
    );
    let mut acc = Array1::<f64>::zeros(samples.len());
    for (bandwidth, weight) in bandwidths(base_bandwidth, BANDWIDTH_COUNT)
        .into_iter()
        .zip(weights.iter().copied())
    {
        if !(bandwidth > 0.0) || !weight.is_finite() {
            continue;
        }
        let line = kde(events, samples, bandwidth, profile);
        acc.scaled_add(weight, &Array1::from_vec(line.values));
    }
    debug!(
        events = events.len(),
        samples = samples.len(),
        base_bandwidth,
        "mixed density computed"
    );
    Curve::new(samples.to_vec(), acc.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(times: &[f64]) -> Vec<(f64, f64)> {
        times.iter().map(|&t| (t, 1.0)).collect()
    }

    #[test]
    fn histogram_conserves_weight_inside_window() {
        let input: Vec<(f64, f64)> = vec![
            (-5.0, 7.0),
            (0.0, 1.0),
            (0.5, 2.0),
            (3.3, 0.5),
            (9.99, 4.0),
            (10.0, 100.0),
            (12.0, 100.0),
        ];
        let (centers, weights) = histogram(&input, 4, (0.0, 10.0));
        let total: f64 = weights.iter().sum();
        assert!((total - 7.5).abs() < 1e-12);
        assert!(centers.len() <= 4);
        assert_eq!(centers.len(), weights.len());
    }

    #[test]
    fn histogram_omits_empty_buckets_and_centers_them() {
        let (centers, weights) = histogram(&events(&[1.0, 1.5, 8.2]), 5, (0.0, 10.0));
        assert_eq!(centers, vec![1.0, 9.0]);
        assert_eq!(weights, vec![2.0, 1.0]);
    }

    #[test]
    fn histogram_degenerate_window_is_empty() {
        let input = events(&[1.0, 2.0]);
        assert!(histogram(&input, 0, (0.0, 10.0)).0.is_empty());
        assert!(histogram(&input, 10, (5.0, 5.0)).0.is_empty());
    }

    #[test]
    fn kde_matches_sample_length_and_is_non_negative() {
        let samples = time_ticks(0.0, 1000.0, 101);
        let line = kde(&events(&[100.0, 120.0, 700.0]), &samples, 50.0, &OptimisationProfile::FAST);
        assert_eq!(line.len(), samples.len());
        assert!(line.values.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn kde_of_single_event_is_a_centered_bump() {
        let samples = time_ticks(0.0, 1000.0, 201);
        let narrow = kde(&events(&[500.0]), &samples, 40.0, &OptimisationProfile::SLOW);
        let wide = kde(&events(&[500.0]), &samples, 120.0, &OptimisationProfile::SLOW);

        let peak = |c: &Curve| {
            c.values
                .iter()
                .enumerate()
                .fold((0, f64::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        };
        let (narrow_idx, narrow_peak) = peak(&narrow);
        let (wide_idx, _) = peak(&wide);
        assert!((samples[narrow_idx] - 500.0).abs() <= 10.0);
        assert!((samples[wide_idx] - 500.0).abs() <= 10.0);

        // Rises to the peak then falls away.
        for i in 1..=narrow_idx {
            assert!(narrow.values[i] >= narrow.values[i - 1]);
        }
        for i in narrow_idx + 1..narrow.len() {
            assert!(narrow.values[i] <= narrow.values[i - 1]);
        }

        let width = |c: &Curve, peak: f64| c.values.iter().filter(|&&v| v > peak / 2.0).count();
        let (_, wide_peak) = peak(&wide);
        assert!(width(&wide, wide_peak) > width(&narrow, narrow_peak));
    }

    #[test]
    fn kde_only_sums_buckets_inside_window() {
        let samples = time_ticks(0.0, 1000.0, 101);
        let profile = OptimisationProfile {
            num_samples: samples.len(),
            histogram_resolution: 1,
            normal_bandwidth: 0.5,
        };
        let input = events(&[100.0, 900.0]);
        let bandwidth = 500.0;
        let line = kde(&input, &samples, bandwidth, &profile);

        let (centers, weights) = histogram(&input, samples.len(), (0.0, 1000.0));
        assert_eq!(centers.len(), 2);
        let term = |j: usize| fast_normal((samples[10] - centers[j]) / bandwidth) * weights[j];
        let near = term(0);
        let everything = near + term(1);
        assert_eq!(samples[10], 100.0);
        assert!((line.values[10] - near).abs() < 1e-12);
        assert!((line.values[10] - everything).abs() > 1e-3);
    }

    #[test]
    fn zero_weight_bucket_counts_as_one() {
        let samples = time_ticks(0.0, 1000.0, 51);
        let zero = kde(&[(500.0, 0.0)], &samples, 80.0, &OptimisationProfile::FAST);
        let unit = kde(&[(500.0, 1.0)], &samples, 80.0, &OptimisationProfile::FAST);
        assert_eq!(zero.values, unit.values);
        assert!(zero.values.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn kde_without_events_is_zero() {
        let samples = time_ticks(0.0, 100.0, 11);
        let line = kde(&[], &samples, 10.0, &OptimisationProfile::FAST);
        assert!(line.values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn bandwidths_halve_geometrically() {
        let seq = bandwidths(1024.0, BANDWIDTH_COUNT);
        assert_eq!(seq.len(), 25);
        assert_eq!(seq[0], 1024.0);
        assert_eq!(seq[1], 512.0);
        assert!((seq[24] - 1024.0 / 2f64.powi(24)).abs() < 1e-15);
    }

    #[test]
    fn mixture_weights_peak_at_bias() {
        let weights = mixture_weights(BANDWIDTH_COUNT, 0.0, 0.2);
        let peak = weights
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        assert_eq!(peak.0, 12);
        assert!((weights[0] - weights[24]).abs() < 1e-12);
    }

    #[test]
    fn time_ticks_use_whole_millisecond_steps() {
        let ticks = time_ticks(0.0, 10.0, 4);
        assert_eq!(ticks, vec![0.0, 4.0, 8.0, 12.0]);
        let flat = time_ticks(5.0, 5.0, 3);
        assert_eq!(flat, vec![5.0, 6.0, 7.0]);
    }

    #[test]
    fn mixed_density_has_one_value_per_sample() {
        let samples = time_ticks(0.0, 10_000.0, 50);
        let line = mixed_density(
            &events(&[1000.0, 2000.0, 2500.0, 9000.0]),
            &samples,
            10_000.0,
            &Settings::default(),
            &OptimisationProfile::FAST,
        );
        assert_eq!(line.times_ms, samples);
        assert!(line.values.iter().all(|v| v.is_finite() && *v >= 0.0));
        assert!(line.values.iter().any(|&v| v > 0.0));
    }
}
