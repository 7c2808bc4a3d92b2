use ordered_float::OrderedFloat;
use tracing::debug;

use crate::{Curve, Settings};

const AMPLITUDE_FLOOR: f64 = 0.15;
pub const FINAL_PADDING: f64 = 0.01;

fn joint_values<'a>(a: &'a Curve, b: &'a Curve) -> impl Iterator<Item = f64> + 'a {
    a.values.iter().chain(b.values.iter()).copied()
}

fn joint_max(a: &Curve, b: &Curve) -> Option<f64> {
    joint_values(a, b).map(OrderedFloat).max().map(|v| v.0)
}

fn joint_min(a: &Curve, b: &Curve) -> Option<f64> {
    joint_values(a, b).map(OrderedFloat).min().map(|v| v.0)
}

fn map_values(curve: &Curve, f: impl Fn(f64) -> f64) -> Curve {
    Curve {
        label: curve.label.clone(),
        times_ms: curve.times_ms.clone(),
        values: curve.values.iter().map(|&v| f(v)).collect(),
    }
}

/// Affine map into `[padding, 1 - padding]` about 0.5, sized by whichever joint
/// extreme lies farther from the midline.
pub fn center_crop(a: &Curve, b: &Curve, padding: f64) -> (Curve, Curve) {
    let (min, max) = match (joint_min(a, b), joint_max(a, b)) {
        (Some(min), Some(max)) => (min, max),
        _ => return (a.clone(), b.clone()),
    };
    let radius = (0.5 - min).max(max - 0.5);
    if !(radius > 0.0) || !radius.is_finite() {
        return (map_values(a, |_| 0.5), map_values(b, |_| 0.5));
    }
    let lo = 0.5 - radius;
    let span = 2.0 * radius;
    let target = 1.0 - 2.0 * padding;
    let crop = |v: f64| padding + (v - lo) / span * target;
    (map_values(a, crop), map_values(b, crop))
}

/// Everything up to, but not including, closeness damping.
///
/// After this stage B is already mirrored, so for identical inputs
/// `a[i] + b[i] == 1`.
pub fn shape_pair(a: &Curve, b: &Curve, settings: &Settings) -> (Curve, Curve) {
    // Amplitude pre-scale into [0.15, 1].
    let max = joint_max(a, b).unwrap_or(0.0);
    let divisor = if max > 0.0 && max.is_finite() { max } else { 1.0 };
    let prescale = |v: f64| AMPLITUDE_FLOOR + (1.0 - AMPLITUDE_FLOOR) * (v / divisor);
    let (a, b) = (map_values(a, prescale), map_values(b, prescale));

    // Log-compression.
    let exponent = 1.0 / settings.log_scaling.exp();
    let (a, b) = (
        map_values(&a, |v| v.powf(exponent)),
        map_values(&b, |v| v.powf(exponent)),
    );

    let (a, b) = center_crop(&a, &b, 0.0);

    // Area rescale: `scaling` controls mean height, not peak height.
    let count = a.len() + b.len();
    let mean = if count > 0 {
        joint_values(&a, &b).sum::<f64>() / count as f64
    } else {
        0.0
    };
    let (a, b) = if mean > 0.0 && mean.is_finite() {
        let factor = settings.scaling / 2.0 / mean;
        (map_values(&a, |v| v * factor), map_values(&b, |v| v * factor))
    } else {
        (a, b)
    };

    // Ceiling clamp.
    let ceiling = ceiling_for(settings.scaling);
    let peak = joint_max(&a, &b).unwrap_or(0.0);
    let (a, b) = if peak > ceiling {
        let factor = ceiling / peak;
        debug!(peak, ceiling, "clamping curve pair to ceiling");
        (map_values(&a, |v| v * factor), map_values(&b, |v| v * factor))
    } else {
        (a, b)
    };

    let b = map_values(&b, |v| 1.0 - v);
    center_crop(&a, &b, 0.0)
}

pub fn ceiling_for(scaling: f64) -> f64 {
    1.0 - (-scaling).exp() / 2.0
}

/// Soft push-apart of the two bands wherever `a - b` comes within
/// `damping` of crossing.
///
/// `a` drops and `b` rises by the same amount, so the midpoint of the pair is
/// unchanged at every index.
pub fn damp_closeness(a: &Curve, b: &Curve, damping: f64) -> (Curve, Curve) {
    if !(damping > 0.0) {
        return (a.clone(), b.clone());
    }
    let shifts: Vec<f64> = a
        .values
        .iter()
        .zip(b.values.iter())
        .map(|(&va, &vb)| {
            let c = va - vb + damping;
            if c < 0.0 {
                return 0.0;
            }
            let r = (1.0 - (-c / damping).exp()) * damping;
            (c - r) / 2.0
        })
        .collect();
    let mut da = a.clone();
    let mut db = b.clone();
    for (i, d) in shifts.into_iter().enumerate() {
        da.values[i] -= d;
        db.values[i] += d;
    }
    (da, db)
}

pub fn normalize_pair(a: &Curve, b: &Curve, settings: &Settings) -> (Curve, Curve) {
    let (a, b) = shape_pair(a, b, settings);
    let (a, b) = damp_closeness(&a, &b, settings.closeness_damping);
    center_crop(&a, &b, FINAL_PADDING)
}
