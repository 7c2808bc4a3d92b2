use crate::Curve;

pub const BALANCE_LABEL: &str = "Conversation Balance";

pub const CONTOUR_WEIGHTS: [f64; 13] = [
    0.1, 0.2, 0.3, 0.4, 0.4333, 0.4667, 0.5, 0.5333, 0.5667, 0.6, 0.7, 0.8, 0.9,
];

/// Weighted sum of `lines` at each index. Timestamps come from the first line.
///
/// All lines must share identical sample ticks; this is not re-checked.
pub fn mix_lines(lines: &[&Curve], weights: &[f64]) -> Curve {
    let first = match lines.first() {
        Some(first) => first,
        None => return Curve::default(),
    };
    let values = (0..first.len())
        .map(|i| {
            lines
                .iter()
                .zip(weights.iter())
                .map(|(line, w)| line.values[i] * w)
                .sum::<f64>()
        })
        .collect();
    Curve::new(first.times_ms.clone(), values)
}

pub fn mix_contour(a: &Curve, b: &Curve, weights: (f64, f64)) -> Curve {
    mix_lines(&[a, b], &[weights.0, weights.1])
}

/// Balance line alone, or the whole fan of contours when `full` is set.
pub fn contour_lines(a: &Curve, b: &Curve, full: bool) -> Vec<Curve> {
    let weights: &[f64] = if full { &CONTOUR_WEIGHTS } else { &[0.5] };
    weights
        .iter()
        .map(|&w| {
            let line = mix_contour(a, b, (w, 1.0 - w));
            if w == 0.5 {
                line.with_label(BALANCE_LABEL)
            } else {
                line
            }
        })
        .collect()
}
