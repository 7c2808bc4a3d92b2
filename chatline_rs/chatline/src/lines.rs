use chrono::{DateTime, Utc};
use tracing::debug;

use crate::chat::Chat;
use crate::kde::{mixed_density, time_ticks};
use crate::normalize::normalize_pair;
use crate::search::nearest_floor;
use crate::{Curve, CurveError, OptimisationProfile, Settings};

const SPAN_PADDING: f64 = 1.0 / 20.0;

pub fn padded_window(chat: &Chat) -> (f64, f64) {
    let (first, last) = chat.time_span();
    let pad = (last - first) * SPAN_PADDING;
    (first - pad, last + pad)
}

fn range_ms(range: (DateTime<Utc>, DateTime<Utc>)) -> (f64, f64) {
    (
        range.0.timestamp_millis() as f64,
        range.1.timestamp_millis() as f64,
    )
}

/// Normalized curves for participants A and B over `sample_range`, or over
/// the padded chat span when no range is given.
pub fn compute_lines(
    chat: &Chat,
    settings: &Settings,
    profile: &OptimisationProfile,
    sample_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> Result<(Curve, Curve), CurveError> {
    settings.validate()?;
    profile.validate()?;

    let (start, end) = padded_window(chat);
    let (sample_start, sample_end) = sample_range.map(range_ms).unwrap_or((start, end));
    let base_bandwidth = end - start;

    let [first, second] = chat.participants();
    let (sender_a, sender_b) = if settings.flipped {
        (second, first)
    } else {
        (first, second)
    };

    let samples = time_ticks(sample_start, sample_end, profile.num_samples);
    let events_a = chat.events_for(sender_a, settings.weighting);
    let events_b = chat.events_for(sender_b, settings.weighting);
    debug!(
        chat = chat.key(),
        samples = samples.len(),
        base_bandwidth,
        inset = sample_range.is_some(),
        "computing lines"
    );

    let raw_a = mixed_density(&events_a, &samples, base_bandwidth, settings, profile);
    let raw_b = mixed_density(&events_b, &samples, base_bandwidth, settings, profile);
    let (a, b) = normalize_pair(&raw_a, &raw_b, settings);
    Ok((a.with_label(sender_a.as_str()), b.with_label(sender_b.as_str())))
}

/// Full-range curves with a higher-fidelity recomputation of `inset` spliced in.
pub fn compute_lines_with_inset(
    chat: &Chat,
    settings: &Settings,
    profile: &OptimisationProfile,
    inset: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> Result<(Curve, Curve), CurveError> {
    let (line_a, line_b) = compute_lines(chat, settings, profile, None)?;
    let Some(range) = inset else {
        return Ok((line_a, line_b));
    };
    let (inset_a, inset_b) = compute_lines(chat, settings, profile, Some(range))?;
    let range = range_ms(range);
    Ok((
        splice_inset(&line_a, &inset_a, range),
        splice_inset(&line_b, &inset_b, range),
    ))
}

/// Replace the part of `full` covering `range` with `inset`.
///
/// One extra point is dropped before the range and two after it to hide seams,
/// and any neighbour that would break strict ordering is dropped too. An empty
/// inset, or one starting at zero, leaves `full` unchanged.
pub fn splice_inset(full: &Curve, inset: &Curve, range: (f64, f64)) -> Curve {
    let usable = matches!(inset.values.first(), Some(&v) if v != 0.0 && v.is_finite());
    if !usable {
        return full.clone();
    }
    let (Some(lo), Some(hi)) = (
        nearest_floor(&full.times_ms, range.0),
        nearest_floor(&full.times_ms, range.1),
    ) else {
        return full.clone();
    };
    let mut lo = lo.saturating_sub(1);
    let mut hi = (hi + 2).min(full.len());

    let inset_first = inset.times_ms[0];
    let inset_last = inset.times_ms[inset.len() - 1];
    lo = lo.min(full.times_ms.partition_point(|&t| t < inset_first));
    hi = hi.max(full.times_ms.partition_point(|&t| t <= inset_last));
    let hi = hi.max(lo);

    let mut times = Vec::with_capacity(full.len() - (hi - lo) + inset.len());
    let mut values = Vec::with_capacity(times.capacity());
    times.extend_from_slice(&full.times_ms[..lo]);
    values.extend_from_slice(&full.values[..lo]);
    times.extend_from_slice(&inset.times_ms);
    values.extend_from_slice(&inset.values);
    times.extend_from_slice(&full.times_ms[hi..]);
    values.extend_from_slice(&full.values[hi..]);
    debug!(lo, hi, inset = inset.len(), "spliced inset");

    Curve {
        label: full.label.clone(),
        times_ms: times,
        values,
    }
}
