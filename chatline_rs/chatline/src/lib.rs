//! Conversation balance curves: smoothed, comparable activity densities for
//! the two participants of a chat.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod chat;
pub mod contour;
pub mod import;
pub mod kde;
pub mod lines;
pub mod normalize;
pub mod search;

pub use chat::{Chat, Message, Provider, Weighting};
pub use contour::{contour_lines, mix_contour, mix_lines, BALANCE_LABEL};
pub use import::{parse_chats, tidy_chats, unique_chats, NameResolver, NoResolver};
pub use lines::{compute_lines, compute_lines_with_inset};
pub use search::nearest_floor;

#[derive(Error, Debug)]
pub enum CurveError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("insufficient data for curve computation")]
    InsufficientData,
    #[error("messages are not sorted by time")]
    UnsortedMessages,
    #[error("message from unknown participant: {0}")]
    UnknownParticipant(String),
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("could not understand chat export: {0}")]
    Import(String),
}

pub struct SettingsRanges {
    pub closeness_damping: (f64, f64),
    pub scaling: (f64, f64),
    pub log_scaling: (f64, f64),
    pub bandwidth_bias: (f64, f64),
}

pub const SETTINGS_RANGES: SettingsRanges = SettingsRanges {
    closeness_damping: (0.0, 0.5),
    scaling: (0.88, 1.03),
    log_scaling: (0.0, 2.5),
    bandwidth_bias: (-0.7, 1.5),
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub flipped: bool,
    pub closeness_damping: f64,
    pub scaling: f64,
    pub log_scaling: f64,
    pub bandwidth_bias: f64,
    /// Derived from `bandwidth_bias` when unset.
    pub bandwidth_variance: Option<f64>,
    pub selected_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub contour: bool,
    pub weighting: Weighting,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            flipped: false,
            closeness_damping: 0.08,
            scaling: 0.95,
            log_scaling: 1.83,
            bandwidth_bias: -0.28,
            bandwidth_variance: None,
            selected_range: None,
            contour: false,
            weighting: Weighting::Count,
        }
    }
}

fn check_range(name: &str, value: f64, (lo, hi): (f64, f64)) -> Result<(), CurveError> {
    if !value.is_finite() || value < lo || value > hi {
        return Err(CurveError::InvalidParameter(format!(
            "{name} must be within [{lo}, {hi}], got {value}"
        )));
    }
    Ok(())
}

impl Settings {
    pub fn validate(&self) -> Result<(), CurveError> {
        let ranges = &SETTINGS_RANGES;
        check_range("closeness_damping", self.closeness_damping, ranges.closeness_damping)?;
        check_range("scaling", self.scaling, ranges.scaling)?;
        check_range("log_scaling", self.log_scaling, ranges.log_scaling)?;
        check_range("bandwidth_bias", self.bandwidth_bias, ranges.bandwidth_bias)?;
        if let Some(variance) = self.bandwidth_variance {
            if !variance.is_finite() || variance <= 0.0 {
                return Err(CurveError::InvalidParameter(format!(
                    "bandwidth_variance must be positive, got {variance}"
                )));
            }
        }
        if let Some((start, end)) = self.selected_range {
            if start >= end {
                return Err(CurveError::InvalidParameter(
                    "selected_range start must precede its end".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn effective_bandwidth_variance(&self) -> f64 {
        self.bandwidth_variance
            .unwrap_or_else(|| bandwidth_variance_for_bias(self.bandwidth_bias))
    }

    pub fn params_hash_sha256(&self) -> Result<String, CurveError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| CurveError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

pub fn bandwidth_variance_for_bias(bias: f64) -> f64 {
    let (lo, hi) = SETTINGS_RANGES.bandwidth_bias;
    let x = (bias - lo) / (hi - lo);
    0.3 / (1.0 + (5.0 - 32.0 * x).exp()) + 0.01
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct OptimisationProfile {
    pub num_samples: usize,
    pub histogram_resolution: usize,
    pub normal_bandwidth: f64,
}

impl OptimisationProfile {
    pub const FAST: Self = Self {
        num_samples: 750,
        histogram_resolution: 5,
        normal_bandwidth: 2.0,
    };
    pub const SLOW: Self = Self {
        num_samples: 1500,
        histogram_resolution: 5,
        normal_bandwidth: 5.0,
    };

    pub fn validate(&self) -> Result<(), CurveError> {
        if self.num_samples < 2 {
            return Err(CurveError::InvalidParameter("num_samples must be at least 2".into()));
        }
        if self.histogram_resolution == 0 {
            return Err(CurveError::InvalidParameter(
                "histogram_resolution must be positive".into(),
            ));
        }
        if !self.normal_bandwidth.is_finite() || self.normal_bandwidth <= 0.0 {
            return Err(CurveError::InvalidParameter(
                "normal_bandwidth must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for OptimisationProfile {
    fn default() -> Self {
        Self::SLOW
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Curve {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub times_ms: Vec<f64>,
    pub values: Vec<f64>,
}

impl Curve {
    pub fn new(times_ms: Vec<f64>, values: Vec<f64>) -> Self {
        Self {
            label: None,
            times_ms,
            values,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn len(&self) -> usize {
        self.times_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times_ms.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.times_ms.iter().copied().zip(self.values.iter().copied())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatLines {
    pub line_a: Curve,
    pub line_b: Curve,
    pub contours: Vec<Curve>,
}

/// Curves for `chat` honouring `settings.selected_range` (as an inset) and
/// `settings.contour`.
pub fn chat_lines(
    chat: &Chat,
    settings: &Settings,
    profile: &OptimisationProfile,
) -> Result<ChatLines, CurveError> {
    let (line_a, line_b) = compute_lines_with_inset(chat, settings, profile, settings.selected_range)?;
    let contours = contour_lines(&line_a, &line_b, settings.contour);
    Ok(ChatLines {
        line_a,
        line_b,
        contours,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn default_settings_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_settings_are_rejected() {
        let bad = [
            Settings {
                closeness_damping: -0.1,
                ..Settings::default()
            },
            Settings {
                log_scaling: 9.0,
                ..Settings::default()
            },
            Settings {
                bandwidth_variance: Some(0.0),
                ..Settings::default()
            },
        ];
        for settings in bad {
            assert!(matches!(settings.validate(), Err(CurveError::InvalidParameter(_))));
        }
    }

    #[test]
    fn inverted_selected_range_is_rejected() {
        let t = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).single().unwrap();
        let settings = Settings {
            selected_range: Some((t, t - Duration::hours(1))),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn variance_mapping_is_logistic_in_bias() {
        let low = bandwidth_variance_for_bias(-0.7);
        let high = bandwidth_variance_for_bias(1.5);
        assert!(low > 0.01 && low < 0.02);
        assert!(high > 0.30 && high <= 0.31);
        assert!(bandwidth_variance_for_bias(0.0) > low);
        let explicit = Settings {
            bandwidth_variance: Some(0.5),
            ..Settings::default()
        };
        assert_eq!(explicit.effective_bandwidth_variance(), 0.5);
    }

    #[test]
    fn settings_json_fills_defaults_and_rejects_unknown_fields() {
        let parsed: Settings = serde_json::from_str(r#"{"scaling": 1.0, "flipped": true}"#).unwrap();
        assert_eq!(parsed.scaling, 1.0);
        assert!(parsed.flipped);
        assert_eq!(parsed.log_scaling, Settings::default().log_scaling);
        assert!(serde_json::from_str::<Settings>(r#"{"scale": 1.0}"#).is_err());
    }

    #[test]
    fn params_hash_tracks_settings() {
        let a = Settings::default().params_hash_sha256().unwrap();
        let b = Settings {
            scaling: 1.0,
            ..Settings::default()
        }
        .params_hash_sha256()
        .unwrap();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn profile_validation() {
        assert!(OptimisationProfile::FAST.validate().is_ok());
        let bad = OptimisationProfile {
            num_samples: 1,
            ..OptimisationProfile::FAST
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn chat_lines_include_balance_contour() {
        let base = Utc.with_ymd_and_hms(2021, 6, 1, 8, 0, 0).single().unwrap();
        let messages = (0..24)
            .map(|i| {
                let sender = if i % 3 == 0 { "bob" } else { "ann" };
                Message::new(sender, base + Duration::hours(5 * i), "hey")
            })
            .collect();
        let chat = Chat::new(["ann".into(), "bob".into()], messages, Provider::Manual).unwrap();
        let profile = OptimisationProfile {
            num_samples: 120,
            ..OptimisationProfile::FAST
        };
        let lines = chat_lines(&chat, &Settings::default(), &profile).unwrap();
        assert_eq!(lines.contours.len(), 1);
        assert_eq!(lines.contours[0].label.as_deref(), Some(BALANCE_LABEL));
        assert_eq!(lines.contours[0].len(), lines.line_a.len());

        let full = Settings {
            contour: true,
            ..Settings::default()
        };
        let lines = chat_lines(&chat, &full, &profile).unwrap();
        assert_eq!(lines.contours.len(), contour::CONTOUR_WEIGHTS.len());
    }

    #[test]
    fn inset_contours_share_spliced_ticks() {
        let base = Utc.with_ymd_and_hms(2021, 6, 1, 8, 0, 0).single().unwrap();
        let messages = (0..40)
            .map(|i| {
                let sender = if i % 2 == 0 { "ann" } else { "bob" };
                Message::new(sender, base + Duration::hours(6 * i), "hey")
            })
            .collect();
        let chat = Chat::new(["ann".into(), "bob".into()], messages, Provider::Manual).unwrap();
        let profile = OptimisationProfile {
            num_samples: 120,
            ..OptimisationProfile::FAST
        };
        let settings = Settings {
            selected_range: Some((base + Duration::days(3), base + Duration::days(5))),
            contour: true,
            ..Settings::default()
        };
        let lines = chat_lines(&chat, &settings, &profile).unwrap();
        assert!(lines.line_a.len() > profile.num_samples);
        assert_eq!(lines.line_a.times_ms, lines.line_b.times_ms);
        for contour in &lines.contours {
            assert_eq!(contour.times_ms, lines.line_a.times_ms);
        }
    }
}
