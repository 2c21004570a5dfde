pub mod coefficients;
pub mod config;
pub mod data_loading;
pub mod filters;
pub mod heart_analysis;
pub mod output;
pub mod pipeline;
pub mod windowing;

use serde::{Deserialize, Serialize};

/// Per-frame average pixel intensities delivered by the capture layer.
///
/// One sample is produced per camera frame, timestamped on the capture
/// clock (monotonic seconds). `is_covering_lens` is the capture layer's
/// judgement that a finger is pressed over the lens and flash.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelSample {
    pub timestamp: f64,
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    #[serde(rename = "isCoveringLens")]
    pub is_covering_lens: bool,
}

/// The color channel a heart-rate estimate was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelChannel {
    Red,
    Green,
    Blue,
}

impl PixelChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelChannel::Red => "red",
            PixelChannel::Green => "green",
            PixelChannel::Blue => "blue",
        }
    }
}

/// One heart-rate estimate produced from a single window of pixel samples.
///
/// A `bpm` of zero is the "no usable estimate" sentinel, not an error;
/// sentinel samples stay in the series but are excluded from summaries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BpmSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    pub bpm: f64,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<PixelChannel>,
}

impl BpmSample {
    /// Whether this sample carries an actual reading rather than the
    /// zero-bpm sentinel.
    pub fn is_reading(&self) -> bool {
        self.bpm != 0.0
    }
}
