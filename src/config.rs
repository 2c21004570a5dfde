use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;

/// Which periodicity-estimation algorithm to run on each window.
///
/// `Bandpass` is the FIR-bandpass + trimmed-mean + full-autocorrelation
/// path wired into live capture; `Butterworth` is the alternate
/// IIR-filtered path with aliasing-peak correction. Both are kept because
/// neither has been declared authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorStrategy {
    Bandpass,
    Butterworth,
}

impl FromStr for EstimatorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bandpass" => Ok(EstimatorStrategy::Bandpass),
            "butterworth" => Ok(EstimatorStrategy::Butterworth),
            _ => Err(format!(
                "Invalid strategy: {}. Use bandpass (default) or butterworth",
                s
            )),
        }
    }
}

/// Participant sex, used only by the VO2-max estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sex {
    Female,
    Male,
    Other,
}

impl FromStr for Sex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "female" => Ok(Sex::Female),
            "male" => Ok(Sex::Male),
            "other" => Ok(Sex::Other),
            _ => Err(format!("Invalid sex: {}. Use female, male or other", s)),
        }
    }
}

/// Engine configuration for one capture session.
///
/// `frame_rate` is the configured camera rate; the window length is derived
/// from it, not from a measured rate, so a camera that misses its
/// configured rate biases the computed BPM proportionally.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub frame_rate: u32,
    pub window_seconds: f64,
    pub window_overlap_seconds: f64,
    pub settle_seconds: f64,
    pub min_confidence: f64,
    pub min_heart_rate: f64,
    pub max_heart_rate: f64,
    pub strategy: EstimatorStrategy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            frame_rate: 60,
            window_seconds: 10.0,
            window_overlap_seconds: 1.0,
            settle_seconds: 3.0,
            min_confidence: 0.5,
            min_heart_rate: 45.0,
            max_heart_rate: 210.0,
            strategy: EstimatorStrategy::Bandpass,
        }
    }
}

impl SessionConfig {
    /// Number of samples in one estimation window.
    pub fn window_len(&self) -> usize {
        (self.window_seconds * self.frame_rate as f64).round() as usize
    }

    /// Number of samples dropped from the backlog after a low-confidence
    /// estimate.
    pub fn overlap_len(&self) -> usize {
        ((self.window_overlap_seconds * self.frame_rate as f64).round() as usize).max(1)
    }

    /// Number of leading samples discarded while the signal settles after
    /// the lens is first covered.
    pub fn settle_len(&self) -> usize {
        (self.settle_seconds * self.frame_rate as f64).round() as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_rate == 0 {
            bail!("frame rate must be positive");
        }
        if self.window_seconds <= 0.0 {
            bail!("window length must be positive");
        }
        if self.min_heart_rate <= 0.0 || self.min_heart_rate >= self.max_heart_rate {
            bail!(
                "heart rate bounds are inverted: {} >= {}",
                self.min_heart_rate,
                self.max_heart_rate
            );
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            bail!("minimum confidence must be within 0.0..=1.0");
        }
        if self.window_overlap_seconds < 0.0 || self.settle_seconds < 0.0 {
            bail!("overlap and settle durations must not be negative");
        }
        Ok(())
    }
}

/// Estimate heart rate from a recorded camera pixel stream
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the recorded RGB sample CSV
    #[arg(help = "Path to the recorded RGB sample CSV")]
    pub input_path: PathBuf,

    /// Configured camera frame rate in frames per second
    #[arg(long, default_value = "60")]
    pub frame_rate: u32,

    /// Estimation window size in seconds
    #[arg(long, default_value = "10.0")]
    pub window_seconds: f64,

    /// Backlog advance after a low-confidence window, in seconds
    #[arg(long, default_value = "1.0")]
    pub window_overlap_seconds: f64,

    /// Seconds to let the signal settle once the lens is covered
    #[arg(long, default_value = "3.0")]
    pub settle_seconds: f64,

    /// Minimum confidence for a sample to count toward summaries
    #[arg(long, default_value = "0.5")]
    pub min_confidence: f64,

    /// Minimum reportable heart rate in BPM
    #[arg(long, default_value = "45.0")]
    pub min_heart_rate: f64,

    /// Maximum reportable heart rate in BPM
    #[arg(long, default_value = "210.0")]
    pub max_heart_rate: f64,

    /// Estimation strategy (bandpass [default] or butterworth)
    #[arg(long, default_value = "bandpass")]
    pub strategy: EstimatorStrategy,

    /// CSV output file for the BPM series
    #[arg(long)]
    pub csv_output: Option<String>,

    /// JSON session report output path
    #[arg(long)]
    pub json_output: Option<String>,

    /// Participant age, enables the VO2-max estimate together with --sex
    #[arg(long)]
    pub age: Option<f64>,

    /// Participant sex (female, male or other) for the VO2-max estimate
    #[arg(long)]
    pub sex: Option<Sex>,
}

impl Args {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            frame_rate: self.frame_rate,
            window_seconds: self.window_seconds,
            window_overlap_seconds: self.window_overlap_seconds,
            settle_seconds: self.settle_seconds,
            min_confidence: self.min_confidence,
            min_heart_rate: self.min_heart_rate,
            max_heart_rate: self.max_heart_rate,
            strategy: self.strategy,
        }
    }
}
