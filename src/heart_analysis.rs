//! Heart-rate estimation from windows of per-frame pixel intensities.
//!
//! Two estimation strategies share one interface. The bandpass path
//! (FIR bandpass, trimmed-mean sharpening, full autocorrelation of the
//! window with itself) is the one driven by live capture. The Butterworth
//! path (table-driven IIR low/high-pass, biased autocorrelation, aliasing
//! peak correction) is the alternate algorithm, kept selectable because
//! neither has been declared authoritative.

use anyhow::{bail, Result};
use log::debug;

use crate::coefficients::{FilterParameters, FilterTable, FilterType};
use crate::config::{EstimatorStrategy, SessionConfig};
use crate::filters::{
    fir_convolve_full, fir_convolve_same, iir_filter, trimmed_mean_filter, trimmed_mean_order,
    BANDPASS_FIR_KERNEL,
};
use crate::{BpmSample, PixelChannel, PixelSample};

/// The `(bpm, confidence)` pair produced for one channel of one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BpmEstimate {
    pub bpm: f64,
    pub confidence: f64,
}

impl BpmEstimate {
    /// The "no usable estimate" sentinel.
    pub const NONE: BpmEstimate = BpmEstimate {
        bpm: 0.0,
        confidence: 0.0,
    };

    pub fn is_reading(&self) -> bool {
        self.bpm != 0.0
    }
}

/// Biased sample autocorrelation up to `lag_max`, normalized by the
/// unscaled variance so that `r[0]` is 1.
///
/// Returns `None` when the input has zero variance (or is shorter than the
/// requested maximum lag); callers treat that as a degenerate window.
pub fn autocorrelation(x: &[f64], lag_max: usize) -> Option<Vec<f64>> {
    let n = x.len();
    if n == 0 || lag_max >= n {
        return None;
    }
    let mean = x.iter().sum::<f64>() / n as f64;
    let variance: f64 = x.iter().map(|&v| (v - mean) * (v - mean)).sum();
    if variance == 0.0 {
        return None;
    }
    let mut out = Vec::with_capacity(lag_max + 1);
    for k in 0..=lag_max {
        let mut sum = 0.0;
        for t in 0..(n - k) {
            sum += (x[t] - mean) * (x[t + k] - mean);
        }
        out.push(sum / variance);
    }
    Some(out)
}

/// Maximum value and the index of its first occurrence.
fn seek_max(x: &[f64]) -> (f64, usize) {
    let mut best = f64::NEG_INFINITY;
    let mut pos = 0;
    for (i, &v) in x.iter().enumerate() {
        if v > best {
            best = v;
            pos = i;
        }
    }
    (best, pos)
}

/// Estimates heart rate and confidence from a single channel's window.
///
/// Pure: a fixed input window and configuration produce bit-identical
/// results on every call. Degenerate inputs (zero variance, too few
/// samples, an empty lag range) produce the `(0, 0)` sentinel, never an
/// error or a NaN.
#[derive(Debug, Clone)]
pub struct HeartRateEstimator {
    frame_rate: f64,
    min_heart_rate: f64,
    max_heart_rate: f64,
    window_seconds: f64,
    strategy: EstimatorStrategy,
    pass_filters: Option<(FilterParameters, FilterParameters)>,
}

impl HeartRateEstimator {
    /// Build an estimator for the configured strategy. The Butterworth
    /// strategy requires an exact coefficient-table match for the
    /// configured frame rate and fails here when there is none.
    pub fn new(config: &SessionConfig, table: Option<&FilterTable>) -> Result<Self> {
        let pass_filters = match config.strategy {
            EstimatorStrategy::Bandpass => None,
            EstimatorStrategy::Butterworth => {
                let table = match table {
                    Some(table) => table,
                    None => bail!("the butterworth strategy requires a filter coefficient table"),
                };
                match (
                    table.lookup(FilterType::Low, config.frame_rate),
                    table.lookup(FilterType::High, config.frame_rate),
                ) {
                    (Some(low), Some(high)) => Some((*low, *high)),
                    _ => bail!(
                        "no filter coefficients for {} fps; the table requires an exact match",
                        config.frame_rate
                    ),
                }
            }
        };
        Ok(HeartRateEstimator {
            frame_rate: config.frame_rate as f64,
            min_heart_rate: config.min_heart_rate,
            max_heart_rate: config.max_heart_rate,
            window_seconds: config.window_seconds,
            strategy: config.strategy,
            pass_filters,
        })
    }

    pub fn strategy(&self) -> EstimatorStrategy {
        self.strategy
    }

    /// Samples needed to trigger one estimate. The Butterworth stages shed
    /// roughly two seconds plus one rank-order window of leading samples,
    /// so that path needs a longer backlog per window.
    pub fn window_len(&self) -> usize {
        match self.strategy {
            EstimatorStrategy::Bandpass => {
                (self.window_seconds * self.frame_rate).round() as usize
            }
            EstimatorStrategy::Butterworth => {
                ((self.window_seconds + 2.0) * self.frame_rate).round() as usize
                    + trimmed_mean_order(self.frame_rate as u32)
            }
        }
    }

    /// Lag search bounds derived from the configured heart-rate band.
    /// Rounding alone can leave a boundary lag mapping to a rate just
    /// outside the band, so those lags are nudged back inside it.
    fn lag_bounds(&self) -> (usize, usize) {
        let fs = self.frame_rate;
        let mut lower = (60.0 * fs / self.max_heart_rate).round() as usize;
        let mut upper = (60.0 * fs / self.min_heart_rate).round() as usize;
        if lower >= 1 && 60.0 * fs / lower as f64 > self.max_heart_rate {
            lower += 1;
        }
        if upper >= 1 && 60.0 * fs / (upper as f64) < self.min_heart_rate {
            upper -= 1;
        }
        (lower, upper)
    }

    /// Estimate from one channel's series for a single window.
    pub fn estimate(&self, series: &[f64]) -> BpmEstimate {
        match self.strategy {
            EstimatorStrategy::Bandpass => self.estimate_bandpass(series),
            EstimatorStrategy::Butterworth => self.estimate_butterworth(series),
        }
    }

    fn estimate_bandpass(&self, series: &[f64]) -> BpmEstimate {
        let fs = self.frame_rate;
        if series.is_empty() {
            return BpmEstimate::NONE;
        }
        // Tuned for a 220 BPM ceiling.
        let nsamples = (60.0 * fs / 220.0).round() as usize;
        let order = 2 * nsamples + 1;

        let mean = series.iter().sum::<f64>() / series.len() as f64;
        let centered: Vec<f64> = series.iter().map(|&v| v - mean).collect();
        let bandpassed = fir_convolve_same(&centered, &BANDPASS_FIR_KERNEL);
        let smoothed = trimmed_mean_filter(&bandpassed, order);

        // 64 samples at each end carry FIR edge artifacts; what is left has
        // to hold at least one full rank-order window.
        if smoothed.len() < 128 + 2 * nsamples + 2 {
            return BpmEstimate::NONE;
        }
        let pulse = &smoothed[64..smoothed.len() - 64];

        let reversed: Vec<f64> = pulse.iter().rev().copied().collect();
        let xcorr = fir_convolve_full(pulse, &reversed);
        let (max_val, max_pos) = seek_max(&xcorr);
        if !(max_val > 0.0) || !max_val.is_finite() {
            return BpmEstimate::NONE;
        }
        // The autocorrelation is even-symmetric; drop everything up to the
        // global peak and search the remainder.
        let spliced = &xcorr[max_pos..];
        let (lower, upper) = self.lag_bounds();
        if lower < 1 || lower >= upper || upper > spliced.len() {
            return BpmEstimate::NONE;
        }
        let (val, pos) = seek_max(&spliced[lower - 1..upper]);
        let pos = pos + lower - 1;
        let bpm = (60.0 * fs / (pos + 1) as f64).round();
        BpmEstimate {
            bpm,
            confidence: val / max_val,
        }
    }

    fn estimate_butterworth(&self, series: &[f64]) -> BpmEstimate {
        let first = match series.first() {
            Some(&first) => first,
            None => return BpmEstimate::NONE,
        };
        // A spreadless window is lens noise; the filter startup transient
        // would otherwise survive the range normalization.
        if series.iter().all(|&v| v == first) {
            return BpmEstimate::NONE;
        }
        let filtered = match self.filtered_signal(series, 0.0) {
            Some(filtered) => filtered,
            None => return BpmEstimate::NONE,
        };
        let window = (self.window_seconds * self.frame_rate).ceil() as usize;
        if filtered.len() < window {
            return BpmEstimate::NONE;
        }
        self.heart_rate_from_filtered(&filtered[filtered.len() - window..])
    }

    /// The Butterworth preprocessing chain: sanitize non-finite values,
    /// optionally drop `drop_seconds` of leading settle samples, low-pass,
    /// high-pass (each shedding its startup transient of one second minus
    /// one sample), then the trimmed-mean stage.
    ///
    /// `None` means the input was too short for the chain, or the
    /// estimator was not built with pass filters.
    pub fn filtered_signal(&self, series: &[f64], drop_seconds: f64) -> Option<Vec<f64>> {
        let (low, high) = self.pass_filters.as_ref()?;
        let settle = (drop_seconds * self.frame_rate).round() as usize;
        let drop = settle.saturating_sub(1);
        if series.len() <= drop {
            return None;
        }
        let x: Vec<f64> = series[drop..]
            .iter()
            .map(|&v| if v.is_finite() { v } else { 0.0 })
            .collect();

        let transient = (self.frame_rate as usize).saturating_sub(1);
        let lowpassed = iir_filter(&x, &low.b, &low.a);
        if lowpassed.len() <= transient {
            return None;
        }
        let highpassed = iir_filter(&lowpassed[transient..], &high.b, &high.a);
        if highpassed.len() <= transient {
            return None;
        }
        let smoothed = trimmed_mean_filter(
            &highpassed[transient..],
            trimmed_mean_order(self.frame_rate as u32),
        );
        if smoothed.is_empty() {
            None
        } else {
            Some(smoothed)
        }
    }

    /// Period detection on the filtered trace: biased autocorrelation over
    /// the valid lag range, then aliasing-peak correction. A detected lag
    /// can be double the true pulse period; when the sub-multiple lag also
    /// carries a strong peak the rate is re-estimated from it.
    fn heart_rate_from_filtered(&self, chunk: &[f64]) -> BpmEstimate {
        let fs = self.frame_rate;
        let (lower, upper) = self.lag_bounds();
        if lower < 1 || lower >= upper || upper >= chunk.len() {
            return BpmEstimate::NONE;
        }
        let acf = match autocorrelation(chunk, upper) {
            Some(acf) => acf,
            None => return BpmEstimate::NONE,
        };

        let (y_max, rel_pos) = seek_max(&acf[lower..=upper]);
        let peak_lag = lower + rel_pos;
        let y_min = acf[lower..=upper]
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let hr_guess = 60.0 * fs / peak_lag as f64;

        // Expected peak count in the search range for an ideal signal at
        // the guessed rate.
        let n_peaks = if hr_guess < 90.0 {
            1
        } else if hr_guess < 135.0 {
            2
        } else if hr_guess < 180.0 {
            3
        } else if hr_guess < 225.0 {
            4
        } else if hr_guess <= 240.0 {
            5
        } else {
            return BpmEstimate::NONE;
        };

        let mut earlier: Vec<usize> = if peak_lag % 2 == 0 {
            vec![peak_lag / 2]
        } else {
            vec![peak_lag / 2, peak_lag / 2 + 1]
        };
        earlier.retain(|&lag| lag >= lower);
        let later: Vec<usize> = if n_peaks > 1 {
            (2..=n_peaks)
                .map(|multiple| multiple * peak_lag)
                .filter(|&lag| lag <= upper)
                .collect()
        } else {
            Vec::new()
        };

        let (acf_max, _) = seek_max(&acf);
        let acf_min = acf.iter().copied().fold(f64::INFINITY, f64::min);

        if !earlier.is_empty() {
            let passing: Vec<usize> = earlier
                .iter()
                .copied()
                .filter(|&lag| acf[lag] - y_min > 0.7 * (y_max - y_min))
                .collect();
            if !passing.is_empty() {
                let bpm = passing
                    .iter()
                    .map(|&lag| 60.0 * fs / lag as f64)
                    .sum::<f64>()
                    / passing.len() as f64;
                let confidence = passing.iter().map(|&lag| acf[lag] - y_min).sum::<f64>()
                    / passing.len() as f64
                    / (acf_max - acf_min);
                BpmEstimate { bpm, confidence }
            } else {
                BpmEstimate {
                    bpm: hr_guess,
                    confidence: y_max / acf_max,
                }
            }
        } else if !later.is_empty() && later.iter().all(|&lag| acf[lag] > 0.7 * y_max) {
            BpmEstimate {
                bpm: hr_guess,
                confidence: y_max / acf_max,
            }
        } else {
            BpmEstimate::NONE
        }
    }
}

/// Run the estimator on the red and green channels of one window and keep
/// the higher-confidence result; equal confidences keep red. The emitted
/// sample is timestamped at the window's midpoint.
pub fn arbitrate(window: &[PixelSample], estimator: &HeartRateEstimator) -> BpmSample {
    let red_series: Vec<f64> = window.iter().map(|s| s.red).collect();
    let green_series: Vec<f64> = window.iter().map(|s| s.green).collect();
    let red = estimator.estimate(&red_series);
    let green = estimator.estimate(&green_series);
    let (winner, channel) = if red.confidence >= green.confidence {
        (red, PixelChannel::Red)
    } else {
        (green, PixelChannel::Green)
    };
    let timestamp = window.get(window.len() / 2).map(|s| s.timestamp);
    debug!(
        "{} bpm={} confidence={:.3}",
        channel.as_str(),
        winner.bpm,
        winner.confidence
    );
    BpmSample {
        timestamp,
        bpm: winner.bpm,
        confidence: winner.confidence,
        channel: Some(channel),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn sinusoid(bpm: f64, frame_rate: f64, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| 0.5 + 0.1 * (2.0 * PI * bpm * (i as f64 / frame_rate) / 60.0).sin())
            .collect()
    }

    fn noise(len: usize, seed: u64) -> Vec<f64> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                0.5 + 0.2 * ((state >> 11) as f64 / (1u64 << 53) as f64 - 0.5)
            })
            .collect()
    }

    fn bandpass_estimator() -> HeartRateEstimator {
        HeartRateEstimator::new(&SessionConfig::default(), None).unwrap()
    }

    fn butterworth_estimator() -> HeartRateEstimator {
        let config = SessionConfig {
            strategy: EstimatorStrategy::Butterworth,
            ..Default::default()
        };
        let table = FilterTable::load().unwrap();
        HeartRateEstimator::new(&config, Some(&table)).unwrap()
    }

    #[test]
    fn autocorrelation_known_values() {
        let acf = autocorrelation(&[1.0, 2.0, 3.0, 4.0], 1).unwrap();
        assert_eq!(acf[0], 1.0);
        assert_eq!(acf[1], 0.25);
    }

    #[test]
    fn autocorrelation_rejects_zero_variance() {
        assert!(autocorrelation(&[0.7; 32], 4).is_none());
        assert!(autocorrelation(&[], 4).is_none());
    }

    #[test]
    fn bandpass_finds_known_rate() {
        let estimator = bandpass_estimator();
        let estimate = estimator.estimate(&sinusoid(72.0, 60.0, 600));
        assert_eq!(estimate.bpm, 71.0);
        assert!(estimate.confidence > 0.8, "{}", estimate.confidence);
        assert!((0.0..=1.0).contains(&estimate.confidence));
    }

    #[test]
    fn bandpass_is_deterministic() {
        let estimator = bandpass_estimator();
        let window = sinusoid(65.0, 60.0, 600);
        let first = estimator.estimate(&window);
        let second = estimator.estimate(&window);
        assert_eq!(first.bpm.to_bits(), second.bpm.to_bits());
        assert_eq!(first.confidence.to_bits(), second.confidence.to_bits());
    }

    #[test]
    fn degenerate_windows_yield_sentinel() {
        for estimator in [bandpass_estimator(), butterworth_estimator()] {
            for window in [vec![0.0; 785], vec![0.61; 785], Vec::new()] {
                let estimate = estimator.estimate(&window);
                assert_eq!(estimate, BpmEstimate::NONE);
                assert!(!estimate.bpm.is_nan());
            }
        }
    }

    #[test]
    fn short_window_yields_sentinel() {
        let estimator = bandpass_estimator();
        assert_eq!(estimator.estimate(&sinusoid(72.0, 60.0, 100)), BpmEstimate::NONE);
    }

    #[test]
    fn readings_stay_inside_configured_band() {
        let estimator = bandpass_estimator();
        for bpm in [50.0, 60.0, 72.0, 90.0, 110.0, 130.0, 150.0, 170.0] {
            let estimate = estimator.estimate(&sinusoid(bpm, 60.0, 600));
            if estimate.is_reading() {
                assert!(
                    (45.0..=210.0).contains(&estimate.bpm),
                    "{} -> {}",
                    bpm,
                    estimate.bpm
                );
            }
        }
        // Noise windows must stay in range too, or report the sentinel.
        for seed in 1..=8u64 {
            let estimate = estimator.estimate(&noise(600, seed.wrapping_mul(0x9E3779B97F4A7C15)));
            assert!(
                !estimate.is_reading() || (45.0..=210.0).contains(&estimate.bpm),
                "seed {} -> {}",
                seed,
                estimate.bpm
            );
        }
    }

    #[test]
    fn butterworth_finds_known_rate() {
        let estimator = butterworth_estimator();
        let window = sinusoid(72.0, 60.0, estimator.window_len());
        let estimate = estimator.estimate(&window);
        assert!((71.0..=73.0).contains(&estimate.bpm), "{}", estimate.bpm);
        assert!(estimate.confidence > 0.5, "{}", estimate.confidence);
    }

    #[test]
    fn butterworth_corrects_aliased_peak() {
        let estimator = butterworth_estimator();
        let window = sinusoid(120.0, 60.0, estimator.window_len());
        let estimate = estimator.estimate(&window);
        assert!((119.0..=121.0).contains(&estimate.bpm), "{}", estimate.bpm);
    }

    #[test]
    fn butterworth_needs_full_filter_backlog() {
        let estimator = butterworth_estimator();
        assert_eq!(
            estimator.estimate(&sinusoid(72.0, 60.0, 600)),
            BpmEstimate::NONE
        );
    }

    #[test]
    fn butterworth_window_len_covers_filter_transients() {
        assert_eq!(butterworth_estimator().window_len(), 785);
        assert_eq!(bandpass_estimator().window_len(), 600);
    }

    #[test]
    fn filtered_signal_drops_settle_and_transients() {
        let estimator = butterworth_estimator();
        let series = sinusoid(72.0, 60.0, 840);
        // 3s settle sheds 179 samples, each pass filter sheds 59, and the
        // rank-order stage sheds 64: 840 - 179 - 59 - 59 - 64.
        let filtered = estimator.filtered_signal(&series, 3.0).unwrap();
        assert_eq!(filtered.len(), 479);
        let unsettled = estimator.filtered_signal(&series, 0.0).unwrap();
        assert_eq!(unsettled.len(), 840 - 59 - 59 - 64);
        // far too short for the filter chain
        assert!(estimator.filtered_signal(&series[..100], 3.0).is_none());
    }

    #[test]
    fn bandpass_estimator_has_no_filtered_signal() {
        let estimator = bandpass_estimator();
        assert!(estimator
            .filtered_signal(&sinusoid(72.0, 60.0, 840), 0.0)
            .is_none());
    }

    #[test]
    fn butterworth_requires_table_match() {
        let config = SessionConfig {
            frame_rate: 100,
            strategy: EstimatorStrategy::Butterworth,
            ..Default::default()
        };
        let table = FilterTable::load().unwrap();
        assert!(HeartRateEstimator::new(&config, Some(&table)).is_err());
        assert!(HeartRateEstimator::new(&config, None).is_err());
    }

    #[test]
    fn arbiter_prefers_red_on_ties() {
        let estimator = bandpass_estimator();
        let series = sinusoid(72.0, 60.0, 600);
        let window: Vec<PixelSample> = series
            .iter()
            .enumerate()
            .map(|(i, &v)| PixelSample {
                timestamp: i as f64 / 60.0,
                red: v,
                green: v,
                blue: 0.0,
                is_covering_lens: true,
            })
            .collect();
        let sample = arbitrate(&window, &estimator);
        assert_eq!(sample.channel, Some(PixelChannel::Red));
    }

    #[test]
    fn arbiter_selects_stronger_channel() {
        let estimator = bandpass_estimator();
        let green = sinusoid(72.0, 60.0, 600);
        let red = noise(600, 0x2545F4914F6CDD1D);
        let window: Vec<PixelSample> = (0..600)
            .map(|i| PixelSample {
                timestamp: i as f64 / 60.0,
                red: red[i],
                green: green[i],
                blue: 0.0,
                is_covering_lens: true,
            })
            .collect();
        let sample = arbitrate(&window, &estimator);
        assert_eq!(sample.channel, Some(PixelChannel::Green));
        assert!((70.0..=74.0).contains(&sample.bpm), "{}", sample.bpm);
        assert_eq!(sample.timestamp, Some(window[300].timestamp));
    }
}
