//! Real-time capture ingestion: the wiring between the camera's delivery
//! thread, the backlog owner and the estimation worker.
//!
//! Three execution contexts, connected by channels:
//!
//! - the capture context calls [`CapturePipeline::push_sample`], which only
//!   enqueues and never blocks on DSP work;
//! - a buffer thread exclusively owns the [`WindowBuffer`] backlog, so
//!   appends and trims are never concurrent;
//! - a compute thread runs the estimator on full windows, strictly FIFO,
//!   and publishes each estimate's confidence for the *next* trim decision.
//!
//! The intake channel is bounded; when compute falls persistently behind,
//! excess capture samples are dropped (and counted) instead of growing the
//! backlog without limit.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use crossbeam_channel::{bounded, Sender, TrySendError};
use log::warn;

use crate::coefficients::FilterTable;
use crate::config::{EstimatorStrategy, SessionConfig, Sex};
use crate::heart_analysis::{arbitrate, HeartRateEstimator};
use crate::windowing::WindowBuffer;
use crate::{BpmSample, PixelSample};

/// High-confidence samples this long after session start qualify as
/// VO2-max window markers.
pub const VO2_MARKER_DELAY_SECONDS: f64 = 30.0;

struct SharedState {
    samples: Mutex<Vec<BpmSample>>,
    /// Confidence of the most recent estimate, stored as f64 bits. Read by
    /// the buffer thread for its trim decision; initially 0 (below any
    /// threshold).
    confidence_bits: AtomicU64,
    /// Timestamp of the first delivered sample, as f64 bits (NaN until
    /// one arrives).
    start_bits: AtomicU64,
    /// Cleared on teardown so an in-flight estimate is discarded rather
    /// than appended to a dead session.
    accepting: AtomicBool,
    dropped: AtomicUsize,
}

/// One capture session's ingestion pipeline. Created per session, fed from
/// the capture callback, torn down with [`finish`](CapturePipeline::finish)
/// (keep results) or [`abort`](CapturePipeline::abort) (discard).
pub struct CapturePipeline {
    sample_tx: Option<Sender<PixelSample>>,
    buffer_handle: Option<JoinHandle<()>>,
    compute_handle: Option<JoinHandle<()>>,
    shared: Arc<SharedState>,
    config: SessionConfig,
}

impl CapturePipeline {
    pub fn new(config: SessionConfig, table: Option<Arc<FilterTable>>) -> Result<Self> {
        Self::start(config, table, None)
    }

    /// Like [`new`](Self::new), with a channel that receives every estimate
    /// as it is produced (for a live display).
    pub fn with_observer(
        config: SessionConfig,
        table: Option<Arc<FilterTable>>,
        observer: Sender<BpmSample>,
    ) -> Result<Self> {
        Self::start(config, table, Some(observer))
    }

    fn start(
        config: SessionConfig,
        table: Option<Arc<FilterTable>>,
        observer: Option<Sender<BpmSample>>,
    ) -> Result<Self> {
        config.validate()?;
        let estimator = match HeartRateEstimator::new(&config, table.as_deref()) {
            Ok(estimator) => estimator,
            Err(err) if config.strategy == EstimatorStrategy::Butterworth => {
                // The bandpass path has no coefficient-table dependency, so
                // a missing table row degrades accuracy instead of aborting
                // the session.
                warn!("butterworth estimator unavailable ({err}); falling back to bandpass");
                let fallback = SessionConfig {
                    strategy: EstimatorStrategy::Bandpass,
                    ..config
                };
                HeartRateEstimator::new(&fallback, None)?
            }
            Err(err) => return Err(err),
        };

        let window_len = estimator.window_len();
        let shared = Arc::new(SharedState {
            samples: Mutex::new(Vec::new()),
            confidence_bits: AtomicU64::new(0.0f64.to_bits()),
            start_bits: AtomicU64::new(f64::NAN.to_bits()),
            accepting: AtomicBool::new(true),
            dropped: AtomicUsize::new(0),
        });

        // The window queue is small and the buffer thread blocks on it, so
        // a persistently slow compute stage backpressures into the intake
        // bound instead of growing an unbounded backlog of windows.
        let (sample_tx, sample_rx) = bounded::<PixelSample>(window_len * 4);
        let (window_tx, window_rx) = bounded::<Vec<PixelSample>>(4);

        let mut buffer = WindowBuffer::new(
            window_len,
            config.overlap_len(),
            config.settle_len(),
            config.min_confidence,
        );
        let buffer_shared = Arc::clone(&shared);
        let buffer_handle = thread::Builder::new()
            .name("hr-buffer".into())
            .spawn(move || {
                for sample in sample_rx {
                    if f64::from_bits(buffer_shared.start_bits.load(Ordering::Relaxed)).is_nan() {
                        buffer_shared
                            .start_bits
                            .store(sample.timestamp.to_bits(), Ordering::Relaxed);
                    }
                    let last_confidence =
                        f64::from_bits(buffer_shared.confidence_bits.load(Ordering::Acquire));
                    if let Some(window) = buffer.push(sample, last_confidence) {
                        if window_tx.send(window).is_err() {
                            break;
                        }
                    }
                }
            })?;

        let compute_shared = Arc::clone(&shared);
        let compute_handle = thread::Builder::new()
            .name("hr-compute".into())
            .spawn(move || {
                for window in window_rx {
                    let sample = arbitrate(&window, &estimator);
                    if !compute_shared.accepting.load(Ordering::Acquire) {
                        continue;
                    }
                    compute_shared
                        .confidence_bits
                        .store(sample.confidence.to_bits(), Ordering::Release);
                    compute_shared.samples.lock().unwrap().push(sample);
                    if let Some(tx) = &observer {
                        let _ = tx.try_send(sample);
                    }
                }
            })?;

        Ok(CapturePipeline {
            sample_tx: Some(sample_tx),
            buffer_handle: Some(buffer_handle),
            compute_handle: Some(compute_handle),
            shared,
            config,
        })
    }

    /// Enqueue one capture sample without blocking. When the intake bound
    /// is reached the sample is dropped and counted.
    pub fn push_sample(&self, sample: PixelSample) {
        if let Some(tx) = &self.sample_tx {
            match tx.try_send(sample) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped == 1 || dropped % 1000 == 0 {
                        warn!("capture intake full; {} samples dropped so far", dropped);
                    }
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    /// Enqueue one sample, waiting for intake space. For offline replay of
    /// a recording, where dropping samples would corrupt the result; live
    /// capture must use [`push_sample`](Self::push_sample) instead.
    pub fn push_sample_blocking(&self, sample: PixelSample) {
        if let Some(tx) = &self.sample_tx {
            let _ = tx.send(sample);
        }
    }

    /// Estimates produced so far (the session may still be running).
    pub fn samples_snapshot(&self) -> Vec<BpmSample> {
        self.shared.samples.lock().unwrap().clone()
    }

    /// Stop accepting samples, let in-flight work drain, and return the
    /// session's results.
    pub fn finish(mut self) -> SessionResult {
        self.join_workers();
        let samples = self.shared.samples.lock().unwrap().clone();
        let dropped_samples = self.shared.dropped.load(Ordering::Relaxed);
        if dropped_samples > 0 {
            warn!(
                "{} capture samples were dropped by the intake bound",
                dropped_samples
            );
        }
        let start = f64::from_bits(self.shared.start_bits.load(Ordering::Relaxed));
        SessionResult {
            samples,
            dropped_samples,
            start_timestamp: if start.is_nan() { None } else { Some(start) },
            config: self.config,
        }
    }

    /// Tear the session down and discard its results, including any
    /// estimate still in flight.
    pub fn abort(mut self) {
        self.shared.accepting.store(false, Ordering::Release);
        self.join_workers();
    }

    fn join_workers(&mut self) {
        drop(self.sample_tx.take());
        if let Some(handle) = self.buffer_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.compute_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if self.sample_tx.is_some() {
            self.shared.accepting.store(false, Ordering::Release);
            self.join_workers();
        }
    }
}

/// The collected output of a finished session.
#[derive(Debug, Clone)]
pub struct SessionResult {
    /// Every estimate, in trigger order, sentinels included.
    pub samples: Vec<BpmSample>,
    /// Capture samples rejected by the intake bound.
    pub dropped_samples: usize,
    /// Timestamp of the first delivered capture sample.
    pub start_timestamp: Option<f64>,
    config: SessionConfig,
}

impl SessionResult {
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn resting_heart_rate(&self) -> Option<BpmSample> {
        resting_heart_rate(&self.samples, self.config.min_confidence)
    }

    pub fn peak_heart_rate(&self) -> Option<BpmSample> {
        peak_heart_rate(&self.samples, self.config.min_confidence)
    }

    pub fn end_heart_rate(&self) -> Option<BpmSample> {
        end_heart_rate(&self.samples, self.config.min_confidence)
    }

    pub fn vo2_window(&self) -> Option<(BpmSample, BpmSample)> {
        vo2_window(
            &self.samples,
            self.config.min_confidence,
            self.start_timestamp?,
        )
    }

    pub fn vo2_max(&self, sex: Sex, age: f64) -> Option<f64> {
        vo2_max(
            &self.samples,
            self.config.min_confidence,
            self.start_timestamp?,
            sex,
            age,
        )
    }
}

fn qualifying(samples: &[BpmSample], min_confidence: f64) -> impl Iterator<Item = &BpmSample> {
    samples
        .iter()
        .filter(move |s| s.is_reading() && s.confidence >= min_confidence)
}

/// Mean bpm and mean confidence over the high-confidence samples, falling
/// back to every non-sentinel sample when none qualify.
pub fn resting_heart_rate(samples: &[BpmSample], min_confidence: f64) -> Option<BpmSample> {
    let high: Vec<&BpmSample> = qualifying(samples, min_confidence).collect();
    let pool: Vec<&BpmSample> = if high.is_empty() {
        samples.iter().filter(|s| s.is_reading()).collect()
    } else {
        high
    };
    if pool.is_empty() {
        return None;
    }
    let n = pool.len() as f64;
    Some(BpmSample {
        timestamp: None,
        bpm: pool.iter().map(|s| s.bpm).sum::<f64>() / n,
        confidence: pool.iter().map(|s| s.confidence).sum::<f64>() / n,
        channel: None,
    })
}

/// First high-confidence sample of the session.
pub fn peak_heart_rate(samples: &[BpmSample], min_confidence: f64) -> Option<BpmSample> {
    qualifying(samples, min_confidence).next().copied()
}

/// Last high-confidence sample of the session.
pub fn end_heart_rate(samples: &[BpmSample], min_confidence: f64) -> Option<BpmSample> {
    qualifying(samples, min_confidence).last().copied()
}

/// First and last high-confidence samples at least 30 seconds after the
/// session start; `None` unless two distinct qualifying samples exist.
pub fn vo2_window(
    samples: &[BpmSample],
    min_confidence: f64,
    start_timestamp: f64,
) -> Option<(BpmSample, BpmSample)> {
    let cutoff = start_timestamp + VO2_MARKER_DELAY_SECONDS;
    let marked: Vec<&BpmSample> = qualifying(samples, min_confidence)
        .filter(|s| s.timestamp.map_or(false, |t| t >= cutoff))
        .collect();
    if marked.len() < 2 {
        return None;
    }
    Some((**marked.first().unwrap(), **marked.last().unwrap()))
}

/// Age- and sex-adjusted VO2-max estimate from the mean qualifying heart
/// rate over the marker window.
pub fn vo2_max(
    samples: &[BpmSample],
    min_confidence: f64,
    start_timestamp: f64,
    sex: Sex,
    age: f64,
) -> Option<f64> {
    let cutoff = start_timestamp + VO2_MARKER_DELAY_SECONDS;
    let marked: Vec<&BpmSample> = qualifying(samples, min_confidence)
        .filter(|s| s.timestamp.map_or(false, |t| t >= cutoff))
        .collect();
    if marked.len() < 2 {
        return None;
    }
    let mean_hr = marked.iter().map(|s| s.bpm).sum::<f64>() / marked.len() as f64;
    let beats_30_to_60 = mean_hr / 2.0;
    Some(match sex {
        Sex::Female => 83.477 - (0.586 * beats_30_to_60) - (0.404 * age) - 7.030,
        Sex::Male => 83.477 - (0.586 * beats_30_to_60) - (0.404 * age),
        Sex::Other => 84.687 - (0.722 * beats_30_to_60) - (0.383 * age),
    })
}
