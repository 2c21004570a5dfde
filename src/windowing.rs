//! The confidence-gated sliding window over the incoming sample stream.
//!
//! Samples accumulate in a backlog until a full window is available; the
//! window is handed to the estimator and the backlog is trimmed. How much
//! is trimmed depends on how confident the previous estimate was: a good
//! estimate slides by half a window, a poor one advances only one overlap
//! step so the next window shares most of its samples with the failed one.

use crate::PixelSample;

#[derive(Debug)]
pub struct WindowBuffer {
    backlog: Vec<PixelSample>,
    window_len: usize,
    overlap_advance: usize,
    settle_len: usize,
    min_confidence: f64,
    started: bool,
    settle_remaining: usize,
}

impl WindowBuffer {
    /// `window_len` samples trigger an estimate; `overlap_advance` is the
    /// backlog advance after a low-confidence estimate; `settle_len`
    /// leading samples are discarded once the lens is first covered.
    pub fn new(
        window_len: usize,
        overlap_advance: usize,
        settle_len: usize,
        min_confidence: f64,
    ) -> Self {
        WindowBuffer {
            backlog: Vec::with_capacity(window_len + overlap_advance),
            window_len,
            overlap_advance: overlap_advance.max(1),
            settle_len,
            min_confidence,
            started: false,
            settle_remaining: settle_len,
        }
    }

    /// Append one sample. Returns a full window when the backlog reaches
    /// the window length, after applying the retention policy based on the
    /// confidence of the *previous* estimate.
    ///
    /// Nothing accumulates until the first lens-covered sample arrives;
    /// after that the stream is taken as-is (a finger slipping off mid-run
    /// shows up as signal degradation, not as a reset).
    pub fn push(&mut self, sample: PixelSample, last_confidence: f64) -> Option<Vec<PixelSample>> {
        if !self.started {
            if !sample.is_covering_lens {
                return None;
            }
            self.started = true;
        }
        if self.settle_remaining > 0 {
            self.settle_remaining -= 1;
            return None;
        }
        self.backlog.push(sample);
        if self.backlog.len() < self.window_len {
            return None;
        }

        let window = self.backlog[self.backlog.len() - self.window_len..].to_vec();
        let advance = if last_confidence >= self.min_confidence {
            self.window_len / 2
        } else {
            self.overlap_advance
        };
        self.backlog.drain(..advance.min(self.backlog.len()));
        Some(window)
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Whether the lens has been covered at least once.
    pub fn started(&self) -> bool {
        self.started
    }

    pub fn reset(&mut self) {
        self.backlog.clear();
        self.started = false;
        self.settle_remaining = self.settle_len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(i: usize, covering: bool) -> PixelSample {
        PixelSample {
            timestamp: i as f64 / 60.0,
            red: 0.5,
            green: 0.5,
            blue: 0.5,
            is_covering_lens: covering,
        }
    }

    #[test]
    fn high_confidence_slides_half_a_window() {
        let mut buffer = WindowBuffer::new(600, 60, 0, 0.5);
        let mut window = None;
        for i in 0..600 {
            window = buffer.push(sample(i, true), 0.9);
        }
        assert!(window.is_some());
        assert_eq!(buffer.backlog_len(), 600 - 300);
    }

    #[test]
    fn low_confidence_advances_one_overlap_step() {
        let mut buffer = WindowBuffer::new(600, 60, 0, 0.5);
        let mut window = None;
        for i in 0..600 {
            window = buffer.push(sample(i, true), 0.2);
        }
        assert!(window.is_some());
        assert_eq!(buffer.backlog_len(), 600 - 60);
    }

    #[test]
    fn threshold_confidence_counts_as_high() {
        let mut buffer = WindowBuffer::new(600, 60, 0, 0.5);
        for i in 0..600 {
            buffer.push(sample(i, true), 0.5);
        }
        assert_eq!(buffer.backlog_len(), 300);
    }

    #[test]
    fn window_holds_most_recent_samples_in_order() {
        let mut buffer = WindowBuffer::new(10, 2, 0, 0.5);
        let mut windows = Vec::new();
        for i in 0..12 {
            if let Some(window) = buffer.push(sample(i, true), 0.0) {
                windows.push(window);
            }
        }
        assert_eq!(windows.len(), 2);
        let last = windows.last().unwrap();
        assert_eq!(last.len(), 10);
        assert_eq!(last[0].timestamp, sample(2, true).timestamp);
        assert_eq!(last[9].timestamp, sample(11, true).timestamp);
    }

    #[test]
    fn ignores_samples_until_lens_is_covered() {
        let mut buffer = WindowBuffer::new(10, 2, 0, 0.5);
        for i in 0..5 {
            assert!(buffer.push(sample(i, false), 0.0).is_none());
        }
        assert!(!buffer.started());
        assert_eq!(buffer.backlog_len(), 0);
        buffer.push(sample(5, true), 0.0);
        assert!(buffer.started());
        assert_eq!(buffer.backlog_len(), 1);
        // Once started, an uncovered frame is kept like any other.
        buffer.push(sample(6, false), 0.0);
        assert_eq!(buffer.backlog_len(), 2);
    }

    #[test]
    fn settle_samples_are_discarded() {
        let mut buffer = WindowBuffer::new(10, 2, 3, 0.5);
        for i in 0..5 {
            buffer.push(sample(i, true), 0.0);
        }
        assert_eq!(buffer.backlog_len(), 2);
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut buffer = WindowBuffer::new(10, 2, 1, 0.5);
        for i in 0..6 {
            buffer.push(sample(i, true), 0.0);
        }
        buffer.reset();
        assert!(!buffer.started());
        assert_eq!(buffer.backlog_len(), 0);
        assert!(buffer.push(sample(0, false), 0.0).is_none());
        assert_eq!(buffer.backlog_len(), 0);
    }
}
