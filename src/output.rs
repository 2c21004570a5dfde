use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

use crate::config::SessionConfig;
use crate::pipeline::SessionResult;
use crate::BpmSample;

/// Write the BPM series as CSV: `timestamp,bpm,confidence,channel`, with
/// an empty channel field for samples that are not channel-attributed.
pub fn write_bpm_records<W: Write>(writer: W, samples: &[BpmSample]) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(["timestamp", "bpm", "confidence", "channel"])?;
    for sample in samples {
        csv_writer.write_record(&[
            sample.timestamp.map(|t| t.to_string()).unwrap_or_default(),
            sample.bpm.to_string(),
            sample.confidence.to_string(),
            sample
                .channel
                .map(|c| c.as_str().to_string())
                .unwrap_or_default(),
        ])?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn write_bpm_csv(path: &str, samples: &[BpmSample]) -> Result<()> {
    let path = Path::new(path);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    println!("Writing results to {}", path.display());
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    write_bpm_records(file, samples)
}

/// The archived form of one session: wall-clock bounds, the configuration
/// that produced it, and the full sample series.
#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub identifier: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub frame_rate: u32,
    pub window_seconds: f64,
    pub min_confidence: f64,
    pub dropped_samples: usize,
    pub samples: Vec<BpmSample>,
}

impl SessionReport {
    pub fn new(
        identifier: String,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        config: &SessionConfig,
        result: &SessionResult,
    ) -> Self {
        SessionReport {
            identifier,
            start_date,
            end_date,
            frame_rate: config.frame_rate,
            window_seconds: config.window_seconds,
            min_confidence: config.min_confidence,
            dropped_samples: result.dropped_samples,
            samples: result.samples.clone(),
        }
    }
}

pub fn write_session_report(path: &str, report: &SessionReport) -> Result<()> {
    let path = Path::new(path);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    println!("Writing session report to {}", path.display());
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, report).context("failed to encode session report")?;
    Ok(())
}
