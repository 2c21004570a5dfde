use anyhow::{bail, Result};
use chrono::Utc;
use clap::Parser;
use log::{debug, warn};
use std::sync::Arc;

use pulse_decoder::coefficients::FilterTable;
use pulse_decoder::config::{Args, EstimatorStrategy};
use pulse_decoder::output::{write_bpm_csv, write_session_report, SessionReport};
use pulse_decoder::pipeline::CapturePipeline;
use pulse_decoder::{data_loading, BpmSample};

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = args.session_config();
    config.validate()?;

    let table = match FilterTable::load() {
        Ok(table) => Some(Arc::new(table)),
        Err(err) => {
            // Only the butterworth path depends on the coefficient table.
            if config.strategy == EstimatorStrategy::Butterworth {
                bail!("filter coefficient table failed to load: {err}");
            }
            warn!("filter coefficient table failed to load ({err}); butterworth path disabled");
            None
        }
    };

    let samples = data_loading::load_pixel_samples(&args.input_path)?;
    if samples.is_empty() {
        bail!("{} holds no samples", args.input_path.display());
    }
    let duration = samples.last().unwrap().timestamp - samples.first().unwrap().timestamp;
    println!(
        "Loaded {} samples covering {:.1} seconds from {}",
        samples.len(),
        duration,
        args.input_path.display()
    );
    debug!(
        "window {} samples, strategy {:?}",
        config.window_len(),
        config.strategy
    );

    let start_date = Utc::now();
    let pipeline = CapturePipeline::new(config, table)?;
    for sample in &samples {
        // Replay must not lose frames to the intake bound, so it takes the
        // blocking path; a live capture source would use push_sample.
        pipeline.push_sample_blocking(*sample);
    }
    let result = pipeline.finish();
    let end_date = Utc::now();

    let readings = result.samples.iter().filter(|s| s.is_reading()).count();
    println!(
        "\nEstimated {} windows ({} with a reading)",
        result.samples.len(),
        readings
    );
    if result.samples.is_empty() {
        println!("No reading yet: the recording never filled a full window");
    }

    print_sample("Resting heart rate", result.resting_heart_rate());
    print_sample("Peak heart rate", result.peak_heart_rate());
    print_sample("End heart rate", result.end_heart_rate());

    match result.vo2_window() {
        Some((first, last)) => println!(
            "VO2 window: {:.0} bpm at {:.1}s to {:.0} bpm at {:.1}s",
            first.bpm,
            first.timestamp.unwrap_or_default(),
            last.bpm,
            last.timestamp.unwrap_or_default()
        ),
        None => println!("VO2 window: not enough high-confidence samples after 30s"),
    }
    if let (Some(age), Some(sex)) = (args.age, args.sex) {
        match result.vo2_max(sex, age) {
            Some(value) => println!("Estimated VO2 max: {:.1}", value),
            None => println!("Estimated VO2 max: unavailable"),
        }
    }

    if let Some(path) = &args.csv_output {
        write_bpm_csv(path, &result.samples)?;
    }
    if let Some(path) = &args.json_output {
        let identifier = args
            .input_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("session")
            .to_string();
        let report = SessionReport::new(identifier, start_date, end_date, &config, &result);
        write_session_report(path, &report)?;
    }

    Ok(())
}

fn print_sample(label: &str, sample: Option<BpmSample>) {
    match sample {
        Some(sample) => println!(
            "{}: {:.0} bpm (confidence {:.2})",
            label, sample.bpm, sample.confidence
        ),
        None => println!("{}: no reading yet", label),
    }
}
