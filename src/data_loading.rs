use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::PixelSample;

/// Parse a recorded per-frame RGB stream.
///
/// The format is the CSV log the capture layer writes, one row per frame:
/// `timestamp,red,green,blue,isCoveringLens`. Rows arrive in one-second
/// batches that are each sorted, but batch boundaries can interleave, so
/// the whole stream is re-sorted by timestamp after parsing.
pub fn parse_pixel_samples<R: Read>(reader: R) -> Result<Vec<PixelSample>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut samples: Vec<PixelSample> = Vec::new();
    for record in csv_reader.deserialize() {
        let sample: PixelSample = record.context("malformed pixel sample row")?;
        samples.push(sample);
    }
    samples.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap());
    Ok(samples)
}

pub fn load_pixel_samples(path: &Path) -> Result<Vec<PixelSample>> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    parse_pixel_samples(BufReader::new(file))
        .with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recorded_stream() {
        let data = "\
timestamp,red,green,blue,isCoveringLens
0.0166,0.41,0.52,0.33,true
0.0,0.40,0.50,0.30,false
0.0333,0.42,0.54,0.35,true
";
        let samples = parse_pixel_samples(data.as_bytes()).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].timestamp, 0.0);
        assert!(!samples[0].is_covering_lens);
        assert_eq!(samples[1].red, 0.41);
        assert!(samples[1].is_covering_lens);
        assert_eq!(samples[2].green, 0.54);
    }

    #[test]
    fn rejects_malformed_rows() {
        let data = "timestamp,red,green,blue,isCoveringLens\n0.0,not-a-number,0.5,0.3,true\n";
        assert!(parse_pixel_samples(data.as_bytes()).is_err());
    }

    #[test]
    fn empty_stream_is_fine() {
        let data = "timestamp,red,green,blue,isCoveringLens\n";
        assert!(parse_pixel_samples(data.as_bytes()).unwrap().is_empty());
    }
}
