use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Butterworth coefficient table embedded at compile time.
///
/// Row-oriented records keyed by `(filter_type, sampling_rate)`, eight
/// numerator and eight denominator coefficients each (7th-order designs,
/// `a1` normalized to 1). Lookup is an exact match on the integer sampling
/// rate; there is no interpolation between rates.
static TABLE_CSV: &str = include_str!("../data/butterworth_params.csv");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    Low,
    High,
}

/// One row of the pass-filter table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParameters {
    pub filter_type: FilterType,
    pub sampling_rate: u32,
    pub b: [f64; 8],
    pub a: [f64; 8],
}

#[derive(Debug, Deserialize)]
struct FilterRow {
    filter_type: FilterType,
    sampling_rate: u32,
    b1: f64,
    b2: f64,
    b3: f64,
    b4: f64,
    b5: f64,
    b6: f64,
    b7: f64,
    b8: f64,
    a1: f64,
    a2: f64,
    a3: f64,
    a4: f64,
    a5: f64,
    a6: f64,
    a7: f64,
    a8: f64,
}

impl From<FilterRow> for FilterParameters {
    fn from(r: FilterRow) -> Self {
        FilterParameters {
            filter_type: r.filter_type,
            sampling_rate: r.sampling_rate,
            b: [r.b1, r.b2, r.b3, r.b4, r.b5, r.b6, r.b7, r.b8],
            a: [r.a1, r.a2, r.a3, r.a4, r.a5, r.a6, r.a7, r.a8],
        }
    }
}

/// The loaded coefficient table. Read-only after construction, safe to
/// share across threads without locking.
#[derive(Debug)]
pub struct FilterTable {
    rows: Vec<FilterParameters>,
}

impl FilterTable {
    /// Parse the embedded table. A malformed table is the one startup
    /// condition treated as fatal (for the Butterworth path).
    pub fn load() -> Result<Self> {
        let mut reader = csv::Reader::from_reader(TABLE_CSV.as_bytes());
        let mut rows = Vec::new();
        for record in reader.deserialize() {
            let row: FilterRow = record.context("malformed filter coefficient row")?;
            let params = FilterParameters::from(row);
            if params.a[0] != 1.0 {
                bail!(
                    "filter coefficients for rate {} are not normalized (a1 = {})",
                    params.sampling_rate,
                    params.a[0]
                );
            }
            rows.push(params);
        }
        if rows.is_empty() {
            bail!("filter coefficient table is empty");
        }
        Ok(FilterTable { rows })
    }

    /// Exact-match lookup; `None` means the rate is unsupported.
    pub fn lookup(&self, filter_type: FilterType, sampling_rate: u32) -> Option<&FilterParameters> {
        self.rows
            .iter()
            .find(|p| p.filter_type == filter_type && p.sampling_rate == sampling_rate)
    }

    /// A sampling rate is valid when both pass filters are defined for it.
    pub fn is_valid_sampling_rate(&self, sampling_rate: u32) -> bool {
        self.lookup(FilterType::Low, sampling_rate).is_some()
            && self.lookup(FilterType::High, sampling_rate).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_embedded_table() {
        let table = FilterTable::load().unwrap();
        let low = table
            .rows
            .iter()
            .filter(|p| p.filter_type == FilterType::Low)
            .count();
        let high = table
            .rows
            .iter()
            .filter(|p| p.filter_type == FilterType::High)
            .count();
        assert_eq!(low, 56);
        assert_eq!(high, 56);
    }

    #[test]
    fn lookup_is_exact_match() {
        let table = FilterTable::load().unwrap();
        let params = table.lookup(FilterType::Low, 60).unwrap();
        assert_eq!(params.sampling_rate, 60);
        assert_eq!(params.a[0], 1.0);
        assert!(table.lookup(FilterType::Low, 2).is_none());
        assert!(table.lookup(FilterType::High, 1000).is_none());
    }

    #[test]
    fn validates_supported_rates() {
        let table = FilterTable::load().unwrap();
        assert!(table.is_valid_sampling_rate(60));
        assert!(table.is_valid_sampling_rate(12));
        assert!(!table.is_valid_sampling_rate(2));
    }
}
