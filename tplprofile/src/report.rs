//! Aggregated template instantiation statistics

use crate::grammar::InstantiationSample;
use serde::Serialize;
use std::{
    cmp::Ordering,
    collections::HashMap,
    fmt::{self, Display, Formatter},
    path::Path,
};

/// Cumulated cost of one template instantiation
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InstantiationRecord {
    /// Normalized template signature
    signature: Box<str>,

    /// Number of times this instantiation was observed
    occurrences: u64,

    /// Sum of the costs of all observations
    cost: f64,
}
//
impl InstantiationRecord {
    /// Normalized template signature
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Number of times this instantiation was observed
    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }

    /// Sum of the costs of all observations
    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Ranking order: highest cost first, then most frequent, then by
    /// signature
    fn rank(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.occurrences.cmp(&self.occurrences))
            .then_with(|| self.signature.cmp(&other.signature))
    }
}
//
impl Display for InstantiationRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let cost = format_cost(self.cost);
        write!(
            f,
            "{cost:>COST_WIDTH$} {:>COUNT_WIDTH$}  {}",
            self.occurrences, self.signature
        )
    }
}

/// Width of the cost column
const COST_WIDTH: usize = 12;

/// Width of the occurrence count column
const COUNT_WIDTH: usize = 8;

/// Display a cost, without fractional part if it is integral
fn format_cost(cost: f64) -> String {
    if cost.fract() == 0.0 && cost.abs() < 1e15 {
        format!("{cost:.0}")
    } else {
        format!("{cost:.3}")
    }
}

/// Instantiation statistics of a translation unit
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Report(HashMap<Box<str>, InstantiationRecord>);
//
impl Report {
    /// Start with no instantiation
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one observation of an instantiation
    pub fn record(&mut self, sample: InstantiationSample) {
        let InstantiationSample { signature, cost } = sample;
        let record = self
            .0
            .entry(signature.clone())
            .or_insert_with(|| InstantiationRecord {
                signature,
                occurrences: 0,
                cost: 0.0,
            });
        record.occurrences += 1;
        record.cost += cost;
    }

    /// Number of distinct instantiations
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Truth that no instantiation was observed
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of observations across all instantiations
    pub fn total_instantiations(&self) -> u64 {
        self.0.values().map(|record| record.occurrences).sum()
    }

    /// Query the record of one instantiation
    pub fn get(&self, signature: &str) -> Option<&InstantiationRecord> {
        self.0.get(signature)
    }

    /// Records, most expensive first
    pub fn ranked(&self) -> Vec<&InstantiationRecord> {
        let mut records = self.0.values().collect::<Vec<_>>();
        records.sort_unstable_by(|a, b| a.rank(b));
        records
    }

    /// Column headers matching the `Display` of records
    pub fn header() -> String {
        format!("{:>COST_WIDTH$} {:>COUNT_WIDTH$}  signature", "cost", "count")
    }

    /// Save the ranked records as CSV
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in self.ranked() {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}
//
impl FromIterator<InstantiationSample> for Report {
    fn from_iter<I: IntoIterator<Item = InstantiationSample>>(iter: I) -> Self {
        let mut report = Self::new();
        for sample in iter {
            report.record(sample);
        }
        report
    }
}
