//! Hour units and per-unit outcomes

use crate::error::{IngestError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Date format used in unit keys, file names and collection names
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// One calendar hour of archive data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Unit {
    date: NaiveDate,
    hour: u8,
}

impl Unit {
    pub fn new(date: NaiveDate, hour: u8) -> Result<Self> {
        if hour > 23 {
            return Err(IngestError::InvalidUnit(format!(
                "hour must be within 0..=23, got {}",
                hour
            )));
        }
        Ok(Self { date, hour })
    }

    /// Build a unit from a `YYYY-MM-DD` date string
    pub fn parse(date: &str, hour: u8) -> Result<Self> {
        let date = NaiveDate::parse_from_str(date, DATE_FORMAT).map_err(|e| {
            IngestError::InvalidUnit(format!("invalid date '{}': {}", date, e))
        })?;
        Self::new(date, hour)
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    /// `YYYY-MM-DD`; also the primary collection name for the unit
    pub fn date_str(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }

    /// Ledger key, `"<date>-<hour>"` with an unpadded hour
    pub fn key(&self) -> String {
        format!("{}-{}", self.date_str(), self.hour)
    }

    /// Remote and cached file name
    pub fn file_name(&self) -> String {
        format!("{}.json.gz", self.key())
    }

    pub fn collection(&self) -> String {
        self.date_str()
    }

    /// All 24 units of a day, in order
    pub fn hours_of(date: NaiveDate) -> impl Iterator<Item = Unit> {
        (0..24u8).map(move |hour| Unit { date, hour })
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Result of one `ingest_unit` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

impl Outcome {
    pub fn is_pass(self) -> bool {
        self == Outcome::Pass
    }

    /// The externally observed progress line, e.g. `pass,2015-01-01,0`
    pub fn line(self, unit: &Unit) -> String {
        format!("{},{},{}", self, unit.date_str(), unit.hour())
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass => write!(f, "pass"),
            Outcome::Fail => write!(f, "fail"),
        }
    }
}
