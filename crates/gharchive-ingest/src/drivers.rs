//! Sequential batch drivers over days, months and years
//!
//! Each unit produces exactly one outcome line (`pass,<date>,<hour>` or
//! `fail,<date>,<hour>`) on the supplied writer, flushed as soon as the unit
//! finishes so progress can be tailed.

use crate::engine::{IngestReport, Ingestor};
use crate::error::{IngestError, Result};
use crate::unit::Unit;
use chrono::{Datelike, NaiveDate};
use std::io::Write;

/// Ingest units in order, emitting one outcome line per unit
pub async fn ingest_units<I, W>(ingestor: &Ingestor, units: I, out: &mut W) -> Result<Vec<IngestReport>>
where
    I: IntoIterator<Item = Unit>,
    W: Write,
{
    let mut reports = Vec::new();
    for unit in units {
        let report = ingestor.ingest(&unit).await;
        writeln!(out, "{}", report.outcome.line(&unit))?;
        out.flush()?;
        reports.push(report);
    }
    Ok(reports)
}

/// Hours 0..=23 of one day
pub async fn ingest_day<W: Write>(ingestor: &Ingestor, date: NaiveDate, out: &mut W) -> Result<Vec<IngestReport>> {
    ingest_units(ingestor, Unit::hours_of(date), out).await
}

/// Every hour of every calendar day of a month
pub async fn ingest_month<W: Write>(
    ingestor: &Ingestor,
    year: i32,
    month: u32,
    out: &mut W,
) -> Result<Vec<IngestReport>> {
    let units = days_of_month(year, month)?.into_iter().flat_map(Unit::hours_of);
    ingest_units(ingestor, units, out).await
}

/// Every hour of a year, month by month
pub async fn ingest_year<W: Write>(ingestor: &Ingestor, year: i32, out: &mut W) -> Result<Vec<IngestReport>> {
    let mut reports = Vec::new();
    for month in 1..=12 {
        reports.extend(ingest_month(ingestor, year, month, out).await?);
    }
    Ok(reports)
}

/// Calendar days of a month, leap years included
pub fn days_of_month(year: i32, month: u32) -> Result<Vec<NaiveDate>> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| IngestError::InvalidUnit(format!("invalid month {}-{}", year, month)))?;

    Ok(first
        .iter_days()
        .take_while(|day| day.month() == month)
        .collect())
}
