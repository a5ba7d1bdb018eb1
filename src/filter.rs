// Row selection by session date and club, used before modeling a subset.
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;

use crate::clean::{CLUB, DATE};
use crate::error::{Result, ShotError};

/// Which clubs to keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClubFilter {
    All,
    One(String),
    Many(Vec<String>),
}

impl ClubFilter {
    /// Builds a filter from user selections, where the literal `All` selects
    /// every club.
    pub fn from_selection(selected: &[String]) -> Self {
        match selected {
            [] => ClubFilter::All,
            [only] if only == "All" => ClubFilter::All,
            [only] => ClubFilter::One(only.clone()),
            many => ClubFilter::Many(many.iter().filter(|c| *c != "All").cloned().collect()),
        }
    }

    /// Every iron in `clubs` (codes starting with `I`).
    pub fn irons<'a>(clubs: impl IntoIterator<Item = &'a str>) -> Self {
        let mut irons: Vec<String> = clubs
            .into_iter()
            .filter(|c| c.starts_with('I'))
            .map(str::to_string)
            .collect();
        irons.sort();
        irons.dedup();
        ClubFilter::Many(irons)
    }

    pub fn driver() -> Self {
        ClubFilter::One("DR".to_string())
    }

    pub fn matches(&self, club: Option<&str>) -> bool {
        match self {
            ClubFilter::All => true,
            ClubFilter::One(code) => club == Some(code.as_str()),
            ClubFilter::Many(codes) => club.is_some_and(|c| codes.iter().any(|code| code == c)),
        }
    }
}

/// Inclusive range of session days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(ShotError::InvalidArgument(format!(
                "date range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        let day = ts.date();
        day >= self.start && day <= self.end
    }
}

/// Keeps rows inside `range` (when given) whose club passes `clubs`.
pub fn filter_shots(
    frame: &DataFrame,
    range: Option<DateRange>,
    clubs: &ClubFilter,
) -> Result<DataFrame> {
    let mut keep = vec![true; frame.height()];
    if let Some(range) = range {
        let dates = frame
            .column(DATE)
            .and_then(|c| c.datetime())
            .map_err(|_| ShotError::schema(DATE, "is missing or not a timestamp"))?;
        for (slot, ts) in keep.iter_mut().zip(dates.as_datetime_iter()) {
            *slot &= ts.is_some_and(|ts| range.contains(ts));
        }
    }
    if *clubs != ClubFilter::All {
        let club_cells = frame
            .column(CLUB)
            .and_then(|c| c.str())
            .map_err(|_| ShotError::schema(CLUB, "is missing or not text"))?;
        for (slot, club) in keep.iter_mut().zip(club_cells) {
            *slot &= clubs.matches(club);
        }
    }
    let mask: BooleanChunked = keep.into_iter().collect();
    Ok(frame.filter(&mask)?)
}
