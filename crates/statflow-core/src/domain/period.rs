//! Reporting periods and collection windows.
//!
//! Periods carry a canonical zero-padded text form (`2024`, `2024Q1`,
//! `2024M03`) so that lexicographic ordering of stored keys matches
//! chronological ordering within one series.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reporting frequency supported by a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Annual,
    Quarterly,
    Monthly,
}

impl Granularity {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Annual => "A",
            Self::Quarterly => "Q",
            Self::Monthly => "M",
        }
    }

    /// Parse a single granularity code.
    pub fn parse(code: &str) -> Result<Self, PeriodError> {
        match code.trim() {
            "A" | "a" => Ok(Self::Annual),
            "Q" | "q" => Ok(Self::Quarterly),
            "M" | "m" => Ok(Self::Monthly),
            other => Err(PeriodError::UnknownGranularity {
                value: other.to_string(),
            }),
        }
    }

    /// Parse a comma-separated list of codes (`"A,Q"`), ignoring blanks.
    pub fn parse_list(codes: &str) -> Vec<Self> {
        codes
            .split(',')
            .filter(|code| !code.trim().is_empty())
            .filter_map(|code| Self::parse(code).ok())
            .collect()
    }
}

impl Display for Granularity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors produced when parsing periods or granularities.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodError {
    #[error("invalid period '{value}', expected forms like 2024, 2024Q1, 2024M03")]
    InvalidPeriod { value: String },
    #[error("period sub-component out of range in '{value}'")]
    OutOfRange { value: String },
    #[error("unknown granularity code '{value}', expected A, Q or M")]
    UnknownGranularity { value: String },
}

/// One reporting period: a year, optionally narrowed to a quarter or month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimePeriod {
    year: i32,
    sub: SubPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SubPeriod {
    Annual,
    Quarter(u8),
    Month(u8),
}

impl TimePeriod {
    pub const fn annual(year: i32) -> Self {
        Self {
            year,
            sub: SubPeriod::Annual,
        }
    }

    pub fn quarterly(year: i32, quarter: u8) -> Result<Self, PeriodError> {
        if !(1..=4).contains(&quarter) {
            return Err(PeriodError::OutOfRange {
                value: format!("{year}Q{quarter}"),
            });
        }
        Ok(Self {
            year,
            sub: SubPeriod::Quarter(quarter),
        })
    }

    pub fn monthly(year: i32, month: u8) -> Result<Self, PeriodError> {
        if !(1..=12).contains(&month) {
            return Err(PeriodError::OutOfRange {
                value: format!("{year}M{month:02}"),
            });
        }
        Ok(Self {
            year,
            sub: SubPeriod::Month(month),
        })
    }

    pub const fn year(&self) -> i32 {
        self.year
    }

    pub const fn granularity(&self) -> Granularity {
        match self.sub {
            SubPeriod::Annual => Granularity::Annual,
            SubPeriod::Quarter(_) => Granularity::Quarterly,
            SubPeriod::Month(_) => Granularity::Monthly,
        }
    }

    /// Month in which this period ends, used for cross-granularity ordering.
    const fn end_month(&self) -> u8 {
        match self.sub {
            SubPeriod::Annual => 12,
            SubPeriod::Quarter(q) => q * 3,
            SubPeriod::Month(m) => m,
        }
    }

    const fn rank(&self) -> u8 {
        match self.sub {
            SubPeriod::Annual => 0,
            SubPeriod::Quarter(_) => 1,
            SubPeriod::Month(_) => 2,
        }
    }
}

impl Ord for TimePeriod {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.year, self.end_month(), self.rank()).cmp(&(
            other.year,
            other.end_month(),
            other.rank(),
        ))
    }
}

impl PartialOrd for TimePeriod {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for TimePeriod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.sub {
            SubPeriod::Annual => write!(f, "{}", self.year),
            SubPeriod::Quarter(q) => write!(f, "{}Q{q}", self.year),
            SubPeriod::Month(m) => write!(f, "{}M{m:02}", self.year),
        }
    }
}

impl FromStr for TimePeriod {
    type Err = PeriodError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || PeriodError::InvalidPeriod {
            value: value.to_string(),
        };
        let value = value.trim();

        if let Some((year, quarter)) = split_once_either(value, 'Q') {
            let year: i32 = year.parse().map_err(|_| invalid())?;
            let quarter: u8 = quarter.parse().map_err(|_| invalid())?;
            return Self::quarterly(year, quarter);
        }
        if let Some((year, month)) = split_once_either(value, 'M') {
            let year: i32 = year.parse().map_err(|_| invalid())?;
            let month: u8 = month.parse().map_err(|_| invalid())?;
            return Self::monthly(year, month);
        }
        let year: i32 = value.parse().map_err(|_| invalid())?;
        Ok(Self::annual(year))
    }
}

fn split_once_either(value: &str, marker: char) -> Option<(&str, &str)> {
    value
        .split_once(marker)
        .or_else(|| value.split_once(marker.to_ascii_lowercase()))
}

/// Inclusive year range for a collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_year: i32,
    pub end_year: i32,
}

impl TimeWindow {
    pub fn new(start_year: i32, end_year: i32) -> Self {
        if start_year <= end_year {
            Self {
                start_year,
                end_year,
            }
        } else {
            Self {
                start_year: end_year,
                end_year: start_year,
            }
        }
    }

    /// Wide historical window used by backfills.
    pub fn backfill_default() -> Self {
        Self::new(1990, current_year())
    }

    /// Window covering the most recent `years` years, used by incremental
    /// updates and sentinel checks.
    pub fn recent(years: i32) -> Self {
        let end = current_year();
        Self::new(end - (years - 1).max(0), end)
    }

    pub const fn contains_year(&self, year: i32) -> bool {
        year >= self.start_year && year <= self.end_year
    }
}

fn current_year() -> i32 {
    time::OffsetDateTime::now_utc().year()
}
