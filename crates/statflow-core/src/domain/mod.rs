//! Domain types shared across the collection engine.

mod catalog;
mod period;

pub use catalog::{CatalogEntry, Observation, SeriesKey};
pub use period::{Granularity, PeriodError, TimePeriod, TimeWindow};
