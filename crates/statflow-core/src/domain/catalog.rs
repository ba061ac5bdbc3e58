use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use statflow_warehouse::CatalogRow;

use super::{Granularity, TimePeriod};

/// Validated identifier for one time series within a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeriesKey(String);

impl SeriesKey {
    /// Accepts non-empty keys of printable ASCII without whitespace.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.len() <= 120
            && raw
                .chars()
                .all(|c| c.is_ascii_graphic() && c != '"' && c != '\'');
        valid.then_some(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SeriesKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SeriesKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One value observed for a series at a period, normalized from a provider
/// response.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub series_key: SeriesKey,
    pub period: TimePeriod,
    pub value: f64,
    pub annotation: Option<String>,
}

/// A collectible unit of a dataset: one table or release with its series.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub dataset: String,
    pub entry_id: String,
    pub title: String,
    pub series_keys: Vec<SeriesKey>,
    pub granularities: Vec<Granularity>,
    pub is_headline: bool,
    pub group_dim: Option<String>,
}

impl CatalogEntry {
    pub fn supports(&self, granularity: Granularity) -> bool {
        self.granularities.contains(&granularity)
    }

    /// The entry's representative series, used as its sentinel identity.
    pub fn primary_series(&self) -> Option<&SeriesKey> {
        self.series_keys.first()
    }
}

impl From<CatalogRow> for CatalogEntry {
    fn from(row: CatalogRow) -> Self {
        let series_keys = row
            .series_keys
            .into_iter()
            .filter_map(SeriesKey::new)
            .collect();
        Self {
            dataset: row.dataset,
            entry_id: row.entry_id,
            title: row.title,
            series_keys,
            granularities: Granularity::parse_list(&row.granularities),
            is_headline: row.is_headline,
            group_dim: row.group_dim,
        }
    }
}

impl From<&CatalogEntry> for CatalogRow {
    fn from(entry: &CatalogEntry) -> Self {
        Self {
            dataset: entry.dataset.clone(),
            entry_id: entry.entry_id.clone(),
            title: entry.title.clone(),
            series_keys: entry
                .series_keys
                .iter()
                .map(|key| key.as_str().to_string())
                .collect(),
            granularities: entry
                .granularities
                .iter()
                .map(|g| g.code())
                .collect::<Vec<_>>()
                .join(","),
            is_headline: entry.is_headline,
            group_dim: entry.group_dim.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_keys_reject_whitespace_and_empty() {
        assert!(SeriesKey::new("T10101-A191RL").is_some());
        assert!(SeriesKey::new("").is_none());
        assert!(SeriesKey::new("has space").is_none());
        assert!(SeriesKey::new("tab\tkey").is_none());
    }

    #[test]
    fn catalog_rows_round_trip_through_entries() {
        let row = CatalogRow {
            dataset: "nipa".into(),
            entry_id: "T10101".into(),
            title: "Percent Change in Real GDP".into(),
            series_keys: vec!["T10101-A191RL".into(), "T10101-DPCERL".into()],
            granularities: "A,Q".into(),
            is_headline: true,
            group_dim: None,
        };
        let entry = CatalogEntry::from(row.clone());
        assert!(entry.supports(Granularity::Quarterly));
        assert!(!entry.supports(Granularity::Monthly));
        assert_eq!(
            entry.primary_series().map(SeriesKey::as_str),
            Some("T10101-A191RL")
        );

        let back = CatalogRow::from(&entry);
        assert_eq!(back.series_keys, row.series_keys);
        assert_eq!(back.granularities, row.granularities);
    }
}
