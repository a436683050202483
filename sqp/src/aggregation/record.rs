use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::types::Record;

/// Daily performance of one product for one search query.
///
/// Warehouses commonly encode integers as strings in JSON results, so counts are accepted as
/// numbers or numeric strings and dates as `YYYY-MM-DD`, optionally followed by a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQueryRecord {
    #[serde(deserialize_with = "deserialize_date")]
    pub date: NaiveDate,
    pub query: String,
    pub asin: String,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub impressions: u64,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub clicks: u64,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub purchases: u64,
}

impl SearchQueryRecord {
    pub fn new(date: NaiveDate, query: impl Into<String>, asin: impl Into<String>) -> Self {
        Self {
            date,
            query: query.into(),
            asin: asin.into(),
            impressions: 0,
            clicks: 0,
            purchases: 0,
        }
    }

    pub fn with_counts(mut self, impressions: u64, clicks: u64, purchases: u64) -> Self {
        self.impressions = impressions;
        self.clicks = clicks;
        self.purchases = purchases;
        self
    }

    /// Parses a warehouse row.
    pub fn from_record(record: &Record) -> SyncResult<Self> {
        serde_json::from_value(serde_json::Value::Object(record.clone())).map_err(|err| {
            SyncError::from((
                ErrorKind::InvalidData,
                "Record is not a valid search query performance row",
                err.to_string(),
            ))
            .with_source(err)
        })
    }

    /// Parses every row, failing on the first invalid one.
    pub fn from_records(records: &[Record]) -> SyncResult<Vec<Self>> {
        records.iter().map(Self::from_record).collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CountRepr {
    Number(u64),
    Float(f64),
    Text(String),
}

fn deserialize_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let repr = Option::<CountRepr>::deserialize(deserializer)?;
    match repr {
        None => Ok(0),
        Some(CountRepr::Number(value)) => Ok(value),
        Some(CountRepr::Float(value)) if value >= 0.0 && value.fract() == 0.0 => Ok(value as u64),
        Some(CountRepr::Float(value)) => Err(serde::de::Error::custom(format!(
            "expected a non-negative integer count, got {value}"
        ))),
        Some(CountRepr::Text(text)) => text.trim().parse::<u64>().map_err(|_| {
            serde::de::Error::custom(format!("expected a non-negative integer count, got `{text}`"))
        }),
    }
}

fn deserialize_date<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    let date_part = text.get(..10).unwrap_or(&text);

    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|err| serde::de::Error::custom(format!("invalid date `{text}`: {err}")))
}
