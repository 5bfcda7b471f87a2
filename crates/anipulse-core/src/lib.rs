//! Core domain model for the anipulse snapshot pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "anipulse-core";

/// One catalog item as the listing endpoint returns it.
///
/// Field presence varies across source versions, so everything the pipeline
/// does not strictly require is optional and unknown keys are ignored. This
/// type never travels past normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawAnime {
    pub mal_id: Option<i64>,
    pub title: Option<String>,
    pub title_english: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub episodes: Option<i32>,
    pub status: Option<String>,
    pub season: Option<String>,
    #[serde(default, deserialize_with = "lenient_year")]
    pub year: Option<i32>,
    pub synopsis: Option<String>,
    pub score: Option<f64>,
    pub rank: Option<i64>,
    pub popularity: Option<i64>,
    pub members: Option<i64>,
    pub favorites: Option<i64>,
}

/// Normalized descriptive record, upserted on the `mal_id` natural key.
///
/// `year` stays `None` when the source omits it or sends something that is
/// not a year; the store column is nullable for the same reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimeRecord {
    pub mal_id: i64,
    pub title: String,
    pub title_english: Option<String>,
    pub kind: Option<String>,
    pub episodes: Option<i32>,
    pub status: Option<String>,
    pub season: Option<String>,
    pub year: Option<i32>,
    pub synopsis: Option<String>,
}

/// A point-in-time metrics observation for one anime.
///
/// Keyed by `mal_id` until the loader swaps in the store surrogate key.
/// Every snapshot in a batch carries the same `collected_at`; once persisted
/// the row is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub mal_id: i64,
    pub score: Option<f64>,
    pub rank: Option<i64>,
    pub popularity: Option<i64>,
    pub members: Option<i64>,
    pub favorites: Option<i64>,
    pub collected_at: DateTime<Utc>,
}

/// The source sometimes ships `year` as a string or other junk; anything
/// that does not parse cleanly becomes `None` rather than failing the whole
/// record.
fn lenient_year<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(match value {
        JsonValue::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}
