//! Persistence boundary.
//!
//! The ingestion core only ever talks to [`Store`], a small capability set
//! over the relational schema (roster reads, idempotent upserts, raw audit
//! inserts, watermark). Production uses [`postgres::Db`]; tests run against
//! the in-memory fake in [`memory`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub mod postgres;

#[cfg(test)]
pub mod memory;

pub use postgres::Db;

/// One scraped roster profile ready for persistence. `current_name` is
/// guaranteed non-empty by callers (placeholder rule).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub roster_id: i64,
    pub steamid64: Option<i64>,
    pub current_name: String,
    pub profile_url: Option<String>,
    pub steam_profile_url: Option<String>,
}

/// A validated message row keyed by its dedupe hash.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub hash_key: String,
    pub steamid64: i64,
    pub msg_time_utc: DateTime<Utc>,
    /// The exact upstream timestamp string that fed the hash.
    pub msg_time_iso: String,
    pub text: String,
    pub logid: Option<i64>,
    pub message_id: Option<String>,
}

/// Verbatim audit row, persisted before validation and without dedupe.
#[derive(Debug, Clone)]
pub struct RawMessageRow {
    pub source: String,
    pub message_id: Option<String>,
    pub steamid: Option<String>,
    pub logid: Option<String>,
    pub logdate_txt: Option<String>,
    pub text: Option<String>,
    pub payload: Value,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// All known Steam64 ids on the roster (non-null, within the Steam64 band).
    async fn roster_steamids(&self) -> Result<Vec<i64>>;

    /// Highest roster id seen so far, 0 when the roster is empty.
    async fn max_roster_id(&self) -> Result<i64>;

    /// Idempotent upsert keyed by `roster_id`. A non-null stored steamid64 is
    /// never overwritten with null; names only overwrite with non-blank values.
    async fn upsert_player(&self, player: &PlayerRecord) -> Result<()>;

    /// Append-only audit insert; returns the number of rows written.
    async fn insert_raw_messages(&self, rows: &[RawMessageRow]) -> Result<u64>;

    /// Insert-if-absent keyed by `hash_key`; true when the row was new.
    async fn insert_message_if_absent(&self, row: &MessageRecord) -> Result<bool>;

    /// Last fully-successful run timestamp, if any.
    async fn watermark(&self) -> Result<Option<DateTime<Utc>>>;

    /// Advance the watermark; called only after a fully successful run.
    async fn set_watermark(&self, at: DateTime<Utc>) -> Result<()>;
}
