//! Ingestion orchestration: roster ids → message fetch → content filter →
//! raw audit insert → validated dedupe upsert → watermark.
//!
//! The one property everything here protects: re-running over an overlapping
//! window never duplicates a validated row. The dedupe key is a content hash
//! of (steamid64, timestamp string, text) and the sole uniqueness constraint.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::db::{MessageRecord, RawMessageRow, Store};
use crate::notify;
use crate::ozf::{self, ProfileProbe, RefreshOptions};
use crate::slurs::{SlurRow, SlursClient};
use crate::steamid;
use crate::util::env::env_parse;
use crate::wordlist::DropFilter;

#[derive(Debug, Default, Clone, Copy)]
pub struct PullSummary {
    pub fetched: u64,
    pub dropped_allowlist: u64,
    pub raw_inserted: u64,
    pub inserted: u64,
    pub skipped_duplicate: u64,
    pub skipped_invalid: u64,
}

/// Content hash keying the validated message store.
pub fn dedupe_key(steamid64: &str, msg_time_iso: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(steamid64.as_bytes());
    hasher.update(b"|");
    hasher.update(msg_time_iso.as_bytes());
    hasher.update(b"|");
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Validate one normalized row. Failures are counted by the caller and never
/// fatal: the row still lands in the raw audit store.
fn validate_row(row: &SlurRow) -> Option<MessageRecord> {
    let sid = row.steamid64.as_deref()?;
    if !steamid::is_steamid64(sid) {
        return None;
    }
    let iso = row.msg_time_iso.as_deref()?.trim();
    if iso.is_empty() {
        return None;
    }
    let text = row.text.as_deref()?;
    if text.is_empty() {
        return None;
    }
    let msg_time_utc = parse_iso_utc(iso)?;
    Some(MessageRecord {
        hash_key: dedupe_key(sid, iso, text),
        steamid64: sid.trim().parse().ok()?,
        msg_time_utc,
        msg_time_iso: iso.to_string(),
        text: text.to_string(),
        logid: row.logid.as_deref().and_then(|s| s.trim().parse::<i64>().ok()),
        message_id: row.message_id.clone(),
    })
}

fn parse_iso_utc(iso: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(iso) {
        return Some(dt.with_timezone(&Utc));
    }
    // upstream occasionally drops the zone designator; assume UTC
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(iso, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Fetch and persist one window for every roster id.
pub async fn run_pull(
    store: &dyn Store,
    client: &SlursClient,
    after: Option<&str>,
    before: Option<&str>,
    filter: &DropFilter,
) -> Result<PullSummary> {
    let steamids = store.roster_steamids().await?;
    info!(ids = steamids.len(), "roster steamids loaded");

    let rows = client.fetch_messages(&steamids, after, before).await;
    let mut summary = PullSummary {
        fetched: rows.len() as u64,
        ..Default::default()
    };

    // optional allow-list drop; rows carrying a lexicon hit are always kept
    let rows: Vec<SlurRow> = if filter.enabled {
        let total = rows.len();
        let kept: Vec<SlurRow> = rows
            .into_iter()
            .filter(|r| filter.keeps(r.text.as_deref().unwrap_or("")))
            .collect();
        summary.dropped_allowlist = (total - kept.len()) as u64;
        info!(
            allow_terms = filter.allow_terms,
            lex_terms = filter.deny_terms,
            dropped = summary.dropped_allowlist,
            kept = kept.len(),
            "allowlist filter"
        );
        kept
    } else {
        rows
    };

    if rows.is_empty() {
        info!("pull: no rows returned from API for given window");
        return Ok(summary);
    }

    persist_rows(store, &rows, &mut summary).await;
    info!(
        raw = summary.raw_inserted,
        inserted = summary.inserted,
        skipped_duplicate = summary.skipped_duplicate,
        skipped_invalid = summary.skipped_invalid,
        "pull persisted"
    );
    Ok(summary)
}

/// Raw audit copy first (verbatim, no dedupe), then validated insert-if-absent.
async fn persist_rows(store: &dyn Store, rows: &[SlurRow], summary: &mut PullSummary) {
    let raw_rows: Vec<RawMessageRow> = rows.iter().map(SlurRow::to_raw).collect();
    match store.insert_raw_messages(&raw_rows).await {
        Ok(n) => summary.raw_inserted = n,
        Err(e) => warn!(error = %e, "raw insert failed"),
    }

    for row in rows {
        match validate_row(row) {
            Some(record) => match store.insert_message_if_absent(&record).await {
                Ok(true) => summary.inserted += 1,
                Ok(false) => summary.skipped_duplicate += 1,
                Err(e) => warn!(error = %e, hash = %record.hash_key, "message insert failed"),
            },
            None => {
                summary.skipped_invalid += 1;
                warn!(steamid = ?row.steamid, "skipping row failing validation");
            }
        }
    }
}

/// `pull` without an explicit lower bound starts from the stored watermark.
pub async fn resolve_since(store: &dyn Store, since: Option<String>) -> Option<String> {
    match since {
        Some(s) => Some(s),
        None => match store.watermark().await {
            Ok(at) => at.map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            Err(e) => {
                warn!(error = %e, "watermark read failed; pulling unbounded");
                None
            }
        },
    }
}

/// Daily orchestration: refresh the roster (non-fatal), pull the sliding
/// lookback window, post summaries, then advance the watermark.
pub async fn run_daily(
    store: &dyn Store,
    client: &SlursClient,
    probe: &dyn ProfileProbe,
) -> Result<PullSummary> {
    match ozf::refresh(probe, store, &RefreshOptions::from_env()).await {
        Ok(summary) => notify::post_roster_summary(&summary).await,
        Err(e) => warn!(error = %e, "roster refresh failed (continuing)"),
    }

    let lookback_hours: i64 = env_parse("LOOKBACK_HOURS", 25i64).max(1);
    let now = Utc::now();
    let since_iso = (now - Duration::hours(lookback_hours)).to_rfc3339_opts(SecondsFormat::Secs, true);
    let before_iso = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    info!(lookback_hours, since = %since_iso, before = %before_iso, "pull window");

    let summary = run_pull(
        store,
        client,
        Some(&since_iso),
        Some(&before_iso),
        &DropFilter::from_env(),
    )
    .await?;
    notify::post_pull_summary(&summary).await;

    // only a completed pull may advance the watermark
    if let Err(e) = store.set_watermark(now).await {
        warn!(error = %e, "failed to advance watermark");
    } else {
        info!("watermark advanced");
    }
    Ok(summary)
}
