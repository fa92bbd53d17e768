//! slurs.tf message API client.
//!
//! Pulls flagged chat messages for batches of Steam64 ids over a time window.
//! The API caps ids per request, pages with limit/offset, and intermittently
//! falls over when asked for server-side classification — in which case the
//! same window is re-pulled unclassified and filtered locally against the
//! lexicon. An empty lexicon fails closed: unclassified rows are discarded
//! rather than imported unfiltered.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::db::RawMessageRow;
use crate::steamid;
use crate::util::env::{env_list_u64, env_opt, env_parse};
use crate::wordlist::{WordList, LEXICON_KEYS};

/// Hard cap the API enforces on ids per request.
pub const MAX_BATCH_SIZE: usize = 10;

const SOURCE: &str = "slurs.tf";

/// Soft failure taxonomy for one request. These feed retry and fallback
/// decisions; none of them aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftFailure {
    Http(u16),
    Timeout,
    ConnErr,
    NonJson,
    Empty,
}

impl SoftFailure {
    /// Server-side-looking failures qualify for the category fallback.
    fn serverish(self) -> bool {
        match self {
            SoftFailure::Http(code) => (500..=599).contains(&code),
            SoftFailure::Timeout
            | SoftFailure::ConnErr
            | SoftFailure::NonJson
            | SoftFailure::Empty => true,
        }
    }
}

/// What one GET produced, after JSON decoding.
#[derive(Debug, Clone)]
pub enum JsonOutcome {
    Json(Value),
    Soft(SoftFailure),
}

#[derive(Debug, Default, Deserialize)]
struct MessagesEnvelope {
    data: Option<Vec<Value>>,
}

/// Wire seam: everything above this trait is deterministic and tested
/// against scripted outcomes.
#[async_trait]
pub trait SlursTransport: Send + Sync {
    async fn get_json(&self, url: &str) -> JsonOutcome;
}

pub struct HttpTransport {
    http: Client,
}

impl HttpTransport {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("ozf-slursbot/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl SlursTransport for HttpTransport {
    async fn get_json(&self, url: &str) -> JsonOutcome {
        let resp = match self.http.get(url).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                warn!(url, "timeout");
                return JsonOutcome::Soft(SoftFailure::Timeout);
            }
            Err(e) => {
                warn!(url, error = %e, "connection error");
                return JsonOutcome::Soft(SoftFailure::ConnErr);
            }
        };
        let status = resp.status();
        if !status.is_success() {
            let snippet: String = resp
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();
            info!(code = status.as_u16(), url, body = %snippet.replace('\n', " "), "non-2xx");
            return JsonOutcome::Soft(SoftFailure::Http(status.as_u16()));
        }
        match resp.json::<Value>().await {
            Ok(v) => JsonOutcome::Json(v),
            Err(e) => {
                info!(url, error = %e, "non-JSON 2xx body");
                JsonOutcome::Soft(SoftFailure::NonJson)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlursOptions {
    pub base_url: String,
    /// Server-side classification tag; `None` disables classified requests
    /// (and with them the fallback path).
    pub category: Option<String>,
    pub limit: u32,
    pub batch_size: usize,
    /// Politeness delay between pages and between batches. The default keeps
    /// the request rate under ~300 per 5 minutes.
    pub sleep_ms: u64,
    /// Escalating backoff schedule (seconds) for soft failures on one page.
    pub retries_s: Vec<u64>,
    pub timeout_secs: u64,
    pub lexicon_path: String,
}

impl Default for SlursOptions {
    fn default() -> Self {
        Self {
            base_url: "https://slurs.tf".into(),
            category: Some("total".into()),
            limit: 100,
            batch_size: MAX_BATCH_SIZE,
            sleep_ms: 1100,
            retries_s: vec![10, 30, 300, 900],
            timeout_secs: 25,
            lexicon_path: "lexicon.yaml".into(),
        }
    }
}

impl SlursOptions {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: env_opt("SLURS_API_BASE")
                .unwrap_or(d.base_url)
                .trim_end_matches('/')
                .to_string(),
            category: d.category,
            limit: env_parse("SLURS_LIMIT", d.limit),
            batch_size: env_parse("SLURS_BATCH_SIZE", d.batch_size),
            sleep_ms: env_parse("SLURS_SLEEP_MS", d.sleep_ms),
            retries_s: env_list_u64("SLURS_RETRIES_S", &d.retries_s),
            timeout_secs: env_parse("SLURS_HTTP_TIMEOUT_S", d.timeout_secs),
            lexicon_path: env_opt("LEXICON_PATH").unwrap_or(d.lexicon_path),
        }
    }
}

/// One upstream message row after normalization. The untouched payload is
/// carried along for the audit store.
#[derive(Debug, Clone)]
pub struct SlurRow {
    pub steamid: Option<String>,
    pub steamid64: Option<String>,
    pub text: Option<String>,
    pub msg_time_iso: Option<String>,
    pub logid: Option<String>,
    pub message_id: Option<String>,
    pub payload: Value,
}

impl SlurRow {
    pub fn to_raw(&self) -> RawMessageRow {
        RawMessageRow {
            source: SOURCE.into(),
            message_id: self.message_id.clone(),
            steamid: self.steamid.clone(),
            logid: self.logid.clone(),
            logdate_txt: nonempty_field(&self.payload, "logdate").or_else(|| self.msg_time_iso.clone()),
            text: self.text.clone(),
            payload: self.payload.clone(),
        }
    }
}

pub struct SlursClient {
    opts: SlursOptions,
    transport: Box<dyn SlursTransport>,
}

impl SlursClient {
    pub fn from_env() -> Result<Self> {
        let opts = SlursOptions::from_env();
        let transport = HttpTransport::new(opts.timeout_secs)?;
        Ok(Self::new(opts, Box::new(transport)))
    }

    pub fn new(mut opts: SlursOptions, transport: Box<dyn SlursTransport>) -> Self {
        opts.batch_size = opts.batch_size.clamp(1, MAX_BATCH_SIZE);
        Self { opts, transport }
    }

    /// Fetch flagged messages for the given Steam64 ids between `after`
    /// (inclusive) and `before` (exclusive), both optional ISO-8601 UTC.
    /// A failed batch yields its partial rows and never aborts the run.
    pub async fn fetch_messages(
        &self,
        steamids: &[i64],
        after: Option<&str>,
        before: Option<&str>,
    ) -> Vec<SlurRow> {
        if steamids.is_empty() {
            return Vec::new();
        }
        let mut all: Vec<SlurRow> = Vec::new();
        for chunk in steamids.chunks(self.opts.batch_size) {
            let raw_rows = self.fetch_chunk(chunk, after, before).await;
            all.extend(raw_rows.iter().map(normalize_row));
            // be gentle between chunks too
            if self.opts.sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.opts.sleep_ms)).await;
            }
        }
        info!(rows = all.len(), ids = steamids.len(), "message fetch complete");
        all
    }

    /// One id batch: classified attempt first; on a serverish failure retry
    /// the whole window unclassified and filter locally (fail-closed when the
    /// lexicon is empty).
    async fn fetch_chunk(&self, ids: &[i64], after: Option<&str>, before: Option<&str>) -> Vec<Value> {
        let use_category = self.opts.category.is_some();
        let (ok, rows, last_status) = self.paginate(ids, use_category, after, before).await;
        if ok {
            return rows;
        }

        let serverish = last_status.map(SoftFailure::serverish).unwrap_or(false);
        if use_category && serverish {
            info!(?ids, ?last_status, "fallback: retrying without category");
            let (ok2, rows2, _) = self.paginate(ids, false, after, before).await;
            if ok2 {
                let lexicon = WordList::load(Path::new(&self.opts.lexicon_path), LEXICON_KEYS);
                if lexicon.is_empty() {
                    warn!(?ids, "lexicon empty/missing; discarding fallback rows");
                    return Vec::new();
                }
                let total = rows2.len();
                let filtered: Vec<Value> = rows2
                    .into_iter()
                    .filter(|r| {
                        lexicon.contains_any(r.get("message").and_then(Value::as_str).unwrap_or(""))
                    })
                    .collect();
                info!(kept = filtered.len(), total, "fallback rows filtered by lexicon");
                return filtered;
            }
        }

        // partial rows from the failed paginate are still worth keeping
        rows
    }

    /// Pull pages until one comes back shorter than `limit`. A soft failure
    /// retries the same offset through the backoff schedule; exhausting it
    /// returns the partial rows and the first failure seen at that offset.
    async fn paginate(
        &self,
        ids: &[i64],
        include_category: bool,
        after: Option<&str>,
        before: Option<&str>,
    ) -> (bool, Vec<Value>, Option<SoftFailure>) {
        let mut out: Vec<Value> = Vec::new();
        let mut offset = 0u64;
        loop {
            let rows = match self
                .page_with_retries(ids, include_category, offset, after, before)
                .await
            {
                Ok(rows) => rows,
                Err(first) => {
                    warn!(offset, ?first, "paginate giving up (soft errors)");
                    return (false, out, Some(first));
                }
            };
            let short = (rows.len() as u64) < u64::from(self.opts.limit);
            out.extend(rows);

            // throttle between pages
            if self.opts.sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.opts.sleep_ms)).await;
            }
            if short {
                return (true, out, None);
            }
            offset += u64::from(self.opts.limit);
        }
    }

    async fn page_with_retries(
        &self,
        ids: &[i64],
        include_category: bool,
        offset: u64,
        after: Option<&str>,
        before: Option<&str>,
    ) -> Result<Vec<Value>, SoftFailure> {
        match self.page_request(ids, include_category, offset, after, before).await {
            Ok(rows) => Ok(rows),
            Err(first) => {
                for &delay_s in &self.opts.retries_s {
                    info!(delay_s, offset, "retrying page after soft failure");
                    tokio::time::sleep(Duration::from_secs(delay_s)).await;
                    if let Ok(rows) = self
                        .page_request(ids, include_category, offset, after, before)
                        .await
                    {
                        return Ok(rows);
                    }
                }
                Err(first)
            }
        }
    }

    async fn page_request(
        &self,
        ids: &[i64],
        include_category: bool,
        offset: u64,
        after: Option<&str>,
        before: Option<&str>,
    ) -> Result<Vec<Value>, SoftFailure> {
        let url = self.messages_url(ids, include_category, offset, after, before);
        debug!(%url, "request");
        match self.transport.get_json(&url).await {
            JsonOutcome::Soft(status) => {
                info!(?status, offset, "soft-fail response");
                Err(status)
            }
            JsonOutcome::Json(body) => {
                match body.as_object() {
                    Some(obj) if !obj.is_empty() => {}
                    _ => {
                        info!(offset, "empty response body");
                        return Err(SoftFailure::Empty);
                    }
                }
                // a present-but-malformed `data` reads as an empty last page
                let envelope: MessagesEnvelope = serde_json::from_value(body).unwrap_or_default();
                let rows = envelope.data.unwrap_or_default();
                debug!(items = rows.len(), offset, "response ok");
                Ok(rows)
            }
        }
    }

    fn messages_url(
        &self,
        ids: &[i64],
        include_category: bool,
        offset: u64,
        after: Option<&str>,
        before: Option<&str>,
    ) -> String {
        let mut q: Vec<String> = ids.iter().map(|sid| format!("steamid={sid}")).collect();
        if include_category {
            if let Some(category) = &self.opts.category {
                q.push(format!("category={category}"));
            }
        }
        if let Some(after) = after {
            q.push(format!("after={}", urlencoding::encode(after)));
        }
        if let Some(before) = before {
            q.push(format!("before={}", urlencoding::encode(before)));
        }
        q.push(format!("limit={}", self.opts.limit));
        q.push(format!("offset={offset}"));
        format!("{}/api/messages?{}", self.opts.base_url, q.join("&"))
    }
}

/// Normalize an upstream row. The API has grown several names for the same
/// fields over time; downstream code only ever sees the stable set.
pub fn normalize_row(raw: &Value) -> SlurRow {
    let msg_time_iso = nonempty_field(raw, "msg_time_iso")
        .or_else(|| nonempty_field(raw, "logdate"))
        .or_else(|| nonempty_field(raw, "messagedate"))
        .or_else(|| {
            raw.get("time")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        });
    let text = string_field(raw, "message").or_else(|| string_field(raw, "text"));
    let steamid = nonempty_field(raw, "steamid64").or_else(|| nonempty_field(raw, "steamid"));
    let steamid64 = steamid.as_deref().and_then(|s| {
        if steamid::is_steamid64(s) {
            Some(s.trim().to_string())
        } else {
            steamid::steamid64_from_any(s).map(|v| v.to_string())
        }
    });
    SlurRow {
        steamid,
        steamid64,
        text,
        msg_time_iso,
        logid: string_field(raw, "logid"),
        message_id: string_field(raw, "message_id"),
        payload: raw.clone(),
    }
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(value_to_string)
}

fn nonempty_field(raw: &Value, key: &str) -> Option<String> {
    string_field(raw, key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
