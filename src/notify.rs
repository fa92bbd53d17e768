//! Webhook notification sink.
//!
//! Carries summary counts only; anything heavier than a JSON POST (embeds,
//! report rendering) lives outside this repo. Every failure here is logged
//! and swallowed: notifications must never fail a run.

use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::ingest::PullSummary;
use crate::ozf::RefreshSummary;
use crate::util::env::{env_opt, env_parse};

pub async fn post_roster_summary(summary: &RefreshSummary) {
    let body = json!({
        "content": format!(
            "roster refresh: checked={} changed={}",
            summary.checked, summary.changed
        ),
    });
    post("roster summary", body).await;
}

pub async fn post_pull_summary(summary: &PullSummary) {
    let body = json!({
        "content": format!(
            "pull: fetched={} raw={} inserted={} dup={} invalid={}",
            summary.fetched,
            summary.raw_inserted,
            summary.inserted,
            summary.skipped_duplicate,
            summary.skipped_invalid
        ),
    });
    post("pull summary", body).await;
}

pub async fn post_error(message: &str) {
    let body = json!({ "content": format!("job failed: {message}") });
    post("error", body).await;
}

async fn post(what: &str, body: serde_json::Value) {
    let Some(url) = env_opt("WEBHOOK_URL") else {
        info!(what, "WEBHOOK_URL unset; skipping webhook post");
        return;
    };
    let timeout = Duration::from_secs(env_parse("WEBHOOK_TIMEOUT_S", 10u64));
    let send = async {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let resp = client.post(&url).json(&body).send().await?;
        anyhow::Ok(resp.status())
    };
    match send.await {
        Ok(status) if status.is_success() => info!(what, "webhook posted"),
        Ok(status) => warn!(what, code = status.as_u16(), "webhook post rejected"),
        Err(e) => warn!(what, error = %e, "webhook post failed"),
    }
}
