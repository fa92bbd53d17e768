//! ozfortress roster discovery.
//!
//! Profile ids on the league site are assigned densely and forward-only, so
//! new players are found by probing `max(roster_id) + 1 ..` until a long run
//! of 404s marks the frontier. Each found profile is upserted immediately so
//! a mid-run crash loses at most the id in flight.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use reqwest::{Client, StatusCode};
use tracing::{info, warn};

use crate::db::{PlayerRecord, Store};
use crate::util::env::env_parse;

const DEFAULT_BASE_URL: &str = "https://ozfortress.com";
const USER_AGENT: &str = "slursbot/1.1 (+ozfortress roster refresh)";

/// Result of probing one roster id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Profile page does not exist (HTTP 404).
    NotFound,
    Found(PlayerProfile),
}

/// What a profile page yields. Both the Steam link and the display name are
/// optional on the page; the persistence layer applies the placeholder-name
/// rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerProfile {
    pub roster_id: i64,
    pub steamid64: Option<i64>,
    pub current_name: Option<String>,
    pub profile_url: String,
    pub steam_profile_url: Option<String>,
}

impl PlayerProfile {
    pub fn into_record(self) -> PlayerRecord {
        let current_name = self
            .current_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("user_{}", self.roster_id));
        PlayerRecord {
            roster_id: self.roster_id,
            steamid64: self.steamid64,
            current_name,
            profile_url: Some(self.profile_url),
            steam_profile_url: self.steam_profile_url,
        }
    }
}

#[async_trait]
pub trait ProfileProbe: Send + Sync {
    /// Fetch and classify one profile page. Transport failures and
    /// unexpected statuses surface as errors; the probe itself never retries.
    async fn probe(&self, roster_id: i64) -> Result<ProbeOutcome>;
}

pub struct HttpProfileProbe {
    base_url: String,
    http: Client,
    re_steam: Regex,
    re_name: Regex,
    re_tag: Regex,
}

impl HttpProfileProbe {
    pub fn new(base_url: Option<&str>, timeout_secs: u64) -> Result<Self> {
        let base_url = base_url
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        let re_steam = RegexBuilder::new(r"https?://steamcommunity\.com/profiles/(\d{17})")
            .case_insensitive(true)
            .build()?;
        let re_name = RegexBuilder::new(r"<h1[^>]*>(.*?)</h1>")
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()?;
        let re_tag = Regex::new(r"<[^>]+>")?;
        Ok(Self {
            base_url,
            http,
            re_steam,
            re_name,
            re_tag,
        })
    }

    fn parse_profile(&self, roster_id: i64, profile_url: String, html: &str) -> PlayerProfile {
        // first profiles/ link wins; a page without one is a valid unlinked profile
        let steamid64 = self
            .re_steam
            .captures(html)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<i64>().ok());
        let current_name = self
            .re_name
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| self.re_tag.replace_all(m.as_str(), "").trim().to_string())
            .filter(|n| !n.is_empty());
        let steam_profile_url =
            steamid64.map(|sid| format!("https://steamcommunity.com/profiles/{sid}"));
        PlayerProfile {
            roster_id,
            steamid64,
            current_name,
            profile_url,
            steam_profile_url,
        }
    }
}

#[async_trait]
impl ProfileProbe for HttpProfileProbe {
    async fn probe(&self, roster_id: i64) -> Result<ProbeOutcome> {
        let url = format!("{}/users/{}", self.base_url, roster_id);
        let resp = self
            .http
            .get(&url)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header("Referer", format!("{}/", self.base_url))
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(ProbeOutcome::NotFound);
        }
        if !resp.status().is_success() {
            anyhow::bail!("unexpected HTTP {} for {url}", resp.status());
        }
        let html = resp.text().await.with_context(|| format!("body of {url}"))?;
        Ok(ProbeOutcome::Found(self.parse_profile(roster_id, url, &html)))
    }
}

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    /// Upper bound on ids probed per run.
    pub max_probe: u32,
    /// Consecutive 404s that end the scan early.
    pub stop_after_miss: u32,
    /// Politeness delay between probes (not a correctness requirement).
    pub sleep_ms: u64,
    /// In-run retries for a transiently failing probe before its id is skipped.
    pub transient_retries: u32,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            max_probe: 300,
            stop_after_miss: 20,
            sleep_ms: 200,
            transient_retries: 2,
        }
    }
}

impl RefreshOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_probe: env_parse("OZF_REFRESH_PROBE", defaults.max_probe),
            stop_after_miss: env_parse("OZF_REFRESH_404_STREAK", defaults.stop_after_miss),
            sleep_ms: env_parse("OZF_REFRESH_SLEEP_MS", defaults.sleep_ms),
            transient_retries: env_parse("OZF_REFRESH_RETRIES", defaults.transient_retries),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RefreshSummary {
    pub checked: u64,
    pub changed: u64,
}

/// Forward-scan the roster id space from the stored maximum and upsert every
/// profile found. Stops on the miss-streak threshold or when the probe budget
/// runs out, whichever comes first.
pub async fn refresh(
    probe: &dyn ProfileProbe,
    store: &dyn Store,
    opts: &RefreshOptions,
) -> Result<RefreshSummary> {
    let base = store.max_roster_id().await?;
    let mut checked = 0u64;
    let mut changed = 0u64;
    let mut miss_streak = 0u32;

    info!(base, max_probe = opts.max_probe, "roster refresh: scanning forward");
    for i in 1..=i64::from(opts.max_probe) {
        let roster_id = base + i;
        let outcome = probe_with_retries(probe, roster_id, opts).await;
        checked += 1;

        match outcome {
            Some(ProbeOutcome::Found(profile)) => {
                miss_streak = 0;
                let record = profile.into_record();
                store.upsert_player(&record).await?;
                changed += 1;
                info!(
                    roster_id,
                    steamid64 = ?record.steamid64,
                    name = %record.current_name,
                    "roster profile upserted"
                );
            }
            Some(ProbeOutcome::NotFound) => {
                miss_streak += 1;
                info!(roster_id, streak = miss_streak, "profile not found");
                if miss_streak >= opts.stop_after_miss {
                    info!(streak = miss_streak, "stopping after consecutive misses");
                    break;
                }
            }
            // transient failure even after retries: skip the id without
            // touching the streak or the found count
            None => warn!(roster_id, "probe failed after retries; skipping id"),
        }

        if opts.sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(opts.sleep_ms)).await;
        }
    }

    info!(checked, changed, "roster refresh done");
    Ok(RefreshSummary { checked, changed })
}

async fn probe_with_retries(
    probe: &dyn ProfileProbe,
    roster_id: i64,
    opts: &RefreshOptions,
) -> Option<ProbeOutcome> {
    let mut attempts = 0u32;
    loop {
        match probe.probe(roster_id).await {
            Ok(outcome) => return Some(outcome),
            Err(e) => {
                attempts += 1;
                if attempts > opts.transient_retries {
                    warn!(roster_id, error = %e, "probe transport failure; giving up on id");
                    return None;
                }
                warn!(
                    roster_id,
                    attempt = attempts,
                    error = %e,
                    "probe transport failure; retrying"
                );
                if opts.sleep_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(opts.sleep_ms)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::steamid::STEAM64_BASE;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone)]
    enum Step {
        Found(Option<i64>),
        Missing,
        Fail,
    }

    /// Probe driven by a per-id script; ids without a script are Missing.
    struct ScriptedProbe {
        script: Mutex<HashMap<i64, Vec<Step>>>,
        visits: Mutex<Vec<i64>>,
    }

    impl ScriptedProbe {
        fn new(script: Vec<(i64, Vec<Step>)>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                visits: Mutex::new(Vec::new()),
            }
        }

        fn visits(&self) -> Vec<i64> {
            self.visits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProfileProbe for ScriptedProbe {
        async fn probe(&self, roster_id: i64) -> Result<ProbeOutcome> {
            self.visits.lock().unwrap().push(roster_id);
            let step = {
                let mut script = self.script.lock().unwrap();
                match script.get_mut(&roster_id) {
                    Some(steps) if !steps.is_empty() => steps.remove(0),
                    _ => Step::Missing,
                }
            };
            match step {
                Step::Missing => Ok(ProbeOutcome::NotFound),
                Step::Fail => Err(anyhow::anyhow!("connection reset")),
                Step::Found(steamid64) => Ok(ProbeOutcome::Found(PlayerProfile {
                    roster_id,
                    steamid64,
                    current_name: Some(format!("player {roster_id}")),
                    profile_url: format!("https://ozfortress.test/users/{roster_id}"),
                    steam_profile_url: None,
                })),
            }
        }
    }

    fn quiet_opts() -> RefreshOptions {
        RefreshOptions {
            max_probe: 300,
            stop_after_miss: 20,
            sleep_ms: 0,
            transient_retries: 2,
        }
    }

    #[tokio::test]
    async fn stops_after_exactly_twenty_misses() {
        let store = MemoryStore::with_players(vec![
            MemoryStore::player(1, Some(STEAM64_BASE + 1)),
            MemoryStore::player(2, Some(STEAM64_BASE + 2)),
            MemoryStore::player(3, Some(STEAM64_BASE + 3)),
        ]);
        let probe = ScriptedProbe::new(vec![]);

        let summary = refresh(&probe, &store, &quiet_opts()).await.unwrap();

        assert_eq!(summary.checked, 20);
        assert_eq!(summary.changed, 0);
        // ids 4..=23 each probed exactly once, starting from max+1
        assert_eq!(probe.visits(), (4..=23).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn found_resets_the_miss_streak() {
        // 19 misses, a hit, then misses until the threshold trips again
        let store = MemoryStore::default();
        let probe = ScriptedProbe::new(vec![(20, vec![Step::Found(Some(STEAM64_BASE + 9))])]);
        let summary = refresh(&probe, &store, &quiet_opts()).await.unwrap();

        // 19 misses + 1 found + 20 misses
        assert_eq!(summary.checked, 40);
        assert_eq!(summary.changed, 1);
        assert_eq!(
            store.players.lock().unwrap().get(&20).unwrap().steamid64,
            Some(STEAM64_BASE + 9)
        );
    }

    #[tokio::test]
    async fn probe_budget_bounds_the_scan() {
        let store = MemoryStore::default();
        let probe = ScriptedProbe::new(vec![]);
        let opts = RefreshOptions {
            max_probe: 5,
            ..quiet_opts()
        };

        let summary = refresh(&probe, &store, &opts).await.unwrap();
        assert_eq!(summary.checked, 5);
        assert_eq!(probe.visits().len(), 5);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_skipped() {
        let store = MemoryStore::default();
        // id 1 fails once then succeeds; id 2 always fails
        let probe = ScriptedProbe::new(vec![
            (1, vec![Step::Fail, Step::Found(Some(STEAM64_BASE + 5))]),
            (2, vec![Step::Fail, Step::Fail, Step::Fail, Step::Fail]),
            (3, vec![Step::Found(None)]),
        ]);
        let opts = RefreshOptions {
            max_probe: 3,
            transient_retries: 2,
            ..quiet_opts()
        };

        let summary = refresh(&probe, &store, &opts).await.unwrap();

        // all three ids checked; id 2's failure affects neither count
        assert_eq!(summary.checked, 3);
        assert_eq!(summary.changed, 2);
        let players = store.players.lock().unwrap();
        assert!(players.contains_key(&1));
        assert!(!players.contains_key(&2));
        assert!(players.contains_key(&3));
    }

    #[tokio::test]
    async fn unlinked_profile_counts_as_found() {
        let store = MemoryStore::default();
        let probe = ScriptedProbe::new(vec![(1, vec![Step::Found(None)])]);
        let opts = RefreshOptions {
            max_probe: 1,
            ..quiet_opts()
        };

        let summary = refresh(&probe, &store, &opts).await.unwrap();
        assert_eq!(summary.changed, 1);
        assert_eq!(store.players.lock().unwrap().get(&1).unwrap().steamid64, None);
    }

    #[test]
    fn profile_without_name_gets_placeholder() {
        let profile = PlayerProfile {
            roster_id: 77,
            steamid64: None,
            current_name: Some("   ".into()),
            profile_url: "https://ozfortress.test/users/77".into(),
            steam_profile_url: None,
        };
        assert_eq!(profile.into_record().current_name, "user_77");
    }

    #[test]
    fn parse_profile_extracts_steam_link_and_name() {
        let probe = HttpProfileProbe::new(Some("https://ozfortress.test"), 5).unwrap();
        let html = r#"
            <html><body>
            <h1 class="profile">  <span>Sn&amp;pe</span> jane  </h1>
            <a href="https://steamcommunity.com/profiles/76561197994110447">steam</a>
            </body></html>"#;
        let profile =
            probe.parse_profile(9, "https://ozfortress.test/users/9".into(), html);
        assert_eq!(profile.steamid64, Some(76_561_197_994_110_447));
        assert_eq!(profile.current_name.as_deref(), Some("Sn&amp;pe jane"));
        assert_eq!(
            profile.steam_profile_url.as_deref(),
            Some("https://steamcommunity.com/profiles/76561197994110447")
        );
    }

    #[test]
    fn parse_profile_tolerates_missing_pieces() {
        let probe = HttpProfileProbe::new(None, 5).unwrap();
        let profile = probe.parse_profile(9, "u".into(), "<html><body>nothing</body></html>");
        assert_eq!(profile.steamid64, None);
        assert_eq!(profile.current_name, None);
        assert_eq!(profile.steam_profile_url, None);
    }
}
