//! In-memory [`Store`] used by unit tests. Mirrors the SQL invariants:
//! roster upserts never null out a stored steamid64, blank names never
//! overwrite, message inserts dedupe on `hash_key`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{MessageRecord, PlayerRecord, RawMessageRow, Store};
use crate::steamid::STEAM64_BASE;

#[derive(Default)]
pub struct MemoryStore {
    pub players: Mutex<BTreeMap<i64, PlayerRecord>>,
    pub raw: Mutex<Vec<RawMessageRow>>,
    pub messages: Mutex<BTreeMap<String, MessageRecord>>,
    pub mark: Mutex<Option<DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn with_players(players: Vec<PlayerRecord>) -> Self {
        let store = Self::default();
        {
            let mut map = store.players.lock().unwrap();
            for p in players {
                map.insert(p.roster_id, p);
            }
        }
        store
    }

    pub fn player(roster_id: i64, steamid64: Option<i64>) -> PlayerRecord {
        PlayerRecord {
            roster_id,
            steamid64,
            current_name: format!("user_{roster_id}"),
            profile_url: None,
            steam_profile_url: None,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn roster_steamids(&self) -> Result<Vec<i64>> {
        let players = self.players.lock().unwrap();
        let mut ids: Vec<i64> = players
            .values()
            .filter_map(|p| p.steamid64)
            .filter(|sid| *sid >= STEAM64_BASE)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn max_roster_id(&self) -> Result<i64> {
        let players = self.players.lock().unwrap();
        Ok(players.keys().next_back().copied().unwrap_or(0))
    }

    async fn upsert_player(&self, player: &PlayerRecord) -> Result<()> {
        let mut players = self.players.lock().unwrap();
        match players.get_mut(&player.roster_id) {
            Some(existing) => {
                if player.steamid64.is_some() {
                    existing.steamid64 = player.steamid64;
                }
                if !player.current_name.trim().is_empty() {
                    existing.current_name = player.current_name.trim().to_string();
                }
                if player.profile_url.is_some() {
                    existing.profile_url = player.profile_url.clone();
                }
                if player.steam_profile_url.is_some() {
                    existing.steam_profile_url = player.steam_profile_url.clone();
                }
            }
            None => {
                players.insert(player.roster_id, player.clone());
            }
        }
        Ok(())
    }

    async fn insert_raw_messages(&self, rows: &[RawMessageRow]) -> Result<u64> {
        let mut raw = self.raw.lock().unwrap();
        raw.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn insert_message_if_absent(&self, row: &MessageRecord) -> Result<bool> {
        let mut messages = self.messages.lock().unwrap();
        if messages.contains_key(&row.hash_key) {
            return Ok(false);
        }
        messages.insert(row.hash_key.clone(), row.clone());
        Ok(true)
    }

    async fn watermark(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.mark.lock().unwrap())
    }

    async fn set_watermark(&self, at: DateTime<Utc>) -> Result<()> {
        *self.mark.lock().unwrap() = Some(at);
        Ok(())
    }
}
