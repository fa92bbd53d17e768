use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tracing::{info, instrument};

use super::{MessageRecord, PlayerRecord, RawMessageRow, Store};
use crate::steamid::STEAM64_BASE;
use crate::util::env::env_flag;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to db");

        // The schema is owned by this tool, so migrations default to on;
        // disable explicitly with AUTO_MIGRATE=0 when pointing at a managed copy.
        if env_flag("AUTO_MIGRATE", true) {
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("migrations applied");
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for Db {
    async fn roster_steamids(&self) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT steamid64 FROM players \
             WHERE steamid64 IS NOT NULL AND steamid64 >= $1 \
             ORDER BY steamid64",
        )
        .persistent(false)
        .bind(STEAM64_BASE)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn max_roster_id(&self) -> Result<i64> {
        let max: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(roster_id), 0) FROM players")
            .persistent(false)
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }

    async fn upsert_player(&self, player: &PlayerRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO players \
               (roster_id, steamid64, current_name, profile_url, steam_profile_url, \
                created_at, updated_at, last_checked_at) \
             VALUES ($1, $2, $3, $4, $5, now(), now(), now()) \
             ON CONFLICT (roster_id) DO UPDATE SET \
               steamid64         = COALESCE(EXCLUDED.steamid64, players.steamid64), \
               current_name      = CASE WHEN btrim(EXCLUDED.current_name) <> '' \
                                        THEN btrim(EXCLUDED.current_name) \
                                        ELSE players.current_name END, \
               profile_url       = COALESCE(EXCLUDED.profile_url, players.profile_url), \
               steam_profile_url = COALESCE(EXCLUDED.steam_profile_url, players.steam_profile_url), \
               updated_at        = now(), \
               last_checked_at   = now()",
        )
        .persistent(false)
        .bind(player.roster_id)
        .bind(player.steamid64)
        .bind(&player.current_name)
        .bind(&player.profile_url)
        .bind(&player.steam_profile_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_raw_messages(&self, rows: &[RawMessageRow]) -> Result<u64> {
        let mut written = 0u64;
        for row in rows {
            sqlx::query(
                "INSERT INTO messages_raw \
                   (source, message_id, steamid, logid, logdate_txt, text, payload) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .persistent(false)
            .bind(&row.source)
            .bind(&row.message_id)
            .bind(&row.steamid)
            .bind(&row.logid)
            .bind(&row.logdate_txt)
            .bind(&row.text)
            .bind(&row.payload)
            .execute(&self.pool)
            .await?;
            written += 1;
        }
        Ok(written)
    }

    async fn insert_message_if_absent(&self, row: &MessageRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO messages \
               (hash_key, message_id, steamid64, logid, msg_time_utc, msg_time_iso, text) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (hash_key) DO NOTHING",
        )
        .persistent(false)
        .bind(&row.hash_key)
        .bind(&row.message_id)
        .bind(row.steamid64)
        .bind(row.logid)
        .bind(row.msg_time_utc)
        .bind(&row.msg_time_iso)
        .bind(&row.text)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn watermark(&self) -> Result<Option<DateTime<Utc>>> {
        let at: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT last_success_utc FROM ingest_state WHERE id = 1")
                .persistent(false)
                .fetch_optional(&self.pool)
                .await?;
        Ok(at.flatten())
    }

    async fn set_watermark(&self, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingest_state (id, last_success_utc, updated_at) \
             VALUES (1, $1, now()) \
             ON CONFLICT (id) DO UPDATE SET \
               last_success_utc = EXCLUDED.last_success_utc, \
               updated_at       = now()",
        )
        .persistent(false)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
