use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use slursbot::db::{Db, Store};
use slursbot::ingest;
use slursbot::notify;
use slursbot::ozf::{self, HttpProfileProbe, RefreshOptions};
use slursbot::slurs::SlursClient;
use slursbot::util::env as env_util;
use slursbot::wordlist::DropFilter;

#[derive(Parser, Debug)]
#[command(name = "slursbot", version, about = "slurs.tf OZF ingest")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull messages from the API and load them into SQL
    Pull {
        /// ISO8601 UTC start (e.g. 2025-09-15T00:00:00Z); defaults to the stored watermark
        #[arg(long)]
        since: Option<String>,
        /// ISO8601 UTC end (e.g. 2025-09-16T00:00:00Z)
        #[arg(long)]
        before: Option<String>,
    },
    /// Refresh the league roster by forward-scanning profile ids
    RosterRefresh,
    /// Roster refresh, pull over the lookback window, webhook, watermark
    RunDaily,
    /// Light probe of roster + API connectivity
    Probe,
    /// Heavier health check (no writes)
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    slursbot::tracing::init_tracing("info")?;
    let cli = Cli::parse();

    let db_url = env_util::env_req("DATABASE_URL")?;
    let db = Db::connect(&db_url, 5).await?;

    if let Err(e) = run(cli.command, &db).await {
        error!(error = ?e, "job failed");
        notify::post_error(&e.to_string()).await;
        return Err(e);
    }
    Ok(())
}

async fn run(command: Command, db: &Db) -> Result<()> {
    match command {
        Command::Pull { since, before } => {
            let client = SlursClient::from_env()?;
            let since = ingest::resolve_since(db, since).await;
            let summary = ingest::run_pull(
                db,
                &client,
                since.as_deref(),
                before.as_deref(),
                &DropFilter::from_env(),
            )
            .await?;
            info!(
                raw = summary.raw_inserted,
                inserted = summary.inserted,
                "pull completed"
            );
        }
        Command::RosterRefresh => {
            let probe = probe_from_env()?;
            let summary = ozf::refresh(&probe, db, &RefreshOptions::from_env()).await?;
            notify::post_roster_summary(&summary).await;
            info!(
                checked = summary.checked,
                changed = summary.changed,
                "roster refresh completed"
            );
        }
        Command::RunDaily => {
            let client = SlursClient::from_env()?;
            let probe = probe_from_env()?;
            let summary = ingest::run_daily(db, &client, &probe).await?;
            info!(upserted = summary.inserted, "run-daily complete");
        }
        Command::Probe => run_probe(db).await,
        Command::Health => run_health(db).await?,
    }
    Ok(())
}

fn probe_from_env() -> Result<HttpProfileProbe> {
    let base_url = env_util::env_opt("OZF_BASE_URL");
    let timeout_secs = env_util::env_parse("OZF_HTTP_TIMEOUT_S", 30u64);
    HttpProfileProbe::new(base_url.as_deref(), timeout_secs)
}

async fn run_probe(db: &Db) {
    let ids = match db.roster_steamids().await {
        Ok(ids) => {
            info!(count = ids.len(), "probe roster ok");
            ids
        }
        Err(e) => {
            warn!(error = %e, "probe roster failed");
            Vec::new()
        }
    };
    match SlursClient::from_env() {
        Ok(client) => {
            let sample: Vec<i64> = ids.into_iter().take(5).collect();
            let rows = client.fetch_messages(&sample, None, None).await;
            info!(rows = rows.len(), "probe slurs api ok");
        }
        Err(e) => warn!(error = %e, "probe client build failed"),
    }
}

async fn run_health(db: &Db) -> Result<()> {
    let ids = db.roster_steamids().await?;
    if ids.is_empty() {
        anyhow::bail!("health: db reachable but roster is empty");
    }
    info!(count = ids.len(), "db ok");
    let client = SlursClient::from_env()?;
    let rows = client.fetch_messages(&ids[..1], None, None).await;
    info!(rows = rows.len(), "api probe rows");
    Ok(())
}
