use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use flk_adapters::AdapterRegistry;
use flk_core::PlatformName;
use flk_store::{DocumentStore, MemoryStore};
use flk_sync::{ConnectUser, SyncConfig, SyncService};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "flk-cli")]
#[command(about = "Fantasy League Keeper command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Group every league under its persistent master identity.
    MigrateBulk { season: i32 },
    /// Migrate one league by id.
    MigrateLeague {
        league_id: Uuid,
        #[arg(long)]
        season: Option<i32>,
    },
    /// Fetch and persist one league's trades.
    SyncTrades {
        league_id: Uuid,
        #[arg(long)]
        external_league_id: Option<String>,
    },
    /// Connect a platform league: upsert league + teams and bind a user.
    Connect {
        platform: String,
        name: String,
        external_league_id: String,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        external_user_id: Option<String>,
        #[arg(long)]
        external_team_id: Option<String>,
    },
    /// Serve the JSON API (and the refresh scheduler when enabled).
    Serve,
}

fn build_service() -> Result<SyncService> {
    let config = SyncConfig::from_env();
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    SyncService::new(config, store, AdapterRegistry::with_defaults())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let service = build_service()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::MigrateBulk { season } => {
            let stats = service.run_bulk_migration(season).await?;
            println!(
                "bulk migration complete: run_id={} leagues={} masters_created={} errors={}",
                stats.run_id,
                stats.leagues_processed,
                stats.league_masters_created,
                stats.errors.len()
            );
            for error in &stats.errors {
                eprintln!("  {error}");
            }
        }
        Commands::MigrateLeague { league_id, season } => {
            let stats = service.run_single_league_migration(league_id, season).await?;
            println!(
                "league migration: success={} message={} teams_updated={} user_teams_updated={}",
                stats.success, stats.message, stats.teams_updated, stats.user_teams_updated
            );
        }
        Commands::SyncTrades {
            league_id,
            external_league_id,
        } => {
            let summary = service
                .sync_trades(league_id, external_league_id.as_deref())
                .await?;
            println!(
                "trade sync complete: fetched={} created={} updated={}",
                summary.fetched, summary.created, summary.updated
            );
        }
        Commands::Connect {
            platform,
            name,
            external_league_id,
            user_id,
            external_user_id,
            external_team_id,
        } => {
            let platform = PlatformName::parse(&platform)
                .ok_or_else(|| anyhow::anyhow!("unknown platform: {platform}"))?;
            let user = user_id.map(|user_id| ConnectUser {
                user_id,
                external_user_id,
                external_team_id,
                credential: None,
            });
            let league = service
                .connect_league(platform, &name, &external_league_id, user)
                .await?;
            println!(
                "connected league: id={} name={} season={:?} master={:?}",
                league.id, league.name, league.season, league.league_master_id
            );
        }
        Commands::Serve => {
            let scheduler = service.maybe_build_scheduler().await?;
            if let Some(mut scheduler) = scheduler {
                scheduler.start().await?;
            }
            flk_web::serve_from_env(service).await?;
        }
    }

    Ok(())
}
