//! Reconciliation/migration engine, staleness policy, and sync orchestration.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Datelike, Utc, Weekday};
use flk_adapters::{AdapterError, AdapterRegistry};
use flk_core::{
    collections, League, LeagueMaster, PlatformName, Team, Trade, UserTeam,
};
use flk_store::{
    encode_entity, get_typed, query_typed, BackoffPolicy, DocumentStore, HttpClientConfig,
    HttpFetcher, Query, StoreError, WriteBatch, WriteOp, MAX_BATCH_OPS,
};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flk-sync";

/// Cached team data older than this is stale regardless of the key-time
/// table.
pub const STALENESS_WINDOW_HOURS: i64 = 24;

/// Read-path threshold: teams read with a `last_fetched` older than this get
/// an opportunistic fire-and-forget bump.
pub const TOUCH_THRESHOLD_MINUTES: i64 = 10;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("league {0} already migrated")]
    AlreadyMigrated(Uuid),
    #[error("no adapter registered for platform {0}")]
    UnsupportedPlatform(PlatformName),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub current_season: i32,
    pub pacing_delay_ms: u64,
    pub refresh_batch_size: usize,
    pub scheduler_enabled: bool,
    pub refresh_crons: Vec<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub reports_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            current_season: Utc::now().year(),
            pacing_delay_ms: 1_000,
            refresh_batch_size: 5,
            scheduler_enabled: false,
            // Shortly after each broadcast window closes.
            refresh_crons: vec![
                "0 30 0 * * Fri".to_string(),
                "0 0 22 * * Sun".to_string(),
                "0 30 0 * * Mon".to_string(),
                "0 30 0 * * Tue".to_string(),
            ],
            user_agent: "flk-bot/0.1".to_string(),
            http_timeout_secs: 20,
            reports_dir: PathBuf::from("./reports"),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            current_season: std::env::var("FLK_CURRENT_SEASON")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.current_season),
            pacing_delay_ms: std::env::var("FLK_PACING_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.pacing_delay_ms),
            refresh_batch_size: std::env::var("FLK_REFRESH_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.refresh_batch_size),
            scheduler_enabled: std::env::var("FLK_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_crons: std::env::var("FLK_REFRESH_CRONS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.refresh_crons),
            user_agent: std::env::var("FLK_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("FLK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            reports_dir: std::env::var("FLK_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStats {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub season: i32,
    pub leagues_processed: usize,
    pub league_masters_created: usize,
    pub leagues_updated: usize,
    pub teams_processed: usize,
    pub teams_updated: usize,
    pub user_teams_processed: usize,
    pub user_teams_updated: usize,
    pub errors: Vec<String>,
}

impl MigrationStats {
    fn begin(season: i32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            season,
            leagues_processed: 0,
            league_masters_created: 0,
            leagues_updated: 0,
            teams_processed: 0,
            teams_updated: 0,
            user_teams_processed: 0,
            user_teams_updated: 0,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SingleLeagueStats {
    pub success: bool,
    pub message: String,
    pub league_id: Uuid,
    pub season: Option<i32>,
    pub league_master_id: Option<Uuid>,
    pub league_master_created: bool,
    pub teams_updated: usize,
    pub user_teams_updated: usize,
    pub errors: Vec<String>,
}

impl SingleLeagueStats {
    fn refused(league_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            league_id,
            season: None,
            league_master_id: None,
            league_master_created: false,
            teams_updated: 0,
            user_teams_updated: 0,
            errors: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Staleness policy
// ---------------------------------------------------------------------------

/// A weekly broadcast window boundary, UTC. Cached data fetched before the
/// most recent key time is presumed stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTime {
    pub weekday: Weekday,
    pub hour: u32,
    pub minute: u32,
}

/// Weekly slate boundaries: Thursday night, the two Sunday windows, Sunday
/// night, and Monday night, all expressed in UTC (hence the day shifts).
pub const KEY_TIMES: &[KeyTime] = &[
    KeyTime { weekday: Weekday::Fri, hour: 0, minute: 20 },
    KeyTime { weekday: Weekday::Sun, hour: 17, minute: 0 },
    KeyTime { weekday: Weekday::Sun, hour: 20, minute: 25 },
    KeyTime { weekday: Weekday::Mon, hour: 0, minute: 20 },
    KeyTime { weekday: Weekday::Tue, hour: 0, minute: 15 },
];

/// The latest key time at or before `now`, searching back across week
/// boundaries.
pub fn most_recent_key_time(now: DateTime<Utc>) -> DateTime<Utc> {
    for days_back in 0..8 {
        let date = (now - chrono::Duration::days(days_back)).date_naive();
        let mut candidates: Vec<DateTime<Utc>> = KEY_TIMES
            .iter()
            .filter(|key| key.weekday == date.weekday())
            .filter_map(|key| date.and_hms_opt(key.hour, key.minute, 0))
            .map(|naive| naive.and_utc())
            .filter(|t| *t <= now)
            .collect();
        candidates.sort();
        if let Some(latest) = candidates.pop() {
            return latest;
        }
    }
    // The table spans the week, so this only guards an empty table.
    now - chrono::Duration::days(7)
}

/// Pure staleness decision: only current-season teams refresh, and they do
/// when never fetched, fetched before the last key time, or outside the
/// staleness window.
pub fn needs_update(team: &Team, now: DateTime<Utc>, current_season: i32) -> bool {
    if team.season != Some(current_season) {
        return false;
    }
    match team.last_fetched {
        None => true,
        Some(fetched) => {
            fetched < most_recent_key_time(now)
                || now - fetched > chrono::Duration::hours(STALENESS_WINDOW_HOURS)
        }
    }
}

/// A record missing its season or league master predates the identity
/// migration.
pub fn needs_migrate(team: &Team) -> bool {
    team.season.is_none() || team.league_master_id.is_none()
}

// ---------------------------------------------------------------------------
// Contention monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ContentionEvent {
    pub at: DateTime<Utc>,
    pub league_key: String,
    pub operation: String,
    pub error_code: String,
    pub message: String,
    pub retry_count: u32,
    pub batch_size: usize,
}

/// Append-only, bounded ring of write-conflict events plus a durable log in
/// the store. Purely observational: it never changes retry or commit
/// behavior.
#[derive(Debug)]
pub struct ContentionMonitor {
    capacity: usize,
    ring: StdMutex<VecDeque<ContentionEvent>>,
}

impl ContentionMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: StdMutex::new(VecDeque::new()),
        }
    }

    pub async fn record(&self, store: &dyn DocumentStore, event: ContentionEvent) {
        {
            let mut ring = self.ring.lock().expect("monitor ring lock");
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        let mut batch = WriteBatch::new();
        match encode_entity(&event) {
            Ok(data) => {
                batch.set(
                    collections::CONTENTION_LOG,
                    Uuid::new_v4().to_string(),
                    data,
                );
                if let Err(err) = store.commit(batch).await {
                    warn!(%err, "failed to persist contention event");
                }
            }
            Err(err) => warn!(%err, "failed to encode contention event"),
        }
    }

    pub fn events(&self) -> Vec<ContentionEvent> {
        self.ring
            .lock()
            .expect("monitor ring lock")
            .iter()
            .cloned()
            .collect()
    }

    pub fn counts_by_league(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for event in self.events() {
            *counts.entry(event.league_key).or_default() += 1;
        }
        counts
    }

    pub fn counts_by_operation(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for event in self.events() {
            *counts.entry(event.operation).or_default() += 1;
        }
        counts
    }
}

/// Call-site retry policy for contended batch commits. The monitor records
/// every conflict; the policy alone decides whether to try again.
pub async fn commit_with_retry(
    store: &dyn DocumentStore,
    monitor: &ContentionMonitor,
    league_key: &str,
    operation: &str,
    batch: WriteBatch,
) -> Result<(), StoreError> {
    let policy = BackoffPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(1),
    };
    let batch_size = batch.len();

    for attempt in 0..=policy.max_retries {
        match store.commit(batch.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_contention() => {
                monitor
                    .record(
                        store,
                        ContentionEvent {
                            at: Utc::now(),
                            league_key: league_key.to_string(),
                            operation: operation.to_string(),
                            error_code: "contention".to_string(),
                            message: err.to_string(),
                            retry_count: attempt as u32,
                            batch_size,
                        },
                    )
                    .await;
                if attempt == policy.max_retries {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }

    unreachable!("retry loop returns on success or final failure")
}

// ---------------------------------------------------------------------------
// Migration engine
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MigrationEngine {
    store: Arc<dyn DocumentStore>,
    monitor: Arc<ContentionMonitor>,
}

struct GroupOutcome {
    master_created: bool,
    leagues_updated: usize,
    leagues: Vec<League>,
    errors: Vec<String>,
}

impl MigrationEngine {
    pub fn new(store: Arc<dyn DocumentStore>, monitor: Arc<ContentionMonitor>) -> Self {
        Self { store, monitor }
    }

    async fn find_master(
        &self,
        platform: PlatformName,
        external_league_id: &str,
    ) -> Result<Option<LeagueMaster>, StoreError> {
        let mut masters: Vec<LeagueMaster> = query_typed(
            self.store.as_ref(),
            collections::LEAGUE_MASTERS,
            Query::new()
                .filter_eq("platform.name", platform.as_str())
                .filter_eq("external_league_id", external_league_id),
        )
        .await?;
        Ok(if masters.is_empty() {
            None
        } else {
            Some(masters.remove(0))
        })
    }

    /// Migrate one group of Leagues sharing the canonical grouping key:
    /// lookup-or-create the LeagueMaster, then stamp every member with the
    /// master id and the supplied season in one batch.
    async fn migrate_group(
        &self,
        key: &str,
        members: Vec<League>,
        season: i32,
    ) -> Result<GroupOutcome, SyncError> {
        let template = members
            .first()
            .ok_or_else(|| SyncError::NotFound(format!("league group {key}")))?
            .clone();
        let now = Utc::now();

        let (master, master_created) = match self
            .find_master(template.platform.name, &template.external_league_id)
            .await?
        {
            Some(master) => (master, false),
            None => (
                LeagueMaster {
                    id: Uuid::new_v4(),
                    name: template.name.clone(),
                    platform: template.platform.clone(),
                    external_league_id: template.external_league_id.clone(),
                    creator_user_id: None,
                    created_at: now,
                    last_modified: now,
                },
                true,
            ),
        };

        let mut outcome = GroupOutcome {
            master_created,
            leagues_updated: 0,
            leagues: Vec::new(),
            errors: Vec::new(),
        };

        let mut batch = WriteBatch::new();
        if master_created {
            batch.set(
                collections::LEAGUE_MASTERS,
                master.id.to_string(),
                encode_entity(&master)?,
            );
        } else {
            batch.update(
                collections::LEAGUE_MASTERS,
                master.id.to_string(),
                json!({ "last_modified": now }),
            );
        }

        for mut league in members {
            match league.league_master_id {
                Some(existing) if existing != master.id => {
                    outcome.errors.push(format!(
                        "league {} already references master {existing}, expected {}",
                        league.id, master.id
                    ));
                }
                _ => {
                    let unchanged = league.league_master_id == Some(master.id)
                        && league.season == Some(season);
                    if !unchanged {
                        league.league_master_id = Some(master.id);
                        league.season = Some(season);
                        league.last_modified = now;
                        batch.update(
                            collections::LEAGUES,
                            league.id.to_string(),
                            json!({
                                "league_master_id": master.id,
                                "season": season,
                                "last_modified": now,
                            }),
                        );
                        outcome.leagues_updated += 1;
                    }
                }
            }
            outcome.leagues.push(league);
        }

        commit_with_retry(
            self.store.as_ref(),
            &self.monitor,
            key,
            "migrate_league_group",
            batch,
        )
        .await?;
        Ok(outcome)
    }

    /// Commit accumulated update ops in ceiling-sized chunks, recording chunk
    /// failures without aborting the remaining chunks. Returns the number of
    /// ops applied.
    async fn commit_chunked(
        &self,
        league_key: &str,
        operation: &str,
        ops: Vec<WriteOp>,
        errors: &mut Vec<String>,
    ) -> usize {
        let mut applied = 0;
        for chunk in ops.chunks(MAX_BATCH_OPS) {
            let batch = WriteBatch::from_ops(chunk.to_vec());
            match commit_with_retry(
                self.store.as_ref(),
                &self.monitor,
                league_key,
                operation,
                batch,
            )
            .await
            {
                Ok(()) => applied += chunk.len(),
                Err(err) => errors.push(format!("{operation}: {err}")),
            }
        }
        applied
    }

    /// Bulk mode: group every League by the canonical key, reconcile each
    /// group against a LeagueMaster, then cascade identity + season through
    /// Teams and UserTeams. Groups run concurrently and fail independently.
    pub async fn run_bulk(&self, season: i32) -> Result<MigrationStats, SyncError> {
        let mut stats = MigrationStats::begin(season);

        // Setup-level failure: a store we cannot read at all aborts the run.
        let leagues: Vec<League> =
            query_typed(self.store.as_ref(), collections::LEAGUES, Query::new()).await?;
        stats.leagues_processed = leagues.len();

        // Pre-migration snapshot: leagues in failed groups keep their old
        // values so the cascade below treats them as no-ops, not as missing.
        let mut league_map: HashMap<Uuid, League> =
            leagues.iter().map(|l| (l.id, l.clone())).collect();

        let mut groups: BTreeMap<String, Vec<League>> = BTreeMap::new();
        for league in leagues {
            groups.entry(league.group_key()).or_default().push(league);
        }

        let outcomes = join_all(groups.into_iter().map(|(key, members)| {
            let engine = self.clone();
            async move {
                let result = engine.migrate_group(&key, members, season).await;
                (key, result)
            }
        }))
        .await;

        for (key, result) in outcomes {
            match result {
                Ok(outcome) => {
                    stats.league_masters_created += outcome.master_created as usize;
                    stats.leagues_updated += outcome.leagues_updated;
                    stats.errors.extend(outcome.errors);
                    for league in outcome.leagues {
                        league_map.insert(league.id, league);
                    }
                }
                Err(err) => stats.errors.push(format!("group {key}: {err}")),
            }
        }

        // Team cascade: copy master/season down from each team's League.
        let teams: Vec<Team> =
            query_typed(self.store.as_ref(), collections::TEAMS, Query::new()).await?;
        stats.teams_processed = teams.len();

        let mut team_map: HashMap<Uuid, (Option<Uuid>, Option<i32>)> = HashMap::new();
        let mut ops = Vec::new();
        for team in &teams {
            team_map.insert(team.id, (team.league_master_id, team.season));
            let Some(league) = league_map.get(&team.league_id) else {
                stats
                    .errors
                    .push(format!("team {}: league {} not found", team.id, team.league_id));
                continue;
            };
            if team.league_master_id == league.league_master_id && team.season == league.season {
                continue;
            }
            ops.push(WriteOp::Update {
                collection: collections::TEAMS.to_string(),
                id: team.id.to_string(),
                fields: json!({
                    "league_master_id": league.league_master_id,
                    "season": league.season,
                }),
                expect_version: None,
            });
            team_map.insert(team.id, (league.league_master_id, league.season));
        }
        stats.teams_updated = self
            .commit_chunked("bulk", "migrate_teams", ops, &mut stats.errors)
            .await;

        // UserTeam cascade: copy from each binding's Team.
        let user_teams: Vec<UserTeam> =
            query_typed(self.store.as_ref(), collections::USER_TEAMS, Query::new()).await?;
        stats.user_teams_processed = user_teams.len();

        let mut ops = Vec::new();
        for binding in &user_teams {
            let Some((master, current_season)) = team_map.get(&binding.team_id) else {
                stats.errors.push(format!(
                    "user team {}: team {} not found",
                    binding.id, binding.team_id
                ));
                continue;
            };
            if binding.league_master_id == *master && binding.current_season == *current_season {
                continue;
            }
            ops.push(WriteOp::Update {
                collection: collections::USER_TEAMS.to_string(),
                id: binding.id.to_string(),
                fields: json!({
                    "league_master_id": master,
                    "current_season": current_season,
                    "last_modified": Utc::now(),
                }),
                expect_version: None,
            });
        }
        stats.user_teams_updated = self
            .commit_chunked("bulk", "migrate_user_teams", ops, &mut stats.errors)
            .await;

        stats.finished_at = Some(Utc::now());
        info!(
            run_id = %stats.run_id,
            leagues = stats.leagues_processed,
            masters_created = stats.league_masters_created,
            errors = stats.errors.len(),
            "bulk migration finished"
        );
        Ok(stats)
    }

    async fn single_league_inner(
        &self,
        league_id: Uuid,
        season: Option<i32>,
    ) -> Result<SingleLeagueStats, SyncError> {
        let league: League = get_typed(
            self.store.as_ref(),
            collections::LEAGUES,
            &league_id.to_string(),
        )
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("league {league_id}")))?;

        if league.league_master_id.is_some() {
            return Err(SyncError::AlreadyMigrated(league_id));
        }

        // Caller-supplied season wins; the league's own season is only a
        // fallback.
        let season = season.or(league.season);
        let key = league.group_key();
        let outcome = self
            .migrate_group(
                &key,
                vec![league.clone()],
                season.ok_or_else(|| {
                    SyncError::NotFound(format!("season for league {league_id}"))
                })?,
            )
            .await?;

        let migrated = outcome
            .leagues
            .first()
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("league {league_id}")))?;

        let mut stats = SingleLeagueStats {
            success: true,
            message: "migrated".to_string(),
            league_id,
            season: migrated.season,
            league_master_id: migrated.league_master_id,
            league_master_created: outcome.master_created,
            teams_updated: 0,
            user_teams_updated: 0,
            errors: outcome.errors,
        };

        let teams: Vec<Team> = query_typed(
            self.store.as_ref(),
            collections::TEAMS,
            Query::new().filter_eq("league_id", league_id),
        )
        .await?;

        let mut ops = Vec::new();
        for team in &teams {
            if team.league_master_id == migrated.league_master_id
                && team.season == migrated.season
            {
                continue;
            }
            ops.push(WriteOp::Update {
                collection: collections::TEAMS.to_string(),
                id: team.id.to_string(),
                fields: json!({
                    "league_master_id": migrated.league_master_id,
                    "season": migrated.season,
                }),
                expect_version: None,
            });
        }
        stats.teams_updated = self
            .commit_chunked(&key, "migrate_teams", ops, &mut stats.errors)
            .await;

        let team_ids: Vec<serde_json::Value> = teams
            .iter()
            .filter_map(|t| serde_json::to_value(t.id).ok())
            .collect();
        if !team_ids.is_empty() {
            let bindings: Vec<UserTeam> = query_typed(
                self.store.as_ref(),
                collections::USER_TEAMS,
                Query::new().filter_in("team_id", team_ids),
            )
            .await?;

            let mut ops = Vec::new();
            for binding in &bindings {
                if binding.league_master_id == migrated.league_master_id
                    && binding.current_season == migrated.season
                {
                    continue;
                }
                ops.push(WriteOp::Update {
                    collection: collections::USER_TEAMS.to_string(),
                    id: binding.id.to_string(),
                    fields: json!({
                        "league_master_id": migrated.league_master_id,
                        "current_season": migrated.season,
                        "last_modified": Utc::now(),
                    }),
                    expect_version: None,
                });
            }
            stats.user_teams_updated = self
                .commit_chunked(&key, "migrate_user_teams", ops, &mut stats.errors)
                .await;
        }

        Ok(stats)
    }

    /// Single-league mode. Refusals (missing league, already migrated) come
    /// back as an unsuccessful stats object with nothing mutated; only store
    /// failures propagate.
    pub async fn run_single_league(
        &self,
        league_id: Uuid,
        season: Option<i32>,
    ) -> Result<SingleLeagueStats, SyncError> {
        match self.single_league_inner(league_id, season).await {
            Ok(stats) => Ok(stats),
            Err(SyncError::AlreadyMigrated(id)) => Ok(SingleLeagueStats::refused(
                id,
                "league already migrated",
            )),
            Err(SyncError::NotFound(what)) => {
                Ok(SingleLeagueStats::refused(league_id, format!("{what} not found")))
            }
            Err(err) => Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Trade sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TradeSyncSummary {
    pub league_id: Uuid,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
}

/// Persist fetched trades, deduplicated by `(external_trade_id, league_id)`:
/// existing documents keep their ids and are replaced, new ones are inserted,
/// all in a single atomic batch.
pub async fn persist_trades(
    store: &dyn DocumentStore,
    monitor: &ContentionMonitor,
    league_key: &str,
    league_id: Uuid,
    fetched: Vec<Trade>,
) -> Result<TradeSyncSummary, SyncError> {
    let existing: Vec<Trade> = query_typed(
        store,
        collections::TRADES,
        Query::new().filter_eq("league_id", league_id),
    )
    .await?;
    let existing_by_external: HashMap<&str, &Trade> = existing
        .iter()
        .map(|t| (t.external_trade_id.as_str(), t))
        .collect();

    let mut summary = TradeSyncSummary {
        league_id,
        fetched: fetched.len(),
        created: 0,
        updated: 0,
    };

    let mut deduped: BTreeMap<String, Trade> = BTreeMap::new();
    for trade in fetched {
        deduped.entry(trade.external_trade_id.clone()).or_insert(trade);
    }

    let mut batch = WriteBatch::new();
    for (_, mut trade) in deduped {
        match existing_by_external.get(trade.external_trade_id.as_str()) {
            Some(prior) => {
                trade.id = prior.id;
                summary.updated += 1;
            }
            None => summary.created += 1,
        }
        batch.set(
            collections::TRADES,
            trade.id.to_string(),
            encode_entity(&trade)?,
        );
    }

    if !batch.is_empty() {
        commit_with_retry(store, monitor, league_key, "sync_trades", batch).await?;
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Background jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub leagues_processed: usize,
    pub errors: Vec<String>,
}

/// Supervision handle for a detached bulk job: a cancellation flag checked
/// between batches, plus an observable status.
#[derive(Clone)]
pub struct JobHandle {
    cancel: Arc<AtomicBool>,
    status: Arc<StdMutex<JobStatus>>,
}

impl JobHandle {
    fn new() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            status: Arc::new(StdMutex::new(JobStatus {
                state: JobState::Running,
                leagues_processed: 0,
                errors: Vec::new(),
            })),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> JobStatus {
        self.status.lock().expect("job status lock").clone()
    }

    fn set_state(&self, state: JobState) {
        self.status.lock().expect("job status lock").state = state;
    }

    fn record_processed(&self) {
        self.status.lock().expect("job status lock").leagues_processed += 1;
    }

    fn record_error(&self, message: String) {
        self.status.lock().expect("job status lock").errors.push(message);
    }
}

// ---------------------------------------------------------------------------
// Service façade
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LeaguePage {
    pub leagues: Vec<League>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamWithFlags {
    #[serde(flatten)]
    pub team: Team,
    pub needs_update: bool,
    pub needs_migrate: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectUser {
    pub user_id: String,
    pub external_user_id: Option<String>,
    pub external_team_id: Option<String>,
    pub credential: Option<String>,
}

/// Owns the store, fetcher, adapter registry, contention monitor, and
/// migration engine, and exposes the operations the outer surfaces call.
#[derive(Clone)]
pub struct SyncService {
    config: SyncConfig,
    store: Arc<dyn DocumentStore>,
    http: Arc<HttpFetcher>,
    registry: AdapterRegistry,
    monitor: Arc<ContentionMonitor>,
    engine: MigrationEngine,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn DocumentStore>,
        registry: AdapterRegistry,
    ) -> anyhow::Result<Self> {
        let http = Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })
            .context("building platform fetcher")?,
        );
        let monitor = Arc::new(ContentionMonitor::new(256));
        let engine = MigrationEngine::new(store.clone(), monitor.clone());
        Ok(Self {
            config,
            store,
            http,
            registry,
            monitor,
            engine,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn monitor(&self) -> &ContentionMonitor {
        &self.monitor
    }

    pub fn compute_needs_update(&self, team: &Team, now: DateTime<Utc>) -> bool {
        needs_update(team, now, self.config.current_season)
    }

    pub async fn run_bulk_migration(&self, season: i32) -> Result<MigrationStats, SyncError> {
        let stats = self.engine.run_bulk(season).await?;
        if let Err(err) = write_run_report(&self.config.reports_dir, &stats).await {
            warn!(%err, run_id = %stats.run_id, "failed to write migration report");
        }
        Ok(stats)
    }

    pub async fn run_single_league_migration(
        &self,
        league_id: Uuid,
        season: Option<i32>,
    ) -> Result<SingleLeagueStats, SyncError> {
        self.engine.run_single_league(league_id, season).await
    }

    /// Fetch and persist a league's trades. Syncing twice yields exactly one
    /// Trade per distinct external id. When no external id is supplied the
    /// league's stored one is used.
    pub async fn sync_trades(
        &self,
        league_id: Uuid,
        external_league_id: Option<&str>,
    ) -> Result<TradeSyncSummary, SyncError> {
        let league: League = get_typed(
            self.store.as_ref(),
            collections::LEAGUES,
            &league_id.to_string(),
        )
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("league {league_id}")))?;

        let adapter = self
            .registry
            .get(league.platform.name)
            .ok_or(SyncError::UnsupportedPlatform(league.platform.name))?;

        let external_league_id =
            external_league_id.unwrap_or(league.external_league_id.as_str());
        let fetched = adapter
            .fetch_trades(&self.http, league_id, external_league_id)
            .await?;
        persist_trades(
            self.store.as_ref(),
            &self.monitor,
            &league.group_key(),
            league_id,
            fetched,
        )
        .await
    }

    /// First-connect flow: upsert the league, always attempt the team upsert
    /// next, bind the user, and give the league a master identity if it does
    /// not have one yet.
    pub async fn connect_league(
        &self,
        platform: PlatformName,
        name: &str,
        external_league_id: &str,
        user: Option<ConnectUser>,
    ) -> Result<League, SyncError> {
        let adapter = self
            .registry
            .get(platform)
            .ok_or(SyncError::UnsupportedPlatform(platform))?;

        let credential = user.as_ref().and_then(|u| u.credential.clone());
        let league = adapter
            .upsert_league(
                self.store.as_ref(),
                &self.http,
                name,
                external_league_id,
                credential.as_deref(),
            )
            .await?;
        adapter
            .upsert_teams(self.store.as_ref(), &self.http, &league)
            .await?;

        if league.league_master_id.is_none() {
            let stats = self
                .engine
                .run_single_league(league.id, league.season.or(Some(self.config.current_season)))
                .await?;
            if !stats.success {
                warn!(league = %league.id, message = %stats.message, "first-connect migration skipped");
            }
        }

        if let Some(user) = user {
            adapter
                .upsert_user_teams(
                    self.store.as_ref(),
                    &league,
                    &user.user_id,
                    user.external_user_id.as_deref(),
                    user.external_team_id.as_deref(),
                )
                .await?;
        }

        get_typed(
            self.store.as_ref(),
            collections::LEAGUES,
            &league.id.to_string(),
        )
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("league {}", league.id)))
    }

    pub async fn list_leagues(
        &self,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<LeaguePage, SyncError> {
        let limit = limit.clamp(1, 100);
        let mut query = Query::new().order_by_asc("name").limit(limit);
        if let Some(cursor) = cursor {
            query = query.start_after(cursor);
        }
        let docs = self.store.query(collections::LEAGUES, query).await?;
        let next_cursor = if docs.len() == limit {
            docs.last().map(|d| d.id.clone())
        } else {
            None
        };
        let leagues = docs
            .iter()
            .map(|d| d.decode::<League>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LeaguePage {
            leagues,
            next_cursor,
        })
    }

    /// Read a league's teams with their staleness flags. Any team whose
    /// `last_fetched` is older than the touch threshold gets bumped in a
    /// fire-and-forget batch that never blocks or fails this read.
    pub async fn list_league_teams(
        &self,
        league_id: Uuid,
    ) -> Result<Vec<TeamWithFlags>, SyncError> {
        let now = Utc::now();
        let teams: Vec<Team> = query_typed(
            self.store.as_ref(),
            collections::TEAMS,
            Query::new().filter_eq("league_id", league_id),
        )
        .await?;

        let stale: Vec<Team> = teams
            .iter()
            .filter(|team| {
                team.last_fetched
                    .map(|f| now - f > chrono::Duration::minutes(TOUCH_THRESHOLD_MINUTES))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !stale.is_empty() {
            let store = self.store.clone();
            let monitor = self.monitor.clone();
            tokio::spawn(async move {
                if let Err(err) = touch_teams(store.as_ref(), &monitor, &stale, now).await {
                    warn!(%err, "opportunistic last_fetched bump failed");
                }
            });
        }

        Ok(teams
            .into_iter()
            .map(|team| TeamWithFlags {
                needs_update: self.compute_needs_update(&team, now),
                needs_migrate: needs_migrate(&team),
                team,
            })
            .collect())
    }

    /// Start the detached refresh-everything job. The caller gets a handle
    /// immediately; the job paces itself between batches and checks the
    /// cancellation flag at each batch boundary.
    pub fn spawn_update_all_leagues(&self) -> JobHandle {
        let handle = JobHandle::new();
        let service = self.clone();
        let job = handle.clone();
        tokio::spawn(async move {
            service.update_all_leagues(&job).await;
        });
        handle
    }

    async fn update_all_leagues(&self, handle: &JobHandle) {
        let leagues: Vec<League> = match query_typed(
            self.store.as_ref(),
            collections::LEAGUES,
            Query::new(),
        )
        .await
        {
            Ok(leagues) => leagues,
            Err(err) => {
                handle.record_error(format!("loading leagues: {err}"));
                handle.set_state(JobState::Failed);
                return;
            }
        };

        let batch_size = self.config.refresh_batch_size.max(1);
        for chunk in leagues.chunks(batch_size) {
            if handle.is_canceled() {
                handle.set_state(JobState::Canceled);
                return;
            }

            join_all(chunk.iter().map(|league| async {
                match self.registry.get(league.platform.name) {
                    Some(adapter) => {
                        if let Err(err) = adapter
                            .upsert_teams(self.store.as_ref(), &self.http, league)
                            .await
                        {
                            handle.record_error(format!("league {}: {err}", league.id));
                        }
                    }
                    None => handle.record_error(format!(
                        "league {}: no adapter for {}",
                        league.id, league.platform.name
                    )),
                }
                handle.record_processed();
            }))
            .await;

            tokio::time::sleep(Duration::from_millis(self.config.pacing_delay_ms)).await;
        }

        if handle.is_canceled() {
            handle.set_state(JobState::Canceled);
        } else {
            handle.set_state(JobState::Completed);
        }
    }

    /// Optional cron schedule that kicks the refresh job after each broadcast
    /// window.
    pub async fn maybe_build_scheduler(&self) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in &self.config.refresh_crons {
            let service = self.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let service = service.clone();
                Box::pin(async move {
                    info!("scheduled league refresh starting");
                    let _handle = service.spawn_update_all_leagues();
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

/// Bump `last_fetched` for the given teams in ceiling-sized batches.
pub async fn touch_teams(
    store: &dyn DocumentStore,
    monitor: &ContentionMonitor,
    teams: &[Team],
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let ops: Vec<WriteOp> = teams
        .iter()
        .map(|team| WriteOp::Update {
            collection: collections::TEAMS.to_string(),
            id: team.id.to_string(),
            fields: json!({ "last_fetched": now }),
            expect_version: None,
        })
        .collect();

    for chunk in ops.chunks(MAX_BATCH_OPS) {
        commit_with_retry(
            store,
            monitor,
            "read_path",
            "touch_teams",
            WriteBatch::from_ops(chunk.to_vec()),
        )
        .await?;
    }
    Ok(())
}

/// Write the run report under `reports/<run_id>/`: a short markdown brief and
/// the full stats dump.
pub async fn write_run_report(
    reports_dir: &std::path::Path,
    stats: &MigrationStats,
) -> anyhow::Result<PathBuf> {
    let dir = reports_dir.join(stats.run_id.to_string());
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let brief = format!(
        "# Migration Run\n\n- Run ID: `{}`\n- Season: {}\n- Leagues processed: {}\n- Masters created: {}\n- Leagues updated: {}\n- Teams updated: {}\n- User teams updated: {}\n- Errors: {}\n",
        stats.run_id,
        stats.season,
        stats.leagues_processed,
        stats.league_masters_created,
        stats.leagues_updated,
        stats.teams_updated,
        stats.user_teams_updated,
        stats.errors.len(),
    );
    tokio::fs::write(dir.join("migration_brief.md"), brief)
        .await
        .context("writing migration_brief.md")?;

    let stats_json = serde_json::to_vec_pretty(stats).context("serializing migration stats")?;
    tokio::fs::write(dir.join("stats.json"), stats_json)
        .await
        .context("writing stats.json")?;

    Ok(dir)
}
