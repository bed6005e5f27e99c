//! Platform adapter contracts + Sleeper and Fleaflicker implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flk_core::{
    collections, League, PlatformName, PlatformRef, Team, TeamRecord, Trade, TradeParticipant,
    TradeStatus, UserTeam, UNKNOWN_COUNTERPARTY,
};
use flk_store::{
    encode_entity, query_typed, DocumentStore, FetchError, HttpFetcher, Query, StoreError,
    WriteBatch,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "flk-adapters";

const SLEEPER_API: &str = "https://api.sleeper.app/v1";
const FLEAFLICKER_API: &str = "https://www.fleaflicker.com/api";

/// Sleeper exposes transactions per scoring week; trades can appear in any of
/// the regular-season weeks.
const SLEEPER_TRADE_WEEKS: std::ops::RangeInclusive<u32> = 1..=18;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Message(String),
}

/// League-level facts pulled from a platform's league endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedLeagueInfo {
    pub name: Option<String>,
    pub season: Option<i32>,
}

/// One implementation per external platform. All store writes inside a single
/// operation go through one atomic batch; transport failures propagate to the
/// caller, malformed payload fields degrade to sentinels instead.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> PlatformName;

    fn platform_ref(&self) -> PlatformRef;

    /// Create-or-update the League keyed by `(platform, external_league_id)`.
    /// Safe to call repeatedly.
    async fn upsert_league(
        &self,
        store: &dyn DocumentStore,
        http: &HttpFetcher,
        name: &str,
        external_league_id: &str,
        credential: Option<&str>,
    ) -> Result<League, AdapterError>;

    /// Fetch current roster/standings data and upsert one Team per external
    /// team, keyed by `(external_team_id, league_id)`.
    async fn upsert_teams(
        &self,
        store: &dyn DocumentStore,
        http: &HttpFetcher,
        league: &League,
    ) -> Result<(), AdapterError>;

    /// Bind an internal user to the Team matching the external owner or team
    /// id. At most one UserTeam per `(user_id, team_id)` survives the call.
    async fn upsert_user_teams(
        &self,
        store: &dyn DocumentStore,
        league: &League,
        user_id: &str,
        external_user_id: Option<&str>,
        external_team_id: Option<&str>,
    ) -> Result<(), AdapterError>;

    /// Retrieve raw transaction data and convert it into canonical trades.
    async fn fetch_trades(
        &self,
        http: &HttpFetcher,
        league_id: Uuid,
        external_league_id: &str,
    ) -> Result<Vec<Trade>, AdapterError>;
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_path(value, path)?.as_str()
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let v = json_path(value, path)?;
    v.as_i64().or_else(|| v.as_str()?.trim().parse().ok())
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let v = json_path(value, path)?;
    v.as_f64().or_else(|| v.as_str()?.trim().parse().ok())
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    json_path(value, path)
        .and_then(|v| v.as_array())
        .map(|v| v.as_slice())
        .unwrap_or_default()
}

/// External ids arrive as strings or numbers depending on the platform.
fn json_id(value: &JsonValue, path: &[&str]) -> Option<String> {
    let v = json_path(value, path)?;
    match v {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_epoch_ms(value: &JsonValue, path: &[&str]) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(json_i64(value, path)?)
}

async fn find_league(
    store: &dyn DocumentStore,
    platform: PlatformName,
    external_league_id: &str,
) -> Result<Option<League>, StoreError> {
    let mut leagues: Vec<League> = query_typed(
        store,
        collections::LEAGUES,
        Query::new()
            .filter_eq("platform.name", platform.as_str())
            .filter_eq("external_league_id", external_league_id),
    )
    .await?;
    Ok(if leagues.is_empty() {
        None
    } else {
        Some(leagues.remove(0))
    })
}

/// Shared lookup-then-create-or-update for the League record itself. The
/// platform payload wins on name/season; `league_master_id` is preserved.
async fn upsert_league_record(
    store: &dyn DocumentStore,
    platform: PlatformRef,
    external_league_id: &str,
    requested_name: &str,
    info: FetchedLeagueInfo,
) -> Result<League, AdapterError> {
    let now = Utc::now();
    let mut batch = WriteBatch::new();

    let league = match find_league(store, platform.name, external_league_id).await? {
        Some(mut league) => {
            league.name = info
                .name
                .unwrap_or_else(|| requested_name.to_string());
            league.season = info.season.or(league.season);
            league.last_modified = now;
            batch.set(
                collections::LEAGUES,
                league.id.to_string(),
                encode_entity(&league)?,
            );
            league
        }
        None => {
            let league = League {
                id: Uuid::new_v4(),
                name: info
                    .name
                    .unwrap_or_else(|| requested_name.to_string()),
                platform,
                external_league_id: external_league_id.to_string(),
                league_master_id: None,
                season: info.season,
                last_modified: now,
            };
            batch.set(
                collections::LEAGUES,
                league.id.to_string(),
                encode_entity(&league)?,
            );
            league
        }
    };

    store.commit(batch).await?;
    Ok(league)
}

async fn load_league_teams(
    store: &dyn DocumentStore,
    league_id: Uuid,
) -> Result<Vec<Team>, StoreError> {
    query_typed(
        store,
        collections::TEAMS,
        Query::new().filter_eq("league_id", league_id),
    )
    .await
}

/// Upsert freshly parsed teams keyed by `(external_team_id, league_id)`,
/// preserving existing document ids. One atomic batch per call.
async fn upsert_team_records(
    store: &dyn DocumentStore,
    league: &League,
    mut incoming: Vec<Team>,
) -> Result<(), AdapterError> {
    let existing = load_league_teams(store, league.id).await?;
    let existing_by_external: HashMap<&str, &Team> = existing
        .iter()
        .map(|t| (t.external_team_id.as_str(), t))
        .collect();

    let mut batch = WriteBatch::new();
    for team in &mut incoming {
        if let Some(prior) = existing_by_external.get(team.external_team_id.as_str()) {
            team.id = prior.id;
        }
        batch.set(
            collections::TEAMS,
            team.id.to_string(),
            encode_entity(team)?,
        );
    }
    if !batch.is_empty() {
        store.commit(batch).await?;
    }
    Ok(())
}

/// Shared UserTeam binding: find the league team matching the external owner
/// or team id, then create or update the `(user_id, team_id)` binding.
/// Existing duplicates are repaired here: the oldest binding survives, the
/// rest are deleted in the same batch.
async fn upsert_user_team_binding(
    store: &dyn DocumentStore,
    league: &League,
    user_id: &str,
    external_user_id: Option<&str>,
    external_team_id: Option<&str>,
) -> Result<(), AdapterError> {
    let teams = load_league_teams(store, league.id).await?;
    let team = teams
        .iter()
        .find(|t| {
            let user_match = match (external_user_id, &t.external_user_id) {
                (Some(wanted), Some(have)) => wanted == have.as_str(),
                _ => false,
            };
            let team_match = external_team_id
                .map(|wanted| wanted == t.external_team_id)
                .unwrap_or(false);
            user_match || team_match
        })
        .ok_or_else(|| {
            AdapterError::NotFound(format!(
                "team for user {user_id} in league {}",
                league.external_league_id
            ))
        })?;

    let mut bindings: Vec<UserTeam> = query_typed(
        store,
        collections::USER_TEAMS,
        Query::new()
            .filter_eq("user_id", user_id)
            .filter_eq("team_id", team.id),
    )
    .await?;
    bindings.sort_by_key(|b| b.created_at);

    let now = Utc::now();
    let mut batch = WriteBatch::new();

    match bindings.first() {
        Some(keeper) => {
            let mut keeper = keeper.clone();
            keeper.league_master_id = team.league_master_id;
            keeper.current_season = team.season;
            keeper.last_modified = now;
            batch.set(
                collections::USER_TEAMS,
                keeper.id.to_string(),
                encode_entity(&keeper)?,
            );
            for duplicate in bindings.iter().skip(1) {
                batch.delete(collections::USER_TEAMS, duplicate.id.to_string());
            }
        }
        None => {
            let binding = UserTeam {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                team_id: team.id,
                league_master_id: team.league_master_id,
                current_season: team.season,
                created_at: now,
                last_modified: now,
            };
            batch.set(
                collections::USER_TEAMS,
                binding.id.to_string(),
                encode_entity(&binding)?,
            );
        }
    }

    store.commit(batch).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sleeper
// ---------------------------------------------------------------------------

/// Sleeper transaction statuses, normalized. Anything unrecognized is treated
/// as still pending rather than guessed at.
fn sleeper_trade_status(raw: &str) -> TradeStatus {
    match raw.to_ascii_lowercase().as_str() {
        "complete" => TradeStatus::Completed,
        "failed" => TradeStatus::Rejected,
        "canceled" => TradeStatus::Canceled,
        "vetoed" => TradeStatus::Vetoed,
        "invalidated" => TradeStatus::Invalidated,
        _ => TradeStatus::Pending,
    }
}

fn parse_sleeper_league(payload: &JsonValue) -> FetchedLeagueInfo {
    FetchedLeagueInfo {
        name: json_str(payload, &["name"]).map(ToString::to_string),
        season: json_i64(payload, &["season"]).map(|s| s as i32),
    }
}

/// Build one Team per Sleeper roster from the rosters, users, and matchups
/// payloads. Sleeper splits fantasy points into integer + hundredths fields.
fn parse_sleeper_teams(
    league: &League,
    rosters: &JsonValue,
    users: &JsonValue,
    matchups: &JsonValue,
    now: DateTime<Utc>,
) -> Vec<Team> {
    let usernames: HashMap<String, String> = json_array(users, &[])
        .iter()
        .filter_map(|u| {
            Some((
                json_id(u, &["user_id"])?,
                json_str(u, &["display_name"])?.to_string(),
            ))
        })
        .collect();

    let mut pairs: HashMap<i64, Vec<String>> = HashMap::new();
    for entry in json_array(matchups, &[]) {
        if let (Some(matchup_id), Some(roster_id)) = (
            json_i64(entry, &["matchup_id"]),
            json_id(entry, &["roster_id"]),
        ) {
            pairs.entry(matchup_id).or_default().push(roster_id);
        }
    }
    let opponent_of = |roster_id: &str| -> Option<String> {
        pairs
            .values()
            .find(|ids| ids.iter().any(|id| id == roster_id))
            .and_then(|ids| ids.iter().find(|id| *id != roster_id).cloned())
    };

    json_array(rosters, &[])
        .iter()
        .filter_map(|roster| {
            let external_team_id = json_id(roster, &["roster_id"])?;
            let external_user_id = json_id(roster, &["owner_id"]);
            let external_username = external_user_id
                .as_deref()
                .and_then(|id| usernames.get(id).cloned());
            let points_for = json_f64(roster, &["settings", "fpts"]).unwrap_or(0.0)
                + json_f64(roster, &["settings", "fpts_decimal"]).unwrap_or(0.0) / 100.0;
            let points_against = json_f64(roster, &["settings", "fpts_against"]).unwrap_or(0.0)
                + json_f64(roster, &["settings", "fpts_against_decimal"]).unwrap_or(0.0) / 100.0;
            Some(Team {
                id: Uuid::new_v4(),
                opponent_external_id: opponent_of(&external_team_id),
                external_team_id,
                league_id: league.id,
                league_master_id: league.league_master_id,
                season: league.season,
                external_user_id,
                external_username,
                players: json_array(roster, &["players"])
                    .iter()
                    .filter_map(|p| json_id(p, &[]))
                    .collect(),
                record: TeamRecord {
                    wins: json_i64(roster, &["settings", "wins"]).unwrap_or(0) as u32,
                    losses: json_i64(roster, &["settings", "losses"]).unwrap_or(0) as u32,
                    ties: json_i64(roster, &["settings", "ties"]).unwrap_or(0) as u32,
                    points_for,
                    points_against,
                },
                last_fetched: Some(now),
            })
        })
        .collect()
}

fn sleeper_pick_label(pick: &JsonValue) -> String {
    let season = json_id(pick, &["season"]).unwrap_or_else(|| "?".to_string());
    let round = json_i64(pick, &["round"]).unwrap_or(0);
    format!("{season} round {round}")
}

/// Convert one week's transaction payload into canonical trades. Non-trade
/// transactions (waivers, free agency) are ignored; a trade without an
/// external id cannot be deduplicated and is skipped.
fn convert_sleeper_transactions(
    league_id: Uuid,
    external_league_id: &str,
    platform_id: &str,
    payload: &JsonValue,
    now: DateTime<Utc>,
) -> Vec<Trade> {
    let mut trades = Vec::new();
    for txn in json_array(payload, &[]) {
        if json_str(txn, &["type"]) != Some("trade") {
            continue;
        }
        let Some(external_trade_id) = json_id(txn, &["transaction_id"]) else {
            warn!(league = external_league_id, "skipping sleeper trade without transaction_id");
            continue;
        };

        let mut roster_ids: Vec<String> = json_array(txn, &["roster_ids"])
            .iter()
            .filter_map(|v| json_id(v, &[]))
            .collect();
        roster_ids.sort();

        let adds = json_path(txn, &["adds"]).and_then(|v| v.as_object());
        let drops = json_path(txn, &["drops"]).and_then(|v| v.as_object());
        let picks = json_array(txn, &["draft_picks"]);

        let participants = roster_ids
            .iter()
            .map(|roster_id| {
                let mut participant = TradeParticipant::empty(roster_id.clone());
                if let Some(adds) = adds {
                    for (player, destination) in adds {
                        if json_id(destination, &[]).as_deref() == Some(roster_id) {
                            participant.players_received.push(player.clone());
                        }
                    }
                }
                if let Some(drops) = drops {
                    for (player, source) in drops {
                        if json_id(source, &[]).as_deref() == Some(roster_id) {
                            participant.players_given.push(player.clone());
                        }
                    }
                }
                for pick in picks {
                    if json_id(pick, &["owner_id"]).as_deref() == Some(roster_id) {
                        participant.picks_received.push(sleeper_pick_label(pick));
                    }
                    if json_id(pick, &["previous_owner_id"]).as_deref() == Some(roster_id) {
                        participant.picks_given.push(sleeper_pick_label(pick));
                    }
                }
                participant.players_given.sort();
                participant.players_received.sort();
                participant
            })
            .collect();

        let status = sleeper_trade_status(json_str(txn, &["status"]).unwrap_or_default());
        trades.push(Trade {
            id: Uuid::new_v4(),
            external_trade_id,
            league_id,
            external_league_id: external_league_id.to_string(),
            platform_id: platform_id.to_string(),
            status,
            participants,
            proposed_at: json_epoch_ms(txn, &["created"]),
            executed_at: if status == TradeStatus::Completed {
                json_epoch_ms(txn, &["status_updated"])
            } else {
                None
            },
            last_synced: now,
        });
    }
    trades
}

#[derive(Debug, Clone)]
pub struct SleeperAdapter {
    platform_id: String,
}

impl Default for SleeperAdapter {
    fn default() -> Self {
        Self {
            platform_id: PlatformName::Sleeper.as_str().to_string(),
        }
    }
}

#[async_trait]
impl PlatformAdapter for SleeperAdapter {
    fn platform(&self) -> PlatformName {
        PlatformName::Sleeper
    }

    fn platform_ref(&self) -> PlatformRef {
        PlatformRef {
            name: PlatformName::Sleeper,
            platform_id: self.platform_id.clone(),
        }
    }

    async fn upsert_league(
        &self,
        store: &dyn DocumentStore,
        http: &HttpFetcher,
        name: &str,
        external_league_id: &str,
        _credential: Option<&str>,
    ) -> Result<League, AdapterError> {
        let payload = http
            .fetch_json(
                self.platform(),
                &format!("{SLEEPER_API}/league/{external_league_id}"),
            )
            .await?;
        let info = parse_sleeper_league(&payload);
        upsert_league_record(store, self.platform_ref(), external_league_id, name, info).await
    }

    async fn upsert_teams(
        &self,
        store: &dyn DocumentStore,
        http: &HttpFetcher,
        league: &League,
    ) -> Result<(), AdapterError> {
        let ext = &league.external_league_id;
        let rosters = http
            .fetch_json(self.platform(), &format!("{SLEEPER_API}/league/{ext}/rosters"))
            .await?;
        let users = http
            .fetch_json(self.platform(), &format!("{SLEEPER_API}/league/{ext}/users"))
            .await?;
        let state = http
            .fetch_json(self.platform(), &format!("{SLEEPER_API}/state/nfl"))
            .await?;
        let week = json_i64(&state, &["week"]).unwrap_or(1).max(1);
        let matchups = http
            .fetch_json(
                self.platform(),
                &format!("{SLEEPER_API}/league/{ext}/matchups/{week}"),
            )
            .await?;

        let teams = parse_sleeper_teams(league, &rosters, &users, &matchups, Utc::now());
        upsert_team_records(store, league, teams).await
    }

    async fn upsert_user_teams(
        &self,
        store: &dyn DocumentStore,
        league: &League,
        user_id: &str,
        external_user_id: Option<&str>,
        external_team_id: Option<&str>,
    ) -> Result<(), AdapterError> {
        upsert_user_team_binding(store, league, user_id, external_user_id, external_team_id).await
    }

    async fn fetch_trades(
        &self,
        http: &HttpFetcher,
        league_id: Uuid,
        external_league_id: &str,
    ) -> Result<Vec<Trade>, AdapterError> {
        let now = Utc::now();
        let mut seen = std::collections::HashSet::new();
        let mut trades = Vec::new();
        for week in SLEEPER_TRADE_WEEKS {
            let payload = http
                .fetch_json(
                    self.platform(),
                    &format!("{SLEEPER_API}/league/{external_league_id}/transactions/{week}"),
                )
                .await?;
            for trade in convert_sleeper_transactions(
                league_id,
                external_league_id,
                &self.platform_id,
                &payload,
                now,
            ) {
                if seen.insert(trade.external_trade_id.clone()) {
                    trades.push(trade);
                }
            }
        }
        Ok(trades)
    }
}

// ---------------------------------------------------------------------------
// Fleaflicker
// ---------------------------------------------------------------------------

/// Fleaflicker trade status strings, normalized with the same safe default.
fn fleaflicker_trade_status(raw: &str) -> TradeStatus {
    match raw {
        "TRADE_STATUS_EXECUTED" => TradeStatus::Completed,
        "TRADE_STATUS_REJECTED" => TradeStatus::Rejected,
        "TRADE_STATUS_CANCELED" => TradeStatus::Canceled,
        "TRADE_STATUS_VETOED" => TradeStatus::Vetoed,
        "TRADE_STATUS_INVALIDATED" => TradeStatus::Invalidated,
        _ => TradeStatus::Pending,
    }
}

fn parse_fleaflicker_league(payload: &JsonValue) -> FetchedLeagueInfo {
    FetchedLeagueInfo {
        name: json_str(payload, &["league", "name"])
            .or_else(|| json_str(payload, &["name"]))
            .map(ToString::to_string),
        season: json_i64(payload, &["season"]).map(|s| s as i32),
    }
}

/// Build Teams from the standings, rosters, and scoreboard payloads.
fn parse_fleaflicker_teams(
    league: &League,
    standings: &JsonValue,
    rosters: &JsonValue,
    scoreboard: &JsonValue,
    now: DateTime<Utc>,
) -> Vec<Team> {
    let mut players_by_team: HashMap<String, Vec<String>> = HashMap::new();
    for roster in json_array(rosters, &["rosters"]) {
        let Some(team_id) = json_id(roster, &["team", "id"]) else {
            continue;
        };
        let players = json_array(roster, &["players"])
            .iter()
            .filter_map(|p| {
                json_str(p, &["proPlayer", "nameFull"])
                    .map(ToString::to_string)
                    .or_else(|| json_id(p, &["proPlayer", "id"]))
            })
            .collect();
        players_by_team.insert(team_id, players);
    }

    let mut opponents: HashMap<String, String> = HashMap::new();
    for game in json_array(scoreboard, &["games"]) {
        if let (Some(home), Some(away)) = (
            json_id(game, &["home", "id"]),
            json_id(game, &["away", "id"]),
        ) {
            opponents.insert(home.clone(), away.clone());
            opponents.insert(away, home);
        }
    }

    let mut teams = Vec::new();
    for division in json_array(standings, &["divisions"]) {
        for entry in json_array(division, &["teams"]) {
            let Some(external_team_id) = json_id(entry, &["id"]) else {
                continue;
            };
            let owner = json_array(entry, &["owners"]).first();
            teams.push(Team {
                id: Uuid::new_v4(),
                league_id: league.id,
                league_master_id: league.league_master_id,
                season: league.season,
                external_user_id: owner.and_then(|o| json_id(o, &["id"])),
                external_username: owner
                    .and_then(|o| json_str(o, &["displayName"]).map(ToString::to_string)),
                opponent_external_id: opponents.get(&external_team_id).cloned(),
                players: players_by_team
                    .remove(&external_team_id)
                    .unwrap_or_default(),
                record: TeamRecord {
                    wins: json_i64(entry, &["recordOverall", "wins"]).unwrap_or(0) as u32,
                    losses: json_i64(entry, &["recordOverall", "losses"]).unwrap_or(0) as u32,
                    ties: json_i64(entry, &["recordOverall", "ties"]).unwrap_or(0) as u32,
                    points_for: json_f64(entry, &["pointsFor", "value"]).unwrap_or(0.0),
                    points_against: json_f64(entry, &["pointsAgainst", "value"]).unwrap_or(0.0),
                },
                external_team_id,
                last_fetched: Some(now),
            });
        }
    }
    teams
}

fn fleaflicker_pick_label(pick: &JsonValue) -> String {
    let season = json_id(pick, &["season"]).unwrap_or_else(|| "?".to_string());
    let round = json_i64(pick, &["slot", "round"])
        .or_else(|| json_i64(pick, &["round"]))
        .unwrap_or(0);
    format!("{season} round {round}")
}

/// Fleaflicker only reports what each side *obtained*. With exactly two
/// participants the giving side is the other team; with any other shape the
/// origin cannot be determined and is attributed to the unknown counterparty.
fn convert_fleaflicker_trades(
    league_id: Uuid,
    external_league_id: &str,
    platform_id: &str,
    payload: &JsonValue,
    now: DateTime<Utc>,
) -> Vec<Trade> {
    let mut trades = Vec::new();
    for raw in json_array(payload, &["trades"]) {
        let Some(external_trade_id) = json_id(raw, &["id"]) else {
            warn!(league = external_league_id, "skipping fleaflicker trade without id");
            continue;
        };

        let mut participants: Vec<TradeParticipant> = json_array(raw, &["teams"])
            .iter()
            .filter_map(|side| {
                let team_id = json_id(side, &["team", "id"])?;
                let mut participant = TradeParticipant::empty(team_id);
                participant.players_received = json_array(side, &["playersObtained"])
                    .iter()
                    .filter_map(|p| {
                        json_str(p, &["proPlayer", "nameFull"])
                            .map(ToString::to_string)
                            .or_else(|| json_id(p, &["proPlayer", "id"]))
                    })
                    .collect();
                participant.picks_received = json_array(side, &["picksObtained"])
                    .iter()
                    .map(fleaflicker_pick_label)
                    .collect();
                Some(participant)
            })
            .collect();

        if participants.len() == 2 {
            let received_a = participants[0].players_received.clone();
            let received_b = participants[1].players_received.clone();
            let picks_a = participants[0].picks_received.clone();
            let picks_b = participants[1].picks_received.clone();
            participants[0].players_given = received_b;
            participants[0].picks_given = picks_b;
            participants[1].players_given = received_a;
            participants[1].picks_given = picks_a;
        } else if !participants.is_empty() {
            let mut unknown = TradeParticipant::empty(UNKNOWN_COUNTERPARTY);
            for participant in &participants {
                unknown
                    .players_given
                    .extend(participant.players_received.iter().cloned());
                unknown
                    .picks_given
                    .extend(participant.picks_received.iter().cloned());
            }
            participants.push(unknown);
        }

        let status = fleaflicker_trade_status(json_str(raw, &["status"]).unwrap_or_default());
        trades.push(Trade {
            id: Uuid::new_v4(),
            external_trade_id,
            league_id,
            external_league_id: external_league_id.to_string(),
            platform_id: platform_id.to_string(),
            status,
            participants,
            proposed_at: json_epoch_ms(raw, &["proposedOn"]),
            executed_at: if status == TradeStatus::Completed {
                json_epoch_ms(raw, &["approvedOn"])
            } else {
                None
            },
            last_synced: now,
        });
    }
    trades
}

#[derive(Debug, Clone)]
pub struct FleaflickerAdapter {
    platform_id: String,
}

impl Default for FleaflickerAdapter {
    fn default() -> Self {
        Self {
            platform_id: PlatformName::Fleaflicker.as_str().to_string(),
        }
    }
}

#[async_trait]
impl PlatformAdapter for FleaflickerAdapter {
    fn platform(&self) -> PlatformName {
        PlatformName::Fleaflicker
    }

    fn platform_ref(&self) -> PlatformRef {
        PlatformRef {
            name: PlatformName::Fleaflicker,
            platform_id: self.platform_id.clone(),
        }
    }

    async fn upsert_league(
        &self,
        store: &dyn DocumentStore,
        http: &HttpFetcher,
        name: &str,
        external_league_id: &str,
        _credential: Option<&str>,
    ) -> Result<League, AdapterError> {
        let payload = http
            .fetch_json(
                self.platform(),
                &format!(
                    "{FLEAFLICKER_API}/FetchLeagueStandings?sport=NFL&league_id={external_league_id}"
                ),
            )
            .await?;
        let info = parse_fleaflicker_league(&payload);
        upsert_league_record(store, self.platform_ref(), external_league_id, name, info).await
    }

    async fn upsert_teams(
        &self,
        store: &dyn DocumentStore,
        http: &HttpFetcher,
        league: &League,
    ) -> Result<(), AdapterError> {
        let ext = &league.external_league_id;
        let standings = http
            .fetch_json(
                self.platform(),
                &format!("{FLEAFLICKER_API}/FetchLeagueStandings?sport=NFL&league_id={ext}"),
            )
            .await?;
        let rosters = http
            .fetch_json(
                self.platform(),
                &format!("{FLEAFLICKER_API}/FetchLeagueRosters?sport=NFL&league_id={ext}"),
            )
            .await?;
        let scoreboard = http
            .fetch_json(
                self.platform(),
                &format!("{FLEAFLICKER_API}/FetchLeagueScoreboard?sport=NFL&league_id={ext}"),
            )
            .await?;

        let teams = parse_fleaflicker_teams(league, &standings, &rosters, &scoreboard, Utc::now());
        upsert_team_records(store, league, teams).await
    }

    async fn upsert_user_teams(
        &self,
        store: &dyn DocumentStore,
        league: &League,
        user_id: &str,
        external_user_id: Option<&str>,
        external_team_id: Option<&str>,
    ) -> Result<(), AdapterError> {
        upsert_user_team_binding(store, league, user_id, external_user_id, external_team_id).await
    }

    async fn fetch_trades(
        &self,
        http: &HttpFetcher,
        league_id: Uuid,
        external_league_id: &str,
    ) -> Result<Vec<Trade>, AdapterError> {
        let now = Utc::now();
        let mut trades = Vec::new();
        let mut offset: Option<String> = None;

        // FetchTrades pages with an opaque offset token.
        loop {
            let mut url = format!(
                "{FLEAFLICKER_API}/FetchTrades?sport=NFL&league_id={external_league_id}&filter=TRADES_ALL"
            );
            if let Some(offset) = &offset {
                url.push_str(&format!("&result_offset={offset}"));
            }
            let payload = http.fetch_json(self.platform(), &url).await?;
            trades.extend(convert_fleaflicker_trades(
                league_id,
                external_league_id,
                &self.platform_id,
                &payload,
                now,
            ));

            match json_id(&payload, &["resultOffsetNext"]) {
                Some(next) if Some(&next) != offset.as_ref() => offset = Some(next),
                _ => break,
            }
        }

        Ok(trades)
    }
}

/// Injected registry mapping platform name to adapter instance, built once at
/// startup and passed explicitly to consumers.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<PlatformName, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SleeperAdapter::default()));
        registry.register(Arc::new(FleaflickerAdapter::default()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: PlatformName) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<PlatformName> {
        self.adapters.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flk_store::MemoryStore;
    use serde_json::json;

    fn test_league(platform: PlatformName) -> League {
        League {
            id: Uuid::new_v4(),
            name: "Test League".to_string(),
            platform: PlatformRef {
                name: platform,
                platform_id: platform.as_str().to_string(),
            },
            external_league_id: "ext-1".to_string(),
            league_master_id: None,
            season: Some(2024),
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn unknown_status_strings_default_to_pending() {
        assert_eq!(sleeper_trade_status("complete"), TradeStatus::Completed);
        assert_eq!(sleeper_trade_status("something_new"), TradeStatus::Pending);
        assert_eq!(
            fleaflicker_trade_status("TRADE_STATUS_VETOED"),
            TradeStatus::Vetoed
        );
        assert_eq!(
            fleaflicker_trade_status("TRADE_STATUS_FUTURE"),
            TradeStatus::Pending
        );
    }

    #[test]
    fn sleeper_transactions_map_adds_drops_and_picks() {
        let league_id = Uuid::new_v4();
        let payload = json!([
            {
                "type": "trade",
                "transaction_id": "tx-1",
                "status": "complete",
                "roster_ids": [1, 2],
                "adds": {"p100": 1, "p200": 2},
                "drops": {"p100": 2, "p200": 1},
                "draft_picks": [
                    {"season": "2025", "round": 2, "owner_id": 1, "previous_owner_id": 2}
                ],
                "created": 1_700_000_000_000i64,
                "status_updated": 1_700_000_500_000i64
            },
            {"type": "waiver", "transaction_id": "tx-2", "status": "complete"}
        ]);

        let trades =
            convert_sleeper_transactions(league_id, "abc", "sleeper", &payload, Utc::now());
        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert_eq!(trade.external_trade_id, "tx-1");
        assert_eq!(trade.status, TradeStatus::Completed);
        assert!(trade.executed_at.is_some());

        let side1 = trade
            .participants
            .iter()
            .find(|p| p.external_team_id == "1")
            .unwrap();
        assert_eq!(side1.players_received, vec!["p100"]);
        assert_eq!(side1.players_given, vec!["p200"]);
        assert_eq!(side1.picks_received, vec!["2025 round 2"]);
        let side2 = trade
            .participants
            .iter()
            .find(|p| p.external_team_id == "2")
            .unwrap();
        assert_eq!(side2.picks_given, vec!["2025 round 2"]);
    }

    #[test]
    fn sleeper_trade_without_id_is_skipped() {
        let payload = json!([{"type": "trade", "status": "complete"}]);
        let trades = convert_sleeper_transactions(
            Uuid::new_v4(),
            "abc",
            "sleeper",
            &payload,
            Utc::now(),
        );
        assert!(trades.is_empty());
    }

    #[test]
    fn fleaflicker_two_team_trade_infers_gives() {
        let payload = json!({
            "trades": [{
                "id": 900,
                "status": "TRADE_STATUS_EXECUTED",
                "proposedOn": "1700000000000",
                "approvedOn": "1700000600000",
                "teams": [
                    {
                        "team": {"id": 11},
                        "playersObtained": [{"proPlayer": {"id": 1, "nameFull": "A. Back"}}],
                        "picksObtained": []
                    },
                    {
                        "team": {"id": 22},
                        "playersObtained": [{"proPlayer": {"id": 2, "nameFull": "B. Receiver"}}],
                        "picksObtained": [{"season": 2025, "slot": {"round": 1}}]
                    }
                ]
            }]
        });

        let trades =
            convert_fleaflicker_trades(Uuid::new_v4(), "77", "fleaflicker", &payload, Utc::now());
        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert_eq!(trade.participants.len(), 2);
        assert_eq!(trade.participants[0].players_given, vec!["B. Receiver"]);
        assert_eq!(trade.participants[0].picks_given, vec!["2025 round 1"]);
        assert_eq!(trade.participants[1].players_given, vec!["A. Back"]);
        assert!(trade.executed_at.is_some());
    }

    #[test]
    fn fleaflicker_multi_team_trade_uses_unknown_counterparty() {
        let payload = json!({
            "trades": [{
                "id": 901,
                "status": "TRADE_STATUS_OPEN",
                "teams": [
                    {"team": {"id": 1}, "playersObtained": [{"proPlayer": {"nameFull": "P One"}}]},
                    {"team": {"id": 2}, "playersObtained": [{"proPlayer": {"nameFull": "P Two"}}]},
                    {"team": {"id": 3}, "playersObtained": [{"proPlayer": {"nameFull": "P Three"}}]}
                ]
            }]
        });

        let trades =
            convert_fleaflicker_trades(Uuid::new_v4(), "77", "fleaflicker", &payload, Utc::now());
        let trade = &trades[0];
        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.participants.len(), 4);
        let unknown = trade.participants.last().unwrap();
        assert_eq!(unknown.external_team_id, UNKNOWN_COUNTERPARTY);
        assert_eq!(unknown.players_given.len(), 3);
        for side in &trade.participants[..3] {
            assert!(side.players_given.is_empty());
        }
    }

    #[test]
    fn sleeper_rosters_map_records_and_opponents() {
        let league = test_league(PlatformName::Sleeper);
        let rosters = json!([
            {
                "roster_id": 1,
                "owner_id": "u1",
                "players": ["p1", "p2"],
                "settings": {"wins": 7, "losses": 3, "ties": 0, "fpts": 1234, "fpts_decimal": 56, "fpts_against": 1100, "fpts_against_decimal": 4}
            },
            {"roster_id": 2, "owner_id": "u2", "players": [], "settings": {"wins": 3, "losses": 7}}
        ]);
        let users = json!([
            {"user_id": "u1", "display_name": "Commish"},
            {"user_id": "u2", "display_name": "Rival"}
        ]);
        let matchups = json!([
            {"roster_id": 1, "matchup_id": 5},
            {"roster_id": 2, "matchup_id": 5}
        ]);

        let teams = parse_sleeper_teams(&league, &rosters, &users, &matchups, Utc::now());
        assert_eq!(teams.len(), 2);
        let first = teams.iter().find(|t| t.external_team_id == "1").unwrap();
        assert_eq!(first.external_username.as_deref(), Some("Commish"));
        assert_eq!(first.opponent_external_id.as_deref(), Some("2"));
        assert_eq!(first.record.wins, 7);
        assert!((first.record.points_for - 1234.56).abs() < 1e-9);
        assert_eq!(first.season, Some(2024));
    }

    #[tokio::test]
    async fn league_record_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let platform = PlatformRef {
            name: PlatformName::Sleeper,
            platform_id: "sleeper".to_string(),
        };
        let info = FetchedLeagueInfo {
            name: Some("Dynasty League".to_string()),
            season: Some(2024),
        };

        let first = upsert_league_record(&store, platform.clone(), "abc", "fallback", info.clone())
            .await
            .unwrap();
        let second = upsert_league_record(
            &store,
            platform,
            "abc",
            "fallback",
            FetchedLeagueInfo {
                name: Some("Dynasty League".to_string()),
                season: Some(2025),
            },
        )
        .await
        .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.season, Some(2025));

        let all: Vec<League> = query_typed(
            &store,
            collections::LEAGUES,
            Query::new().filter_eq("external_league_id", "abc"),
        )
        .await
        .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn user_team_binding_repairs_duplicates() {
        let store = MemoryStore::new();
        let league = test_league(PlatformName::Sleeper);

        let team = Team {
            id: Uuid::new_v4(),
            external_team_id: "1".to_string(),
            league_id: league.id,
            league_master_id: None,
            season: Some(2024),
            external_user_id: Some("u1".to_string()),
            external_username: Some("Commish".to_string()),
            opponent_external_id: None,
            players: vec![],
            record: TeamRecord::default(),
            last_fetched: None,
        };
        let mut batch = WriteBatch::new();
        batch.set(
            collections::TEAMS,
            team.id.to_string(),
            encode_entity(&team).unwrap(),
        );
        // Seed two conflicting bindings for the same (user, team).
        for offset in [10, 5] {
            let binding = UserTeam {
                id: Uuid::new_v4(),
                user_id: "internal-1".to_string(),
                team_id: team.id,
                league_master_id: None,
                current_season: None,
                created_at: Utc::now() - chrono::Duration::days(offset),
                last_modified: Utc::now(),
            };
            batch.set(
                collections::USER_TEAMS,
                binding.id.to_string(),
                encode_entity(&binding).unwrap(),
            );
        }
        store.commit(batch).await.unwrap();

        upsert_user_team_binding(&store, &league, "internal-1", Some("u1"), None)
            .await
            .unwrap();

        let bindings: Vec<UserTeam> = query_typed(
            &store,
            collections::USER_TEAMS,
            Query::new().filter_eq("user_id", "internal-1"),
        )
        .await
        .unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].current_season, Some(2024));

        // Calling again is a no-op on cardinality.
        upsert_user_team_binding(&store, &league, "internal-1", None, Some("1"))
            .await
            .unwrap();
        let bindings: Vec<UserTeam> = query_typed(
            &store,
            collections::USER_TEAMS,
            Query::new().filter_eq("user_id", "internal-1"),
        )
        .await
        .unwrap();
        assert_eq!(bindings.len(), 1);
    }

    #[tokio::test]
    async fn missing_team_yields_not_found() {
        let store = MemoryStore::new();
        let league = test_league(PlatformName::Fleaflicker);
        let err = upsert_user_team_binding(&store, &league, "u", Some("nobody"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::NotFound(_)));
    }

    #[test]
    fn registry_resolves_both_platforms() {
        let registry = AdapterRegistry::with_defaults();
        assert!(registry.get(PlatformName::Sleeper).is_some());
        assert!(registry.get(PlatformName::Fleaflicker).is_some());
        assert_eq!(registry.platforms().len(), 2);
    }
}
