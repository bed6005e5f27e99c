//! Canonical domain model for FLK: the platform-independent entity graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flk-core";

/// Sentinel counterparty for trade sides that cannot be attributed from the
/// source payload.
pub const UNKNOWN_COUNTERPARTY: &str = "unknown";

/// Store collection names, one per entity kind plus the contention log.
pub mod collections {
    pub const LEAGUE_MASTERS: &str = "league_masters";
    pub const LEAGUES: &str = "leagues";
    pub const TEAMS: &str = "teams";
    pub const USER_TEAMS: &str = "user_teams";
    pub const TRADES: &str = "trades";
    pub const CONTENTION_LOG: &str = "contention_log";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformName {
    Sleeper,
    Fleaflicker,
}

impl PlatformName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformName::Sleeper => "sleeper",
            PlatformName::Fleaflicker => "fleaflicker",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "sleeper" => Some(PlatformName::Sleeper),
            "fleaflicker" => Some(PlatformName::Fleaflicker),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlatformName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External platform identity attached to a league: which platform, and the
/// platform's own id for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformRef {
    pub name: PlatformName,
    pub platform_id: String,
}

/// The canonical grouping key for persistent league identity. Historical
/// League rows that share this key belong to the same real-world league.
pub fn league_group_key(platform: PlatformName, external_league_id: &str) -> String {
    format!("{}:{}", platform.as_str(), external_league_id)
}

/// Persistent identity for a league across seasons. Created by migration or
/// first-connect; never deleted; only `last_modified` refreshes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeagueMaster {
    pub id: Uuid,
    pub name: String,
    pub platform: PlatformRef,
    pub external_league_id: String,
    pub creator_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl LeagueMaster {
    pub fn group_key(&self) -> String {
        league_group_key(self.platform.name, &self.external_league_id)
    }
}

/// One season's instance of a league. `league_master_id` is a back-reference,
/// immutable once set by migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct League {
    pub id: Uuid,
    pub name: String,
    pub platform: PlatformRef,
    pub external_league_id: String,
    pub league_master_id: Option<Uuid>,
    pub season: Option<i32>,
    pub last_modified: DateTime<Utc>,
}

impl League {
    pub fn group_key(&self) -> String {
        league_group_key(self.platform.name, &self.external_league_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TeamRecord {
    pub wins: u32,
    pub losses: u32,
    pub ties: u32,
    pub points_for: f64,
    pub points_against: f64,
}

/// A roster within one League for one season. Unique per
/// `(external_team_id, league_id)`. `league_master_id` and `season` are
/// denormalized from the owning League for season-spanning lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub external_team_id: String,
    pub league_id: Uuid,
    pub league_master_id: Option<Uuid>,
    pub season: Option<i32>,
    pub external_user_id: Option<String>,
    pub external_username: Option<String>,
    pub opponent_external_id: Option<String>,
    pub players: Vec<String>,
    pub record: TeamRecord,
    pub last_fetched: Option<DateTime<Utc>>,
}

/// Binding of an internal user to a Team, denormalized with the league master
/// and current season for history queries. Unique per `(user_id, team_id)`;
/// duplicates are detected and repaired, not tolerated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTeam {
    pub id: Uuid,
    pub user_id: String,
    pub team_id: Uuid,
    pub league_master_id: Option<Uuid>,
    pub current_season: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Completed,
    Rejected,
    Canceled,
    Vetoed,
    Invalidated,
}

/// One side of a trade: what this external team gave up and received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeParticipant {
    pub external_team_id: String,
    pub players_given: Vec<String>,
    pub players_received: Vec<String>,
    pub picks_given: Vec<String>,
    pub picks_received: Vec<String>,
}

impl TradeParticipant {
    pub fn empty(external_team_id: impl Into<String>) -> Self {
        Self {
            external_team_id: external_team_id.into(),
            players_given: Vec::new(),
            players_received: Vec::new(),
            picks_given: Vec::new(),
            picks_received: Vec::new(),
        }
    }
}

/// Canonical representation of a platform trade/transaction. Unique per
/// `(external_trade_id, league_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub external_trade_id: String,
    pub league_id: Uuid,
    pub external_league_id: String,
    pub platform_id: String,
    pub status: TradeStatus,
    pub participants: Vec<TradeParticipant>,
    pub proposed_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub last_synced: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_key_is_platform_scoped() {
        let sleeper = league_group_key(PlatformName::Sleeper, "abc");
        let fleaflicker = league_group_key(PlatformName::Fleaflicker, "abc");
        assert_eq!(sleeper, "sleeper:abc");
        assert_ne!(sleeper, fleaflicker);
    }

    #[test]
    fn platform_name_round_trips_through_strings() {
        for name in [PlatformName::Sleeper, PlatformName::Fleaflicker] {
            assert_eq!(PlatformName::parse(name.as_str()), Some(name));
        }
        assert_eq!(PlatformName::parse("espn"), None);
    }

    #[test]
    fn trade_status_serializes_snake_case() {
        let json = serde_json::to_string(&TradeStatus::Vetoed).unwrap();
        assert_eq!(json, "\"vetoed\"");
    }
}
