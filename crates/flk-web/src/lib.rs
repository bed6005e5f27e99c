//! Axum JSON surface over the FLK sync service.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flk_sync::{SyncError, SyncService};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "flk-web";

#[derive(Clone)]
pub struct AppState {
    pub service: SyncService,
}

impl AppState {
    pub fn new(service: SyncService) -> Self {
        Self { service }
    }
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    success: bool,
    message: String,
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiMessage {
            success: false,
            message: message.into(),
        }),
    )
        .into_response()
}

/// Every failure is a structured body, never a raw error dump.
fn sync_error_response(err: SyncError) -> Response {
    let status = match &err {
        SyncError::NotFound(_) => StatusCode::NOT_FOUND,
        SyncError::UnsupportedPlatform(_) => StatusCode::BAD_REQUEST,
        SyncError::AlreadyMigrated(_) => StatusCode::CONFLICT,
        SyncError::Adapter(_) => StatusCode::BAD_GATEWAY,
        SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    failure(status, err.to_string())
}

#[derive(Debug, Deserialize, Default)]
struct SeasonQuery {
    season: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
struct TradeSyncQuery {
    external_league_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LeaguesQuery {
    limit: Option<usize>,
    cursor: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/migrations/bulk", post(bulk_migration_handler))
        .route("/leagues", get(leagues_handler))
        .route("/leagues/{id}/migrate", post(league_migration_handler))
        .route("/leagues/{id}/trades/sync", post(trade_sync_handler))
        .route("/leagues/{id}/teams", get(league_teams_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(service: SyncService, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

pub async fn serve_from_env(service: SyncService) -> anyhow::Result<()> {
    let port: u16 = std::env::var("FLK_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    serve(service, port).await
}

async fn bulk_migration_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SeasonQuery>,
) -> Response {
    let Some(season) = query.season else {
        return failure(StatusCode::BAD_REQUEST, "season query parameter is required");
    };
    match state.service.run_bulk_migration(season).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn league_migration_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Query(query): Query<SeasonQuery>,
) -> Response {
    match state
        .service
        .run_single_league_migration(id, query.season)
        .await
    {
        Ok(stats) if stats.success => Json(stats).into_response(),
        Ok(stats) => (StatusCode::CONFLICT, Json(stats)).into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn trade_sync_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Query(query): Query<TradeSyncQuery>,
) -> Response {
    match state
        .service
        .sync_trades(id, query.external_league_id.as_deref())
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn leagues_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeaguesQuery>,
) -> Response {
    match state
        .service
        .list_leagues(query.limit.unwrap_or(20), query.cursor)
        .await
    {
        Ok(page) => Json(page).into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn league_teams_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.service.list_league_teams(id).await {
        Ok(teams) => Json(teams).into_response(),
        Err(err) => sync_error_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use flk_adapters::AdapterRegistry;
    use flk_core::{collections, League, PlatformName, PlatformRef, Team, TeamRecord};
    use flk_store::{encode_entity, DocumentStore, MemoryStore, WriteBatch};
    use flk_sync::SyncConfig;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn seeded_state() -> (AppState, League) {
        let store = Arc::new(MemoryStore::new());
        let league = League {
            id: Uuid::new_v4(),
            name: "Dynasty".to_string(),
            platform: PlatformRef {
                name: PlatformName::Sleeper,
                platform_id: "sleeper".to_string(),
            },
            external_league_id: "abc".to_string(),
            league_master_id: None,
            season: Some(2023),
            last_modified: Utc::now(),
        };
        let team = Team {
            id: Uuid::new_v4(),
            external_team_id: "1".to_string(),
            league_id: league.id,
            league_master_id: None,
            season: Some(2023),
            external_user_id: Some("u1".to_string()),
            external_username: None,
            opponent_external_id: None,
            players: vec![],
            record: TeamRecord::default(),
            last_fetched: None,
        };
        let mut batch = WriteBatch::new();
        batch.set(
            collections::LEAGUES,
            league.id.to_string(),
            encode_entity(&league).unwrap(),
        );
        batch.set(
            collections::TEAMS,
            team.id.to_string(),
            encode_entity(&team).unwrap(),
        );
        store.commit(batch).await.unwrap();

        let service = SyncService::new(
            SyncConfig::default(),
            store as Arc<dyn DocumentStore>,
            AdapterRegistry::with_defaults(),
        )
        .unwrap();
        (AppState::new(service), league)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn bulk_migration_requires_a_season() {
        let (state, _) = seeded_state().await;
        let app = app(state);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/migrations/bulk")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn bulk_migration_returns_stats() {
        let (state, _) = seeded_state().await;
        let app = app(state);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/migrations/bulk?season=2024")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["leagues_processed"], 1);
        assert_eq!(body["league_masters_created"], 1);
        assert_eq!(body["season"], 2024);
    }

    #[tokio::test]
    async fn second_single_league_migration_conflicts() {
        let (state, league) = seeded_state().await;
        let app = app(state);

        let first = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/leagues/{}/migrate?season=2024", league.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/leagues/{}/migrate?season=2024", league.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let body = body_json(second).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn league_listing_and_team_flags_render() {
        let (state, league) = seeded_state().await;
        let app = app(state);

        let leagues = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/leagues?limit=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(leagues.status(), StatusCode::OK);
        let body = body_json(leagues).await;
        assert_eq!(body["leagues"].as_array().unwrap().len(), 1);

        let teams = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/leagues/{}/teams", league.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(teams.status(), StatusCode::OK);
        let body = body_json(teams).await;
        let first = &body.as_array().unwrap()[0];
        // Never-fetched, pre-migration team: both flags set.
        assert_eq!(first["needs_migrate"], true);
        assert_eq!(first["needs_update"], false);
    }

    #[tokio::test]
    async fn unknown_league_is_structured_not_found() {
        let (state, _) = seeded_state().await;
        let app = app(state);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/leagues/{}/trades/sync", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("not found"));
    }
}
