//! Match allocation endpoints.
//!
//! `request-public-match` and `request-private-match` share one path:
//! validate, pick a VM, ask its worker to start the match, record it.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::matches::MatchRecord;
use crate::scenes;
use crate::state::AppState;
use crate::worker::StartMatchRequest;

/// Tick rate applied when the request omits one.
const DEFAULT_TICK_RATE: u32 = 60;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/request-public-match", post(request_public_match))
        .route("/request-private-match", post(request_private_match))
        .route("/match-details/{match_id}", get(match_details))
}

/// Incoming match request. Unknown fields are tolerated; missing required
/// fields are rejected in validation, not by the decoder.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    #[serde(default)]
    pub match_id: Option<String>,
    #[serde(default)]
    pub game_mode: Option<String>,
    #[serde(default)]
    pub tick_rate: Option<u32>,
    #[serde(default)]
    pub match_type: Option<String>,
}

/// Outgoing match descriptor.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchDescriptor {
    #[serde(rename = "serverIP")]
    pub server_ip: String,
    pub server_port: u16,
    pub match_id: String,
    pub game_mode: String,
    pub tick_rate: u32,
    pub container_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

async fn request_public_match(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<MatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    allocate_match(state, ctx, body, "Public").await
}

async fn request_private_match(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<MatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    allocate_match(state, ctx, body, "Private").await
}

async fn allocate_match(
    state: AppState,
    ctx: RequestContext,
    body: MatchRequest,
    match_privacy: &str,
) -> Result<Json<MatchDescriptor>, ApiError> {
    let request_id = ctx.request_id;

    let match_id = match body.match_id {
        Some(id) if !id.is_empty() => id,
        _ => {
            return Err(
                ApiError::bad_request("missing_match_id", "matchId is required")
                    .with_request_id(request_id),
            )
        }
    };
    let game_mode = match body.game_mode {
        Some(mode) if !mode.is_empty() => mode,
        _ => {
            return Err(
                ApiError::bad_request("missing_game_mode", "gameMode is required")
                    .with_request_id(request_id),
            )
        }
    };
    if !scenes::is_known_game_mode(&game_mode) {
        return Err(ApiError::bad_request(
            "invalid_game_mode",
            format!("unrecognized gameMode: {game_mode}"),
        )
        .with_request_id(request_id));
    }

    let tick_rate = body.tick_rate.unwrap_or(DEFAULT_TICK_RATE);
    let match_type = body.match_type.unwrap_or_else(|| {
        if match_privacy == "Private" {
            "CustomPrivate".to_string()
        } else {
            "QuickPlay".to_string()
        }
    });

    let Some(vm) = state.fleet().get_available_vm().await else {
        warn!(match_id = %match_id, request_id = %request_id, "No VM available for match");
        return Err(
            ApiError::no_capacity("no VM has free capacity and none could be launched")
                .with_request_id(request_id),
        );
    };

    let start_request = StartMatchRequest {
        match_id: match_id.clone(),
        game_mode: game_mode.clone(),
        match_privacy: match_privacy.to_string(),
        tick_rate,
        match_type: match_type.clone(),
        playfab_secret_key: state.config().playfab_secret_key.clone(),
    };

    let started = match state
        .fleet()
        .worker()
        .start_match(&vm.ip, &start_request)
        .await
    {
        Ok(started) => started,
        Err(e) => {
            // Count untouched: the next reconcile normalizes from status.
            warn!(
                match_id = %match_id,
                instance_id = %vm.instance_id,
                error = %e,
                "Worker failed to start match"
            );
            return Err(
                ApiError::internal("match_start_failed", "worker failed to start the match")
                    .with_request_id(request_id),
            );
        }
    };

    state
        .matches()
        .insert(MatchRecord {
            match_id: match_id.clone(),
            game_mode: game_mode.clone(),
            match_privacy: match_privacy.to_string(),
            tick_rate,
            match_type,
            server_ip: vm.ip.clone(),
            server_port: started.server_port,
            container_id: started.container_id.clone(),
            vm_instance_id: vm.instance_id.clone(),
            started_at: chrono::Utc::now(),
        })
        .await;
    state
        .fleet()
        .registry()
        .increment_match_count(&vm.instance_id)
        .await;

    info!(
        match_id = %match_id,
        instance_id = %vm.instance_id,
        server_ip = %vm.ip,
        server_port = started.server_port,
        "Match started"
    );

    Ok(Json(MatchDescriptor {
        server_ip: vm.ip,
        server_port: started.server_port,
        match_id,
        game_mode,
        tick_rate,
        container_id: started.container_id,
        message: started.message,
    }))
}

async fn match_details(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(match_id): Path<String>,
) -> Result<Json<MatchRecord>, ApiError> {
    match state.matches().get(&match_id).await {
        Some(record) => Ok(Json(record)),
        None => Err(
            ApiError::not_found("match_not_found", format!("no match with id {match_id}"))
                .with_request_id(ctx.request_id),
        ),
    }
}
