//! The administrative HTTP surface: POI and air-beacon lifecycle, build
//! info, runtime log level, store dump and the development token helper.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde_json::json;

use geopulse_core::entity::{BeaconSummary, PoiSummary};
use geopulse_core::WorldError;
use geopulse_transport::command::{BeaconCommand, PoiCommand};

use crate::auth::{self, Capabilities, Claims};
use crate::session::TOKEN_HEADER;
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/POI", post(create_poi).delete(remove_poi))
        .route("/v1/airbeacon", post(create_beacon).delete(remove_beacon))
        .route("/v1/log", post(set_log_level))
        .route("/v1/dump", get(dump_store))
        .route("/v1/dev/token", get(dev_token))
        .with_state(state)
}

fn token_from(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.get("token").cloned())
}

fn error_body(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "error": error }))).into_response()
}

/// Verifies the capability token and its `http` grant, then the
/// route-specific capability.
fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    allowed: impl Fn(&Capabilities) -> bool,
    denied: &str,
) -> Result<Claims, Response> {
    let Some(token) = token_from(headers, query) else {
        warn!("HTTP route: missing token");
        return Err(error_body(
            StatusCode::UNAUTHORIZED,
            "Can't parse token, or token invalid",
        ));
    };
    let claims = match auth::verify(&token, &state.secret) {
        Ok(claims) => claims,
        Err(err) => {
            warn!("HTTP route: {err}");
            return Err(error_body(
                StatusCode::UNAUTHORIZED,
                "Can't parse token, or token invalid",
            ));
        }
    };
    if !claims.capabilities.http {
        warn!("HTTP route: token without the http capability");
        return Err(error_body(
            StatusCode::UNAUTHORIZED,
            "Can't parse token, or token invalid",
        ));
    }
    if !allowed(&claims.capabilities) {
        warn!("HTTP route: {denied}");
        return Err(error_body(StatusCode::FORBIDDEN, denied));
    }
    Ok(claims)
}

fn admin_authorized(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> bool {
    let Some(expected) = state.admin_bearer.as_deref() else {
        return false;
    };
    let header = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value));
    header == Some(expected) || query.get("bearer").map(String::as_str) == Some(expected)
}

fn poi_json(poi: &PoiSummary) -> serde_json::Value {
    json!({
        "poi_id": poi.id.as_ref(),
        "pos": poi.pos,
        "publicData": poi.public_data,
        "creator": poi.creator.as_deref(),
    })
}

fn beacon_json(beacon: &BeaconSummary) -> serde_json::Value {
    json!({
        "ab_id": beacon.id.as_ref(),
        "pos": beacon.rect,
        "publicData": beacon.public_data,
        "creator": beacon.creator.as_deref(),
    })
}

async fn ping() -> Response {
    Json(json!({
        "tag": env!("CARGO_PKG_VERSION"),
        "build": option_env!("GEOPULSE_BUILD").unwrap_or("dev"),
    }))
    .into_response()
}

async fn create_poi(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let authorized = authorize(
        &state,
        &headers,
        &query,
        |caps| caps.create_poi,
        "Your token doesn't allow POI creation/removal",
    );
    if let Err(response) = authorized {
        return response;
    }
    let command: PoiCommand = match serde_json::from_slice(&body) {
        Ok(command) => command,
        Err(_) => return error_body(StatusCode::BAD_REQUEST, "Can't parse json body"),
    };
    let (Some(id), Some(pos)) = (command.poi_id.as_deref(), command.pos) else {
        return error_body(StatusCode::BAD_REQUEST, "poi_id and pos are required");
    };
    if !pos.is_valid() {
        return error_body(StatusCode::BAD_REQUEST, "Invalid POI position");
    }
    info!("POST /v1/POI: {id} at {pos:?}");
    match state
        .dispatcher
        .create_poi(id, pos, command.public_data.unwrap_or_default(), command.creator.as_deref())
    {
        Ok(poi) => (StatusCode::CREATED, Json(poi_json(&poi))).into_response(),
        Err(err @ WorldError::DuplicateId { .. }) => {
            error_body(StatusCode::CONFLICT, &err.to_string())
        }
        Err(err) => error_body(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn remove_poi(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let authorized = authorize(
        &state,
        &headers,
        &query,
        |caps| caps.create_poi,
        "Your token doesn't allow POI creation/removal",
    );
    if let Err(response) = authorized {
        return response;
    }
    let command: PoiCommand = match serde_json::from_slice(&body) {
        Ok(command) => command,
        Err(_) => return error_body(StatusCode::BAD_REQUEST, "Can't parse json body"),
    };
    let Some(id) = command.poi_id.as_deref() else {
        return error_body(StatusCode::BAD_REQUEST, "poi_id is required");
    };
    info!("DELETE /v1/POI: {id}");
    match state.dispatcher.remove_poi(id, None) {
        Ok(poi) => (StatusCode::OK, Json(poi_json(&poi))).into_response(),
        Err(WorldError::NotFound { .. }) => error_body(StatusCode::NOT_FOUND, "POI not found"),
        Err(err) => error_body(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn create_beacon(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let authorized = authorize(
        &state,
        &headers,
        &query,
        |caps| caps.create_air_beacon,
        "Your token doesn't allow air beacon creation/removal",
    );
    if let Err(response) = authorized {
        return response;
    }
    let command: BeaconCommand = match serde_json::from_slice(&body) {
        Ok(command) => command,
        Err(_) => return error_body(StatusCode::BAD_REQUEST, "Can't parse json body"),
    };
    let (Some(id), Some(pos)) = (command.ab_id.as_deref(), command.pos) else {
        return error_body(StatusCode::BAD_REQUEST, "ab_id and pos are required");
    };
    if !pos.is_valid() {
        return error_body(StatusCode::BAD_REQUEST, "Invalid air beacon position");
    }
    info!("POST /v1/airbeacon: {id} at {pos:?}");
    match state
        .world
        .create_beacon(id, pos, command.public_data.unwrap_or_default(), command.creator.as_deref())
    {
        Ok(beacon) => (StatusCode::CREATED, Json(beacon_json(&beacon))).into_response(),
        Err(err @ WorldError::DuplicateId { .. }) => {
            error_body(StatusCode::CONFLICT, &err.to_string())
        }
        Err(err) => error_body(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn remove_beacon(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let authorized = authorize(
        &state,
        &headers,
        &query,
        |caps| caps.create_air_beacon,
        "Your token doesn't allow air beacon creation/removal",
    );
    if let Err(response) = authorized {
        return response;
    }
    let command: BeaconCommand = match serde_json::from_slice(&body) {
        Ok(command) => command,
        Err(_) => return error_body(StatusCode::BAD_REQUEST, "Can't parse json body"),
    };
    let Some(id) = command.ab_id.as_deref() else {
        return error_body(StatusCode::BAD_REQUEST, "ab_id is required");
    };
    info!("DELETE /v1/airbeacon: {id}");
    match state.world.remove_beacon(id, None) {
        Ok(beacon) => (StatusCode::OK, Json(beacon_json(&beacon))).into_response(),
        Err(WorldError::NotFound { .. }) => {
            error_body(StatusCode::NOT_FOUND, "air beacon not found")
        }
        Err(err) => error_body(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn set_log_level(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !admin_authorized(&state, &headers, &query) {
        warn!("unauthorized attempt to set the log level");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let level = query.get("level").map(String::as_str).unwrap_or("");
    let filter = match level {
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        other => {
            warn!("invalid log level {other:?}");
            return error_body(StatusCode::BAD_REQUEST, "invalid log level");
        }
    };
    info!("setting log level to {level}");
    log::set_max_level(filter);
    StatusCode::OK.into_response()
}

async fn dump_store(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !admin_authorized(&state, &headers, &query) {
        warn!("unauthorized attempt to dump the store");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.world.dump_store() {
        Ok(stored) => Json(stored).into_response(),
        Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn dev_token(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !state.dev_routes {
        return StatusCode::NOT_FOUND.into_response();
    }
    let agent_id = query.get("agId").map(String::as_str).unwrap_or("");
    let view_id = query.get("viewId").map(String::as_str).unwrap_or("");
    match auth::dev_token(&state.secret, agent_id, view_id) {
        Ok(token) => token.into_response(),
        Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}
