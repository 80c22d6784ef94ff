//! HTTP request handlers.

use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
};
use serde::Serialize;
use tracing::{info, instrument};

use crate::user::{CreateUserRequest, LoginRequest, UserInfo, UserListQuery, UserPatch};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub users: u64,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let users = state.users.count().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        users,
    }))
}

/// Check credentials and return the matching user.
#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Json<UserInfo>> {
    let Json(request) = payload?;

    state
        .users
        .login(request)
        .await?
        .map(|u| Json(u.into()))
        .ok_or_else(|| ApiError::unauthorized("Invalid email or password"))
}

/// List users.
#[instrument(skip(state, query))]
pub async fn list_users(
    State(state): State<AppState>,
    query: Result<Query<UserListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<UserInfo>>> {
    let Query(query) = query?;
    let users = state.users.list_users(query).await?;

    let user_infos: Vec<UserInfo> = users.into_iter().map(|u| u.into()).collect();
    info!(count = user_infos.len(), "Listed users");
    Ok(Json(user_infos))
}

/// Get a specific user.
#[instrument(skip(state))]
pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<UserInfo>> {
    state
        .users
        .get_user_by_id(&user_id)
        .await?
        .map(|u| Json(u.into()))
        .ok_or_else(|| ApiError::not_found(format!("User {} not found", user_id)))
}

/// Create a new user.
#[instrument(skip(state, payload))]
pub async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<UserInfo>)> {
    let Json(request) = payload?;
    let user = state.users.create_user(request).await?;

    Ok((StatusCode::CREATED, Json(user.into())))
}

/// Update a user. Only fields present in the body change.
#[instrument(skip(state, payload))]
pub async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    payload: Result<Json<UserPatch>, JsonRejection>,
) -> ApiResult<Json<UserInfo>> {
    let Json(patch) = payload?;

    state
        .users
        .update_user(&user_id, patch)
        .await?
        .map(|u| Json(u.into()))
        .ok_or_else(|| ApiError::not_found(format!("User {} not found", user_id)))
}

/// Delete a user.
#[instrument(skip(state))]
pub async fn delete_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.users.delete_user(&user_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("User {} not found", user_id)))
    }
}
