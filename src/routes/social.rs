use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::db::models::{Post, UserProfile};
use crate::error::AppResult;
use crate::extractors::CurrentUser;
use crate::social::FollowOutcome;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct FollowRequest {
    pub username: String,
}

#[derive(Serialize)]
pub struct FollowResponse {
    pub status: FollowOutcome,
}

#[derive(Deserialize)]
pub struct PostRequest {
    pub message: String,
}

/// POST /follow
pub async fn follow(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<FollowRequest>,
) -> AppResult<Json<FollowResponse>> {
    let status = state.graph.follow(&user, &req.username).await?;
    Ok(Json(FollowResponse { status }))
}

/// POST /posts
pub async fn create_post(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<PostRequest>,
) -> AppResult<Response> {
    let post = state.feed.publish(&user, &req.message).await?;
    Ok((StatusCode::CREATED, Json(post)).into_response())
}

/// GET /feed
pub async fn feed(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<Vec<Post>>> {
    Ok(Json(state.feed.get_feed(&user).await?))
}

/// GET /me
pub async fn me(CurrentUser(user): CurrentUser) -> Json<UserProfile> {
    Json(user.profile())
}
