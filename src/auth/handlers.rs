use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::session;
use crate::db::models::UserProfile;
use crate::error::AppResult;
use crate::extractors::session_token;
use crate::social::Registration;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserProfile,
}

// -- Cookie helpers --

fn session_cookie(name: &str, token: &str, max_age_hours: u64) -> String {
    let max_age_secs = max_age_hours * 3600;
    format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
        name, token, max_age_secs
    )
}

fn clear_session_cookie(name: &str) -> String {
    format!("{}=; HttpOnly; SameSite=Strict; Path=/; Max-Age=0", name)
}

/// POST /register
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<Registration>,
) -> AppResult<Response> {
    let user = state.identity.register(&req).await?;
    Ok((StatusCode::CREATED, Json(user.profile())).into_response())
}

/// POST /login: verify credentials and open a session
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Response> {
    let user = state.identity.authenticate(&req.email, &req.password).await?;

    let hours = state.config.auth.session_hours;
    let token = session::create_session(&state.db, user.id, hours)?;
    let cookie = session_cookie(&state.config.auth.cookie_name, &token, hours);

    Ok((
        StatusCode::OK,
        AppendHeaders([(header::SET_COOKIE, cookie)]),
        Json(LoginResponse {
            token,
            user: user.profile(),
        }),
    )
        .into_response())
}

/// POST /logout: delete the session, if any, and clear the cookie
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let cookie_name = &state.config.auth.cookie_name;

    if let Some(token) = session_token(&headers, cookie_name) {
        session::delete_session(&state.db, token)?;
    }

    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, clear_session_cookie(cookie_name))],
        Json(serde_json::json!({ "status": "logged_out" })),
    )
        .into_response())
}
