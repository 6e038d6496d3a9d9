// Sessions and identity
//
// Sessions are opaque tokens held in memory. A token arrives either as the
// `sb_session` cookie or as an `Authorization: Bearer` header. The identity
// provider itself lives outside this service; `POST /auth/dev-login` stands
// in for it when DEV_LOGIN is enabled.

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

pub const SESSION_COOKIE: &str = "sb_session";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
struct Session {
    user: UserProfile,
    expires_at: DateTime<Utc>,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Start a session for `user` and return its token
    pub fn create(&self, user: UserProfile) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::days(7));
        let session = Session {
            user,
            expires_at: Utc::now() + ttl,
        };
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.insert(token.clone(), session);
        token
    }

    pub fn get(&self, token: &str) -> Option<UserProfile> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let session = sessions.get(token)?;
        if session.expires_at <= Utc::now() {
            return None;
        }
        Some(session.user.clone())
    }

    pub fn remove(&self, token: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(token).is_some()
    }

    /// Drop expired sessions
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }
}

/// Session token from the cookie, falling back to a bearer header
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string());

    from_cookie.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
    })
    .filter(|token| !token.is_empty())
}

pub fn current_user(state: &AppState, headers: &HeaderMap) -> Option<UserProfile> {
    let token = session_token(headers)?;
    state.sessions.get(&token)
}

fn session_cookie(token: &str, max_age: u64) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(&format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE, token, max_age
    ))
    .map_err(|e| ApiError::Internal(e.to_string()))
}

/// GET /auth/me - The signed-in user
pub async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &headers).ok_or(ApiError::Unauthorized)?;
    Ok(Json(json!({ "user": user })))
}

/// POST /auth/logout - End the current session, if any
pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if let Some(token) = session_token(&headers) {
        state.sessions.remove(&token);
    }
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, session_cookie("", 0)?)],
        Json(json!({ "ok": true })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct DevLoginRequest {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// POST /auth/dev-login - Sign in as anyone; only with DEV_LOGIN enabled
pub async fn dev_login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DevLoginRequest>,
) -> Result<Response, ApiError> {
    if !state.config.dev_login {
        return Err(ApiError::NotFound);
    }
    if payload.id.trim().is_empty() {
        return Err(ApiError::MissingId);
    }

    let user = UserProfile {
        name: payload.name.unwrap_or_else(|| payload.id.clone()),
        id: payload.id,
        email: payload.email,
    };
    let token = state.sessions.create(user.clone());
    info!(user_id = %user.id, "Dev login session created");

    Ok((
        StatusCode::OK,
        [(
            header::SET_COOKIE,
            session_cookie(&token, state.sessions.ttl().as_secs())?,
        )],
        Json(json!({ "token": token, "user": user })),
    )
        .into_response())
}
