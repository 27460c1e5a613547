//! In-memory stand-in for the time-tracking API.
//!
//! Speaks the real wire format (snake_case JSON, `{data, meta}` envelopes,
//! bearer access tokens, an HttpOnly refresh cookie) and exposes hooks on
//! [`AppState`] so tests can expire or revoke credentials and count refresh
//! calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

pub const REFRESH_COOKIE: &str = "refresh_token";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub color: Option<String>,
    pub billable: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct SignupRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct CreateProject {
    pub name: String,
    pub color: Option<String>,
    #[serde(default)]
    pub billable: bool,
}

#[derive(Deserialize)]
pub struct UpdateProject {
    pub name: Option<String>,
    pub color: Option<String>,
    pub billable: Option<bool>,
}

#[derive(Deserialize)]
pub struct CreateTimeEntry {
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct EntryFilter {
    pub project_id: Option<Uuid>,
}

struct Account {
    user: User,
    password: String,
}

#[derive(Default)]
struct Store {
    accounts: HashMap<Uuid, Account>,
    access_tokens: HashMap<String, Uuid>,
    refresh_tokens: HashMap<String, Uuid>,
    projects: HashMap<Uuid, Project>,
    entries: Vec<TimeEntry>,
}

impl Store {
    fn issue_access_token(&mut self, user_id: Uuid) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.access_tokens.insert(token.clone(), user_id);
        token
    }

    fn issue_refresh_token(&mut self, user_id: Uuid) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.refresh_tokens.insert(token.clone(), user_id);
        token
    }
}

/// Shared server state plus test hooks.
#[derive(Clone, Default)]
pub struct AppState {
    store: Arc<RwLock<Store>>,
    refresh_calls: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `POST /auth/refresh` requests received so far.
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Invalidate every access token, as if they had all timed out.
    pub async fn expire_access_tokens(&self) {
        self.store.write().await.access_tokens.clear();
    }

    /// Invalidate every refresh cookie.
    pub async fn revoke_refresh_tokens(&self) {
        self.store.write().await.refresh_tokens.clear();
    }
}

/// A JSON error body: `{"message": ...}`.
#[derive(Debug)]
pub struct Failure(pub StatusCode, pub &'static str);

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "message": self.1 }))).into_response()
    }
}

pub fn app() -> Router {
    app_with_state(AppState::new())
}

pub fn app_with_state(state: AppState) -> Router {
    let api = Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", delete(logout))
        .route("/projects", get(list_projects).post(create_project))
        .route(
            "/projects/{id}",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/time-entries", get(list_entries).post(create_entry))
        .route("/uploads", post(upload));
    Router::new().nest("/api/v1", api).with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with_state(listener, AppState::new()).await
}

pub async fn run_with_state(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

fn session_cookie(token: &str) -> String {
    format!("{REFRESH_COOKIE}={token}; HttpOnly; Path=/; SameSite=Strict")
}

fn refresh_token_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| pair.trim().strip_prefix(&format!("{REFRESH_COOKIE}=")).map(str::to_string))
}

fn bearer_from(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Uuid, Failure> {
    let token = bearer_from(headers).ok_or(Failure(StatusCode::UNAUTHORIZED, "missing access token"))?;
    state
        .store
        .read()
        .await
        .access_tokens
        .get(token)
        .copied()
        .ok_or(Failure(StatusCode::UNAUTHORIZED, "access token expired"))
}

fn session_response(status: StatusCode, access: String, refresh: String, user: &User) -> Response {
    (
        status,
        [(header::SET_COOKIE, session_cookie(&refresh))],
        Json(json!({ "data": { "access_token": access, "user": user } })),
    )
        .into_response()
}

async fn signup(
    State(state): State<AppState>,
    Json(input): Json<SignupRequest>,
) -> Result<Response, Failure> {
    let mut store = state.store.write().await;
    if store.accounts.values().any(|a| a.user.email == input.email) {
        return Err(Failure(StatusCode::CONFLICT, "email already registered"));
    }
    let user = User {
        id: Uuid::new_v4(),
        name: input.name,
        email: input.email,
    };
    store.accounts.insert(
        user.id,
        Account {
            user: user.clone(),
            password: input.password,
        },
    );
    let access = store.issue_access_token(user.id);
    let refresh = store.issue_refresh_token(user.id);
    tracing::info!(user_id = %user.id, "signed up");
    Ok(session_response(StatusCode::CREATED, access, refresh, &user))
}

async fn login(
    State(state): State<AppState>,
    Json(input): Json<LoginRequest>,
) -> Result<Response, Failure> {
    let mut store = state.store.write().await;
    let user = store
        .accounts
        .values()
        .find(|a| a.user.email == input.email && a.password == input.password)
        .map(|a| a.user.clone())
        .ok_or(Failure(StatusCode::UNAUTHORIZED, "invalid email or password"))?;
    let access = store.issue_access_token(user.id);
    let refresh = store.issue_refresh_token(user.id);
    tracing::info!(user_id = %user.id, "logged in");
    Ok(session_response(StatusCode::OK, access, refresh, &user))
}

async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, Failure> {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let presented = refresh_token_from(&headers)
        .ok_or(Failure(StatusCode::UNAUTHORIZED, "missing refresh token"))?;
    let mut store = state.store.write().await;
    let user_id = store
        .refresh_tokens
        .get(&presented)
        .copied()
        .ok_or(Failure(StatusCode::UNAUTHORIZED, "refresh token invalid"))?;
    let access = store.issue_access_token(user_id);
    tracing::info!(%user_id, "access token refreshed");
    Ok(Json(json!({ "data": { "access_token": access } })))
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let mut store = state.store.write().await;
    if let Some(token) = refresh_token_from(&headers) {
        store.refresh_tokens.remove(&token);
    }
    if let Some(token) = bearer_from(&headers) {
        store.access_tokens.remove(token);
    }
    (
        StatusCode::NO_CONTENT,
        [(header::SET_COOKIE, format!("{REFRESH_COOKIE}=; Max-Age=0; Path=/"))],
    )
}

async fn list_projects(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, Failure> {
    authenticate(&state, &headers).await?;
    let store = state.store.read().await;
    let mut projects: Vec<&Project> = store.projects.values().collect();
    projects.sort_by_key(|p| p.created_at);
    Ok(Json(json!({
        "data": projects,
        "meta": { "total_count": projects.len() },
    })))
}

async fn create_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateProject>,
) -> Result<(StatusCode, Json<Value>), Failure> {
    authenticate(&state, &headers).await?;
    if input.name.trim().is_empty() {
        return Err(Failure(StatusCode::UNPROCESSABLE_ENTITY, "name is required"));
    }
    let project = Project {
        id: Uuid::new_v4(),
        name: input.name,
        color: input.color,
        billable: input.billable,
        created_at: Utc::now(),
    };
    state.store.write().await.projects.insert(project.id, project.clone());
    Ok((StatusCode::CREATED, Json(json!({ "data": project }))))
}

async fn get_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, Failure> {
    authenticate(&state, &headers).await?;
    let store = state.store.read().await;
    let project = store
        .projects
        .get(&id)
        .ok_or(Failure(StatusCode::NOT_FOUND, "project not found"))?;
    Ok(Json(json!({ "data": project })))
}

async fn update_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateProject>,
) -> Result<Json<Value>, Failure> {
    authenticate(&state, &headers).await?;
    let mut store = state.store.write().await;
    let project = store
        .projects
        .get_mut(&id)
        .ok_or(Failure(StatusCode::NOT_FOUND, "project not found"))?;
    if let Some(name) = input.name {
        project.name = name;
    }
    if let Some(color) = input.color {
        project.color = Some(color);
    }
    if let Some(billable) = input.billable {
        project.billable = billable;
    }
    Ok(Json(json!({ "data": project })))
}

async fn delete_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Failure> {
    authenticate(&state, &headers).await?;
    let mut store = state.store.write().await;
    store
        .projects
        .remove(&id)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or(Failure(StatusCode::NOT_FOUND, "project not found"))
}

async fn list_entries(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<EntryFilter>,
) -> Result<Json<Value>, Failure> {
    authenticate(&state, &headers).await?;
    let store = state.store.read().await;
    let entries: Vec<&TimeEntry> = store
        .entries
        .iter()
        .filter(|e| filter.project_id.is_none() || e.project_id == filter.project_id)
        .collect();
    Ok(Json(json!({
        "data": entries,
        "meta": { "total_count": entries.len() },
    })))
}

async fn create_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateTimeEntry>,
) -> Result<(StatusCode, Json<Value>), Failure> {
    authenticate(&state, &headers).await?;
    if input.ended_at.is_some_and(|end| end < input.started_at) {
        return Err(Failure(StatusCode::UNPROCESSABLE_ENTITY, "ended_at precedes started_at"));
    }
    let mut store = state.store.write().await;
    if let Some(project_id) = input.project_id {
        if !store.projects.contains_key(&project_id) {
            return Err(Failure(StatusCode::NOT_FOUND, "project not found"));
        }
    }
    let entry = TimeEntry {
        id: Uuid::new_v4(),
        project_id: input.project_id,
        description: input.description,
        started_at: input.started_at,
        ended_at: input.ended_at,
    };
    store.entries.push(entry.clone());
    Ok((StatusCode::CREATED, Json(json!({ "data": entry }))))
}

/// Echoes what it received: text fields verbatim, files as name/type/size.
async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), Failure> {
    authenticate(&state, &headers).await?;
    let mut fields = Map::new();
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| Failure(StatusCode::BAD_REQUEST, "malformed multipart body"))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|_| Failure(StatusCode::BAD_REQUEST, "malformed multipart body"))?;
        match file_name {
            Some(file_name) => files.push(json!({
                "field_name": name,
                "file_name": file_name,
                "content_type": content_type,
                "size": bytes.len(),
            })),
            None => {
                fields.insert(name, Value::String(String::from_utf8_lossy(&bytes).into_owned()));
            }
        }
    }
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": { "fields": fields, "files": files } })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_serializes_with_snake_case_keys() {
        let project = Project {
            id: Uuid::nil(),
            name: "Client work".to_string(),
            color: None,
            billable: true,
            created_at: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let json = serde_json::to_value(&project).unwrap();
        assert_eq!(json["id"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(json["created_at"], "1970-01-01T00:00:00Z");
        assert!(json.get("createdAt").is_none());
    }

    #[test]
    fn create_project_defaults_billable_to_false() {
        let input: CreateProject = serde_json::from_str(r#"{"name":"Internal"}"#).unwrap();
        assert_eq!(input.name, "Internal");
        assert!(!input.billable);
        assert!(input.color.is_none());
    }

    #[test]
    fn create_project_rejects_missing_name() {
        let result: Result<CreateProject, _> = serde_json::from_str(r#"{"billable":true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn update_project_all_fields_optional() {
        let input: UpdateProject = serde_json::from_str(r#"{}"#).unwrap();
        assert!(input.name.is_none());
        assert!(input.billable.is_none());
    }

    #[test]
    fn time_entry_accepts_millisecond_timestamps() {
        let input: CreateTimeEntry = serde_json::from_str(
            r#"{"description":"standup","started_at":"2024-01-01T09:00:00.000Z"}"#,
        )
        .unwrap();
        assert_eq!(input.started_at.to_rfc3339(), "2024-01-01T09:00:00+00:00");
        assert!(input.project_id.is_none());
    }

    #[test]
    fn refresh_cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "theme=dark; refresh_token=abc; lang=en".parse().unwrap());
        assert_eq!(refresh_token_from(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn bearer_requires_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Token abc".parse().unwrap());
        assert!(bearer_from(&headers).is_none());
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_from(&headers), Some("abc"));
    }
}
