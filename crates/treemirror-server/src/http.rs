//! HTTP transport for the host write path and the sync endpoints.
//!
//! Routes:
//! - `GET /health`
//! - `GET /entities`, `POST /entities`
//! - `GET /entities/{slug}`, `DELETE /entities/{slug}`
//! - `PUT /entities/{slug}/tree`
//! - `GET /entities/{slug}/status`
//! - `GET /entities/{slug}/nonce`
//! - `POST /entities/{slug}/override`
//! - `POST /entities/{slug}/poll`
//!
//! Every handler does its SQLite work on the blocking pool with a connection
//! of its own.

use crate::actor::RequestActor;
use crate::stores::SqliteStores;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use treemirror_core::config::Config;
use treemirror_core::error::{EndpointError, ProtocolErrorCode};
use treemirror_core::nonce;
use treemirror_core::ports::Authorizer;
use treemirror_core::types::{Capability, SourceItem, SourceTree, TreeEvent};
use treemirror_state::entities::{self, EntityRecord};
use treemirror_state::{db, mirror, schema};
use treemirror_sync::deletion::DeletionOutcome;
use treemirror_sync::endpoints;
use treemirror_sync::queue::JobSummary;
use treemirror_sync::session::{Handled, SyncSession};

/// Shared state for the HTTP transport.
pub struct HttpState {
    pub config: Config,
    pub db_path: PathBuf,
    pub server_start: Instant,
}

impl HttpState {
    pub fn new(config: Config) -> Self {
        let db_path = config.db_path();
        Self {
            config,
            db_path,
            server_start: Instant::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateEntityBody {
    slug: String,
    name: String,
    #[serde(default)]
    items: Vec<SourceItem>,
}

#[derive(Debug, Deserialize)]
struct TreeBody {
    items: Vec<SourceItem>,
}

#[derive(Debug, Deserialize)]
struct OverrideBody {
    enabled: bool,
    nonce: String,
}

#[derive(Debug, Deserialize)]
struct PollBody {
    nonce: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub entity: EntityRecord,
    pub sync: Vec<JobSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntityResponse {
    pub entity: EntityRecord,
    pub items: SourceTree,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub slug: String,
    pub mirror: DeletionOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NonceResponse {
    pub slug: String,
    pub override_nonce: String,
    pub poll_nonce: String,
}

/// Create tables and apply pending migrations before serving.
pub fn prepare_database(config: &Config) -> Result<(), EndpointError> {
    let conn = db::open_with_storage_config(&config.db_path(), &config.storage)?;
    schema::create_tables(&conn)?;
    Ok(())
}

pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/entities", get(list_entities_handler).post(create_entity_handler))
        .route(
            "/entities/{slug}",
            get(get_entity_handler).delete(delete_entity_handler),
        )
        .route("/entities/{slug}/tree", put(update_tree_handler))
        .route("/entities/{slug}/status", get(status_handler))
        .route("/entities/{slug}/nonce", get(nonce_handler))
        .route("/entities/{slug}/override", post(override_handler))
        .route("/entities/{slug}/poll", post(poll_handler))
        .with_state(state)
}

/// Start the HTTP transport on the given bind address and port.
pub async fn run_http_server(
    config: Config,
    bind_addr: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    prepare_database(&config)?;
    if config.server.api_token.is_none() {
        warn!("No server.api_token configured; every request is trusted");
    }

    let state = Arc::new(HttpState::new(config));
    let app = build_router(state);

    let addr = format!("{}:{}", bind_addr, port);
    info!("treemirror HTTP server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// GET /health
async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let result = tokio::task::spawn_blocking({
        let state = Arc::clone(&state);
        move || build_health_response(&state)
    })
    .await;

    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => internal_error_response(&e.to_string()),
    }
}

fn build_health_response(state: &HttpState) -> Value {
    let uptime_seconds = state.server_start.elapsed().as_secs();
    let check = open_request_connection(state).and_then(|conn| {
        let (sqlite_ok, sqlite_detail) = db::check_sqlite_health(&conn)?;
        let applied = schema::applied_version(&conn)?;
        let mirror_initialized = mirror::is_initialized(&conn)?;
        Ok((sqlite_ok, sqlite_detail, applied, mirror_initialized))
    });

    match check {
        Ok((sqlite_ok, sqlite_detail, applied, mirror_initialized)) => {
            let schema_ok = applied >= schema::CURRENT_SCHEMA_VERSION;
            json!({
                "status": if sqlite_ok && schema_ok { "ok" } else { "error" },
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": uptime_seconds,
                "sqlite": { "ok": sqlite_ok, "detail": sqlite_detail },
                "schema": {
                    "current_version": applied,
                    "required_version": schema::CURRENT_SCHEMA_VERSION,
                },
                "mirror_initialized": mirror_initialized,
            })
        }
        Err(err) => {
            warn!(db_path = %state.db_path.display(), error = %err, "Health check failed");
            json!({
                "status": "error",
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": uptime_seconds,
                "error": err.to_string(),
            })
        }
    }
}

/// GET /entities
async fn list_entities_handler(State(state): State<Arc<HttpState>>) -> Response {
    run_blocking(state, |_, conn| Ok(entities::list_entities(conn)?)).await
}

/// POST /entities
async fn create_entity_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: CreateEntityBody = match parse_body(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let actor = RequestActor::from_headers(&headers, &state.config.server);

    run_blocking(state, move |state, conn| {
        require_manage(&actor)?;
        if request.slug.trim().is_empty() {
            return Err(EndpointError::InvalidInput("slug must not be empty".into()));
        }
        let entity_id = entities::create_entity(conn, &request.slug, &request.name)?;

        let stores = SqliteStores::new(conn);
        let mut session = SyncSession::new(stores.context(&actor, &state.config), actor.origin);
        session.handle(TreeEvent::Created(entity_id))?;
        for event in entities::replace_items(conn, entity_id, &request.items)? {
            session.handle(event)?;
        }
        let report = session.finish();

        let entity = entities::get_entity(conn, entity_id)?
            .ok_or_else(|| EndpointError::EntityNotFound {
                slug: request.slug.clone(),
            })?;
        info!(slug = %entity.slug, entity_id, "Entity created");
        Ok(WriteResponse {
            entity,
            sync: report.summaries(),
        })
    })
    .await
}

/// GET /entities/{slug}
async fn get_entity_handler(
    State(state): State<Arc<HttpState>>,
    Path(slug): Path<String>,
) -> Response {
    run_blocking(state, move |_, conn| {
        let entity = find_entity(conn, &slug)?;
        let items = entities::load_items(conn, entity.entity_id)?;
        Ok(EntityResponse { entity, items })
    })
    .await
}

/// PUT /entities/{slug}/tree
async fn update_tree_handler(
    State(state): State<Arc<HttpState>>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: TreeBody = match parse_body(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let actor = RequestActor::from_headers(&headers, &state.config.server);

    run_blocking(state, move |state, conn| {
        require_manage(&actor)?;
        let entity = find_entity(conn, &slug)?;

        let stores = SqliteStores::new(conn);
        let mut session = SyncSession::new(stores.context(&actor, &state.config), actor.origin);
        // The entity-level event fires before items are rewritten, so the
        // snapshot captures the pre-edit tree.
        session.handle(TreeEvent::Changed(entity.entity_id))?;
        for event in entities::replace_items(conn, entity.entity_id, &request.items)? {
            session.handle(event)?;
        }
        let report = session.finish();

        let entity = find_entity(conn, &slug)?;
        Ok(WriteResponse {
            entity,
            sync: report.summaries(),
        })
    })
    .await
}

/// DELETE /entities/{slug}
async fn delete_entity_handler(
    State(state): State<Arc<HttpState>>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Response {
    let actor = RequestActor::from_headers(&headers, &state.config.server);

    run_blocking(state, move |state, conn| {
        require_manage(&actor)?;
        let entity = find_entity(conn, &slug)?;

        let stores = SqliteStores::new(conn);
        let mut session = SyncSession::new(stores.context(&actor, &state.config), actor.origin);
        let handled = session.handle(TreeEvent::Deleting(entity.entity_id, entity.metadata()))?;
        entities::delete_entity(conn, entity.entity_id)?;
        session.finish();

        let mirror = match handled {
            Handled::Deleted(outcome) => outcome,
            _ => DeletionOutcome::Unauthorized,
        };
        info!(slug = %slug, entity_id = entity.entity_id, "Entity deleted");
        Ok(DeleteResponse { slug, mirror })
    })
    .await
}

/// GET /entities/{slug}/status
async fn status_handler(
    State(state): State<Arc<HttpState>>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Response {
    let actor = RequestActor::from_headers(&headers, &state.config.server);
    run_blocking(state, move |state, conn| {
        let stores = SqliteStores::new(conn);
        endpoints::status(&stores.context(&actor, &state.config), &slug)
    })
    .await
}

/// GET /entities/{slug}/nonce
async fn nonce_handler(
    State(state): State<Arc<HttpState>>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Response {
    let actor = RequestActor::from_headers(&headers, &state.config.server);
    run_blocking(state, move |_, conn| {
        require_manage(&actor)?;
        find_entity(conn, &slug)?;
        let issue = |action: String| {
            actor
                .nonce_for(&action)
                .ok_or_else(|| EndpointError::forbidden(action))
        };
        Ok(NonceResponse {
            override_nonce: issue(nonce::override_action(&slug))?,
            poll_nonce: issue(nonce::poll_action(&slug))?,
            slug,
        })
    })
    .await
}

/// POST /entities/{slug}/override
async fn override_handler(
    State(state): State<Arc<HttpState>>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: OverrideBody = match parse_body(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let actor = RequestActor::from_headers(&headers, &state.config.server);
    run_blocking(state, move |state, conn| {
        let stores = SqliteStores::new(conn);
        endpoints::set_override(
            &stores.context(&actor, &state.config),
            &slug,
            request.enabled,
            &request.nonce,
        )
    })
    .await
}

/// POST /entities/{slug}/poll
async fn poll_handler(
    State(state): State<Arc<HttpState>>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: PollBody = match parse_body(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let actor = RequestActor::from_headers(&headers, &state.config.server);
    run_blocking(state, move |state, conn| {
        let stores = SqliteStores::new(conn);
        endpoints::poll_completion(&stores.context(&actor, &state.config), &slug, &request.nonce)
    })
    .await
}

async fn run_blocking<T, F>(state: Arc<HttpState>, work: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&HttpState, &Connection) -> Result<T, EndpointError> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || {
        let conn = open_request_connection(&state)?;
        work(state.as_ref(), &conn)
    })
    .await;

    match result {
        Ok(Ok(value)) => Json(value).into_response(),
        Ok(Err(err)) => error_response(&err),
        Err(e) => internal_error_response(&e.to_string()),
    }
}

fn open_request_connection(state: &HttpState) -> Result<Connection, EndpointError> {
    Ok(db::open_with_storage_config(
        &state.db_path,
        &state.config.storage,
    )?)
}

fn require_manage(actor: &RequestActor) -> Result<(), EndpointError> {
    if !actor.current_actor_can(Capability::ManageMenus) {
        return Err(EndpointError::forbidden(Capability::ManageMenus.as_str()));
    }
    Ok(())
}

fn find_entity(conn: &Connection, slug: &str) -> Result<EntityRecord, EndpointError> {
    entities::get_by_slug(conn, slug)?.ok_or_else(|| EndpointError::EntityNotFound {
        slug: slug.to_string(),
    })
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        let body = json!({
            "error": {
                "code": ProtocolErrorCode::InvalidInput.as_str(),
                "message": format!("Invalid JSON request body: {}", e),
            }
        });
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    })
}

fn status_for(code: ProtocolErrorCode) -> StatusCode {
    match code {
        ProtocolErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
        ProtocolErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ProtocolErrorCode::EntityNotFound => StatusCode::NOT_FOUND,
        ProtocolErrorCode::EntityAlreadyExists => StatusCode::CONFLICT,
        ProtocolErrorCode::MirrorUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ProtocolErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &EndpointError) -> Response {
    let code = err.code();
    let status = status_for(code);
    if status.is_server_error() {
        warn!(error = %err, "Request failed");
    }
    let body = json!({
        "error": {
            "code": code.as_str(),
            "message": err.to_string(),
        }
    });
    (status, Json(body)).into_response()
}

fn internal_error_response(message: &str) -> Response {
    let body = json!({
        "error": {
            "code": ProtocolErrorCode::InternalError.as_str(),
            "message": format!("internal error: {}", message),
        }
    });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}
