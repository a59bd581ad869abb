use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{Next, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use elab_graph::api::{CurrentActor, GraphApp};
use elab_graph::config::{GraphConfig, env_flag};
use elab_graph::models::{GroupId, UserId};
use elab_graph::operations::ItemOperations;
use elab_graph::permissions::{Actor, CreatorGroupPolicy};
use elab_graph::store::{DocumentStore, MemoryStore};

#[derive(Clone)]
struct DevAuthConfig {
    default_user_id: Uuid,
    require_dev_header: bool,
}

struct DemoApp<S> {
    ops: ItemOperations<S>,
}

impl<S> Clone for DemoApp<S> {
    fn clone(&self) -> Self {
        Self {
            ops: self.ops.clone(),
        }
    }
}

impl<S: DocumentStore + 'static> GraphApp for DemoApp<S> {
    type Store = S;
    type Policy = CreatorGroupPolicy;

    fn operations(&self) -> &ItemOperations<S> {
        &self.ops
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind = env::var("ELAB_BIND").unwrap_or_else(|_| "127.0.0.1:4010".to_string());
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid ELAB_BIND '{}'", bind))?;

    let default_user_id = env::var("ELAB_DEFAULT_USER_ID")
        .unwrap_or_else(|_| "00000000-0000-0000-0000-000000000001".to_string());
    let default_user_id = Uuid::parse_str(&default_user_id)
        .with_context(|| format!("invalid ELAB_DEFAULT_USER_ID '{}'", default_user_id))?;
    let auth = DevAuthConfig {
        default_user_id,
        require_dev_header: env_flag("ELAB_REQUIRE_DEV_HEADER"),
    };
    let config = GraphConfig::from_env();

    #[cfg(feature = "sqlx")]
    if let Ok(database_url) = env::var("DATABASE_URL") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .context("failed to connect to postgres")?;
        elab_graph::db::create_document_tables(&pool)
            .await
            .context("failed to run document migrations")?;
        let store = Arc::new(elab_graph::db::PgDocumentStore::from_pool(&pool));
        tracing::info!("using postgres document store");
        return serve(bind_addr, ItemOperations::with_default_policy(store, config), auth).await;
    }

    tracing::info!("using in-memory document store");
    let store = Arc::new(MemoryStore::new());
    serve(bind_addr, ItemOperations::with_default_policy(store, config), auth).await
}

async fn serve<S: DocumentStore + 'static>(
    bind_addr: SocketAddr,
    ops: ItemOperations<S>,
    auth: DevAuthConfig,
) -> anyhow::Result<()> {
    let api_v1 = Router::new()
        .route("/healthz", get(health_handler))
        .route("/example/whoami", get(whoami_handler))
        .merge(elab_graph::api::routes::<DemoApp<S>>());

    let app = Router::new()
        .nest("/api/v1", api_v1)
        .layer(from_fn_with_state(auth, dev_identity_middleware))
        .with_state(DemoApp { ops });

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", bind_addr))?;

    tracing::info!(%bind_addr, "elab_graph demo server listening; api base path /api/v1");
    tracing::info!("auth shim headers: x-dev-user-id, x-dev-group-ids, x-dev-role");

    axum::serve(listener, app)
        .await
        .context("demo server failed")
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true
    }))
}

async fn whoami_handler(CurrentActor(actor): CurrentActor) -> Json<Actor> {
    Json(actor)
}

async fn dev_identity_middleware(
    State(auth): State<DevAuthConfig>,
    mut req: Request,
    next: Next,
) -> Response {
    let actor = match parse_actor(req.headers(), &auth) {
        Ok(actor) => actor,
        Err(response) => return response,
    };

    req.extensions_mut().insert(actor);
    next.run(req).await
}

fn parse_actor(headers: &HeaderMap, auth: &DevAuthConfig) -> Result<Actor, Response> {
    let user_id = match header_value(headers, "x-dev-user-id") {
        Some(raw) => Uuid::parse_str(raw).map(UserId).map_err(|_| {
            json_error(StatusCode::BAD_REQUEST, "invalid_dev_user_id", "invalid UUID")
        })?,
        None if auth.require_dev_header => {
            return Err(json_error(
                StatusCode::UNAUTHORIZED,
                "missing_dev_user_id",
                "x-dev-user-id header is required",
            ));
        }
        None => UserId(auth.default_user_id),
    };

    let group_ids = header_value(headers, "x-dev-group-ids")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| Uuid::parse_str(value).map(GroupId))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()
        .map_err(|_| {
            json_error(
                StatusCode::BAD_REQUEST,
                "invalid_dev_group_ids",
                "x-dev-group-ids must be comma-separated UUIDs",
            )
        })?
        .unwrap_or_default();

    let actor = if header_value(headers, "x-dev-role") == Some("admin") {
        Actor::admin(user_id)
    } else {
        Actor::user(user_id)
    };
    Ok(actor.with_groups(group_ids))
}

fn header_value<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|value| value.to_str().ok())
}

fn json_error(status: StatusCode, code: &'static str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        })),
    )
        .into_response()
}
