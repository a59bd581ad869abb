use anyhow::anyhow;
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::error::{ErrorKind, LibError};
use crate::models::{CreateCollectionPayload, GraphQuery, UpdateItemPayload};
use crate::operations::ItemOperations;
use crate::permissions::{Actor, PermissionPolicy};
use crate::store::DocumentStore;

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::CascadeFailure => StatusCode::CONFLICT,
            ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!(
            kind = ?self.0.kind,
            code = self.0.code,
            error = %self.0.source,
            "item graph api request failed"
        );
        let body = json!({ "code": self.0.code, "message": self.0.public });
        (status, Json(body)).into_response()
    }
}

/// Caller identity placed in request extensions by upstream auth middleware.
#[derive(Debug, Clone)]
pub struct CurrentActor(pub Actor);

impl<S> FromRequestParts<S> for CurrentActor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Actor>()
            .cloned()
            .map(CurrentActor)
            .ok_or_else(|| {
                AppError(LibError::forbidden(
                    "Authentication required",
                    anyhow!("request reached the item graph api without an actor"),
                ))
            })
    }
}

pub trait GraphApp: Clone + Send + Sync + 'static {
    type Store: DocumentStore + 'static;
    type Policy: PermissionPolicy + 'static;

    fn operations(&self) -> &ItemOperations<Self::Store, Self::Policy>;
}

async fn global_graph_handler<S: GraphApp>(
    State(app): State<S>,
    CurrentActor(actor): CurrentActor,
    Query(query): Query<GraphQuery>,
) -> Result<impl IntoResponse, AppError> {
    let graph = app.operations().global_graph(&actor, query).await?;
    Ok(Json(graph))
}

async fn item_graph_handler<S: GraphApp>(
    State(app): State<S>,
    CurrentActor(actor): CurrentActor,
    Path(item_id): Path<String>,
    Query(query): Query<GraphQuery>,
) -> Result<impl IntoResponse, AppError> {
    let graph = app.operations().item_graph(&actor, &item_id, query).await?;
    Ok(Json(graph))
}

async fn collection_graph_handler<S: GraphApp>(
    State(app): State<S>,
    CurrentActor(actor): CurrentActor,
    Path(collection_id): Path<String>,
    Query(query): Query<GraphQuery>,
) -> Result<impl IntoResponse, AppError> {
    let graph = app
        .operations()
        .collection_graph(&actor, &collection_id, query)
        .await?;
    Ok(Json(graph))
}

async fn create_item_handler<S: GraphApp>(
    State(app): State<S>,
    CurrentActor(actor): CurrentActor,
    Json(document): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = app.operations().create_item(&actor, document).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn get_item_handler<S: GraphApp>(
    State(app): State<S>,
    CurrentActor(actor): CurrentActor,
    Path(item_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let item = app.operations().get_item(&actor, &item_id).await?;
    Ok(Json(item))
}

async fn update_item_handler<S: GraphApp>(
    State(app): State<S>,
    CurrentActor(actor): CurrentActor,
    Path(item_id): Path<String>,
    Json(payload): Json<UpdateItemPayload>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = app
        .operations()
        .update_item(&actor, &item_id, payload)
        .await?;
    Ok(Json(outcome))
}

async fn delete_item_handler<S: GraphApp>(
    State(app): State<S>,
    CurrentActor(actor): CurrentActor,
    Path(item_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = app.operations().delete_item(&actor, &item_id).await?;
    Ok(Json(outcome))
}

async fn check_relationships_handler<S: GraphApp>(
    State(app): State<S>,
    CurrentActor(actor): CurrentActor,
    Path(item_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let report = app
        .operations()
        .check_relationships(&actor, &item_id)
        .await?;
    Ok(Json(report))
}

async fn create_collection_handler<S: GraphApp>(
    State(app): State<S>,
    CurrentActor(actor): CurrentActor,
    Json(payload): Json<CreateCollectionPayload>,
) -> Result<impl IntoResponse, AppError> {
    let collection = app.operations().create_collection(&actor, payload).await?;
    Ok((StatusCode::CREATED, Json(collection)))
}

async fn delete_collection_handler<S: GraphApp>(
    State(app): State<S>,
    CurrentActor(actor): CurrentActor,
    Path(collection_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    app.operations()
        .delete_collection(&actor, &collection_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn routes<S: GraphApp>() -> Router<S> {
    tracing::info!("Registering route /graph [GET]");
    tracing::info!("Registering route /items [POST]");
    tracing::info!("Registering route /items/{{item_id}} [GET,PATCH,DELETE]");
    tracing::info!("Registering route /items/{{item_id}}/graph [GET]");
    tracing::info!("Registering route /items/{{item_id}}/relationships/check [POST]");
    tracing::info!("Registering route /collections [POST]");
    tracing::info!("Registering route /collections/{{collection_id}} [DELETE]");
    tracing::info!("Registering route /collections/{{collection_id}}/graph [GET]");

    Router::new()
        .route("/graph", get(global_graph_handler::<S>))
        .route("/items", post(create_item_handler::<S>))
        .route(
            "/items/{item_id}",
            get(get_item_handler::<S>)
                .patch(update_item_handler::<S>)
                .delete(delete_item_handler::<S>),
        )
        .route("/items/{item_id}/graph", get(item_graph_handler::<S>))
        .route(
            "/items/{item_id}/relationships/check",
            post(check_relationships_handler::<S>),
        )
        .route("/collections", post(create_collection_handler::<S>))
        .route(
            "/collections/{collection_id}",
            axum::routing::delete(delete_collection_handler::<S>),
        )
        .route(
            "/collections/{collection_id}/graph",
            get(collection_graph_handler::<S>),
        )
}
