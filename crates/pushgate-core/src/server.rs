//! HTTP surface.
//!
//! Routes:
//!   PUT /api/v2/package                         - push, identity read from the archive
//!   PUT /api/v2/package/:id/:version            - push with an asserted identity
//!   GET /api/v2/package/:id/:version            - download (200), pending (202) or 404
//!   GET /api/v2/package/:id/:version/status     - ledger state of one claim
//!   GET /api/v2/package/:id/versions            - available versions of a package
//!   GET /health

use std::sync::Arc;

use axum::body::{Body, BodyDataStream};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, ETAG, RETRY_AFTER};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::admission::Created;
use crate::error::{PushError, Result};
use crate::identity::PackageIdentity;
use crate::read_path::ArtifactLookup;
use crate::Gallery;

pub const API_KEY_HEADER: &str = "x-nuget-apikey";

pub type SharedState = Arc<Gallery>;

pub fn router(gallery: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v2/package", put(push_package))
        .route("/api/v2/package/:id/versions", get(list_versions))
        .route(
            "/api/v2/package/:id/:version",
            get(download_package).put(push_package_as),
        )
        .route("/api/v2/package/:id/:version/status", get(package_status))
        // The store enforces max_package_bytes while streaming.
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(gallery)
}

/// Bind, serve until Ctrl-C, then stop the validator workers. Unfinished
/// validations keep their tickets and resume on the next start.
pub async fn serve(gallery: SharedState) -> Result<()> {
    let bind = gallery.config().bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "pushgate listening");

    let workers = gallery.start_workers();
    axum::serve(listener, router(Arc::clone(&gallery)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for worker in workers {
        worker.abort();
    }
    tracing::info!(outstanding = gallery.validator().outstanding(), "pushgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn health() -> &'static str {
    "ok"
}

fn authorize(keys: &[String], headers: &HeaderMap) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim);
    match presented {
        Some(key) if keys.iter().any(|k| k == key) => Ok(()),
        Some(_) => Err(PushError::Unauthorized("unknown API key".to_string())),
        None => Err(PushError::Unauthorized("missing API key".to_string())),
    }
}

fn created_response(created: Created) -> Response {
    let artifact = created.artifact;
    (
        StatusCode::CREATED,
        Json(json!({
            "id": artifact.identity.id(),
            "version": artifact.identity.version(),
            "sha256": artifact.sha256,
            "integrity": artifact.integrity,
            "size": artifact.size,
            "state": "pending",
        })),
    )
        .into_response()
}

/// Body of an authorized push. A refused body is drained first so the
/// connection can carry the next request.
async fn authorized_body(gallery: &Gallery, headers: &HeaderMap, body: Body) -> Result<BodyDataStream> {
    let mut stream = body.into_data_stream();
    if let Err(e) = authorize(&gallery.config().api_keys, headers) {
        gallery.admission().discard_body(&mut stream).await;
        return Err(e);
    }
    Ok(stream)
}

async fn push_package(State(gallery): State<SharedState>, headers: HeaderMap, body: Body) -> Result<Response> {
    let stream = authorized_body(&gallery, &headers, body).await?;
    let created = gallery.admission().publish(None, stream).await?;
    Ok(created_response(created))
}

async fn push_package_as(
    State(gallery): State<SharedState>,
    Path((id, version)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let mut stream = authorized_body(&gallery, &headers, body).await?;
    let asserted = match PackageIdentity::parse(&id, &version) {
        Ok(identity) => identity,
        Err(e) => {
            gallery.admission().discard_body(&mut stream).await;
            return Err(e);
        }
    };
    let created = gallery.admission().publish(Some(asserted), stream).await?;
    Ok(created_response(created))
}

async fn download_package(
    State(gallery): State<SharedState>,
    Path((id, version)): Path<(String, String)>,
) -> Result<Response> {
    let identity = PackageIdentity::parse(&id, &version)?;
    match gallery.read_path().get_artifact(&identity).await? {
        ArtifactLookup::Found { content, artifact } => Ok((
            StatusCode::OK,
            [
                (CONTENT_TYPE, "application/octet-stream".to_string()),
                (ETAG, format!("\"{}\"", artifact.sha256)),
            ],
            content,
        )
            .into_response()),
        ArtifactLookup::NotYetAvailable => Ok((
            StatusCode::ACCEPTED,
            [(RETRY_AFTER, "1")],
            Json(json!({
                "id": identity.id(),
                "version": identity.version(),
                "state": "pending",
            })),
        )
            .into_response()),
        ArtifactLookup::NotFound => Err(PushError::NotFound(format!("package {}", identity))),
    }
}

async fn package_status(
    State(gallery): State<SharedState>,
    Path((id, version)): Path<(String, String)>,
) -> Result<Response> {
    let identity = PackageIdentity::parse(&id, &version)?;
    let report = gallery
        .read_path()
        .status(&identity)
        .ok_or_else(|| PushError::NotFound(format!("package {}", identity)))?;
    Ok(Json(report).into_response())
}

async fn list_versions(State(gallery): State<SharedState>, Path(id): Path<String>) -> Json<serde_json::Value> {
    let versions = gallery.read_path().available_versions(&id);
    Json(json!({ "id": id, "versions": versions }))
}
