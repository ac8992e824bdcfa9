use crate::engine::{HostDetail, HostView, SyncEngine};
use crate::metrics::Metrics;
use crate::model::EntityId;
use crate::push::ConnectionState;
use crate::roster::Roster;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub engine: Arc<SyncEngine>,
    pub roster: Arc<Roster>,
}

#[derive(Debug, Serialize)]
pub struct HostsResponse {
    pub push: Option<ConnectionState>,
    pub degraded: bool,
    pub hosts: Vec<HostEntry>,
}

#[derive(Debug, Serialize)]
pub struct HostEntry {
    #[serde(flatten)]
    pub view: HostView,
    pub hostname: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HostDetailResponse {
    #[serde(flatten)]
    pub detail: HostDetail,
    pub hostname: Option<String>,
    pub online: bool,
}

pub fn build_router(metrics: Arc<Metrics>, engine: Arc<SyncEngine>, roster: Arc<Roster>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/hosts", get(hosts_handler))
        .route("/api/hosts/:id", get(host_handler))
        .with_state(HttpAppState {
            metrics,
            engine,
            roster,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn hosts_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let hosts = state
        .engine
        .snapshot()
        .into_iter()
        .map(|view| HostEntry {
            hostname: state.roster.hostname(&view.id),
            view,
        })
        .collect();
    Json(HostsResponse {
        push: state.engine.connection_state(),
        degraded: state.engine.is_degraded(),
        hosts,
    })
}

async fn host_handler(
    State(state): State<HttpAppState>,
    Path(id): Path<String>,
) -> Result<Json<HostDetailResponse>, StatusCode> {
    let id = EntityId::new(id);
    let detail = state.engine.host(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(HostDetailResponse {
        hostname: state.roster.hostname(&id),
        online: state.engine.is_online(&id),
        detail,
    }))
}
