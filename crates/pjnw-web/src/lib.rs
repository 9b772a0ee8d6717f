//! JSON API for the operator frontend: stored updates and on-demand scrapes.

use std::cmp::Reverse;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pjnw_storage::{DocumentStore, FieldValue, Fields, StoredDocument};
use pjnw_sync::{fields, SyncConfig, SyncPipeline};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "pjnw-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub collection: String,
    pub pipeline: Option<Arc<SyncPipeline>>,
}

impl AppState {
    /// Read-only state: `/scrape` answers 503.
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
            pipeline: None,
        }
    }

    pub fn from_pipeline(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            store: pipeline.store(),
            collection: pipeline.config().collection.clone(),
            pipeline: Some(pipeline),
        }
    }
}

/// One stored update as the frontend reads it: the document id plus its flat fields.
#[derive(Debug, Clone, Serialize)]
pub struct DataRow {
    pub id: String,
    #[serde(flatten)]
    pub fields: Fields,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/data", get(data_handler))
        .route("/scrape", post(scrape_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(SyncConfig::from_env()).await
}

pub async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let port = config.web_port;
    let pipeline = Arc::new(SyncPipeline::from_config(config)?);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving operator api");
    axum::serve(listener, app(AppState::from_pipeline(pipeline))).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn data_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_documents(&state.collection).await {
        Ok(documents) => Json(data_rows(documents)).into_response(),
        Err(err) => {
            error!(error = %err, collection = %state.collection, "listing documents failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": format!("could not read stored updates: {err}") })),
            )
                .into_response()
        }
    }
}

async fn scrape_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(pipeline) = state.pipeline.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "scraping is not enabled on this server" })),
        )
            .into_response();
    };
    let Some(claim) = pipeline.try_claim() else {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a scrape is already running" })),
        )
            .into_response();
    };

    tokio::spawn(async move {
        match pipeline.run_claimed(claim).await {
            Ok(summary) => info!(run_id = %summary.run_id, records = summary.records, "on-demand scrape finished"),
            Err(err) => error!(error = %format!("{err:#}"), "on-demand scrape failed"),
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response()
}

/// Newest `Fecha` first, undated documents last.
fn data_rows(documents: Vec<StoredDocument>) -> Vec<DataRow> {
    let mut rows = documents
        .into_iter()
        .map(|doc| DataRow {
            id: doc.id,
            fields: doc.fields,
        })
        .collect::<Vec<_>>();
    rows.sort_by_key(|row| {
        let date = match row.fields.get(fields::EVENT_DATE) {
            Some(FieldValue::Timestamp(ts)) => Some(*ts),
            _ => None,
        };
        (date.is_none(), Reverse(date))
    });
    rows
}
