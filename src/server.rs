use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    response::Html,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::error::{Result, ServiceError};
use crate::labels::LabelMap;
use crate::model::{top_k, InferencePipeline, Prediction};
use crate::page::INDEX_HTML;

const DEFAULT_TOP_K: i64 = 3;

/// Everything a request handler needs. Built once at startup, never mutated.
#[derive(Clone)]
pub struct ServiceContext {
    pipeline: Arc<InferencePipeline>,
    labels: Arc<LabelMap>,
}

impl ServiceContext {
    pub fn new(pipeline: InferencePipeline, labels: LabelMap) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            labels: Arc::new(labels),
        }
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }
}

#[derive(Debug, Deserialize)]
pub struct PredictParams {
    top_k: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    predictions: Vec<Prediction>,
}

pub fn router(ctx: ServiceContext, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/labels", get(labels))
        .route("/predict", post(predict))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

pub async fn serve(ctx: ServiceContext, addr: SocketAddr, body_limit_bytes: usize) -> anyhow::Result<()> {
    let app = router(ctx, body_limit_bytes);
    tracing::info!(%addr, "Listening");
    axum::Server::try_bind(&addr)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn labels(State(ctx): State<ServiceContext>) -> Json<LabelMap> {
    Json(ctx.labels().clone())
}

async fn predict(
    State(ctx): State<ServiceContext>,
    Query(params): Query<PredictParams>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let is_image = field
            .content_type()
            .is_some_and(|ct| ct.starts_with("image/"));
        if !is_image {
            return Err(ServiceError::NotAnImage);
        }
        upload = Some(field.bytes().await?);
        break;
    }
    let bytes = upload.ok_or(ServiceError::MissingFile)?;

    let started = Instant::now();
    let pipeline = Arc::clone(&ctx.pipeline);
    let probs = tokio::task::spawn_blocking(move || pipeline.probabilities(&bytes))
        .await
        .map_err(|e| ServiceError::Inference(e.to_string()))??;

    let predictions = top_k(&probs, params.top_k.unwrap_or(DEFAULT_TOP_K), ctx.labels());
    if let Some(best) = predictions.first() {
        tracing::debug!(
            label = %best.label,
            score = best.score,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Prediction served"
        );
    }
    Ok(Json(PredictResponse { predictions }))
}
