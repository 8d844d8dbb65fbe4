pub mod api;
pub mod config;
pub mod services;
pub mod utils;

use crate::config::ConvertConfig;
use crate::services::archive::ArchiveAssembler;
use crate::services::converter::Converter;
use crate::services::notifier::ProgressNotifier;
use crate::services::pipeline::{Pipeline, PipelineSettings};
use crate::services::progress::ProgressStore;
use crate::services::session::SessionRegistry;
use crate::utils::validation::FilePolicy;
use axum::{
    Json, Router,
    middleware::from_fn,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::convert::create_session,
        api::handlers::convert::convert_files,
        api::handlers::status::progress_socket,
        api::handlers::download::download_archive,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::convert::SessionResponse,
            api::handlers::health::HealthResponse,
            services::pipeline::PipelineSummary,
            services::session::PipelineState,
        )
    ),
    tags(
        (name = "convert", description = "Batch upload, progress and download endpoints"),
        (name = "system", description = "Service health")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub store: Arc<dyn ProgressStore>,
    pub pipeline: Arc<Pipeline>,
    pub notifier: Arc<ProgressNotifier>,
    pub archive: Arc<ArchiveAssembler>,
    pub config: ConvertConfig,
}

impl AppState {
    /// Wires every component from one config, one shared progress store and
    /// one converter.
    pub fn new(
        config: ConvertConfig,
        store: Arc<dyn ProgressStore>,
        converter: Arc<dyn Converter>,
    ) -> Self {
        let policy = FilePolicy::from_config(&config);
        let sessions = Arc::new(SessionRegistry::new(config.storage_root.clone()));
        let pipeline = Arc::new(Pipeline::new(
            sessions.clone(),
            store.clone(),
            converter,
            PipelineSettings {
                policy: policy.clone(),
                queue_capacity: config.queue_capacity,
                conversion_concurrency: config.conversion_concurrency,
                session_ttl: config.session_ttl(),
            },
        ));
        let notifier = Arc::new(ProgressNotifier::new(store.clone(), config.poll_interval()));
        let archive = Arc::new(ArchiveAssembler::new(policy));

        Self {
            sessions,
            store,
            pipeline,
            notifier,
            archive,
            config,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    // Runs inside the request-id layer so every span sees the final id
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &axum::http::Request<_>| {
            let request_id = request
                .headers()
                .get(&api::middleware::request_id::REQUEST_ID)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown");
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id,
            )
        })
        .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
            tracing::info!("📥 {} {}", request.method(), request.uri());
        })
        .on_response(
            |response: &axum::http::Response<_>,
             latency: std::time::Duration,
             _span: &tracing::Span| {
                tracing::info!(
                    "📤 Finished in {:?} with status {}",
                    latency,
                    response.status()
                );
            },
        );

    Router::new()
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .route("/session", post(api::handlers::convert::create_session))
        .route(
            "/convert",
            post(api::handlers::convert::convert_files).layer(
                axum::extract::DefaultBodyLimit::max(state.config.max_upload_size),
            ),
        )
        .route("/socket", get(api::handlers::status::progress_socket))
        .route("/download", get(api::handlers::download::download_archive))
        .layer(trace_layer)
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .with_state(state)
}
