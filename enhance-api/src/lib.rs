//! # enhance-api: image super-resolution over HTTP
//!
//! `enhance-api` wraps a pretrained BSRGAN x4 super-resolution network behind a single endpoint.
//! Clients upload a JPEG or PNG to `POST /enhance` and receive the upscaled image back as a PNG
//! attachment.
//!
//! ## Request Flow
//!
//! Each request follows the same linear path: the multipart part named `file` is checked against
//! the extension allow-list ([`types::ImageExtension`]), streamed to a uniquely named temp file
//! ([`storage`]), enhanced on tokio's blocking pool ([`inference::pipeline`]) and streamed back to
//! the client. The staged upload is deleted as soon as the enhancement step ends, whatever the
//! outcome; the enhanced file is deleted once the response body has been sent.
//!
//! The network is loaded once at startup ([`inference::onnx::OnnxEnhancer`]) and shared by every
//! request through the [`inference::Enhancer`] trait. Concurrency of the inference step can be
//! capped with [`limits`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use enhance_api::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = enhance_api::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     enhance_api::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     // Loads and validates the model, prepares the temp directory
//!     let app = Application::new(config).await?;
//!
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     }).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.
pub mod api;
pub mod config;
pub mod errors;
pub mod inference;
pub mod limits;
pub mod openapi;
pub mod storage;
pub mod telemetry;
#[cfg(test)]
mod test_utils;
pub mod types;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::{self, HeaderValue},
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::{
    config::{CorsOrigin, ModelConfig},
    inference::{Enhancer, onnx::OnnxEnhancer, pipeline},
    limits::Limiters,
    openapi::ApiDoc,
    storage::TempStorage,
};

/// Headroom on top of `uploads.max_file_size` for multipart boundaries and part headers.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Shared state handed to every request handler.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .enhancer(enhancer)
///     .storage(storage)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub enhancer: Arc<dyn Enhancer>,
    pub storage: TempStorage,
    #[builder(default)]
    pub limiters: Limiters,
}

fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let cors_config = &config.cors;

    let allow_origin = if cors_config.allowed_origins.iter().any(|o| matches!(o, CorsOrigin::Wildcard)) {
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &cors_config.allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                // Browsers send origins without a trailing slash
                origins.push(url.as_str().trim_end_matches('/').parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    // Credentialed requests cannot use `*` for methods or headers
    let (allow_methods, allow_headers) = if cors_config.allow_credentials {
        (AllowMethods::mirror_request(), AllowHeaders::mirror_request())
    } else {
        (AllowMethods::from(Any), AllowHeaders::from(Any))
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(allow_methods)
        .allow_headers(allow_headers)
        .allow_credentials(cors_config.allow_credentials)
        .expose_headers(vec![http::header::CONTENT_DISPOSITION]);

    if let Some(max_age) = cors_config.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router with all endpoints and middleware.
///
/// - `POST /enhance` with a body limit derived from `uploads.max_file_size`
/// - `GET /healthz`
/// - `GET /openapi.json` and the Scalar UI at `/docs`
/// - `GET /internal/metrics` when metrics are enabled
///
/// CORS and request tracing wrap everything.
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    let body_limit = match state.config.uploads.max_file_size {
        0 => DefaultBodyLimit::disable(),
        max => DefaultBodyLimit::max(usize::try_from(max).unwrap_or(usize::MAX).saturating_add(MULTIPART_OVERHEAD)),
    };

    let mut router = Router::new()
        .route("/enhance", post(api::handlers::enhance::enhance_image).layer(body_limit))
        .route("/healthz", get(|| async { "OK" }))
        .with_state(state.clone())
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        ServiceBuilder::new()
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_request(DefaultOnRequest::new().level(Level::INFO))
                    .on_response(DefaultOnResponse::new().level(Level::INFO)),
            )
            .layer(create_cors_layer(&state.config)?),
    );

    Ok(router)
}

/// Loads the ONNX model and, if configured, runs the warm-up check. Blocking.
#[instrument(skip_all)]
fn load_enhancer(config: &ModelConfig) -> anyhow::Result<Arc<dyn Enhancer>> {
    let enhancer = OnnxEnhancer::load(config).with_context(|| format!("Failed to load model from {}", config.path.display()))?;

    if config.validate_on_startup {
        pipeline::validate_model(&enhancer).context("Model failed the startup check")?;
        info!(model = enhancer.name(), "Model validated");
    }

    Ok(Arc::new(enhancer))
}

pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    /// Create a new application: load the model, prepare the temp directory, build the router.
    ///
    /// Fails if the weights are missing or unusable; there is no fallback model.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting enhance-api with configuration: {:#?}", config);

        let model_config = config.model.clone();
        let enhancer = tokio::task::spawn_blocking(move || load_enhancer(&model_config))
            .await
            .context("Model loading task failed")??;

        Self::with_enhancer(config, enhancer).await
    }

    /// Create an application around an already loaded enhancer.
    pub async fn with_enhancer(config: Config, enhancer: Arc<dyn Enhancer>) -> anyhow::Result<Self> {
        let storage = TempStorage::prepare(&config.storage.temp_dir)
            .await
            .with_context(|| format!("Failed to create temp directory {}", config.storage.temp_dir.display()))?;

        if config.storage.sweep_on_startup {
            storage.sweep().await.context("Failed to sweep temp directory")?;
        }

        let app_state = AppState::builder()
            .config(config.clone())
            .enhancer(enhancer)
            .storage(storage)
            .limiters(Limiters::new(&config.limits))
            .build();

        let router = build_router(&app_state)?;

        Ok(Self { router, config })
    }

    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Enhancement service listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        telemetry::shutdown_telemetry();

        Ok(())
    }
}
