pub mod api;
pub mod config;
pub mod services;
pub mod utils;

use crate::config::ServiceConfig;
use crate::services::dispatcher::Dispatcher;
use crate::services::registry::OperationRegistry;
use crate::services::staging::UploadStager;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, header},
    middleware::from_fn,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::health::health_check,
        api::handlers::operations::run_operation,
    ),
    components(
        schemas(
            api::handlers::health::HealthResponse,
            api::handlers::operations::ArtifactResponse,
            api::error::ErrorResponse,
            api::error::ErrorKind,
        )
    ),
    tags(
        (name = "operations", description = "Document operations on uploaded files"),
        (name = "system", description = "Service status endpoints")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub config: ServiceConfig,
}

impl AppState {
    /// Wires the stager and dispatcher around an already built registry.
    /// Fails only when the staging directory cannot be created.
    pub fn new(config: ServiceConfig, registry: OperationRegistry) -> std::io::Result<Self> {
        let stager = UploadStager::new(&config)?;
        let dispatcher = Dispatcher::new(Arc::new(registry), stager, &config);

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            config,
        })
    }
}

pub fn create_app(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/api/:operation",
            post(api::handlers::operations::run_operation),
        );

    if state.config.enable_api_docs {
        router = router.merge(
            SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()),
        );
    }

    router
        .layer(DefaultBodyLimit::max(state.config.request_body_limit()))
        .layer(cors_layer(&state.config))
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(from_fn(api::middleware::security::security_headers))
        .with_state(state)
}

fn cors_layer(config: &ServiceConfig) -> CorsLayer {
    let origin = if config.allows_any_origin() {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            header::CONTENT_DISPOSITION,
            HeaderName::from_static("x-operation-status"),
            HeaderName::from_static("x-artifact-filename"),
            HeaderName::from_static(api::middleware::request_id::REQUEST_ID_HEADER),
        ])
}
