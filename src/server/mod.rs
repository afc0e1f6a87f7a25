pub mod auth;
pub mod handlers;
pub mod state;

use crate::config::Config;
use crate::error::{Result, VcServeError};
use axum::{
    Router,
    http::HeaderValue,
    middleware,
    response::Response,
    routing::{MethodFilter, get, on},
};
use state::AppState;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info};

/// Methods accepted on the asset routes; anything else is 405.
const ASSET_METHODS: MethodFilter = MethodFilter::GET
    .or(MethodFilter::POST)
    .or(MethodFilter::PUT)
    .or(MethodFilter::DELETE)
    .or(MethodFilter::PATCH)
    .or(MethodFilter::HEAD)
    .or(MethodFilter::OPTIONS);

/// Middleware: add X-Vcserve-Version header to all responses
async fn add_version_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        "x-vcserve-version",
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Build the Axum router with all routes and middleware.
///
/// Opens both namespace stores, so fails if an asset root cannot be created.
pub async fn build_router(config: Config) -> Result<Router> {
    let dist_dir = config.dist_dir.clone();
    let state = AppState::new(config).await?;

    let router = Router::new()
        .route("/", get(handlers::shell::serve_index))
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::serve_metrics))
        .route(
            "/vcsky/{*path}",
            on(ASSET_METHODS, handlers::assets::serve_vcsky),
        )
        .route(
            "/vcbr/{*path}",
            on(ASSET_METHODS, handlers::assets::serve_vcbr),
        )
        .fallback_service(ServeDir::new(dist_dir))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::basic_auth_middleware,
        ))
        .layer(middleware::map_response(add_version_header))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(router)
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let public_url = config.public_url();
    if config.auth.is_some() {
        info!("Basic auth enabled");
    }

    let app = build_router(config).await?;

    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(VcServeError::Config(format!("cannot bind {}: {}", addr, e)));
        }
    };

    info!("vcserve listening on http://{}", addr);
    info!("Open {} to play", public_url);

    axum::serve(listener, app)
        .await
        .map_err(|e| VcServeError::InternalError(format!("server error: {}", e)))
}
