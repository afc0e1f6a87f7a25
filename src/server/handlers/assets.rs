use crate::{
    asset_path::Namespace,
    error::Result,
    resolver::AssetRequest,
    server::state::AppState,
};
use axum::{
    extract::{Path, Request, State},
    response::Response,
};

/// `/vcsky/{*path}` for every method.
pub async fn serve_vcsky(
    State(state): State<AppState>,
    Path(path): Path<String>,
    req: Request,
) -> Result<Response> {
    serve(state, Namespace::Vcsky, path, req).await
}

/// `/vcbr/{*path}` for every method.
pub async fn serve_vcbr(
    State(state): State<AppState>,
    Path(path): Path<String>,
    req: Request,
) -> Result<Response> {
    serve(state, Namespace::Vcbr, path, req).await
}

async fn serve(
    state: AppState,
    namespace: Namespace,
    path: String,
    req: Request,
) -> Result<Response> {
    let (parts, body) = req.into_parts();
    let request = AssetRequest {
        method: parts.method,
        headers: parts.headers,
        query: parts.uri.query().map(str::to_string),
        body,
    };

    state.resolver.resolve(namespace, &path, request).await
}
