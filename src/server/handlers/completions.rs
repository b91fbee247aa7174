use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::error::GatewayError;
use crate::server::AppState;

// 按 provider 名分发到对应的上游处理器
pub async fn completions(
    State(app_state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(handler) = app_state.handlers.get(provider.as_str()).cloned() else {
        return GatewayError::UnknownProvider(provider).into_response();
    };
    handler.handle(&app_state, headers, body).await
}
