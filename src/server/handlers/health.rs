use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::server::AppState;

pub async fn healthz(State(app_state): State<Arc<AppState>>) -> Json<Value> {
    let mut providers: Vec<&str> = app_state.handlers.keys().copied().collect();
    providers.sort_unstable();
    Json(json!({ "status": "ok", "providers": providers }))
}
