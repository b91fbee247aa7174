use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::server::AppState;

mod completions;
mod health;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/completions/{provider}", post(completions::completions))
        .route("/healthz", get(health::healthz))
}
