//! Health check endpoints

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub database: bool,
    pub online: bool,
    pub remote: String,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = sqlx::query("SELECT 1").execute(state.db()).await.is_ok();

    Json(HealthResponse {
        status: if database { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        service: "order-sync",
        database,
        online: state.engine().monitor().is_online(),
        remote: state.config().sync.remote_url.clone(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}
