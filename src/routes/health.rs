use axum::response::Json;
use serde_json::{Value, json};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": VERSION }))
}
