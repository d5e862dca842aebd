use axum::Json;
use serde_json::{json, Value};

use super::ApiResponse;

pub async fn health_check() -> Json<ApiResponse<Value>> {
    ApiResponse::ok("ok", json!({ "status": "ok" }))
}
