pub mod handlers;
pub mod routes;
pub mod state;
pub mod websocket;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::AgentError;

pub use routes::create_router;
pub use state::AppState;

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = Json(serde_json::json!({
            "code": status.as_u16(),
            "detail": self.to_string(),
        }));

        (status, body).into_response()
    }
}
