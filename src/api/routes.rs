use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::domain::PATH_PREFIX;

use super::handlers;
use super::state::AppState;
use super::websocket::client_feed_handler;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/healthcheck/version", get(handlers::healthcheck_version))
        .route("/healthcheck/config", get(handlers::healthcheck_config))
        .route("/healthcheck/status", get(handlers::healthcheck_status))
        .route("/register", post(handlers::register_agent))
        .route("/client", get(handlers::get_client))
        .route(
            "/actions/:action_id",
            put(handlers::action_approve).delete(handlers::action_reject),
        )
        .route("/client/feed", get(client_feed_handler));

    Router::new()
        .nest(PATH_PREFIX, api)
        .with_state(state)
        .layer(cors)
}
