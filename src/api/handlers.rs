use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use tracing::{error, info};

use crate::agent::service::{AgentDetailsResponse, AgentRegisterRequest, HealthStatusResponse};
use crate::config::AppConfig;
use crate::error::{AgentError, Result};

use super::state::AppState;

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    #[serde(rename = "actionID")]
    pub action_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
}

/// Register the agent with the authority, then start the feed service.
pub async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<AgentRegisterRequest>,
) -> Result<Json<AgentDetailsResponse>> {
    let resp = state.agent_service.register(&req).await?;

    info!("agent registered, starting the service");

    if let Err(e) = state.agent_service.start().await {
        error!("failed to start the agent service, err: {}", e);
        return Err(AgentError::Internal(
            "failed to start the agent service. Please restart".to_string(),
        ));
    }

    Ok(Json(resp))
}

pub async fn get_client(State(state): State<AppState>) -> Result<Json<AgentDetailsResponse>> {
    state.agent_service.get_agent_details().await.map(Json)
}

pub async fn action_approve(
    State(state): State<AppState>,
    Path(action_id): Path<String>,
) -> Result<Json<ActionResponse>> {
    let action_id = require_action_id(&action_id)?;
    state.action_service.approve(action_id).await?;

    Ok(Json(ActionResponse {
        action_id: action_id.to_string(),
        status: "approved".to_string(),
    }))
}

pub async fn action_reject(
    State(state): State<AppState>,
    Path(action_id): Path<String>,
) -> Result<Json<ActionResponse>> {
    let action_id = require_action_id(&action_id)?;
    state.action_service.reject(action_id).await?;

    Ok(Json(ActionResponse {
        action_id: action_id.to_string(),
        status: "rejected".to_string(),
    }))
}

pub async fn healthcheck_version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn healthcheck_config(State(state): State<AppState>) -> Json<AppConfig> {
    Json(state.config.as_ref().clone())
}

pub async fn healthcheck_status(State(state): State<AppState>) -> Json<HealthStatusResponse> {
    Json(state.agent_service.websocket_status().await)
}

fn require_action_id(raw: &str) -> Result<&str> {
    let action_id = raw.trim();
    if action_id.is_empty() {
        return Err(AgentError::Validation("empty actionID".to_string()));
    }
    Ok(action_id)
}
