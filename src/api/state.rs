use std::sync::Arc;

use crate::action::ActionService;
use crate::agent::AgentService;
use crate::config::AppConfig;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub agent_service: Arc<AgentService>,
    pub action_service: Arc<ActionService>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        agent_service: Arc<AgentService>,
        action_service: Arc<ActionService>,
        config: AppConfig,
    ) -> Self {
        Self {
            agent_service,
            action_service,
            config: Arc::new(config),
        }
    }
}
