use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use signing_agent::action::{ActionService, ActionSigner, AutoApprover, Signer};
use signing_agent::agent::{AgentService, AgentStore, FileKvStore, KvStore};
use signing_agent::api::{create_router, AppState};
use signing_agent::auth::{HeaderProvider, TokenProvider};
use signing_agent::config::AppConfig;
use signing_agent::coordination::{ActionSync, KvActionSync};
use signing_agent::error::{AgentError, Result};
use signing_agent::hub::cache::{ActionCache, LocalActionCache, SharedActionCache};
use signing_agent::hub::source::WebsocketSource;
use signing_agent::hub::FeedHub;

#[derive(Parser, Debug)]
#[command(name = "signing-agent", version, about = "Approval signing agent")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)?;

    init_logging(&config);

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!("invalid configuration: {}", problem);
        }
        return Err(AgentError::Validation(problems.join("; ")));
    }

    // agent identity
    let kv = FileKvStore::new(&config.store.file);
    kv.init()?;
    let store = Arc::new(AgentStore::new(Box::new(kv)));
    let agent_info = store.get_agent_info()?;

    let auth_provider: Arc<dyn HeaderProvider> = Arc::new(TokenProvider::new(&config.base.qredo_api));

    // a registered agent authenticates with its stored credentials right away
    if let Some(info) = &agent_info {
        auth_provider
            .initiate(&info.workspace_id, &info.api_key_secret, &info.api_key_id)
            .await?;
        info!("agent `{}` authenticated", info.api_key_id);
    } else {
        warn!("agent not registered yet, waiting for a register request");
    }

    let signer: Arc<dyn Signer> = Arc::new(ActionSigner::new(
        &config.base.qredo_api,
        Arc::clone(&auth_provider),
        agent_info.as_ref().map(|info| info.bls_private_key.as_str()),
    )?);

    // multi-instance fleets share the cache and the coordinator through the
    // external key-value server
    let (cache, synchronizer): (Arc<dyn ActionCache>, Option<Arc<dyn ActionSync>>) =
        if config.load_balancing.enable {
            let client = redis::Client::open(config.load_balancing.redis.url())?;
            let conn = client.get_multiplexed_async_connection().await?;

            (
                Arc::new(SharedActionCache::new(conn.clone())),
                Some(Arc::new(KvActionSync::new(conn, &config.load_balancing))),
            )
        } else {
            (Arc::new(LocalActionCache::new()), None)
        };

    let source = Arc::new(WebsocketSource::new(
        &config.websocket.qredo_websocket,
        &config.websocket,
        Arc::clone(&auth_provider),
    ));
    let feed_hub = Arc::new(FeedHub::new(source, Some(Arc::clone(&cache))));

    let auto_approver = config.auto_approval.enabled.then(|| {
        Arc::new(AutoApprover::new(
            config.auto_approval.clone(),
            config.load_balancing.enable,
            synchronizer.clone(),
            Arc::clone(&signer),
        ))
    });

    let agent_service = Arc::new(AgentService::new(
        config.clone(),
        store,
        Arc::clone(&auth_provider),
        Arc::clone(&signer),
        feed_hub,
        auto_approver,
        agent_info,
    ));

    let action_service = Arc::new(ActionService::new(
        synchronizer,
        config.load_balancing.enable,
        Some(cache),
        signer,
    ));

    agent_service.start().await?;

    let state = AppState::new(Arc::clone(&agent_service), action_service, config.clone());
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.http.addr).await?;
    info!("signing agent listening on {}", config.http.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // let the source close and the hub cascade settle before exiting
    agent_service.stop().await;
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("signing agent stopped");
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,signing_agent={}", config.logging.level)));

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
