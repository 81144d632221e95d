//! Orchestrator Core daemon: loads the worker catalog and model
//! configuration, discovers the container network, and serves the
//! HTTP + streaming surface defined in `orchestrator::api`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use orchestrator_core::orchestrator::api::{router, AppState};
use orchestrator_core::orchestrator::container::ContainerManager;
use orchestrator_core::orchestrator::event::LoggingEventObserver;
use orchestrator_core::orchestrator::llm::ModelRegistry;
use orchestrator_core::orchestrator::package::Keyring;
use orchestrator_core::orchestrator::worker::WorkerRegistry;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn state_root() -> PathBuf {
    PathBuf::from(env_or("ORCHESTRATOR_STATE_DIR", "."))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env().filter_level(log::LevelFilter::Info).try_init().ok();

    let bind_addr: SocketAddr = env_or("ORCHESTRATOR_BIND_ADDR", "0.0.0.0:8080").parse()?;
    let orchestrator_url = env_or("ORCHESTRATOR_URL", &format!("http://localhost:{}", bind_addr.port()));
    let orchestrator_ws = env_or("ORCHESTRATOR_WS", &format!("ws://localhost:{}", bind_addr.port()));
    let container_binary = env_or("ORCHESTRATOR_CONTAINER_BIN", "docker");
    let network = match ContainerManager::discover_network(&container_binary).await {
        Some(net) => {
            log::info!("discovered container network '{}'", net);
            net
        }
        None => {
            let fallback = env_or("ORCHESTRATOR_NETWORK", "orchestrator-net");
            log::warn!(
                "could not discover the orchestrator's own container network, falling back to '{}'",
                fallback
            );
            fallback
        }
    };
    let catalog_base_url = env_or("ORCHESTRATOR_CATALOG_URL", "https://catalog.invalid");

    let root = state_root();
    let workers = Arc::new(WorkerRegistry::new());
    let registered = workers.load_catalog(&root.join("workers.json")).await?;
    log::info!("loaded {} worker(s) from catalog", registered);
    workers.refresh_all().await;

    let models = Arc::new(ModelRegistry::load(root.join("configs/models.yaml")).await?);

    let containers = Arc::new(
        ContainerManager::new(network, orchestrator_url, orchestrator_ws).with_state_dir(root.clone()),
    );
    containers.load_index().await?;

    let keyring = Arc::new(Keyring::new());
    load_trusted_publishers(&keyring, &root.join("registry/publishers")).await?;

    let state = Arc::new(AppState {
        workers,
        models,
        containers,
        keyring,
        catalog_base_url,
        install_root: root.join("registry"),
        workflows_dir: root.join("workflows/user"),
        agent_defs_dir: root.join("agent-definitions"),
        team_defs_dir: root.join("agent-teams"),
        observer: Arc::new(LoggingEventObserver),
    });

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    log::info!("orchestratord listening on {}", bind_addr);
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Loads every `registry/publishers/{id}/pubkey.asc` into the keyring,
/// trusted by construction — a publisher only reaches this directory
/// because an operator placed it there.
async fn load_trusted_publishers(
    keyring: &Keyring,
    publishers_dir: &std::path::Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let Ok(mut entries) = tokio::fs::read_dir(publishers_dir).await else {
        return Ok(());
    };
    while let Some(entry) = entries.next_entry().await? {
        let id = entry.file_name().to_string_lossy().to_string();
        let key_path = entry.path().join("pubkey.asc");
        let Ok(public_key) = tokio::fs::read_to_string(&key_path).await else { continue };
        keyring
            .trust(orchestrator_core::orchestrator::package::Publisher {
                id: id.clone(),
                public_key: public_key.trim().to_string(),
                trusted: true,
            })
            .await;
        log::info!("trusted publisher '{}'", id);
    }
    Ok(())
}
