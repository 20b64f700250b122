// ABOUTME: Shared helpers for opening the run store and connecting to the engine.
// ABOUTME: Eliminates duplication across push, plan, and resume commands.

use conveyor::cluster::DockerCluster;
use conveyor::config::{Config, resolve_env_pairs, resolve_optional};
use conveyor::coordinator::Coordinator;
use conveyor::deploy::{FileRunStore, WorkloadLocks};
use conveyor::error::Result;
use conveyor::hooks::HookRunner;
use conveyor::output::Output;
use conveyor::registry::DockerRegistry;
use std::env;
use std::sync::Arc;

/// Open the run store under the configured state directory.
pub async fn open_store(config: &Config) -> Result<FileRunStore> {
    let state_dir = config.state_dir()?;
    Ok(FileRunStore::open(&state_dir).await?)
}

/// Build a coordinator wired to the local engine and the file-backed store.
///
/// This handles the common pattern of:
/// 1. Opening the store and lock directory
/// 2. Connecting to the engine with registry credentials
/// 3. Resolving per-workload replica environments
pub async fn connect(config: &Config, output: &Output) -> Result<Coordinator> {
    let state_dir = config.state_dir()?;
    let store = FileRunStore::open(&state_dir).await?;
    let locks = WorkloadLocks::new(state_dir.join("locks"));

    output.progress(&format!(
        "  → Connecting to {}...",
        config.cluster.socket.as_deref().unwrap_or("local engine")
    ));
    let mut cluster =
        DockerCluster::connect(config.cluster.socket.as_deref())?.with_network(config.cluster.network.clone());
    let mut registry = DockerRegistry::new(cluster.client().clone());

    let username = resolve_optional(config.registry.username.as_ref())?;
    let password = resolve_optional(config.registry.password.as_ref())?;
    if let (Some(username), Some(password)) = (username, password) {
        cluster = cluster.with_credentials(username.clone(), password.clone());
        registry = registry.with_credentials(username, password);
    }

    for workload in &config.workloads {
        cluster = cluster.with_workload_env(workload.id.clone(), resolve_env_pairs(&workload.env)?);
    }

    let cwd = env::current_dir()?;
    Ok(Coordinator::new(
        config,
        Arc::new(registry),
        Arc::new(cluster),
        Arc::new(store),
        locks,
    )
    .with_hooks(HookRunner::new(&cwd)))
}
