//! crew-forge server binary.
//!
//! Starts the orchestration kernel on either the stdio or HTTP
//! transport (spec.md §6.4). Boot sequence: load config, open the
//! store, mint an admin key if none exists, recover any workflows
//! interrupted by a prior crash, wire the Crew Manager and Supervisor,
//! then run the selected transport until shutdown.
//!
//! # Environment Variables
//!
//! See `Config::from_env` for the full `CREW_FORGE_*` list.
//!
//! Exit codes: `0` clean shutdown, `1` fatal initialization error, `2`
//! invalid configuration, `3` store unreachable at boot.

use std::process::ExitCode;
use std::sync::Arc;

use crew_forge::config::{Config, TransportKind};
use crew_forge::crew_manager::CrewManager;
use crew_forge::dispatcher::Dispatcher;
use crew_forge::evolution::engine::EvolutionEngine;
use crew_forge::instructions::bus::InstructionBus;
use crew_forge::security::api_key::ApiKey;
use crew_forge::security::gate::SecurityGate;
use crew_forge::server::{http, stdio};
use crew_forge::store::sqlite::SqliteStore;
use crew_forge::store::Store;
use crew_forge::supervisor::Supervisor;
use crew_forge::workflow::runner::SimulatedCrewRunner;
use crew_forge::workflow::state_machine::WorkflowContext;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,crew_forge=debug".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let db_path = config.data_root.join("store.sqlite3");
    let store: Arc<dyn Store> = match SqliteStore::open(&db_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!(error = %e, "store unreachable at boot");
            return ExitCode::from(3);
        }
    };

    if let Err(e) = std::fs::create_dir_all(config.data_root.join("deliverables")) {
        tracing::error!(error = %e, "failed to create deliverables directory");
        return ExitCode::from(1);
    }

    if let Err(e) = bootstrap_admin_key(store.as_ref(), &config).await {
        tracing::error!(error = %e, "failed to bootstrap admin api key");
        return ExitCode::from(1);
    }

    match store.recover_interrupted_workflows().await {
        Ok(recovered) if !recovered.is_empty() => {
            tracing::warn!(count = recovered.len(), "recovered workflows interrupted by a prior crash");
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!(error = %e, "failed to recover interrupted workflows at boot");
            return ExitCode::from(3);
        }
    }

    let bus = Arc::new(InstructionBus::new(store.clone()));
    let evolution = Arc::new(EvolutionEngine::new(store.clone(), config.min_evolution_interval));
    let worker_pool = Arc::new(tokio::sync::Semaphore::new(config.worker_pool_size));
    let workflow_ctx = Arc::new(WorkflowContext {
        store: store.clone(),
        bus: bus.clone(),
        runner: Arc::new(SimulatedCrewRunner::new()),
        evolution: evolution.clone(),
        worker_pool: worker_pool.clone(),
        data_root: config.data_root.clone(),
        intake_poll_interval: config.instruction_intake_poll_interval,
        emergency_stop_deadline: config.emergency_stop_deadline,
    });
    let crew_manager = Arc::new(CrewManager::new(store.clone(), bus.clone(), workflow_ctx, config.saturation_policy));

    let config_handle = Arc::new(parking_lot::RwLock::new(config.clone()));
    let supervisor = Arc::new(Supervisor::new(
        store.clone(),
        bus,
        evolution,
        worker_pool,
        config.worker_pool_size,
        config_handle.clone(),
    ));
    let gate = Arc::new(SecurityGate::new(store.clone(), &config));
    let dispatcher = Arc::new(Dispatcher::new(crew_manager, supervisor.clone(), gate, config_handle));

    let handles = supervisor.spawn_all();

    let transport_result = match config.transport {
        TransportKind::Stdio => {
            tracing::info!("crew-forge listening on stdio");
            stdio::run(dispatcher, config.stdio_api_key.clone(), supervisor.shutdown_token()).await;
            Ok(())
        }
        TransportKind::Http => run_http(dispatcher, store, supervisor.clone(), &config).await,
    };

    supervisor.shutdown(handles, std::time::Duration::from_secs(10)).await;

    match transport_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "transport exited with an error");
            ExitCode::from(1)
        }
    }
}

async fn run_http(
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn Store>,
    supervisor: Arc<Supervisor>,
    config: &Config,
) -> Result<(), std::io::Error> {
    let state = http::AppState { dispatcher, store, supervisor: supervisor.clone() };
    let app = http::app_router(state);
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "crew-forge listening on http");

    let shutdown = supervisor.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown.cancelled() => {}
            }
        })
        .await
}

/// If no API keys exist yet, mint one from `CREW_FORGE_ADMIN_KEY` (if
/// set) or generate a random one and print it once — spec.md §4.2
/// "Bootstrapping". The plaintext is never persisted or logged again.
async fn bootstrap_admin_key(store: &dyn Store, config: &Config) -> Result<(), crew_forge::error::StoreError> {
    if store.count_api_keys().await? > 0 {
        return Ok(());
    }

    let key = match &config.admin_bootstrap_key {
        Some(plaintext) => ApiKey::from_plaintext(plaintext, vec!["*".to_string()]),
        None => {
            let (plaintext, key) = ApiKey::generate(vec!["*".to_string()]);
            eprintln!("crew-forge: no admin api key configured; generated one for this boot:");
            eprintln!("  {plaintext}");
            eprintln!("this will not be shown again. Set CREW_FORGE_ADMIN_KEY to pin it across restarts.");
            key
        }
    };
    store.put_api_key(&key).await?;
    Ok(())
}
