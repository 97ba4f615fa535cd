use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use eyre::eyre;
use tokio::sync::watch;
use tokio::task::JoinSet;

use bridge_relayer::api::{self, AppState};
use bridge_relayer::chain::{ChainClient, ChainPair, EvmChain};
use bridge_relayer::claims::KeyClaims;
use bridge_relayer::config::Config;
use bridge_relayer::confirmation::{ConfirmationDepths, ConfirmationTracker};
use bridge_relayer::coordinator::SignatureCoordinator;
use bridge_relayer::digest::SigningDomain;
use bridge_relayer::error::is_fatal;
use bridge_relayer::ledger::{Ledger, PgLedger};
use bridge_relayer::metrics;
use bridge_relayer::monitor::Monitor;
use bridge_relayer::status::StatusBoard;
use bridge_relayer::submitter::RelaySubmitter;
use bridge_relayer::validators::{HttpValidatorClient, ValidatorClient, ValidatorSet};
use bridge_relayer::watcher::{ChainWatcher, WatcherManager};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting bridge relayer");

    let config = Config::load()?;
    tracing::info!(
        chain_a = %config.chain_a.name,
        chain_a_id = config.chain_a.chain_id,
        chain_b = %config.chain_b.name,
        chain_b_id = config.chain_b.chain_id,
        validators = config.validators.members.len(),
        quorum_threshold = config.validators.quorum_threshold,
        "Configuration loaded"
    );

    let ledger: Arc<dyn Ledger> = Arc::new(
        PgLedger::connect(&config.database.url, config.database.max_connections).await?,
    );
    tracing::info!("Database connected, migrations complete");

    let rpc_timeout = Duration::from_millis(config.rpc_timeout_ms);
    let chain_a: Arc<dyn ChainClient> = Arc::new(EvmChain::new(&config.chain_a, rpc_timeout)?);
    let chain_b: Arc<dyn ChainClient> = Arc::new(EvmChain::new(&config.chain_b, rpc_timeout)?);
    let chains = ChainPair::new(Arc::clone(&chain_a), Arc::clone(&chain_b));
    let domain = SigningDomain::new(config.chain_a.chain_id, config.chain_b.chain_id);

    let request_timeout = Duration::from_millis(config.validators.request_timeout_ms);
    let mut members: BTreeMap<Address, Arc<dyn ValidatorClient>> = BTreeMap::new();
    for member in &config.validators.members {
        let client = HttpValidatorClient::new(member.endpoint.clone(), request_timeout)?;
        members.insert(member.address, Arc::new(client));
    }
    let validators = Arc::new(ValidatorSet::new(
        members,
        config.validators.quorum_threshold,
        request_timeout,
    ));

    let status = StatusBoard::new();
    let claims = KeyClaims::new();

    let watchers = WatcherManager::new(vec![
        ChainWatcher::new(chain_a, Arc::clone(&ledger), &config.chain_a, status.clone()),
        ChainWatcher::new(chain_b, Arc::clone(&ledger), &config.chain_b, status.clone()),
    ]);
    let coordinator = SignatureCoordinator::new(
        Arc::clone(&ledger),
        Arc::clone(&validators),
        domain,
        config.coordinator.clone(),
        claims.clone(),
    );
    let submitter = RelaySubmitter::new(
        Arc::clone(&ledger),
        chains.clone(),
        Arc::clone(&validators),
        domain,
        config.submitter.clone(),
        claims.clone(),
    );
    let tracker = ConfirmationTracker::new(
        Arc::clone(&ledger),
        chains,
        domain,
        ConfirmationDepths::from_config(&config),
        config.submitter.clone(),
        claims,
    );
    let monitor = Monitor::new(Arc::clone(&ledger), config.monitor.clone(), status.clone());
    let api_state = AppState {
        ledger,
        status: status.clone(),
        validator_count: validators.len(),
        quorum_threshold: validators.threshold(),
    };

    // One shutdown channel observed by every component
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = signal_tx.send(true);
    });

    tracing::info!("Components initialized, starting processing");
    metrics::UP.set(1.0);

    let mut tasks = JoinSet::new();
    let rx = shutdown_rx.clone();
    tasks.spawn(async move { ("watchers", watchers.run(rx).await) });
    let rx = shutdown_rx.clone();
    tasks.spawn(async move { ("coordinator", coordinator.run(rx).await) });
    let rx = shutdown_rx.clone();
    tasks.spawn(async move { ("submitter", submitter.run(rx).await) });
    let rx = shutdown_rx.clone();
    tasks.spawn(async move { ("confirmation", tracker.run(rx).await) });
    let rx = shutdown_rx.clone();
    tasks.spawn(async move { ("monitor", monitor.run(rx).await) });
    let bind_address = config.api.bind_address.clone();
    tasks.spawn(async move {
        (
            "api",
            api::start_server(&bind_address, api_state, shutdown_rx).await,
        )
    });

    // The first failure stops everything; the rest finish their current unit of work
    let mut failure: Option<eyre::Report> = None;
    while let Some(joined) = tasks.join_next().await {
        let error = match joined {
            Ok((component, Ok(()))) => {
                tracing::info!(component, "Component stopped");
                continue;
            }
            Ok((component, Err(e))) => {
                if is_fatal(&e) {
                    metrics::record_alert("fatal");
                }
                tracing::error!(component, error = ?e, "Component failed, stopping relayer");
                status.set_fatal(format!("{}: {:#}", component, e)).await;
                e
            }
            Err(e) => {
                tracing::error!(error = %e, "Component task panicked, stopping relayer");
                eyre!("component task panicked: {}", e)
            }
        };
        let _ = shutdown_tx.send(true);
        failure.get_or_insert(error);
    }

    metrics::UP.set(0.0);
    match failure {
        Some(e) => Err(e),
        None => {
            tracing::info!("Bridge relayer stopped");
            Ok(())
        }
    }
}

/// Initialize tracing/logging with structured output
///
/// `LOG_FORMAT=json` switches to one JSON object per line.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_relayer=debug"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
