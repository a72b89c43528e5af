use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notifier::auth::HmacVerifier;
use notifier::hub::Hub;
use notifier::subscriber::Subscriber;
use notifier::webhook::AlertDispatcher;
use notifier::{AppState, config};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "notifier starting");

    // Config path: first CLI arg, or the default deployment path.
    let loaded = match std::env::args().nth(1) {
        Some(path) => config::load_config_from_path(Path::new(&path)),
        None => config::load_config(),
    };
    let config = match loaded {
        Ok(cfg) => {
            info!(
                bind = %cfg.bind,
                max_connections = cfg.max_connections,
                webhook = cfg.webhook.url.is_some(),
                "config loaded"
            );
            Arc::new(cfg)
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let alerts = AlertDispatcher::new(config.webhook.url.clone());
    let hub = Hub::new(config.max_connections, alerts);
    let hub_loop = tokio::spawn(hub.clone().run());

    let redis_client = match redis::Client::open(config.redis.url.as_str()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("FATAL: invalid redis url '{}': {e}", config.redis.url);
            std::process::exit(1);
        }
    };
    let subscriber = Subscriber::new(
        redis_client,
        hub.clone(),
        config.subscriber.clone(),
        hub.shutdown_signal(),
    );
    // A bus that is unreachable at startup is fatal; reconnection only covers
    // subscriptions that were once established.
    let initial = match subscriber.subscribe().await {
        Ok(pubsub) => pubsub,
        Err(e) => {
            eprintln!("FATAL: cannot subscribe to pub/sub bus: {e}");
            std::process::exit(1);
        }
    };
    info!(url = %config.redis.url, "subscribed to pub/sub bus");

    let (fatal_tx, fatal_rx) = tokio::sync::oneshot::channel::<String>();
    tokio::spawn(async move {
        match subscriber.run(initial).await {
            Ok(()) => {}
            Err(e) => {
                let _ = fatal_tx.send(e.to_string());
            }
        }
    });

    let verifier = Arc::new(HmacVerifier::new(config.auth.secret.clone()));
    let state = AppState::new(hub.clone(), verifier, config.clone());
    let router = notifier::build_router(state);

    let listener = match tokio::net::TcpListener::bind(&config.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {e}", config.bind);
            std::process::exit(1);
        }
    };
    info!(addr = %config.bind, "notifier listening");

    let runtime_fatal = Arc::new(AtomicBool::new(false));
    let graceful = {
        let hub = hub.clone();
        let runtime_fatal = runtime_fatal.clone();
        let deadline = config.shutdown_deadline;
        async move {
            tokio::select! {
                () = shutdown_signal() => {}
                Ok(reason) = fatal_rx => {
                    error!(error = %reason, "pub/sub subscriber failed, shutting down");
                    runtime_fatal.store(true, Ordering::Release);
                }
            }
            // Teardown order: the shared signal stops the subscriber, the hub
            // drains its sessions, then the listener stops accepting.
            if let Err(e) = hub.shutdown(deadline).await {
                error!(error = %e, "hub did not drain before deadline");
            }
        }
    };

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(graceful)
        .await
    {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    // The hub loop only exits once the registry has drained; don't let a
    // stuck session hold the process open past its shutdown deadline.
    let _ = tokio::time::timeout(Duration::from_secs(1), hub_loop).await;
    if runtime_fatal.load(Ordering::Acquire) {
        error!("notifier stopped after pub/sub failure");
        std::process::exit(1);
    }
    info!("notifier shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
