// Single-process entry point: control-plane API, reconciler and proxy
// manager share one runtime and one shutdown signal.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;

use simplify::api::{self, ApiContext};
use simplify::{CaddyManager, Config, Context, DockerEngine, Env, Store, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        // The logger may not exist yet when startup fails.
        eprintln!("simplify: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_path =
        std::env::var("SIMPLIFY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
    let config = Config::load(Path::new(&config_path))?;
    config.validate()?;

    let default_filter = match config.env {
        Env::Development => "info,simplify=debug",
        Env::Production => "info",
    };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .init();
    info!(config = %config_path, env = %config.env, "starting simplify");

    let store = Store::open(Path::new(&config.database.path))?;
    let engine = Arc::new(DockerEngine::connect()?);

    let caddy = if config.caddy.enabled {
        let manager = Arc::new(CaddyManager::new(
            engine.clone(),
            config.caddy.clone(),
            config.server.port,
        ));
        manager.ensure_running().await?;
        Some(manager)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller = tokio::spawn(simplify::run(
        Context {
            store: store.clone(),
            engine: engine.clone(),
            caddy,
            interval: simplify::DEFAULT_INTERVAL,
        },
        shutdown_rx.clone(),
    ));

    let routes = api::routes(ApiContext { store, engine });
    let mut server_shutdown = shutdown_rx;
    let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(
        ([0, 0, 0, 0], config.server.port),
        async move {
            let _ = server_shutdown.changed().await;
        },
    );
    info!(%addr, "control plane listening");
    let server = tokio::spawn(server);

    wait_for_signal().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    let drain = Duration::from_secs(config.server.shutdown_timeout);
    if tokio::time::timeout(drain, async {
        if let Err(err) = server.await {
            error!(%err, "server task failed");
        }
        if let Err(err) = controller.await {
            error!(%err, "reconciler task failed");
        }
    })
    .await
    .is_err()
    {
        warn!(timeout_secs = drain.as_secs(), "shutdown timed out, abandoning in-flight work");
    }

    info!("bye");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
