use anyhow::Result;
use rollcalld::backend::SessionBackend;
use rollcalld::engine::run_session;
use rollcalld::supervisor::supervise;
use rollcalld::Config;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        api = %config.api_base,
        camera = %config.camera_device,
        models = %config.model_dir.display(),
        db = %config.db_path.display(),
        "rollcalld starting"
    );

    let backend = Arc::new(SessionBackend::new(&config.api_base, config.http_timeout())?);

    // Ctrl-C quits the running session (reported to the backend) and exits.
    let (quit_tx, quit_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received; shutting down");
                let _ = quit_tx.send(true);
            }
            Err(e) => tracing::error!(error = %e, "cannot listen for interrupt"),
        }
        quit_tx.closed().await;
    });

    let interval = config.poll_interval();
    let session_backend = backend.clone();
    let session_quit = quit_rx.clone();
    supervise(backend, interval, quit_rx, move |active| {
        run_session(config.clone(), session_backend.clone(), active, session_quit.clone())
    })
    .await;

    tracing::info!("rollcalld stopped");
    Ok(())
}
