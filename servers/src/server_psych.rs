use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use lib_psych::core::{Diagnostics, Dispatcher, Lifecycle, PsychProvider};

mod psych_logic;
use psych_logic::{admin, config, logger, monitor};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), config.log_level())?;

    let feed_config = config.load_feed_config()?;
    log::info!(
        "Starting {} with {} resources every {}s",
        feed_config.service_name,
        feed_config.resources.len(),
        feed_config.interval
    );

    let dispatcher = Arc::new(Dispatcher::new());
    let mut provider = PsychProvider::with_http(feed_config, dispatcher.clone())?;
    if config.no_timer.unwrap_or(false) {
        log::info!("Timer disabled, polling on manual republish only.");
        provider = provider.without_timer();
    }
    let provider = Arc::new(provider);
    provider.start()?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let admin_handle = tokio::spawn(admin::run(
        config.clone(),
        admin::AdminState {
            provider: provider.clone(),
            dispatcher: dispatcher.clone(),
        },
        shutdown_tx.subscribe(),
    ));

    let monitor_handle = tokio::spawn(monitor::run(dispatcher.clone(), shutdown_tx.subscribe()));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::error!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
        _ = async {
            // A panic-level clock drift leaves the core unable to poll; exit so
            // the supervisor restarts with a fresh one.
            let mut check = tokio::time::interval(Duration::from_secs(1));
            loop {
                check.tick().await;
                if provider.is_shutdown().await {
                    break;
                }
            }
        } => {
            log::error!("Core shut down after a clock drift panic, exiting.");
        }
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
    provider.stop().await;

    // Wait for components to shut down
    let (admin_result, _) = tokio::join!(admin_handle, monitor_handle);
    if let Ok(Err(e)) = admin_result {
        log::error!("Admin server failed: {}", e);
    }

    log::info!("Shutdown complete.");
    Ok(())
}
