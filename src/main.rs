//! RAX Fax Client - Entry Point
//!
//! Starts a session pool against the configured fax server and, when
//! enabled, logs every status event the server reports.

use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;

use rax_fax_client::config::ClientConfig;
use rax_fax_client::error::FaxResult;
use rax_fax_client::pool::ConnectionPool;
use rax_fax_client::watcher::{EventMask, StatusEvent, StatusListener, StatusWatcher, TYPE_ALL};

struct LoggingListener;

impl StatusListener for LoggingListener {
    fn on_event(&self, event: &StatusEvent) {
        match (&event.description, event.job_id(), event.device()) {
            (Some(description), _, _) => info!("[{}] {}", event.code, description),
            (None, Some(job), _) => info!("[{}] job {}", event.code, job),
            (None, None, Some(device)) => info!("[{}] {}", event.code, device),
            (None, None, None) => info!("[{}]", event.code),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger (env_logger picks up RUST_LOG environment variable)
    env_logger::init();

    let config = match ClientConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ClientConfig) -> FaxResult<()> {
    info!("Launching fax client for {}...", config.pool.server_address());

    let pool = ConnectionPool::new(config.pool.clone());
    pool.start().await?;

    {
        let lease = pool.acquire().await?;
        lease.call(|session| Box::pin(session.noop())).await?;
        info!("Fax server {} is reachable", config.pool.server_address());
    }

    let watcher = StatusWatcher::new(config.watcher.clone());
    if config.watcher.enabled {
        let listener: Arc<dyn StatusListener> = Arc::new(LoggingListener);
        if let Err(e) = watcher
            .add_listener(
                &config.pool.host,
                config.pool.port,
                &config.pool.user,
                config.pool.timezone,
                listener,
                TYPE_ALL,
                EventMask::all(),
                None,
            )
            .await
        {
            error!("Status events unavailable: {}", e);
        }
    }

    info!("Pool ready: {:?}", pool.stats());
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for shutdown signal: {}", e);
    }

    info!("Shutting down...");
    watcher.shutdown().await;
    pool.stop().await;
    Ok(())
}
