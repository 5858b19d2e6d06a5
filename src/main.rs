mod bridge;
mod cache;
mod config;
mod driver;
mod fetcher;
mod messages;
mod player;
mod queue;
mod server;
mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::driver::SessionDriver;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // 1. Init logging
    tracing_subscriber::fmt::init();

    // 2. Load/create config
    let config = config::Config::load()?;

    // 3. Read env overrides
    let http_port: u16 = std::env::var("MEETJAM_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(config.http_port);
    let cdp_port: u16 = std::env::var("MEETJAM_CDP_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(config.cdp_port);
    let fetcher_bin =
        std::env::var("MEETJAM_FETCHER").unwrap_or_else(|_| config.fetcher_bin.clone());
    let browser_path = std::env::var("MEETJAM_BROWSER")
        .ok()
        .or_else(|| config.browser_path.clone());

    // 4. Resolve working directories
    let state_dir = config
        .downloads_dir
        .clone()
        .map(|d| d.parent().map(PathBuf::from).unwrap_or_else(|| d.clone()))
        .unwrap_or_else(|| PathBuf::from("."));
    let downloads_dir = config
        .downloads_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("downloads"));

    // 5. Create the download cache (wipes leftovers from the last run)
    let cache = Arc::new(cache::DownloadCache::new(
        downloads_dir.clone(),
        fetcher::YtDlp::new(fetcher_bin.clone()),
    )?);
    tracing::info!(
        "[init] cache at {} (fetcher: {})",
        downloads_dir.display(),
        fetcher_bin
    );

    // 6. Session driver (browser is launched lazily on first join)
    let driver = Arc::new(driver::CdpDriver::new(cdp_port, browser_path, state_dir));

    // 7. Create channels
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (control_tx, mut control_rx) =
        tokio::sync::mpsc::channel::<player::ControlRequest>(64);
    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel::<player::InternalEvent>(64);

    // 8. Orchestrator state. The session page fetches audio from our own
    // HTTP server, so the base URL is loopback as seen from the browser.
    let base_url = format!("http://127.0.0.1:{http_port}");
    let mut player = player::Player::new(
        cache,
        driver.clone(),
        events_tx,
        shutdown_rx.clone(),
        base_url,
    );

    // 9. Spawn the HTTP + websocket front
    let server_state = Arc::new(server::ServerState {
        control_tx,
        downloads_dir,
    });
    let server_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_server(http_port, server_state, server_shutdown).await {
            tracing::error!("[http] server error: {e}");
        }
    });

    tracing::info!("[init] ready — control channel at ws://0.0.0.0:{http_port}/ws");

    // 10. Orchestrator loop (runs on the main task; owns all playback state)
    loop {
        tokio::select! {
            req = control_rx.recv() => {
                let Some(req) = req else {
                    tracing::info!("[player] control channel closed, shutting down");
                    break;
                };
                player.handle_request(req).await;
            }

            Some(event) = events_rx.recv() => {
                player.handle_event(event).await;
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, shutting down...");
                break;
            }
        }
    }

    // 11. Teardown: stop background loops, leave the session, drop the browser
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(10), session::leave_meeting(driver.as_ref()))
        .await
        .is_err()
    {
        tracing::warn!("[session] leave timed out");
    }
    driver.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
