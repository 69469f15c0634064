use anyhow::Result;
use fleetd_core::config::GlobalConfig;
use fleetd_server::{api, manager::Fleet, monitor};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = GlobalConfig::load()?;
    info!(
        "fleetd starting (projects root: {})",
        config.projects_root.display()
    );

    let listen_port = config.listen_port;
    let fleet = Fleet::new(config)?;
    fleet.restore().await?;
    if let Err(e) = fleet.rescan().await {
        warn!("initial rescan failed: {e:#}");
    }
    monitor::spawn(fleet.clone());

    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], listen_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on http://{}", addr);

    let app = api::router(fleet);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("received Ctrl+C, shutting down"),
                Err(e) => warn!("unable to listen for shutdown signal: {}", e),
            }
        })
        .await?;

    // Managed dev servers are left running on purpose; the next boot
    // re-adopts them from the persisted pids.
    info!("fleetd stopped");
    Ok(())
}
