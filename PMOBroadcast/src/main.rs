use std::sync::Arc;

use pmobroadcast::{
    BroadcastConfigExt, BroadcastServerExt, BroadcastSession, Controller, SoxProcessor,
};
use pmoconfig::get_config;
use pmoserver::{ServerBuilder, logs::LoggingOptions};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ========== PHASE 1 : Configuration et logs ==========
    let config = get_config();
    let mut server = ServerBuilder::new_configured().build();
    server.init_logging(LoggingOptions::from_config()).await;
    info!(config_dir = config.directory(), "Configuration loaded");

    let settings = config.get_broadcast_settings()?;

    // ========== PHASE 2 : Session de diffusion ==========
    let processor = Arc::new(SoxProcessor::new(&settings));
    let session = BroadcastSession::new(settings.clone(), processor);
    let controller = Controller::new(session.clone(), settings.fx_dir.clone());
    info!(
        source = %settings.default_source.display(),
        fx_dir = %settings.fx_dir.display(),
        "Broadcast session ready"
    );

    server
        .add_route("/api/info", || async {
            serde_json::json!({
                "name": "PMOBroadcast",
                "version": env!("CARGO_PKG_VERSION"),
            })
        })
        .await;
    server
        .init_broadcast(controller, settings.public_dir.clone())
        .await?;

    // ========== PHASE 3 : Démarrage du serveur ==========
    info!("Starting HTTP server...");
    server.start().await?;

    info!("PMOBroadcast is ready, press Ctrl+C to stop");
    server.wait().await;

    session.stop().await;
    info!("Broadcast stopped, bye");
    Ok(())
}
