use synccode_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    match &config.storage_path {
        Some(path) => log::info!("Persisting rooms to {}", path.display()),
        None => log::info!("No storage path set, rooms live in memory only"),
    }
    let server = SyncServer::new(config)?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
            let saved = server.registry().checkpoint_all().await;
            log::info!("Saved {saved} rooms");
            Ok(())
        }
    }
}
