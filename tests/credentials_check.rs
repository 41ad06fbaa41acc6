use anyhow::{anyhow, Result};
use dotenvy::dotenv;
use oxide_wasabi::config::Settings;
use oxide_wasabi::storage::{StorageProvider, WasabiStorage};
use oxide_wasabi::transfer::TransferProgress;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::test]
#[ignore = "Requires real credentials"]
async fn test_credentials_validation() -> Result<()> {
    load_dotenv();
    init_tracing();

    info!("Starting integration test for Wasabi credentials...");
    let settings = Settings::new().map_err(|e| anyhow!("Settings failed to load: {e}"))?;
    assert!(!settings.bot_token.is_empty(), "BOT_TOKEN is missing");

    let storage = WasabiStorage::new(&settings).await?;
    info!("Bucket: {}", storage.bucket());
    storage.check_connection().await?;

    verify_round_trip(&storage).await?;
    info!("Credentials validation test passed successfully.");
    Ok(())
}

fn load_dotenv() {
    let env_path = Path::new("../.env");
    if env_path.exists() {
        let _ = dotenvy::from_path(env_path);
    } else {
        dotenv().ok();
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

async fn verify_round_trip(storage: &WasabiStorage) -> Result<()> {
    let dir = std::env::temp_dir().join("oxide-wasabi-it");
    tokio::fs::create_dir_all(&dir).await?;
    let source = dir.join("connectivity.txt");
    tokio::fs::write(&source, b"test_connectivity").await?;

    let key = "integration_test/connectivity.txt";
    let progress = Arc::new(TransferProgress::new(17));
    storage.upload_file(&source, key, progress.clone()).await?;
    assert_eq!(progress.seen(), 17);

    let info = storage.head_object(key).await?;
    assert_eq!(info.size, 17);

    let url = storage.presigned_url(key, Duration::from_secs(60)).await?;
    assert!(url.contains("X-Amz-Signature="));

    let target = dir.join("connectivity.copy");
    let written = storage
        .download_file(key, &target, Arc::new(TransferProgress::new(17)))
        .await?;
    assert_eq!(written, 17);

    info!("Cleaning up...");
    storage.delete_object(key).await?;
    let _ = tokio::fs::remove_dir_all(&dir).await;
    Ok(())
}
