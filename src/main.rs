use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vidmosaic::{
    config::Config,
    coordinator::{DiscoveryOptions, LibraryCoordinator},
    db::Catalog,
    extract::FrameExtractor,
    mosaic::MosaicEngine,
    preview::PreviewEngine,
    processor::VideoProcessor,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vidmosaic=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Vidmosaic Library Engine");

    let config = Config::from_env()?;
    info!("Configuration loaded");

    let catalog = Catalog::new(&config.database_url).await?;
    info!("Catalog initialized");

    let use_acceleration = std::env::var("USE_HW_DECODE").unwrap_or_default() == "true";
    let extractor = Arc::new(FrameExtractor::create(use_acceleration).await);

    let processor = VideoProcessor::new(
        catalog.clone(),
        config.processing.clone(),
        config.storage.clone(),
        extractor,
        config.generate_thumbnails,
    );

    let coordinator = Arc::new(
        LibraryCoordinator::new(catalog.clone(), processor)
            .with_mosaic_engine(MosaicEngine::create(use_acceleration).await)
            .with_preview_engine(PreviewEngine::new(config.storage.clone())),
    );

    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            coordinator.cancel();
        });
    }

    if config.library_roots.is_empty() {
        warn!("No library roots configured; set LIBRARY_ROOTS to scan");
        return Ok(());
    }

    let options = DiscoveryOptions::new(
        true,
        config.concurrent_operations,
        std::env::var("UPDATE_EXISTING").unwrap_or_default() == "true",
        config.generate_thumbnails,
    );
    let generate_mosaics = std::env::var("GENERATE_MOSAICS").unwrap_or_default() == "true";
    let generate_previews = std::env::var("GENERATE_PREVIEWS").unwrap_or_default() == "true";

    for root in &config.library_roots {
        if !root.exists() || !root.is_dir() {
            warn!("Skipping invalid library root: {}", root.display());
            continue;
        }
        info!("Discovering: {}", root.display());
        match coordinator.discover_folder(root, &options, None).await {
            Ok(result) => {
                info!(
                    "Discovery of {} finished: {} added, {} updated, {} removed, {} folders created, {} errors ({:.1} videos/s)",
                    root.display(),
                    result.added,
                    result.updated,
                    result.removed,
                    result.created_folders,
                    result.errors.len(),
                    result.statistics.processing_rate
                );
                for failure in &result.errors {
                    warn!("  {}: {}", failure.url, failure.error);
                }
            }
            Err(e) => {
                warn!("Discovery of {} failed: {}", root.display(), e);
                continue;
            }
        }

        if generate_mosaics || generate_previews {
            let videos = catalog
                .fetch_videos_under(&root.to_string_lossy())
                .await?;
            if generate_mosaics {
                info!("Generating mosaics for {} videos", videos.len());
                match coordinator
                    .generate_mosaics(&videos, &config.mosaic, Some(root), &options, None)
                    .await
                {
                    Ok(result) => info!(
                        "Mosaics: {} generated, {} errors",
                        result.updated,
                        result.errors.len()
                    ),
                    Err(e) => warn!("Mosaic generation failed: {}", e),
                }
            }
            if generate_previews {
                info!("Generating previews for {} videos", videos.len());
                match coordinator
                    .generate_previews(&videos, &config.preview, &options, None)
                    .await
                {
                    Ok(result) => info!(
                        "Previews: {} generated, {} errors",
                        result.updated,
                        result.errors.len()
                    ),
                    Err(e) => warn!("Preview generation failed: {}", e),
                }
            }
        }
    }

    info!("All library roots processed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling discovery");
        },
        _ = terminate => {
            info!("Received terminate signal, cancelling discovery");
        },
    }
}
