//! Large Image - inspect images and build pyramids from the command line.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use large_image::{
    config::{Cli, Command, ConvertConfig, InfoConfig},
    ConvertOptions, EngineContext, OpenOptions,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = cli.cache.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    let context = EngineContext::new(cli.cache);

    match cli.command {
        Command::Info(config) => run_info(&context, config).await,
        Command::Convert(config) => run_convert(&context, config).await,
    }
}

// =============================================================================
// Info Command
// =============================================================================

async fn run_info(context: &EngineContext, config: InfoConfig) -> ExitCode {
    let source = match context.open(&config.path, &OpenOptions::default()).await {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to open {}: {}", config.path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let meta = source.metadata();
    let mut json = serde_json::json!({
        "metadata": meta,
        "associated": source.associated_images(),
    });
    if config.levels {
        let levels: Vec<_> = (0..meta.levels)
            .map(|level| {
                let (width, height) = meta.level_size(level);
                let (columns, rows) = meta.tile_grid(level);
                serde_json::json!({
                    "level": level,
                    "width": width,
                    "height": height,
                    "tiles": [columns, rows],
                    "magnification": source.magnification_for_level(Some(level)),
                })
            })
            .collect();
        json["levels"] = serde_json::Value::Array(levels);
    }

    match serde_json::to_string_pretty(&json) {
        Ok(text) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to render metadata: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Convert Command
// =============================================================================

async fn run_convert(context: &EngineContext, config: ConvertConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Converting {} -> {}", config.source.display(), config.destination.display());
    if let Some(crop) = config.crop {
        info!(
            "  Crop: {}x{} at ({}, {})",
            crop.width, crop.height, crop.left, crop.top
        );
    }
    info!("  Resample: {}", config.resample);

    let options = ConvertOptions {
        resample: config.resample,
        crop: config.crop,
    };
    match context
        .convert(&config.source, &config.destination, options)
        .await
    {
        Ok(meta) => {
            info!(
                "Wrote {}: {}x{}, {} band(s), {} frame(s)",
                config.destination.display(),
                meta.size_x,
                meta.size_y,
                meta.band_count,
                meta.frame_count()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Conversion failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "large_image=debug"
    } else {
        "large_image=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
