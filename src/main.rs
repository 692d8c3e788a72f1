//! Passage - CLI entry point

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use passage::{App, Config, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "passage.yaml";

#[derive(Parser, Debug)]
#[command(name = "passage")]
#[command(version = VERSION)]
#[command(about = "L4 edge proxy with health-checked backend pools")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("passage=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!("Passage v{}", VERSION);

    let config_path = args.config.to_string_lossy().to_string();
    let config = if args.config.exists() {
        info!("loading configuration from {}", config_path);
        match Config::load(&config_path) {
            Ok(c) => c,
            Err(e) => {
                error!("failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    } else if config_path == DEFAULT_CONFIG {
        info!("no {} found, starting with defaults only", DEFAULT_CONFIG);
        Config::default()
    } else {
        error!("configuration file {} does not exist", config_path);
        std::process::exit(1);
    };

    if args.test {
        if let Err(e) = config.validate() {
            error!("configuration test failed: {}", e);
            std::process::exit(1);
        }
        info!("configuration test passed");
        return Ok(());
    }

    let app = match App::new() {
        Ok(app) => app,
        Err(e) => {
            error!("failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.apply(&app) {
        error!("{}", e);
        app.shutdown();
        std::process::exit(1);
    }

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    app.shutdown();

    Ok(())
}
