use tracing::info;

use nimbus::{Config, ServiceContext};

#[tokio::main]
async fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    // Load configuration
    let config = match Config::load_with_env(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {path}: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = nimbus::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        nimbus::logging::init_console_only(&config.logging.level);
    }

    info!("Nimbus - virtual filesystem engine");
    let ctx = match ServiceContext::from_config(config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            std::process::exit(1);
        }
    };
    info!(
        database = %ctx.config.database.path,
        storage = %ctx.config.storage.local_root,
        thumbnail_workers = ctx.thumbnails.capacity(),
        "service context ready"
    );
}
