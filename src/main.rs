//! Dashboard portal - signed-in analytics pages over blob storage

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use dash_portal::{
    cli::{Cli, Command},
    config::Config,
    portal::{Bootstrap, Portal},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Fetch {
            name,
            no_cache,
            output,
        }) => run_fetch(&config, &name, !no_cache, output).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> dash_portal::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    Ok(config)
}

/// Fetch one data file through the blob cache
async fn run_fetch(
    config: &Config,
    name: &str,
    use_cache: bool,
    output: Option<PathBuf>,
) -> ExitCode {
    let Some(file) = config.data.files.get(name) else {
        let known: Vec<&str> = config.data.files.keys().map(String::as_str).collect();
        eprintln!("Unknown data file '{name}'. Configured: {}", known.join(", "));
        return ExitCode::FAILURE;
    };

    let bootstrap = match Bootstrap::resolve(config).await {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to resolve settings: {e}");
            return ExitCode::FAILURE;
        }
    };

    let blob = file.resolve(&bootstrap.settings.storage_name);
    let cache = bootstrap.blob_cache(config);

    let data = match cache.get(&blob, use_cache).await {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Failed to fetch {blob}: {e}");
            return ExitCode::FAILURE;
        }
    };

    match output {
        Some(path) => {
            if let Err(e) = tokio::fs::write(&path, &data).await {
                eprintln!("Failed to write {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
            println!("Wrote {} bytes to {}", data.len(), path.display());
        }
        None => {
            let stats = cache.stats();
            println!(
                "{blob}: {} bytes (cache hits: {}, downloads: {})",
                data.len(),
                stats.hits(),
                stats.downloads()
            );
        }
    }

    ExitCode::SUCCESS
}

/// Run the portal server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        production = config.is_prod,
        "Starting dashboard portal"
    );

    let portal = match Portal::build(config).await {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to start portal: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = portal.run().await {
        error!("Portal error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Portal shutdown complete");
    ExitCode::SUCCESS
}
