use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use log::info;
use sentinel_proxy::config::{Config, ConfigError};
use sentinel_proxy::utils::format_bytes;
use sentinel_proxy::SentinelProxy;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sentinel-proxy")]
#[command(about = "A transparent high-availability proxy for Redis deployments managed by Redis Sentinel")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run {
        /// Path to configuration file (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Address to accept clients on
        #[arg(short, long)]
        listen: Option<String>,
        /// Initial primary host
        primary_host: Option<String>,
        /// Initial primary port
        primary_port: Option<u16>,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            listen,
            primary_host,
            primary_port,
        } => {
            run_proxy(config, listen, primary_host, primary_port).await?;
        }
        Commands::Config { output } => {
            generate_config(output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

async fn run_proxy(
    config_path: Option<PathBuf>,
    listen: Option<String>,
    primary_host: Option<String>,
    primary_port: Option<u16>,
) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };

    // Command line wins over the file
    if let Some(listen) = listen {
        config.server.listen_addr = listen;
    }
    if let Some(host) = primary_host {
        config.sentinel.primary_host = host;
    }
    if let Some(port) = primary_port {
        config.sentinel.primary_port = port;
    }

    init_logging(&config)?;

    info!("Starting sentinel-proxy v{}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => info!("Configuration loaded from: {:?}", path),
        None => info!("No configuration file given, using defaults"),
    }
    info!("Initial primary: {}", config.sentinel.primary());

    let proxy = SentinelProxy::new(config).context("Invalid configuration")?;
    proxy.run().await.context("Proxy terminated")?;

    Ok(())
}

fn generate_config(output: PathBuf) -> anyhow::Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  sentinel-proxy run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.server.listen_addr);
            println!("  Max connections: {}", config.server.max_connections);
            println!("  Initial primary: {}", config.sentinel.primary());
            if let Some(name) = &config.sentinel.master_name {
                println!("  Primary name: {}", name);
            }
            println!("  Sentinel seeds: {} instances", config.sentinel.seeds.len());
            for (i, seed) in config.sentinel.seeds.iter().enumerate() {
                println!("    {}: {}", i + 1, seed);
            }
            println!(
                "  Pool: {} connections per endpoint",
                config.pool.connections_per_endpoint
            );
            println!(
                "  Max request size: {}",
                format_bytes(config.server.max_request_bytes as u64)
            );
            println!(
                "  Reply cache: {}",
                if config.cache.enabled { "enabled" } else { "disabled" }
            );
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("sentinel-proxy v{}", env!("CARGO_PKG_VERSION"));
    println!("A transparent high-availability proxy for Redis deployments managed by Redis Sentinel");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Writes follow the primary across Sentinel failovers");
    println!("  • Read-only commands spread over healthy replicas");
    println!("  • Short-lived cache of replica replies");
    println!("  • Streaming reply relay for large values");
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    // RUST_LOG takes precedence over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log filter")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.logging.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| anyhow!("Failed to initialize logging: {e}"))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
