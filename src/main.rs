//! Proxy gateway CLI entry point (§11).

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use proxy_gateway::{Config, Gateway};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "proxy-gateway")]
#[command(version)]
#[command(about = "Multi-protocol proxy gateway (Shadowsocks, SOCKS5, HTTP/HTTPS)")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "./config.yaml")]
    config: PathBuf,

    /// Load and validate the configuration, then exit
    #[arg(long = "test-config")]
    test_config: bool,

    /// Write a Clash-style client config derived from the server config, then exit
    #[arg(long = "generate-config")]
    generate_config: bool,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .max_blocking_threads(32)
        .enable_all()
        .event_interval(61)
        .global_queue_interval(31)
        .thread_name("proxy-gateway-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) if args.config == Config::default_path() => {
            // no config.yaml present yet: fall back to defaults so
            // --generate-config works on a bare checkout.
            if args.generate_config {
                Config::default()
            } else {
                eprintln!("failed to load configuration: {e}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config.server.log_level)?;

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        std::process::exit(1);
    }

    if args.test_config {
        info!("configuration valid");
        return Ok(());
    }

    if args.generate_config {
        let client_yaml = config.generate_client_config();
        let path = PathBuf::from("./client-config.yaml");
        std::fs::write(&path, client_yaml)?;
        println!("wrote client config to {}", path.display());
        return Ok(());
    }

    info!("loading configuration from {}", args.config.display());

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("failed to initialize gateway: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = gateway.run().await {
        error!("gateway error: {e}");
        std::process::exit(1);
    }

    Ok(())
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("proxy_gateway={log_level}")));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
    Ok(())
}
