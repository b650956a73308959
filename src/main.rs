//! webacquire - multi-tenant web data-acquisition server.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "webacquire", version, about = "Multi-tenant web data-acquisition server")]
struct Args {
    /// Path to the server configuration file (line-oriented key=value)
    config_file: std::path::PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webacquire=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    webacquire::app::run(&args.config_file)
}
