use clap::Parser;
use tracing_subscriber::EnvFilter;

use bilbo_firmware_core::runtime::{self, Args};

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    if let Err(e) = runtime::run(args).await {
        eprintln!("Firmware error: {}", e);
        std::process::exit(1);
    }
}
