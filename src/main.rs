//! Dragonchain installer - provision a managed chain on Kubernetes

use clap::Parser;

use dc_installer::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = cli.run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
