use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gateway::configuration::GatewayConfig;
use gateway::context::Context;
use gateway::metric::Metrics;
use gateway::server::Server;

#[derive(Debug, Parser)]
#[command(name = "gateway", about = "Admission and metering gateway")]
struct Cli {
    /// Gateway configuration file (YAML).
    #[arg(short, long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Override the listen address from the config file.
    #[arg(short, long)]
    listen: Option<String>,
}

fn build(cli: &Cli) -> Result<Server, Box<dyn std::error::Error>> {
    let mut config = GatewayConfig::from_file(&cli.config)?;
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }

    let ctx = Context::from_config(&config)?;
    log::info!("Using database {}", config.database.display());

    let mut server = Server::new(None)?;
    server.bootstrap(&ctx, &config.listen, Arc::new(Metrics::new()));
    Ok(server)
}

fn main() {
    // Set RUST_LOG=info for visibility.
    env_logger::init();

    let cli = Cli::parse();
    let server = match build(&cli) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to start gateway: {e}");
            std::process::exit(1);
        }
    };
    server.run_forever();
}
