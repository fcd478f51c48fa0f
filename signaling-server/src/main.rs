use std::net::SocketAddr;

use clap::Parser;
use log::{info, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use peercall_signaling_server::router;
use peercall_signaling_server::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "peercall-signaling-server", version, about = "peercall signaling relay")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9001", env = "RELAY_ADDRESS")]
    address: SocketAddr,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "RELAY_LOG_LEVEL")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = args.log_level.parse().unwrap_or(LevelFilter::Info);
    TermLogger::init(level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto)?;

    let listener = tokio::net::TcpListener::bind(args.address).await?;
    info!("signaling relay listening on {}", listener.local_addr()?);

    axum::serve(listener, router::create(RelayServer::new())).await?;
    Ok(())
}
