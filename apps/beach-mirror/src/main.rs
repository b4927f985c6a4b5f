use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use beach_mirror::config::{OperatingModel, SessionConfig};
use beach_mirror::server::{self, ServerConfig};
use beach_mirror::telemetry::Telemetry;
use clap::Parser;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "beach-mirror",
    author,
    version,
    about = "Mirrors one app session to many clients with staged late-join replay"
)]
struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "BEACH_MIRROR_LISTEN_ADDR", default_value = "127.0.0.1:9450")]
    listen_addr: String,

    /// Who simulates physics for new sessions.
    #[arg(
        long,
        env = "BEACH_MIRROR_OPERATING_MODEL",
        value_enum,
        default_value_t = OperatingModel::PeerAuthoritative
    )]
    operating_model: OperatingModel,

    /// Time a client has to complete the handshake.
    #[arg(long, env = "BEACH_MIRROR_HANDSHAKE_TIMEOUT_SECS", default_value_t = 30)]
    handshake_timeout_secs: u64,

    /// Lower bound of the randomized heartbeat interval.
    #[arg(long, env = "BEACH_MIRROR_HEARTBEAT_MIN_SECS", default_value_t = 5)]
    heartbeat_min_secs: u64,

    /// Upper bound of the randomized heartbeat interval.
    #[arg(long, env = "BEACH_MIRROR_HEARTBEAT_MAX_SECS", default_value_t = 10)]
    heartbeat_max_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_MIRROR_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let session = SessionConfig {
            operating_model: cli.operating_model,
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            heartbeat_min: Duration::from_secs(cli.heartbeat_min_secs),
            heartbeat_max: Duration::from_secs(cli.heartbeat_max_secs),
        };
        session.validate().context("invalid session configuration")?;
        Ok(ServerConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            session,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        operating_model = ?config.session.operating_model,
        "starting beach-mirror"
    );

    server::run(config, telemetry.metrics_handle()).await
}
