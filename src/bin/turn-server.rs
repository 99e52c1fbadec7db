use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use turn_server::{init_logging, parse_users, RelayConfig, ServerConfig, StaticCredentials, TurnServer};

#[derive(Parser, Debug)]
#[command(author, version, about = "TURN relay server", long_about = None)]
struct Args {
    /// IP address advertised to clients as the relay address
    #[arg(long)]
    public_ip: Option<IpAddr>,

    /// Listening port (UDP and TCP)
    #[arg(short, long)]
    port: Option<u16>,

    /// Credentials as "user=pass,user=pass"
    #[arg(short, long)]
    users: String,

    /// Authentication realm
    #[arg(short, long)]
    realm: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON configuration file; command-line flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if let Some(realm) = &self.realm {
            config.realm = realm.clone();
        }

        match (self.public_ip, &mut config.relay) {
            (Some(ip), RelayConfig::Static { public_ip, .. }) => *public_ip = ip,
            (Some(ip), RelayConfig::PortRange { relay_ip, .. }) => *relay_ip = ip,
            (None, _) if self.config.is_none() => bail!("--public-ip is required"),
            (None, _) => {}
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = args.server_config()?;

    let users = parse_users(&args.users);
    if users.is_empty() {
        bail!("--users must contain at least one user=pass entry");
    }
    let credentials = StaticCredentials::from_passwords(
        config.realm.clone(),
        users.iter().map(|(user, pass)| (user.as_str(), pass.as_str())),
    );
    info!("Loaded {} users for realm {}", credentials.len(), config.realm);

    let server = TurnServer::start(config, Arc::new(credentials))
        .await
        .context("Failed to start TURN server")?;

    if let Some(addr) = server.udp_local_addr() {
        info!("Listening on udp://{}", addr);
    }
    if let Some(addr) = server.tcp_local_addr() {
        info!("Listening on tcp://{}", addr);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    server.stop().await?;
    Ok(())
}
