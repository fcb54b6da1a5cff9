//! fluxswarmd: a thin binary that loads a config file, boots an `Agent`, and
//! blocks until shutdown. The CLI front-end proper (subcommand parsing,
//! human-readable tables over the control protocol) is an external
//! collaborator; this binary only proves the library boots the way the
//! teacher's `rusty-db-server` binary is a thin `main.rs` over
//! `rusty_db::network::Server`.

use std::path::PathBuf;
use std::sync::Arc;

use fluxswarm::config::Config;
use fluxswarm::error::Result;
use fluxswarm::transport::net::{NetTransport, NetTransportConfig};
use fluxswarm::transport::Transport;
use fluxswarm::{Agent, VERSION};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("fluxswarm.toml"));

    let config = match std::fs::read_to_string(&config_path) {
        Ok(raw) => Config::from_toml_str(&raw)?,
        Err(e) => {
            warn!(path = %config_path.display(), error = %e, "no config file found, using defaults");
            let cfg = Config::default();
            cfg.validate()?;
            cfg
        }
    };

    print_banner(&config);

    let transport: Arc<dyn Transport> = Arc::new(
        NetTransport::bind(NetTransportConfig {
            bind_addr: config.bind_addr,
            advertise_addr: config.advertise_addr,
            udp_buffer_size: config.udp_buffer_size,
            tcp_timeout: config.tcp_timeout,
        })
        .await?,
    );

    let agent = Agent::new(config, transport)?;
    agent.start().await?;

    info!("agent started, press ctrl-c to leave the cluster and shut down");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c, shutting down immediately");
        return agent.shutdown().await;
    }

    info!("leaving cluster");
    agent.leave().await
}

fn print_banner(config: &Config) {
    println!("fluxswarm {VERSION}");
    println!("  node name:       {}", config.name);
    println!("  bind address:    {}", config.bind_addr);
    println!(
        "  advertise addr:  {}",
        config
            .advertise_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "(derived from bind address)".to_string())
    );
    println!("  control address: {}", config.control_bind_addr);
    println!(
        "  snapshot path:   {}",
        config.snapshot_path.as_deref().unwrap_or("(disabled)")
    );
    println!(
        "  encryption:      {}",
        if config.secret_keys.is_empty() { "disabled" } else { "enabled" }
    );
    println!();
}
