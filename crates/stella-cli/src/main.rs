//! stella CLI - forward HTTP(S) proxy over a chain of upstream proxies
//!
//! Loads the chain configuration, composes the hop dialers, and serves
//! clients until interrupted.

mod cli;
mod config;

use clap::Parser;
use cli::Cli;
use std::sync::Arc;
use stella_proxy::{compose, AuthMode, ChainConfig, ProxyConfig, ProxyError, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli) {
        error!("{}", e);
        eprintln!("stella: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Some(path) = &cli.example {
        config::write_example(path)?;
        println!("Example configuration written to {}", path.display());
        return Ok(());
    }

    let chain_config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => ChainConfig::default(),
    };
    let hops = chain_config.hops()?;
    for (index, hop) in hops.iter().enumerate() {
        let auth = match hop.auth {
            AuthMode::None => "none",
            AuthMode::Basic { .. } => "basic",
            AuthMode::Ntlm { .. } => "ntlm",
        };
        info!(
            hop = index,
            addr = %hop.address,
            auth = auth,
            tls = hop.use_tls,
            method = %hop.method(),
            "chain hop"
        );
    }

    let dialer = compose(Arc::new(chain_config.tcp_dialer()?), &hops);
    let env_port = std::env::var("PORT").ok();
    let proxy_config = ProxyConfig {
        bind_addr: cli.bind,
        bind_port: config::resolve_port(cli.port, &chain_config, env_port.as_deref()),
        max_connections: cli.max_connections,
        dial_deadline: chain_config.dial_deadline(),
    };

    // Multi-thread runtime: connection handlers run on worker threads while
    // the main task waits for Ctrl-C.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ProxyError::Config(format!("Failed to start proxy runtime: {}", e)))?;

    rt.block_on(async {
        let handle = stella_proxy::start(proxy_config, dialer).await?;
        info!("stella listening on {} ({} hops)", handle.local_addr, hops.len());
        tokio::signal::ctrl_c().await?;
        info!("Interrupted, shutting down");
        handle.shutdown();
        Ok::<(), ProxyError>(())
    })
}
