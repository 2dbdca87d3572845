//! CLI argument definitions for stella
//!
//! Uses clap for argument parsing. There are no subcommands: the binary
//! either writes an example configuration or runs the proxy.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

/// stella - forward HTTP(S) proxy with chained upstream proxies
///
/// Every outbound connection is tunneled through the hops listed in the
/// configuration file, in order. Without a configuration the proxy connects
/// directly.
#[derive(Parser, Debug)]
#[command(name = "stella")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "EXAMPLES:
    # Write a sample configuration to ./example.json
    stella --example

    # Run with ./config.json
    stella --config

    # Run with a specific file on port 3128
    stella --config /etc/stella/chain.json --port 3128
")]
pub struct Cli {
    /// Load the chain configuration from a JSON file (default: ./config.json)
    #[arg(
        long,
        value_name = "PATH",
        num_args = 0..=1,
        default_missing_value = "config.json"
    )]
    pub config: Option<PathBuf>,

    /// Write an example configuration file and exit (default: ./example.json)
    #[arg(
        long,
        value_name = "PATH",
        num_args = 0..=1,
        default_missing_value = "example.json"
    )]
    pub example: Option<PathBuf>,

    /// Listening port (overrides the configuration file and $PORT)
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Listening address
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Maximum concurrent client connections (0 = unlimited)
    #[arg(long, default_value_t = 256)]
    pub max_connections: usize,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}
