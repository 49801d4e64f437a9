use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "connectgate",
    version,
    about = "HTTP CONNECT forward proxy with SSRF protection and per-destination limits"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the proxy and serve until Ctrl-C
    Serve(ServeArgs),
    /// Validate configuration, TLS material and the DoH endpoint
    Check(CheckArgs),
    /// Manage connectgate configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Load a config file on top of the global one
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Listen address, overriding config and environment
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<SocketAddr>,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Load a config file on top of the global one
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config file
    Init {
        /// Destination (defaults to the global config path)
        #[arg(long, value_name = "PATH")]
        path: Option<PathBuf>,
    },
    /// Print the effective merged configuration
    Show {
        /// Load a config file on top of the global one
        #[arg(long = "config", value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}
