use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use ipnet::Ipv4Net;

use crate::gateway::DEFAULT_GATEWAY_MTU;
use crate::latency;

#[derive(Parser, Debug)]
#[command(
    name = "relaytune",
    author,
    version,
    about = "Host tuning pipeline for high-throughput relay gateways"
)]
pub struct Cli {
    /// Output format for command responses
    #[arg(
        long = "output",
        value_enum,
        default_value_t = OutputFormat::Text,
        global = true
    )]
    pub output_format: OutputFormat,

    /// Shorthand for --output json
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Probe the host and apply the platform tuning catalog
    Tune(TuneArgs),

    /// Enable IP forwarding and NAT masquerade for an internal interface
    Gateway(GatewayArgs),

    /// Print the probed host profile without mutating anything
    Probe,

    /// Internal worker that keeps the minimum-latency handle open
    #[command(name = latency::WORKER_SUBCOMMAND, hide = true)]
    LatencyHoldWorker(LatencyHoldArgs),
}

#[derive(Args, Debug)]
pub struct TuneArgs {
    /// Core all interface IRQs are pinned to
    #[arg(long, default_value_t = 0)]
    pub core: u32,

    /// Probe and filter the catalog without applying anything
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct GatewayArgs {
    /// Internal (relay-facing) interface name
    #[arg(long)]
    pub interface: String,

    /// Internal subnet to masquerade (CIDR, e.g. 10.13.13.0/24)
    #[arg(long)]
    pub subnet: Ipv4Net,

    /// MTU clamped onto the internal interface
    #[arg(long, default_value_t = DEFAULT_GATEWAY_MTU)]
    pub mtu: u32,
}

#[derive(Args, Debug)]
pub struct LatencyHoldArgs {
    /// Marker file recording the hold's pid
    #[arg(long)]
    pub marker: PathBuf,
}
