//! CLI definitions for netpulsed.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "netpulsed",
    version,
    about = "Network quality monitor\n\nProbes configured targets, derives RTT/loss/jitter metrics over a sliding window, and streams live telemetry over HTTP + WebSocket.",
    long_about = None
)]
pub struct Cli {
    /// Probe transport. ICMP needs CAP_NET_RAW and falls back to TCP when
    /// unavailable.
    #[clap(long, value_enum)]
    pub probe_type: Option<ProbeTypeArg>,

    /// HTTP/WebSocket listen port (default 7331, or the config file value)
    #[clap(long)]
    pub http_port: Option<u16>,

    /// Data directory for the event journal and config (default ~/.netpulse)
    #[clap(long)]
    pub data_dir: Option<PathBuf>,

    /// Path to config.toml (default <data_dir>/config.toml)
    #[clap(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProbeTypeArg {
    Tcp,
    Icmp,
}
