use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use simac_broker::{DEFAULT_CLIENT_ADDRESS, DEFAULT_WORKER_ADDRESS};
use simac_transport::Endpoint;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod broker;
pub mod send;
pub mod version;
pub mod worker;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broker and the devices listed in a fleet manifest.
    Broker(BrokerArgs),
    /// Run an echo backend for one device.
    Worker(WorkerArgs),
    /// Send one command to a device through the broker.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Broker(args) => broker::run(args, format),
        Command::Worker(args) => worker::run(args),
        Command::Send(args) => send::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct BrokerArgs {
    /// Endpoint request clients connect to.
    #[arg(long, env = "SIMAC_CLIENT_ADDRESS", default_value = DEFAULT_CLIENT_ADDRESS)]
    pub client_address: Endpoint,
    /// Endpoint device backends connect to.
    #[arg(long, env = "MAC_RPC_BACKEND_ADDRESS", default_value = DEFAULT_WORKER_ADDRESS)]
    pub worker_address: Endpoint,
    /// JSON fleet manifest of devices to start.
    #[arg(long, value_name = "FILE")]
    pub fleet: Option<PathBuf>,
    /// Override the LoRaMac-node executable used by `lora-mac` devices.
    #[arg(long, value_name = "PATH")]
    pub lora_mac_executable: Option<PathBuf>,
    /// How long to wait for devices to report ready (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub ready_timeout: String,
    /// How long each backend gets to exit on shutdown.
    #[arg(long, default_value = "2s")]
    pub stop_grace: String,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Device identifier to serve.
    #[arg(long)]
    pub deveui: String,
    /// Broker endpoint for backends.
    #[arg(long, env = "MAC_RPC_BACKEND_ADDRESS", default_value = DEFAULT_WORKER_ADDRESS)]
    pub address: Endpoint,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Target device identifier.
    pub deveui: String,
    /// Command text.
    pub command: String,
    /// Broker endpoint for clients.
    #[arg(long, env = "SIMAC_CLIENT_ADDRESS", default_value = DEFAULT_CLIENT_ADDRESS)]
    pub address: Endpoint,
    /// Maximum time to wait for the reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    if millis {
        Ok(Duration::from_millis(value))
    } else {
        Ok(Duration::from_secs(value))
    }
}
