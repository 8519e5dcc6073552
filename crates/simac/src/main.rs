mod cmd;
mod exit;
mod fleet;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "simac", version, about = "MAC device broker CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "simac",
            "send",
            "0000000000000001",
            "PING",
            "--address",
            "ipc:///tmp/test.client",
            "--timeout",
            "2s",
        ])
        .expect("send args should parse");

        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.deveui, "0000000000000001");
        assert_eq!(args.command, "PING");
        assert_eq!(args.address.to_string(), "ipc:///tmp/test.client");
    }

    #[test]
    fn worker_requires_deveui() {
        let err = Cli::try_parse_from(["simac", "worker", "--address", "/tmp/w.sock"])
            .expect_err("missing --deveui should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn rejects_non_ipc_address() {
        let err = Cli::try_parse_from([
            "simac",
            "broker",
            "--client-address",
            "tcp://127.0.0.1:5555",
        ])
        .expect_err("tcp endpoint should be rejected");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn parses_broker_with_fleet() {
        let cli = Cli::try_parse_from([
            "simac",
            "--log-level",
            "debug",
            "broker",
            "--fleet",
            "/etc/simac/fleet.json",
            "--worker-address",
            "/tmp/mac.rpc",
        ])
        .expect("broker args should parse");
        let Command::Broker(args) = cli.command else {
            panic!("expected broker");
        };
        assert_eq!(args.worker_address.to_string(), "ipc:///tmp/mac.rpc");
        assert!(args.fleet.is_some());
    }
}
