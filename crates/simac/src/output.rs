use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use simac_broker::Mac;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ReplyOutput<'a> {
    pub deveui: &'a str,
    pub command: &'a str,
    pub reply: &'a str,
    pub elapsed_ms: f64,
    pub timestamp: String,
}

impl<'a> ReplyOutput<'a> {
    pub fn new(deveui: &'a str, command: &'a str, reply: &'a str, elapsed_ms: f64) -> Self {
        Self {
            deveui,
            command,
            reply,
            elapsed_ms,
            timestamp: now_unix_seconds(),
        }
    }
}

pub fn print_reply(out: &ReplyOutput<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["DEVEUI", "COMMAND", "REPLY", "ELAPSED"])
                .add_row(vec![
                    out.deveui.to_string(),
                    out.command.to_string(),
                    out.reply.to_string(),
                    format!("{:.2}ms", out.elapsed_ms),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "deveui={} command={} reply={} elapsed={:.2}ms",
                out.deveui, out.command, out.reply, out.elapsed_ms
            );
        }
        OutputFormat::Raw => print_raw(out.reply.as_bytes()),
    }
}

#[derive(Serialize, Debug)]
pub struct DeviceStatus {
    pub deveui: String,
    pub backend: &'static str,
    pub ready: bool,
    pub pid: Option<u32>,
}

impl DeviceStatus {
    pub fn of(mac: &Mac) -> Self {
        Self {
            deveui: mac.deveui().to_string(),
            backend: mac.kind(),
            ready: mac.is_ready(),
            pid: mac.pid(),
        }
    }
}

#[derive(Serialize)]
struct FleetOutput<'a> {
    client_address: &'a str,
    worker_address: &'a str,
    devices: &'a [DeviceStatus],
}

pub fn print_fleet(
    client_address: &str,
    worker_address: &str,
    devices: &[DeviceStatus],
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => print_json(&FleetOutput {
            client_address,
            worker_address,
            devices,
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["DEVEUI", "BACKEND", "READY", "PID"]);
            for device in devices {
                table.add_row(vec![
                    device.deveui.clone(),
                    device.backend.to_string(),
                    device.ready.to_string(),
                    device.pid.map(|p| p.to_string()).unwrap_or_default(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("client={client_address} worker={worker_address}");
            for device in devices {
                println!(
                    "deveui={} backend={} ready={}",
                    device.deveui, device.backend, device.ready
                );
            }
        }
        OutputFormat::Raw => {
            for device in devices {
                println!("{}", device.deveui);
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
