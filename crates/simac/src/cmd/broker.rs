use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use simac_broker::{echo_reply, BrokerConfig, Mac, MacConfig, MacDirectory, Worker};
use simac_transport::Endpoint;
use tracing::{info, warn};

use crate::cmd::{parse_duration, BrokerArgs};
use crate::exit::{io_error, mac_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::fleet::{BackendEntry, DeviceEntry, Fleet};
use crate::output::{print_fleet, DeviceStatus, OutputFormat};

const IDLE_POLL: Duration = Duration::from_millis(100);

pub fn run(args: BrokerArgs, format: OutputFormat) -> CliResult<i32> {
    let ready_timeout = parse_duration(&args.ready_timeout)?;
    let stop_grace = parse_duration(&args.stop_grace)?;
    let fleet = match &args.fleet {
        Some(path) => Fleet::load(path)?,
        None => Fleet::default(),
    };

    let mut mac_config = MacConfig {
        stop_grace,
        ..MacConfig::default()
    };
    if let Some(path) = args.lora_mac_executable {
        mac_config.lora_mac_executable = path;
    }

    for endpoint in [&args.client_address, &args.worker_address] {
        ensure_socket_dir(endpoint)?;
    }
    let broker_config = BrokerConfig::new(args.client_address.clone(), args.worker_address.clone());
    let directory = MacDirectory::start(broker_config, mac_config)
        .map_err(|err| mac_error("broker failed to start", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    for device in &fleet.devices {
        if let Err(err) = start_device(&directory, device) {
            warn!(deveui = %device.deveui, error = %err, "device failed to start");
        }
    }
    let pending = directory.wait_ready(ready_timeout);
    if !pending.is_empty() {
        warn!(?pending, "devices not ready");
    }
    info!(
        total = directory.len(),
        ready = directory.len() - pending.len(),
        "fleet started"
    );

    let devices: Vec<DeviceStatus> = directory
        .ids()
        .iter()
        .filter_map(|id| directory.get(id))
        .map(|mac| DeviceStatus::of(&mac))
        .collect();
    print_fleet(
        &args.client_address.to_string(),
        &args.worker_address.to_string(),
        &devices,
        format,
    );

    while running.load(Ordering::SeqCst) {
        thread::sleep(IDLE_POLL);
    }

    info!("shutting down");
    directory.shutdown();
    Ok(SUCCESS)
}

fn start_device(directory: &MacDirectory, device: &DeviceEntry) -> simac_broker::Result<Arc<Mac>> {
    let deveui = device.deveui.as_str();
    match &device.backend {
        BackendEntry::Echo => directory.start_inproc(deveui, echo_backend),
        BackendEntry::Worker => {
            let exe = std::env::current_exe()?;
            directory.start_process(deveui, exe, ["worker"])
        }
        BackendEntry::Process { program, args } => {
            directory.start_process(deveui, program.clone(), args.iter().cloned())
        }
        BackendEntry::LoraMac => directory.start_lora_mac(deveui),
    }
}

fn echo_backend(deveui: &str, address: &Endpoint) {
    let worker = match Worker::connect(deveui, address) {
        Ok(worker) => worker,
        Err(err) => {
            warn!(deveui, error = %err, "echo backend could not connect");
            return;
        }
    };
    let id = deveui.to_string();
    if let Err(err) = worker.serve(|command| echo_reply(&id, command)) {
        warn!(deveui, error = %err, "echo backend failed");
    }
}

fn ensure_socket_dir(endpoint: &Endpoint) -> CliResult<()> {
    match endpoint.path().parent() {
        Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)
            .map_err(|err| io_error(&format!("failed creating {}", dir.display()), err)),
        _ => Ok(()),
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
