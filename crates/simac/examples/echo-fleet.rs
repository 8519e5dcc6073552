//! Start a broker with a handful of in-process echo devices and talk to them.
//!
//! Run with: `cargo run -p simac --example echo-fleet`

use std::time::Duration;

use simac::broker::{echo_reply, Endpoint};
use simac::{BrokerConfig, MacConfig, MacDirectory, Worker};

fn echo(deveui: &str, address: &Endpoint) {
    let Ok(worker) = Worker::connect(deveui, address) else {
        eprintln!("{deveui}: could not reach broker");
        return;
    };
    let id = deveui.to_string();
    let _ = worker.serve(|command| echo_reply(&id, command));
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = std::env::temp_dir().join(format!("simac-echo-fleet-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;

    let directory = MacDirectory::start(BrokerConfig::in_dir(&dir), MacConfig::default())?;
    println!("broker on {}", directory.broker().client_address());

    for n in 1..=3u64 {
        directory.start_inproc(&format!("{n:016x}"), echo)?;
    }
    let pending = directory.wait_ready(Duration::from_secs(5));
    if !pending.is_empty() {
        eprintln!("not ready: {pending:?}");
    }

    for deveui in directory.ids() {
        if let Some(mac) = directory.get(&deveui) {
            match mac.request("PING") {
                Ok(reply) => println!("{deveui} -> {reply}"),
                Err(err) => println!("{deveui} !! {err}"),
            }
        }
    }

    // A device that was never started is rejected without a round trip.
    let ghost = simac::Mac::new(
        "ffffffffffffffff",
        simac::Backend::in_process(echo),
        directory.broker().clone(),
        directory.config(),
    );
    if let Err(err) = ghost.request("PING") {
        println!("ffffffffffffffff !! {err}");
    }

    directory.shutdown();
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
