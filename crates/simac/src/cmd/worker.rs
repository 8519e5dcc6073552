use simac_broker::{echo_reply, ServeExit, Worker};
use tracing::info;

use crate::cmd::WorkerArgs;
use crate::exit::{mac_error, CliResult, FAILURE, SUCCESS};

pub fn run(args: WorkerArgs) -> CliResult<i32> {
    let worker = Worker::connect(&args.deveui, &args.address)
        .map_err(|err| mac_error("worker connect failed", err))?;
    info!(deveui = %args.deveui, address = %args.address, pid = std::process::id(), "worker ready");

    let exit = worker
        .serve(|command| echo_reply(&args.deveui, command))
        .map_err(|err| mac_error("worker failed", err))?;
    info!(deveui = %args.deveui, ?exit, "worker exiting");

    match exit {
        ServeExit::Shutdown => Ok(SUCCESS),
        ServeExit::Disconnected => Ok(FAILURE),
    }
}
