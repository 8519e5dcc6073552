use std::time::Instant;

use simac_broker::{ClientConfig, RequestClient};

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{mac_error, CliResult, SUCCESS};
use crate::output::{print_reply, OutputFormat, ReplyOutput};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let config = ClientConfig {
        reply_timeout: Some(timeout),
        ..ClientConfig::default()
    };
    let mut client = RequestClient::with_config(args.address.clone(), config);

    let started = Instant::now();
    let reply = client
        .send(&args.deveui, &args.command)
        .map_err(|err| mac_error("send failed", err))?;
    let elapsed_ms = (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0;

    print_reply(
        &ReplyOutput::new(&args.deveui, &args.command, &reply, elapsed_ms),
        format,
    );
    Ok(SUCCESS)
}
