use simac_broker::{DEFAULT_CLIENT_ADDRESS, DEFAULT_WORKER_ADDRESS};
use simac_socket::HandshakeConfig;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("simac {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let handshake = HandshakeConfig::default();
    println!("name: simac");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "build_target: {}",
        option_env!("SIMAC_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "protocol: {} {}",
        handshake.protocol_name, handshake.protocol_version
    );
    println!("default_client_address: {DEFAULT_CLIENT_ADDRESS}");
    println!("default_worker_address: {DEFAULT_WORKER_ADDRESS}");

    Ok(SUCCESS)
}
