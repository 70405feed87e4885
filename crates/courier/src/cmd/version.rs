use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("courier {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let handshake = courier_peer::HandshakeConfig::default();
    println!("name: courier");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "protocol: {}/{}",
        handshake.protocol_name, handshake.protocol_version
    );
    println!(
        "target: {}",
        option_env!("COURIER_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "max_payload: {}",
        courier_frame::DEFAULT_MAX_PAYLOAD
    );
    println!(
        "features: peer={}, async={}, cli=true",
        cfg!(feature = "peer"),
        cfg!(feature = "async")
    );

    Ok(SUCCESS)
}
