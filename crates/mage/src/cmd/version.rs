use mage_crypto::MAX_RECORD_PLAINTEXT;
use mage_peer::HandshakeConfig;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("mage {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let handshake = HandshakeConfig::default();
    println!("name: mage");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "protocol: {}/{}",
        handshake.protocol_name, handshake.protocol_version
    );
    println!("suite: HKDF-SHA256, HMAC-SHA256, ChaCha20-Poly1305");
    println!("max_record_plaintext: {MAX_RECORD_PLAINTEXT}");
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "build_target: {}",
        option_env!("MAGE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));

    Ok(SUCCESS)
}
