use serde::Serialize;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_json, OutputFormat};

#[derive(Serialize)]
struct VersionOutput {
    name: &'static str,
    version: &'static str,
    target: &'static str,
    profile: &'static str,
    target_os: &'static str,
    target_arch: &'static str,
    frame_magic: String,
    msgpack: bool,
}

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    if !args.extended {
        println!("peerwire {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let out = VersionOutput {
        name: "peerwire",
        version: env!("CARGO_PKG_VERSION"),
        target: option_env!("PEERWIRE_BUILD_TARGET").unwrap_or("unknown"),
        profile: option_env!("PEERWIRE_BUILD_PROFILE").unwrap_or("unknown"),
        target_os: std::env::consts::OS,
        target_arch: std::env::consts::ARCH,
        frame_magic: String::from_utf8_lossy(&peerwire_frame::MAGIC).into_owned(),
        msgpack: cfg!(feature = "msgpack"),
    };

    match format {
        OutputFormat::Json => print_json(&out),
        _ => {
            println!("name: {}", out.name);
            println!("version: {}", out.version);
            println!("target: {}", out.target);
            println!("profile: {}", out.profile);
            println!("target_os: {}", out.target_os);
            println!("target_arch: {}", out.target_arch);
            println!("frame_magic: {}", out.frame_magic);
            println!("features: peer=true, msgpack={}, cli=true", out.msgpack);
        }
    }

    Ok(SUCCESS)
}
