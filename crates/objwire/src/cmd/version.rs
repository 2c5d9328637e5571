use objwire_frame::HEADER_SIZE;
use objwire_protocol::PROTOCOL_MAGIC;
use serde::Serialize;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_json, schema_id, OutputFormat};

#[derive(Serialize)]
struct VersionOutput {
    schema_id: String,
    name: &'static str,
    version: &'static str,
    protocol_magic: String,
    frame_header_bytes: usize,
    target: &'static str,
    rustc: &'static str,
    git_hash: &'static str,
}

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    if !args.extended {
        println!("objwire {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let out = VersionOutput {
        schema_id: schema_id("version"),
        name: "objwire",
        version: env!("CARGO_PKG_VERSION"),
        protocol_magic: format!("{PROTOCOL_MAGIC:#010x}"),
        frame_header_bytes: HEADER_SIZE,
        target: option_env!("OBJWIRE_BUILD_TARGET").unwrap_or("unknown"),
        rustc: option_env!("RUSTC_VERSION").unwrap_or("unknown"),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown"),
    };

    if format == OutputFormat::Json {
        print_json(&out);
        return Ok(SUCCESS);
    }

    println!("name: {}", out.name);
    println!("version: {}", out.version);
    println!("protocol_magic: {}", out.protocol_magic);
    println!("frame_header_bytes: {}", out.frame_header_bytes);
    println!("target: {}", out.target);
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("rustc: {}", out.rustc);
    println!("git_hash: {}", out.git_hash);
    println!("features: demo={}, cli=true", cfg!(feature = "demo"));

    Ok(SUCCESS)
}
