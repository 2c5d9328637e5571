use std::time::Instant;

use objwire_protocol::{connect_with_config, ClientConfig, ExceptionRegistry};
use serde::Serialize;

use crate::cmd::{parse_duration, PingArgs};
use crate::exit::{rpc_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{
    millis, now_unix_seconds, print_json, print_raw, print_table, schema_id, OutputFormat,
};

#[derive(Serialize)]
struct PingOutput {
    schema_id: String,
    endpoint: String,
    message: String,
    round_trips: Vec<f64>,
    timestamp: String,
}

pub fn run(args: PingArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let config = ClientConfig::default()
        .with_connect_timeout(Some(timeout))
        .with_call_timeout(Some(timeout));
    let client = connect_with_config(&args.endpoint, config, ExceptionRegistry::new())
        .map_err(|err| rpc_error("connect failed", err))?;

    let mut round_trips = Vec::with_capacity(args.count as usize);
    for _ in 0..args.count.max(1) {
        let started = Instant::now();
        let echoed = client
            .ping(&args.message)
            .map_err(|err| rpc_error("ping failed", err))?;
        if echoed != args.message {
            return Err(CliError::new(
                DATA_INVALID,
                format!("peer echoed {echoed:?}, expected {:?}", args.message),
            ));
        }
        round_trips.push(millis(started.elapsed()));
    }

    if let Err(err) = client.quit() {
        tracing::debug!(error = %err, "quit after ping failed");
    }

    let out = PingOutput {
        schema_id: schema_id("ping-result"),
        endpoint: args.endpoint.to_string(),
        message: args.message,
        round_trips,
        timestamp: now_unix_seconds(),
    };
    print_ping(&out, format);
    Ok(SUCCESS)
}

fn print_ping(out: &PingOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => print_table(
            &["#", "MESSAGE", "RTT (ms)"],
            out.round_trips
                .iter()
                .enumerate()
                .map(|(i, rtt)| {
                    vec![
                        (i + 1).to_string(),
                        out.message.clone(),
                        format!("{rtt:.2}"),
                    ]
                })
                .collect(),
        ),
        OutputFormat::Pretty => {
            for (i, rtt) in out.round_trips.iter().enumerate() {
                println!(
                    "reply from {}: seq={} message={:?} time={rtt:.2}ms",
                    out.endpoint,
                    i + 1,
                    out.message
                );
            }
        }
        OutputFormat::Raw => {
            print_raw(out.message.as_bytes());
            println!();
        }
    }
}
