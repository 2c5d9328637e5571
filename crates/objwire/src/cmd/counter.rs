use objwire::demo::{self, CounterProxy};
use objwire_protocol::{connect_with_config, ClientConfig};
use serde::Serialize;

use crate::cmd::{parse_duration, CounterArgs};
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::output::{now_unix_seconds, print_json, print_raw, print_table, schema_id, OutputFormat};

#[derive(Serialize)]
struct Step {
    delta: i64,
    total: i64,
}

#[derive(Serialize)]
struct CounterOutput {
    schema_id: String,
    endpoint: String,
    object_id: i64,
    start: i64,
    steps: Vec<Step>,
    value: i64,
    live_objects_after_release: i64,
    timestamp: String,
}

pub fn run(args: CounterArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let config = ClientConfig::default()
        .with_connect_timeout(Some(timeout))
        .with_call_timeout(Some(timeout));
    let client = connect_with_config(&args.endpoint, config, demo::exceptions())
        .map_err(|err| rpc_error("connect failed", err))?;

    let counter = CounterProxy::create(&client, args.start)
        .map_err(|err| rpc_error("new_counter failed", err))?;
    let object_id = counter.id();
    tracing::debug!(object_id, start = args.start, "remote counter created");

    let mut steps = Vec::with_capacity(args.add.len());
    for &delta in &args.add {
        let total = counter
            .add(delta)
            .map_err(|err| rpc_error("add failed", err))?;
        steps.push(Step { delta, total });
    }
    let value = counter
        .get()
        .map_err(|err| rpc_error("get failed", err))?;

    // Dropping the only proxy releases the remote counter.
    drop(counter);
    let live_objects_after_release =
        demo::live_objects(&client).map_err(|err| rpc_error("live_objects failed", err))?;

    if let Err(err) = client.quit() {
        tracing::debug!(error = %err, "quit after counter run failed");
    }

    let out = CounterOutput {
        schema_id: schema_id("counter-run"),
        endpoint: args.endpoint.to_string(),
        object_id,
        start: args.start,
        steps,
        value,
        live_objects_after_release,
        timestamp: now_unix_seconds(),
    };
    print_counter(&out, format);
    Ok(SUCCESS)
}

fn print_counter(out: &CounterOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut rows = vec![vec!["start".to_string(), String::new(), out.start.to_string()]];
            rows.extend(out.steps.iter().map(|step| {
                vec![
                    "add".to_string(),
                    step.delta.to_string(),
                    step.total.to_string(),
                ]
            }));
            rows.push(vec!["get".to_string(), String::new(), out.value.to_string()]);
            print_table(&["OP", "DELTA", "VALUE"], rows);
        }
        OutputFormat::Pretty => {
            println!("Counter #{} on {}:", out.object_id, out.endpoint);
            println!("  start: {}", out.start);
            for step in &out.steps {
                println!("  add {:+} -> {}", step.delta, step.total);
            }
            println!("  value: {}", out.value);
            println!("  live objects after release: {}", out.live_objects_after_release);
        }
        OutputFormat::Raw => print_raw(format!("{}\n", out.value).as_bytes()),
    }
}
