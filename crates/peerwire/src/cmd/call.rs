use std::time::Instant;

use peerwire_peer::{Client, ClientConfig};
use serde_json::Value;

use crate::cmd::{parse_duration, CallArgs};
use crate::exit::{rpc_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_reply, CallReply, OutputFormat};

pub async fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout, false)?;
    let request = parse_arguments(args.json.as_deref())?;

    let client = Client::with_config(
        args.endpoint.clone(),
        ClientConfig {
            call_timeout: Some(timeout),
            ..ClientConfig::default()
        },
    );

    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, client.call::<_, Value>(&args.service, &request))
        .await
        .map_err(|_| CliError::new(TIMEOUT, format!("call timed out after {timeout:?}")))?;
    let elapsed = started.elapsed();
    client.close();

    let result = outcome.map_err(|err| rpc_error("call failed", err))?;
    print_reply(
        &CallReply {
            endpoint: args.endpoint.to_string(),
            service: args.service,
            elapsed_ms: (elapsed.as_secs_f64() * 1000.0 * 100.0).round() / 100.0,
            result,
        },
        format,
    );

    Ok(SUCCESS)
}

fn parse_arguments(json: Option<&str>) -> CliResult<Value> {
    match json {
        Some(text) => serde_json::from_str(text)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}"))),
        None => Ok(Value::Null),
    }
}
