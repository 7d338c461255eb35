use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use peerwire_transport::Endpoint;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CallReply {
    pub endpoint: String,
    pub service: String,
    pub elapsed_ms: f64,
    pub result: Value,
}

#[derive(Serialize)]
struct ListeningOutput<'a> {
    event: &'static str,
    endpoint: String,
    transport: &'static str,
    services: &'a [String],
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_listening(endpoint: &Endpoint, services: &[String], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ListeningOutput {
            event: "listening",
            endpoint: endpoint.to_string(),
            transport: endpoint.transport_name(),
            services,
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ENDPOINT", "TRANSPORT", "SERVICES"])
                .add_row(vec![
                    endpoint.to_string(),
                    endpoint.transport_name().to_string(),
                    services.join(", "),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("listening on {endpoint} ({})", endpoint.transport_name());
            println!("services: {}", services.join(", "));
        }
        OutputFormat::Raw => println!("{endpoint}"),
    }
}

pub fn print_reply(reply: &CallReply, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(reply),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SERVICE", "ENDPOINT", "ELAPSED", "RESULT"])
                .add_row(vec![
                    reply.service.clone(),
                    reply.endpoint.clone(),
                    format!("{:.2}ms", reply.elapsed_ms),
                    compact(&reply.result),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{} @ {} ({:.2}ms)",
                reply.service, reply.endpoint, reply.elapsed_ms
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&reply.result).unwrap_or_else(|_| "null".to_string())
            );
        }
        OutputFormat::Raw => match &reply.result {
            Value::String(text) => print_raw(text.as_bytes()),
            other => print_raw(compact(other).as_bytes()),
        },
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}
