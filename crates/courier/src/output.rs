use std::io::{IsTerminal, Write};
use std::time::Duration;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use courier_frame::is_reserved;
use courier_peer::OperationInfo;
use serde::Serialize;

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

#[derive(Serialize)]
struct ReplyOutput<'a> {
    path: &'a str,
    operation_id: u32,
    elapsed_ms: u128,
    body_size: usize,
    body: String,
}

pub fn print_reply(path: &str, operation_id: u32, elapsed: Duration, body: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ReplyOutput {
                path,
                operation_id,
                elapsed_ms: elapsed.as_millis(),
                body_size: body.len(),
                body: body_preview(body),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["OPERATION", "SIZE", "ELAPSED", "BODY"])
                .add_row(vec![
                    operation_id.to_string(),
                    body.len().to_string(),
                    format!("{}ms", elapsed.as_millis()),
                    body_preview(body),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "op={} size={} elapsed={}ms body={}",
                operation_id,
                body.len(),
                elapsed.as_millis(),
                body_preview(body)
            );
        }
        OutputFormat::Raw => print_raw(body),
    }
}

#[derive(Serialize)]
struct OperationsOutput<'a> {
    path: &'a str,
    operations: &'a [OperationInfo],
}

pub fn print_operations(path: &str, operations: &[OperationInfo], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = OperationsOutput { path, operations };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "NAME", "KIND"]);
            for op in operations {
                table.add_row(vec![
                    format!("{:#x}", op.id),
                    op.name.clone(),
                    kind(op.id).to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for op in operations {
                println!("{:#010x} {} ({})", op.id, op.name, kind(op.id));
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn kind(operation_id: u32) -> &'static str {
    if is_reserved(operation_id) {
        "builtin"
    } else {
        "user"
    }
}

fn body_preview(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", body.len()),
    }
}
