use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use mongoproxy_pipeline::ProxyConfig;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
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

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

/// Print a configuration. Secrets must already be redacted.
pub fn print_config(config: &ProxyConfig, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", to_json(config)),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SETTING", "VALUE"])
                .add_row(vec!["listen".to_string(), config.bind_address()])
                .add_row(vec![
                    "unix socket".to_string(),
                    config
                        .unix_socket
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ])
                .add_row(vec!["scheme".to_string(), config.scheme.clone()])
                .add_row(vec!["tls".to_string(), config.tls.to_string()]);
            if !config.opt_params.is_empty() {
                table.add_row(vec!["optParams".to_string(), config.opt_params.clone()]);
            }
            for (index, stage) in config.stages.iter().enumerate() {
                table.add_row(vec![
                    format!("stage {index}: {}", stage.name),
                    to_json(&stage.config),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("Proxy Configuration:");
            println!("  Listen:      {}", config.bind_address());
            if let Some(path) = &config.unix_socket {
                println!("  Unix socket: {}", path.display());
            }
            println!("  Scheme:      {}", config.scheme);
            println!("  TLS:         {}", config.tls);
            println!("  Stages:");
            for stage in &config.stages {
                println!("    - {} {}", stage.name, to_json(&stage.config));
            }
        }
    }
}

/// Result of probing a server.
#[derive(Serialize)]
pub struct PingOutput {
    pub address: String,
    pub connect_ms: f64,
    pub ping_ms: f64,
    pub ok: bool,
    pub hello: serde_json::Value,
}

pub fn print_ping(out: &PingOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", to_json(out)),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ADDRESS", "CONNECT", "PING", "OK"])
                .add_row(vec![
                    out.address.clone(),
                    format!("{:.2}ms", out.connect_ms),
                    format!("{:.2}ms", out.ping_ms),
                    out.ok.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("Ping {}:", out.address);
            println!("  Connect: {:.2}ms", out.connect_ms);
            println!("  Ping:    {:.2}ms", out.ping_ms);
            println!("  Ok:      {}", out.ok);
            println!(
                "  Hello:   {}",
                serde_json::to_string_pretty(&out.hello).unwrap_or_default()
            );
        }
    }
}

pub fn millis(duration: std::time::Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}
