use std::path::PathBuf;

use clap::{Args, Subcommand};
use mongoproxy_backend::BackendStage;
use mongoproxy_pipeline::ProxyConfig;

use crate::exit::{config_error, CliResult};
use crate::output::OutputFormat;

pub mod config;
pub mod ping;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the proxy.
    Serve(ServeArgs),
    /// Print the resolved configuration with secrets redacted.
    Config(ConfigArgs),
    /// Probe a server (proxy or backend) with ping and isMaster.
    Ping(PingArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Config(args) => config::run(args, format),
        Command::Ping(args) => ping::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Where the configuration comes from, plus flag overrides.
#[derive(Args, Debug, Default)]
pub struct SourceArgs {
    /// JSON configuration file. Without it, MONGO_* / MONGOPROXY_* variables are used.
    #[arg(long, short = 'f', value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,
    /// Host or address to bind.
    #[arg(long, value_name = "HOST")]
    pub listen: Option<String>,
    /// Also accept clients on this Unix socket.
    #[arg(long, value_name = "PATH")]
    pub unix_socket: Option<PathBuf>,
    /// Refuse writes at the backend stage.
    #[arg(long)]
    pub read_only: bool,
}

impl SourceArgs {
    pub fn load(&self) -> CliResult<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::from_file(path),
            None => ProxyConfig::from_env(),
        }
        .map_err(|err| config_error("failed to load configuration", err))?;

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(path) = &self.unix_socket {
            config.unix_socket = Some(path.clone());
        }
        if self.read_only {
            for stage in config
                .stages
                .iter_mut()
                .filter(|stage| stage.name == BackendStage::NAME)
            {
                stage.config.insert("readOnly", true);
            }
        }
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub source: SourceArgs,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub source: SourceArgs,
}

#[derive(Args, Debug)]
pub struct PingArgs {
    /// Server address (host:port).
    pub address: String,
    /// Connect and read timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
