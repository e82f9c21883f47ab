use std::thread;

use mongoproxy::default_registry;
use mongoproxy_pipeline::{Pipeline, PipelineBuilder, ProxyConfig, ProxyServer, ShutdownHandle};
use mongoproxy_transport::{Listener, TcpTransport};
use tracing::{error, info};

use crate::cmd::ServeArgs;
use crate::exit::{pipeline_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let config = args.source.load()?;
    let pipeline = build_pipeline(&config)?;
    info!(stages = ?pipeline.stage_names(), "pipeline ready");

    let servers = bind(&config, &pipeline)?;
    let handles: Vec<ShutdownHandle> = servers.iter().map(ProxyServer::shutdown_handle).collect();
    install_ctrlc_handler(handles.clone())?;

    let mut workers = Vec::with_capacity(servers.len());
    for server in servers {
        let handles = handles.clone();
        let name = format!("mongoproxy-accept-{}", server.local_description());
        let worker = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let result = server.serve();
                // One acceptor failing takes the others down with it.
                for handle in &handles {
                    handle.shutdown();
                }
                result
            })
            .map_err(|err| CliError::new(INTERNAL, format!("failed to start acceptor: {err}")))?;
        workers.push(worker);
    }

    let mut outcome = Ok(SUCCESS);
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(error = %err, "acceptor failed");
                outcome = Err(pipeline_error("proxy stopped", err));
            }
            Err(_) => outcome = Err(CliError::new(INTERNAL, "acceptor thread panicked")),
        }
    }
    if outcome.is_ok() {
        info!("shutdown complete");
    }
    outcome
}

fn build_pipeline(config: &ProxyConfig) -> CliResult<Pipeline> {
    let registry = default_registry().map_err(|err| pipeline_error("stage registry", err))?;
    PipelineBuilder::new(&registry)
        .stages_from(config)
        .and_then(PipelineBuilder::build)
        .map_err(|err| pipeline_error("invalid pipeline", err))
}

fn bind(config: &ProxyConfig, pipeline: &Pipeline) -> CliResult<Vec<ProxyServer>> {
    let address = config.bind_address();
    let tcp = TcpTransport::bind(&address)
        .map_err(|err| transport_error(&format!("bind {address} failed"), err))?;
    let mut servers = vec![ProxyServer::new(Listener::from(tcp), pipeline.clone())];

    if let Some(path) = &config.unix_socket {
        #[cfg(unix)]
        {
            let uds = mongoproxy_transport::UnixDomainSocket::bind(path).map_err(|err| {
                transport_error(&format!("bind {} failed", path.display()), err)
            })?;
            servers.push(ProxyServer::new(Listener::from(uds), pipeline.clone()));
        }
        #[cfg(not(unix))]
        tracing::warn!(path = %path.display(), "unix sockets are not available on this platform");
    }
    Ok(servers)
}

fn install_ctrlc_handler(handles: Vec<ShutdownHandle>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        info!("interrupt received, stopping");
        for handle in &handles {
            handle.shutdown();
        }
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
