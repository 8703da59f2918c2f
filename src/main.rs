use std::env;
use std::sync::Arc;

use anyhow::{Context, Error};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use renderq::config::Config;
use renderq::registry::JobRegistry;
use renderq::renderer::Renderer;
use renderq::{server, telemetry};

#[instrument(skip_all)]
async fn setup(config: Config, cancel_token: CancellationToken) -> Result<(), Error> {
    let base = env::current_dir().context("reading the working directory")?;
    let paths = config.resolve(&base);
    tokio::fs::create_dir_all(&paths.output_dir)
        .await
        .with_context(|| format!("creating {}", paths.output_dir.display()))?;

    info!(
        sd_cli = %paths.sd_cli.display(),
        model_dir = %paths.model_dir.display(),
        output_dir = %paths.output_dir.display(),
        "Resolved paths"
    );
    if !paths.sd_cli.is_file() {
        error!(sd_cli = %paths.sd_cli.display(), "Render CLI not found; jobs will fail to start");
    }

    let renderer = Arc::new(Renderer::new(paths));
    let registry = Arc::new(JobRegistry::new(renderer, config.stop_grace()));

    let addr = format!("{}:{}", config.host, config.port);
    server::serve(cancel_token, addr, registry)
        .instrument(info_span!("server"))
        .await
}

async fn wait_for_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => tokio::select! {
                _ = sigterm.recv() => debug!("Received SIGTERM"),
                _ = sigint.recv() => debug!("Received SIGINT"),
            },
            (Err(err), _) | (_, Err(err)) => {
                error!(error = %err, "Failed to install signal handlers");
                return;
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for ctrl-c");
            return;
        }
        debug!("Received ctrl-c");
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::parse();

    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();
    tokio::spawn(wait_for_signal(token.clone()));

    let result = setup(config, token).await;
    if let Err(err) = &result {
        error!("Server error: {:#}", err);
    }
    info!("Shutting down.");
    telemetry::shutdown();

    result.map_err(Into::into)
}
