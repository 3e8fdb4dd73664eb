//! kiln build worker entry point.
//!
//! The worker is launched by the build manager's executor with its
//! configuration in the environment, runs exactly one build job, and
//! exits: zero on a completed build, nonzero on any fatal error.

use anyhow::Context;
use kiln_core::logstream::LogRecord;
use kiln_core::{job, runtime, GrpcManagerClient, KilnError, ManagerClient, WorkerConfig};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .init();

    match run().await {
        Ok(()) => {
            info!("done");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    info!("starting kiln-worker: {}", env!("CARGO_PKG_VERSION"));
    let config = WorkerConfig::from_env()?;

    let channel = connect(&config).await?;

    info!("pinging build manager...");
    let client = Arc::new(
        GrpcManagerClient::connect(channel)
            .await
            .context("failed to connect to build manager")?,
    );

    info!("registering job");
    let args = client
        .register_build_job(&config.token)
        .await
        .context("failed to register job with build manager")?;

    let container_runtime = runtime::new_runtime(config.runtime, &config.docker_host)?;
    let writer = runtime::new_log_writer(config.runtime, client.clone());

    info!("starting heartbeat to build manager");
    let shutdown = CancellationToken::new();
    let heartbeat = {
        let client = client.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.heartbeat(shutdown).await })
    };

    // A heartbeat that ends cleanly (manager hung up after completion)
    // must not abort the build; only a failure does.
    let heartbeat_failure = async move {
        match heartbeat.await {
            Ok(Err(err)) => err,
            Ok(Ok(())) => std::future::pending().await,
            Err(join_err) => KilnError::Internal(format!("heartbeat task failed: {join_err}")),
        }
    };

    info!("starting build");
    let result = tokio::select! {
        result = job::run(
            client.clone(),
            container_runtime,
            writer,
            args,
            shutdown.clone(),
        ) => result,
        err = heartbeat_failure => Err(err),
    };

    match result {
        Ok(metadata) => {
            info!("successfully built image {}", metadata.image_id);
            Ok(())
        }
        Err(err) => {
            shutdown.cancel();
            report_failure(client.as_ref(), &err).await;
            Err(anyhow::Error::new(err).context("failed to build"))
        }
    }
}

/// Gives the manager its last look at a failed build: one log entry with
/// the typed error, then the terminal error phase. Both are best effort;
/// the worker is about to exit nonzero either way.
async fn report_failure(client: &dyn ManagerClient, err: &KilnError) {
    let entry = LogRecord {
        error: format!("{}: {err}", err.kind()),
        ..Default::default()
    };
    match serde_json::to_string(&entry) {
        Ok(entry) => {
            if let Err(publish_err) = client.publish_build_log_entry(&entry).await {
                warn!("failed to publish final error entry: {publish_err}");
            }
        }
        Err(marshal_err) => warn!("failed to marshal final error entry: {marshal_err}"),
    }

    if let Err(phase_err) = client.set_phase(kiln_core::Phase::Error, None).await {
        warn!("failed to report error phase: {phase_err}");
    }
}

/// Dials the manager, retrying with exponential backoff (2ⁿ seconds, n
/// starting at 1) up to the configured attempt limit.
async fn connect(config: &WorkerConfig) -> anyhow::Result<Channel> {
    let scheme = if config.insecure { "http" } else { "https" };
    // Only the handshake is bounded here. Unary deadlines are enforced
    // per call inside the client; a channel-wide timeout would also
    // sever the long-lived log and heartbeat streams.
    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", config.server))
        .context("invalid SERVER value")?
        .connect_timeout(Duration::from_secs(10));

    if !config.insecure {
        let mut tls = ClientTlsConfig::new().with_native_roots();
        if let Some(path) = &config.tls_cert_path {
            let pem = std::fs::read(path)
                .with_context(|| format!("invalid TLS config: {}", path.display()))?;
            tls = tls.ca_certificate(Certificate::from_pem(pem));
        }
        endpoint = endpoint.tls_config(tls).context("invalid TLS config")?;
    }

    let mut delay = Duration::from_secs(2);
    for attempt in 1..=config.max_connect_attempts {
        info!("connecting to build manager...: {} (attempt {attempt})", config.server);
        match endpoint.connect().await {
            Ok(channel) => return Ok(channel),
            Err(err) if attempt < config.max_connect_attempts => {
                warn!(
                    "failed to dial build manager: {err}; retrying in {}s",
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => {
                return Err(anyhow::Error::new(err).context("failed to dial build manager"))
            }
        }
    }

    anyhow::bail!("no connection attempts configured")
}
