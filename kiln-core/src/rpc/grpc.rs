//! gRPC implementation of [`ManagerClient`].
//!
//! One long-lived log stream is opened at construction; the heartbeat
//! stream is opened by [`ManagerClient::heartbeat`]. Stream send/recv
//! pairs live behind a single mutex each so concurrent callers can never
//! interleave frames on one stream.

use super::{ManagerClient, UNARY_TIMEOUT};
use crate::error::{KilnError, Result};
use crate::types::{BaseImageAuth, BuildArgs, GitSource, Phase, PullMetadata, TagMetadata};
use async_trait::async_trait;
use kiln_api::buildman::v1 as pb;
use kiln_api::buildman::v1::build_manager_client::BuildManagerClient;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
const HEARTBEAT_RETRIES: u32 = 3;
/// How long to wait for a heartbeat acknowledgement before it counts as
/// a failed attempt.
const HEARTBEAT_RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Awaits a manager call under the unary deadline. The grpc-timeout
/// request header only asks the server to give up; the local clock is
/// what actually bounds a manager that accepts the connection and never
/// replies.
async fn with_deadline<T, F>(what: &str, call: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
{
    match timeout(UNARY_TIMEOUT, call).await {
        Ok(Ok(response)) => Ok(response.into_inner()),
        Ok(Err(status)) => Err(KilnError::Internal(format!("{what}: {status}"))),
        Err(_) => Err(KilnError::Internal(format!("{what}: deadline exceeded"))),
    }
}

/// State of the long-lived log stream. Guarded by one mutex so that a
/// send and its matching recv are never split across callers.
struct LogStream {
    tx: mpsc::Sender<pb::LogMessageRequest>,
    rx: tonic::Streaming<pb::LogMessageResponse>,
    sequence: i32,
}

/// Production [`ManagerClient`] speaking the buildman.v1 protocol.
pub struct GrpcManagerClient {
    client: BuildManagerClient<Channel>,
    job_token: RwLock<String>,
    phase_sequence: Mutex<i32>,
    log: Mutex<LogStream>,
}

impl GrpcManagerClient {
    /// Pings the manager and opens the log stream over an established
    /// channel.
    pub async fn connect(channel: Channel) -> Result<Self> {
        let mut client = BuildManagerClient::new(channel);

        let mut request = Request::new(pb::PingRequest {});
        request.set_timeout(UNARY_TIMEOUT);
        with_deadline("ping failed", client.ping(request)).await?;

        info!("starting log stream to build manager");
        let (tx, outbound) = mpsc::channel(16);
        let rx = with_deadline(
            "failed to open log stream",
            client.log_message(Request::new(ReceiverStream::new(outbound))),
        )
        .await?;

        Ok(Self {
            client,
            job_token: RwLock::new(String::new()),
            phase_sequence: Mutex::new(0),
            log: Mutex::new(LogStream { tx, rx, sequence: 0 }),
        })
    }

    fn job_token(&self) -> String {
        self.job_token.read().expect("job token lock poisoned").clone()
    }
}

#[async_trait]
impl ManagerClient for GrpcManagerClient {
    async fn ping(&self) -> Result<()> {
        let mut request = Request::new(pb::PingRequest {});
        request.set_timeout(UNARY_TIMEOUT);
        with_deadline("ping failed", self.client.clone().ping(request)).await?;
        Ok(())
    }

    async fn register_build_job(&self, registration_token: &str) -> Result<BuildArgs> {
        let mut request = Request::new(pb::BuildJobArgs {
            register_jwt: registration_token.to_string(),
        });
        request.set_timeout(UNARY_TIMEOUT);

        let pack = with_deadline(
            "failed to register job",
            self.client.clone().register_build_job(request),
        )
        .await?;

        *self.job_token.write().expect("job token lock poisoned") = pack.job_jwt.clone();

        let mut args = BuildArgs {
            context: pack.context,
            dockerfile_path: pack.dockerfile_path,
            repository: pack.repository,
            registry: pack.registry,
            pull_token: pack.pull_token,
            push_token: pack.push_token,
            tag_names: pack.tag_names,
            base_image: pack
                .base_image
                .map(|auth| BaseImageAuth { username: auth.username, password: auth.password })
                .unwrap_or_default(),
            ..Default::default()
        };

        match pack.source {
            Some(pb::build_pack::Source::PackageUrl(url)) => args.build_package = url,
            Some(pb::build_pack::Source::GitPackage(git)) => {
                args.git = Some(GitSource {
                    url: git.url,
                    sha: git.sha,
                    private_key: git.private_key,
                });
            }
            None => {
                return Err(KilnError::Internal("build pack has no source".to_string()));
            }
        }

        Ok(args)
    }

    async fn set_phase(&self, phase: Phase, pull_metadata: Option<PullMetadata>) -> Result<()> {
        // Hold the counter across the call so transitions stay ordered.
        let mut sequence = self.phase_sequence.lock().await;
        *sequence += 1;

        let mut request = Request::new(pb::SetPhaseRequest {
            job_jwt: self.job_token(),
            sequence_number: *sequence,
            phase: wire_phase(phase) as i32,
            pull_metadata: pull_metadata.map(|md| pb::set_phase_request::PullMetadata {
                registry_url: md.registry_url,
                base_image: md.base_image,
                base_image_tag: md.base_image_tag,
                pull_username: md.pull_username,
            }),
        });
        request.set_timeout(UNARY_TIMEOUT);

        let response =
            with_deadline("failed to update phase", self.client.clone().set_phase(request))
                .await
                .map_err(|err| {
                    error!("{err}");
                    err
                })?;

        if !response.success {
            return Err(KilnError::PhaseRejected { reason: String::new() });
        }
        if response.sequence_number != *sequence {
            return Err(KilnError::PhaseRejected {
                reason: format!(
                    "sequence out of order: {} vs {}",
                    response.sequence_number, *sequence
                ),
            });
        }

        Ok(())
    }

    async fn find_most_similar_tag(&self, metadata: TagMetadata) -> Result<String> {
        let mut request = Request::new(pb::CachedTagRequest {
            job_jwt: self.job_token(),
            base_image_name: metadata.base_image,
            base_image_tag: metadata.base_image_tag,
            base_image_id: metadata.base_image_id,
        });
        request.set_timeout(UNARY_TIMEOUT);

        let response = with_deadline(
            "cached tag lookup failed",
            self.client.clone().determine_cached_tag(request),
        )
        .await?;

        Ok(response.cached_tag)
    }

    async fn publish_build_log_entry(&self, entry: &str) -> Result<()> {
        let mut log = self.log.lock().await;

        log.sequence += 1;
        let message = pb::LogMessageRequest {
            job_jwt: self.job_token(),
            sequence_number: log.sequence,
            log_message: entry.to_string(),
        };

        if let Err(err) = log.tx.send(message).await {
            warn!("failed to send log message: {err}");
            log.sequence -= 1;
            return Err(KilnError::Internal(format!("log stream closed: {err}")));
        }

        match log.rx.message().await {
            // The manager hung up cleanly; nothing left to confirm.
            Ok(None) => Ok(()),
            Ok(Some(response)) => {
                if !response.success {
                    warn!("build manager failed to log message: {}", log.sequence);
                }
                Ok(())
            }
            Err(status) => {
                warn!("failed to get log response: {status}");
                Ok(())
            }
        }
    }

    async fn heartbeat(&self, shutdown: CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel(1);
        let mut inbound = with_deadline(
            "failed to start heartbeat",
            self.client.clone().heartbeat(Request::new(ReceiverStream::new(rx))),
        )
        .await?;

        let mut budget = RetryBudget::new(HEARTBEAT_RETRIES);
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let beat = pb::HeartbeatRequest { job_jwt: self.job_token() };
            let mut acknowledged = false;
            if tx.send(beat).await.is_err() {
                warn!("failed to send heartbeat");
            } else {
                // The recv is bounded so a manager that accepts the
                // stream but stops replying still consumes the budget.
                match timeout(HEARTBEAT_RECV_TIMEOUT, inbound.message()).await {
                    // The manager hung up; the job is ending.
                    Ok(Ok(None)) => return Ok(()),
                    Ok(Ok(Some(response))) if response.reply => {
                        debug!("heartbeat acknowledged by build manager");
                        acknowledged = true;
                    }
                    Ok(Ok(Some(_))) => warn!("heartbeat was not acknowledged, retrying"),
                    Ok(Err(status)) => warn!("failed to get heartbeat response: {status}"),
                    Err(_) => warn!("timed out waiting for heartbeat response"),
                }
            }

            if acknowledged {
                budget.reset();
            } else if budget.strike() {
                return Err(KilnError::Internal(
                    "failed to update heartbeat too many times".to_string(),
                ));
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
            }
        }
    }
}

/// Consecutive-failure accounting for the heartbeat loop. Any success
/// refills the budget; `strike` reports exhaustion.
#[derive(Debug)]
struct RetryBudget {
    limit: u32,
    remaining: u32,
}

impl RetryBudget {
    fn new(limit: u32) -> Self {
        Self { limit, remaining: limit }
    }

    fn strike(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }

    fn reset(&mut self) {
        self.remaining = self.limit;
    }
}

/// Maps a worker phase onto its wire value. The protocol only has one
/// PULLING code, so the cache phases collapse onto it.
fn wire_phase(phase: Phase) -> pb::Phase {
    match phase {
        Phase::Waiting => pb::Phase::Waiting,
        Phase::Unpacking => pb::Phase::Unpacking,
        Phase::Pulling | Phase::CheckingCache | Phase::PrimingCache => pb::Phase::Pulling,
        Phase::Building => pb::Phase::Building,
        Phase::Pushing => pb::Phase::Pushing,
        Phase::Complete => pb::Phase::Complete,
        Phase::Error => pb::Phase::Error,
    }
}
