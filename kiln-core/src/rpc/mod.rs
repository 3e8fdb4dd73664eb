//! Transport between the worker and the build manager.
//!
//! [`ManagerClient`] is the seam the rest of the worker depends on; the
//! production implementation is [`GrpcManagerClient`]. The trait is
//! shared by the orchestrator (phases, cache lookup), the log writers
//! (log publication) and the heartbeat task, so implementations must be
//! safe for concurrent use.

mod grpc;

pub use grpc::GrpcManagerClient;

use crate::error::Result;
use crate::types::{BuildArgs, Phase, PullMetadata, TagMetadata};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// How long a unary call may take before it is abandoned.
pub const UNARY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Client side of the build-manager RPC surface.
#[async_trait]
pub trait ManagerClient: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Exchanges the registration token for the job's build arguments.
    /// The returned job token is retained by the client and attached to
    /// every subsequent call.
    async fn register_build_job(&self, registration_token: &str) -> Result<BuildArgs>;

    /// Reports a phase transition. The sequence number is incremented
    /// before the send; a rejection or an echoed mismatch surfaces as
    /// [`crate::KilnError::PhaseRejected`].
    async fn set_phase(&self, phase: Phase, pull_metadata: Option<PullMetadata>) -> Result<()>;

    /// Asks the manager for the best tag to prime the build cache with.
    async fn find_most_similar_tag(&self, metadata: TagMetadata) -> Result<String>;

    /// Publishes one log entry on the bidirectional log stream. On a
    /// send failure the sequence number is rewound so a retry does not
    /// leave a gap.
    async fn publish_build_log_entry(&self, entry: &str) -> Result<()>;

    /// Runs the heartbeat loop until `shutdown` is cancelled. Returns an
    /// error once the consecutive-failure budget is exhausted.
    async fn heartbeat(&self, shutdown: CancellationToken) -> Result<()>;
}
