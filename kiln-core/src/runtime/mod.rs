//! Container-runtime adapters.
//!
//! One trait, two runtimes: [`DockerRuntime`] speaks the Docker Engine
//! HTTP API over the configured socket, [`PodmanRuntime`] drives the
//! podman CLI. Operations are synchronous from the orchestrator's point
//! of view and stream their progress into the build's [`LogWriter`];
//! which writer variant pairs with which runtime is decided by the same
//! [`RuntimeKind`] selector.

mod docker;
mod podman;

pub use docker::DockerRuntime;
pub use podman::PodmanRuntime;

use crate::config::RuntimeKind;
use crate::error::Result;
use crate::logstream::{JsonLogWriter, LogWriter, PlainLogWriter};
use crate::rpc::ManagerClient;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Registry credentials attached to pulls and pushes.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

impl RegistryAuth {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildImageOptions {
    /// Name (or name:tag) given to the built image.
    pub name: String,
    pub no_cache: bool,
    /// Image references offered to the builder as cache sources.
    pub cache_from: Vec<String>,
    pub rm_tmp_container: bool,
    pub force_rm_tmp_container: bool,
    /// Dockerfile path relative to the context directory.
    pub dockerfile: String,
    pub context_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct PullImageOptions {
    /// Repository to pull, qualified with a registry when needed.
    pub repository: String,
    pub tag: String,
}

#[derive(Debug, Clone, Default)]
pub struct PushImageOptions {
    pub repository: String,
    pub tag: String,
}

#[derive(Debug, Clone, Default)]
pub struct TagImageOptions {
    pub repository: String,
    pub tag: String,
    pub force: bool,
}

/// What an image inspect reveals.
#[derive(Debug, Clone, Default)]
pub struct ImageDetails {
    pub id: String,
    pub repo_digests: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub images_deleted: Vec<String>,
    pub space_reclaimed: i64,
}

/// Uniform facade over the container runtimes the worker can drive.
///
/// Streaming operations write raw progress into `output`; whether that
/// stream is chunked JSON or plain text is a private matter between a
/// runtime and its paired log-writer variant.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn build_image(&self, opts: BuildImageOptions, output: &dyn LogWriter) -> Result<()>;

    async fn pull_image(
        &self,
        opts: PullImageOptions,
        auth: RegistryAuth,
        output: &dyn LogWriter,
    ) -> Result<()>;

    async fn push_image(
        &self,
        opts: PushImageOptions,
        auth: RegistryAuth,
        output: &dyn LogWriter,
    ) -> Result<()>;

    async fn tag_image(&self, name: &str, opts: TagImageOptions) -> Result<()>;

    async fn inspect_image(&self, name: &str) -> Result<ImageDetails>;

    async fn remove_image(&self, name: &str, force: bool) -> Result<()>;

    async fn prune_images(&self) -> Result<PruneReport>;
}

/// Creates the runtime adapter for the configured kind.
pub fn new_runtime(kind: RuntimeKind, host: &str) -> Result<Arc<dyn ContainerRuntime>> {
    match kind {
        RuntimeKind::Docker => Ok(Arc::new(DockerRuntime::new(host)?)),
        RuntimeKind::Podman => Ok(Arc::new(PodmanRuntime::new(host))),
    }
}

/// Creates the log-writer variant that understands the configured
/// runtime's output stream.
pub fn new_log_writer(kind: RuntimeKind, client: Arc<dyn ManagerClient>) -> Arc<dyn LogWriter> {
    match kind {
        RuntimeKind::Docker => Arc::new(JsonLogWriter::new(client)),
        RuntimeKind::Podman => Arc::new(PlainLogWriter::new(client)),
    }
}
