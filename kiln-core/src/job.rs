//! Build orchestration.
//!
//! [`BuildJob`] drives a registered job through its linear phase
//! sequence: unpack, pull, cache, build, push, then completion and
//! best-effort cleanup. Every stage announces its phase to the manager
//! before touching anything, and a failed stage ends the job.

use crate::buildpack::{self, Buildpack};
use crate::dockerfile::DockerfileMetadata;
use crate::error::{KilnError, Result};
use crate::logstream::LogWriter;
use crate::rpc::ManagerClient;
use crate::runtime::{
    BuildImageOptions, ContainerRuntime, PullImageOptions, PushImageOptions, RegistryAuth,
    TagImageOptions,
};
use crate::types::{
    BuildArgs, BuildMetadata, Phase, PullMetadata, TagMetadata, SCRATCH_IMAGE_ID,
    SCRATCH_IMAGE_NAME,
};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Attempts for runtime requests that mutate external state.
const RUNTIME_REQUEST_ATTEMPTS: u32 = 3;

/// The internal state of one build.
pub struct BuildJob {
    client: Arc<dyn ManagerClient>,
    runtime: Arc<dyn ContainerRuntime>,
    writer: Arc<dyn LogWriter>,
    args: BuildArgs,
    buildpack: Option<Buildpack>,
    metadata: Option<DockerfileMetadata>,
    build_id: String,
    cache_tag: String,
}

/// Runs a registered job to completion: all five stages, the terminal
/// phase transition, and best-effort image cleanup. The heartbeat is
/// stopped just before the job is declared complete.
pub async fn run(
    client: Arc<dyn ManagerClient>,
    runtime: Arc<dyn ContainerRuntime>,
    writer: Arc<dyn LogWriter>,
    args: BuildArgs,
    heartbeat_shutdown: CancellationToken,
) -> Result<BuildMetadata> {
    let mut job = BuildJob::new(client.clone(), runtime, writer, args);

    info!("build: unpacking build pack");
    job.unpack().await?;

    info!("build: pulling base image");
    job.pull().await?;

    info!("build: priming cache");
    job.cache().await?;

    info!("build: building");
    job.build().await?;

    info!("build: pushing");
    let metadata = job.push().await?;

    heartbeat_shutdown.cancel();

    client.set_phase(Phase::Complete, None).await?;

    info!("build: cleanup");
    job.cleanup(&metadata.image_id).await;

    Ok(metadata)
}

impl BuildJob {
    pub fn new(
        client: Arc<dyn ManagerClient>,
        runtime: Arc<dyn ContainerRuntime>,
        writer: Arc<dyn LogWriter>,
        args: BuildArgs,
    ) -> Self {
        Self {
            client,
            runtime,
            writer,
            args,
            buildpack: None,
            metadata: None,
            build_id: String::new(),
            cache_tag: String::new(),
        }
    }

    /// Downloads and expands the build pack and parses the Dockerfile.
    pub async fn unpack(&mut self) -> Result<()> {
        self.client.set_phase(Phase::Unpacking, None).await?;

        let buildpack = buildpack::fetch(&self.args).await?;
        let metadata =
            DockerfileMetadata::from_dir(buildpack.context_dir(), &self.args.dockerfile_path)?;

        self.buildpack = Some(buildpack);
        self.metadata = Some(metadata);
        Ok(())
    }

    /// Pulls the base image named by the Dockerfile's first FROM.
    pub async fn pull(&self) -> Result<()> {
        let metadata = self.metadata()?;

        self.client
            .set_phase(
                Phase::Pulling,
                Some(PullMetadata {
                    registry_url: self.args.registry.clone(),
                    base_image: metadata.base_image.clone(),
                    base_image_tag: metadata.base_image_tag.clone(),
                    pull_username: self.args.base_image.username.clone(),
                }),
            )
            .await?;

        // scratch is built in; pulling it is an error.
        if metadata.base_image == SCRATCH_IMAGE_NAME {
            return Ok(());
        }

        // Only authenticate the base pull when the image lives in our
        // own registry.
        let mut auth = RegistryAuth::default();
        if !self.args.base_image.username.is_empty()
            && metadata.base_image.starts_with(&self.args.registry)
        {
            auth = RegistryAuth {
                username: self.args.base_image.username.clone(),
                password: self.args.base_image.password.clone(),
            };
        }

        info!(
            "pulling base image {}:{} (with auth: {})",
            metadata.base_image,
            metadata.base_image_tag,
            !auth.is_empty()
        );

        let opts = PullImageOptions {
            repository: metadata.base_image.clone(),
            tag: metadata.base_image_tag.clone(),
        };
        retry_runtime_request(self.writer.as_ref(), || {
            self.runtime.pull_image(opts.clone(), auth.clone(), self.writer.as_ref())
        })
        .await
        .map_err(|reason| KilnError::Pull { reason })
    }

    /// Asks the manager for the best tag to prime the cache with and
    /// pulls it. The whole stage is advisory: failures are logged and
    /// the build continues without a cache tag.
    pub async fn cache(&mut self) -> Result<()> {
        self.client.set_phase(Phase::CheckingCache, None).await?;

        let cached_tag = match self.find_cached_tag().await {
            Ok(tag) => tag,
            Err(err) => {
                warn!("failed to lookup caching tag: {err}");
                return Ok(());
            }
        };

        if !self.args.pull_token.is_empty() && !cached_tag.is_empty() {
            self.client.set_phase(Phase::PrimingCache, None).await?;

            match self.prime_cache(&cached_tag).await {
                Ok(()) => self.cache_tag = cached_tag,
                Err(err) => warn!("error priming cache: {err}"),
            }
        }

        Ok(())
    }

    async fn find_cached_tag(&self) -> Result<String> {
        let metadata = self.metadata()?;

        let base_image_id = if metadata.base_image == SCRATCH_IMAGE_NAME {
            // scratch must be manually assigned its well-known ID.
            SCRATCH_IMAGE_ID.to_string()
        } else {
            info!(
                "querying runtime for the ID of the pulled base image: {}:{}",
                metadata.base_image, metadata.base_image_tag
            );
            let name = format!("{}:{}", metadata.base_image, metadata.base_image_tag);
            let details = self.runtime.inspect_image(&name).await?;
            if let Some(streamed) = self.writer.err_response() {
                return Err(KilnError::Internal(streamed));
            }
            details.id
        };

        info!("querying build manager for most similar tag");
        self.client
            .find_most_similar_tag(TagMetadata {
                base_image: metadata.base_image.clone(),
                base_image_tag: metadata.base_image_tag.clone(),
                base_image_id,
            })
            .await
    }

    async fn prime_cache(&self, cached_tag: &str) -> Result<()> {
        info!("priming cache with image {}:{}", self.args.repository, cached_tag);

        let opts =
            PullImageOptions { repository: self.args.full_repo_name(), tag: cached_tag.to_string() };
        let auth = RegistryAuth {
            username: "$token".to_string(),
            password: self.args.pull_token.clone(),
        };
        retry_runtime_request(self.writer.as_ref(), || {
            self.runtime.pull_image(opts.clone(), auth.clone(), self.writer.as_ref())
        })
        .await
        .map_err(|reason| KilnError::CannotPullForCache { reason })
    }

    /// Runs the container build. The build pack directory is deleted on
    /// the way out whether the build succeeded or not.
    pub async fn build(&mut self) -> Result<()> {
        self.client.set_phase(Phase::Building, None).await?;

        let buildpack = self
            .buildpack
            .take()
            .ok_or_else(|| KilnError::Internal("build started before unpack".to_string()))?;

        let result = self.execute_build(&buildpack).await;
        buildpack.remove();

        self.build_id = result?;
        Ok(())
    }

    async fn execute_build(&self, buildpack: &Buildpack) -> Result<String> {
        let build_id = uuid::Uuid::new_v4().to_string();
        info!("executing build with ID {build_id}");

        let mut cache_from = Vec::new();
        if !self.cache_tag.is_empty() {
            let cached_image = format!("{}:{}", self.args.full_repo_name(), self.cache_tag);
            info!("using cache image {cached_image}");
            cache_from.push(cached_image);
        }

        let opts = BuildImageOptions {
            name: build_id.clone(),
            no_cache: false,
            cache_from,
            rm_tmp_container: true,
            force_rm_tmp_container: true,
            dockerfile: self.args.dockerfile_path.clone(),
            context_dir: buildpack.context_dir().to_path_buf(),
        };

        self.runtime
            .build_image(opts, self.writer.as_ref())
            .await
            .map_err(|err| KilnError::Build { reason: error_reason(err) })?;

        if let Some(streamed) = self.writer.err_response() {
            return Err(KilnError::Build { reason: streamed });
        }

        Ok(build_id)
    }

    /// Tags and pushes the built image under every requested tag, in
    /// order, then inspects it for the final build metadata. Tags pushed
    /// before a failure are not rolled back.
    pub async fn push(&self) -> Result<BuildMetadata> {
        self.client.set_phase(Phase::Pushing, None).await?;

        let repo = self.args.full_repo_name();
        for tag_name in &self.args.tag_names {
            info!("tagging image {} as {}:{}", self.build_id, repo, tag_name);
            self.runtime
                .tag_image(
                    &self.build_id,
                    TagImageOptions { repository: repo.clone(), tag: tag_name.clone(), force: true },
                )
                .await
                .map_err(|err| KilnError::Tag { reason: error_reason(err) })?;
            if let Some(streamed) = self.writer.err_response() {
                return Err(KilnError::Tag { reason: streamed });
            }

            info!("pushing image {repo}:{tag_name} ({})", self.build_id);
            let opts = PushImageOptions { repository: repo.clone(), tag: tag_name.clone() };
            let auth = RegistryAuth {
                username: "$token".to_string(),
                password: self.args.push_token.clone(),
            };
            retry_runtime_request(self.writer.as_ref(), || {
                self.runtime.push_image(opts.clone(), auth.clone(), self.writer.as_ref())
            })
            .await
            .map_err(|reason| KilnError::Push { reason })?;

            info!("successfully pushed {repo}:{tag_name}");
        }

        let details = self
            .runtime
            .inspect_image(&self.build_id)
            .await
            .map_err(|err| KilnError::Tag { reason: error_reason(err) })?;
        if let Some(streamed) = self.writer.err_response() {
            return Err(KilnError::Tag { reason: streamed });
        }

        Ok(BuildMetadata { image_id: details.id, digests: details.repo_digests })
    }

    /// Removes every image the build touched: the cache image, the base
    /// image, the built image, then an untargeted prune. Each removal is
    /// best effort.
    pub async fn cleanup(&self, built_image_id: &str) {
        if !self.cache_tag.is_empty() {
            let cache_image = format!("{}:{}", self.args.full_repo_name(), self.cache_tag);
            if let Err(err) = self.runtime.remove_image(&cache_image, true).await {
                warn!("could not remove cached image {cache_image}: {err}");
            }
        }

        if let Ok(metadata) = self.metadata() {
            let mut base_image = metadata.base_image.clone();
            if !metadata.base_image_tag.is_empty() {
                base_image = format!("{base_image}:{}", metadata.base_image_tag);
            }
            if let Err(err) = self.runtime.remove_image(&base_image, true).await {
                warn!("could not remove base image {base_image}: {err}");
            }
        }

        if let Err(err) = self.runtime.remove_image(built_image_id, true).await {
            warn!("could not remove built image {built_image_id}: {err}");
        }

        match self.runtime.prune_images().await {
            Ok(report) => info!(
                "pruned {} images, reclaimed {} bytes",
                report.images_deleted.len(),
                report.space_reclaimed
            ),
            Err(err) => warn!("could not prune images: {err}"),
        }
    }

    fn metadata(&self) -> Result<&DockerfileMetadata> {
        self.metadata
            .as_ref()
            .ok_or_else(|| KilnError::Internal("Dockerfile has not been parsed".to_string()))
    }
}

/// Retries a runtime request that mutates external state. A request only
/// counts as successful when the call returns cleanly AND the log stream
/// carried no error response; the writer's error slot is cleared before
/// every attempt so stale errors cannot fail a later one.
async fn retry_runtime_request<F, Fut>(
    writer: &dyn LogWriter,
    mut request: F,
) -> std::result::Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut failure = String::new();
    for attempt in 1..=RUNTIME_REQUEST_ATTEMPTS {
        writer.reset_error();

        let call = request().await;
        let streamed = writer.err_response();
        match (call, streamed) {
            (Ok(()), None) => return Ok(()),
            (call, streamed) => {
                // The call error wins over the streamed one.
                failure = match (call.err(), streamed) {
                    (Some(err), _) => error_reason(err),
                    (None, Some(streamed)) => streamed,
                    (None, None) => unreachable!("at least one error is present"),
                };
                info!("failed runtime request attempt #{attempt}: {failure}");
            }
        }
    }

    Err(failure)
}

/// Unwraps the bare reason from an internal error so stage wrappers do
/// not stack prefixes.
fn error_reason(err: KilnError) -> String {
    match err {
        KilnError::Internal(reason) => reason,
        other => other.to_string(),
    }
}
