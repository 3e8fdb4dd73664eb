//! Integration tests for the build orchestrator.
//!
//! These drive full builds through mock manager and runtime adapters:
//! phase ordering, cache advisory behaviour, scratch handling, push
//! retries and best-effort cleanup, with the build pack served from a
//! local one-shot HTTP listener.

use async_trait::async_trait;
use kiln_core::error::{KilnError, Result};
use kiln_core::job;
use kiln_core::logstream::JsonLogWriter;
use kiln_core::rpc::ManagerClient;
use kiln_core::runtime::{
    BuildImageOptions, ContainerRuntime, ImageDetails, PruneReport, PullImageOptions,
    PushImageOptions, RegistryAuth, TagImageOptions,
};
use kiln_core::logstream::LogWriter;
use kiln_core::types::{BuildArgs, Phase, PullMetadata, TagMetadata};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const BUILT_IMAGE_ID: &str = "sha256:0a2b4c6d8e";
const BASE_IMAGE_ID: &str = "sha256:baseimage";

#[derive(Default)]
struct MockManager {
    phases: Mutex<Vec<Phase>>,
    entries: Mutex<Vec<String>>,
    tag_queries: Mutex<Vec<TagMetadata>>,
    cached_tag: String,
    fail_cached_tag: bool,
}

#[async_trait]
impl ManagerClient for MockManager {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn register_build_job(&self, _token: &str) -> Result<BuildArgs> {
        unreachable!("registration happens before the orchestrator runs")
    }

    async fn set_phase(&self, phase: Phase, _pull_metadata: Option<PullMetadata>) -> Result<()> {
        self.phases.lock().unwrap().push(phase);
        Ok(())
    }

    async fn find_most_similar_tag(&self, metadata: TagMetadata) -> Result<String> {
        self.tag_queries.lock().unwrap().push(metadata);
        if self.fail_cached_tag {
            return Err(KilnError::Internal("cached tag lookup failed".into()));
        }
        Ok(self.cached_tag.clone())
    }

    async fn publish_build_log_entry(&self, entry: &str) -> Result<()> {
        self.entries.lock().unwrap().push(entry.to_string());
        Ok(())
    }

    async fn heartbeat(&self, _shutdown: CancellationToken) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MockRuntime {
    pulls: Mutex<Vec<(String, String)>>,
    builds: Mutex<Vec<BuildImageOptions>>,
    tags: Mutex<Vec<(String, String, String)>>,
    pushes: Mutex<Vec<(String, String)>>,
    removals: Mutex<Vec<String>>,
    prunes: Mutex<u32>,
    /// Fail this many pushes before succeeding.
    push_failures: Mutex<u32>,
    /// Every removal fails when set.
    removals_fail: bool,
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn build_image(&self, opts: BuildImageOptions, output: &dyn LogWriter) -> Result<()> {
        self.builds.lock().unwrap().push(opts);
        output.write(br#"{"stream":"Step 1/1 : FROM base"}"#).await?;
        Ok(())
    }

    async fn pull_image(
        &self,
        opts: PullImageOptions,
        _auth: RegistryAuth,
        output: &dyn LogWriter,
    ) -> Result<()> {
        self.pulls.lock().unwrap().push((opts.repository.clone(), opts.tag.clone()));
        output.write(br#"{"status":"Pulling fs layer"}"#).await?;
        Ok(())
    }

    async fn push_image(
        &self,
        opts: PushImageOptions,
        _auth: RegistryAuth,
        _output: &dyn LogWriter,
    ) -> Result<()> {
        self.pushes.lock().unwrap().push((opts.repository.clone(), opts.tag.clone()));
        let mut failures = self.push_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(KilnError::Internal("connection reset during push".into()));
        }
        Ok(())
    }

    async fn tag_image(&self, name: &str, opts: TagImageOptions) -> Result<()> {
        self.tags.lock().unwrap().push((name.to_string(), opts.repository, opts.tag));
        Ok(())
    }

    async fn inspect_image(&self, name: &str) -> Result<ImageDetails> {
        // The built image is inspected by ID; anything else is the base.
        if name.starts_with("sha256:") || name.contains('-') {
            Ok(ImageDetails {
                id: BUILT_IMAGE_ID.to_string(),
                repo_digests: vec!["registry.example.com/team/app@sha256:d1g35t".to_string()],
            })
        } else {
            Ok(ImageDetails { id: BASE_IMAGE_ID.to_string(), repo_digests: vec![] })
        }
    }

    async fn remove_image(&self, name: &str, _force: bool) -> Result<()> {
        self.removals.lock().unwrap().push(name.to_string());
        if self.removals_fail {
            return Err(KilnError::Internal("image is in use".into()));
        }
        Ok(())
    }

    async fn prune_images(&self) -> Result<PruneReport> {
        *self.prunes.lock().unwrap() += 1;
        Ok(PruneReport::default())
    }
}

/// Serves one HTTP response containing a gzipped tar of `files`, then
/// closes.
async fn serve_tgz(files: &[(&str, &str)]) -> String {
    let mut gz =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    {
        let mut builder = tar::Builder::new(&mut gz);
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, *path, contents.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
    }
    let body = gz.finish().unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut discard = [0u8; 1024];
        let _ = socket.read(&mut discard).await;
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/gzip\r\ncontent-length: {}\r\n\r\n",
            body.len()
        );
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(&body).await;
    });

    format!("http://{addr}/pack.tar.gz")
}

fn args_for(package_url: String, tags: &[&str]) -> BuildArgs {
    BuildArgs {
        build_package: package_url,
        dockerfile_path: "Dockerfile".into(),
        repository: "team/app".into(),
        registry: "registry.example.com".into(),
        pull_token: "pull-jwt".into(),
        push_token: "push-jwt".into(),
        tag_names: tags.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}

struct Harness {
    manager: Arc<MockManager>,
    runtime: Arc<MockRuntime>,
}

impl Harness {
    fn new(manager: MockManager, runtime: MockRuntime) -> Self {
        Self { manager: Arc::new(manager), runtime: Arc::new(runtime) }
    }

    async fn run(&self, args: BuildArgs) -> Result<kiln_core::BuildMetadata> {
        let writer = Arc::new(JsonLogWriter::new(self.manager.clone()));
        job::run(
            self.manager.clone(),
            self.runtime.clone(),
            writer,
            args,
            CancellationToken::new(),
        )
        .await
    }

    fn phases(&self) -> Vec<Phase> {
        self.manager.phases.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn test_happy_path_archive_source() {
    let url = serve_tgz(&[("Dockerfile", "FROM alpine:3.18\n")]).await;
    let harness = Harness::new(MockManager::default(), MockRuntime::default());

    let metadata = harness.run(args_for(url, &["v1", "latest"])).await.unwrap();

    assert_eq!(
        harness.phases(),
        vec![
            Phase::Unpacking,
            Phase::Pulling,
            Phase::CheckingCache,
            Phase::Building,
            Phase::Pushing,
            Phase::Complete,
        ]
    );

    // One base pull, no cache pull.
    assert_eq!(
        harness.runtime.pulls.lock().unwrap().clone(),
        vec![("alpine".to_string(), "3.18".to_string())]
    );

    // One build with no cache sources.
    let builds = harness.runtime.builds.lock().unwrap();
    assert_eq!(builds.len(), 1);
    assert!(builds[0].cache_from.is_empty());
    assert_eq!(builds[0].dockerfile, "Dockerfile");

    // Both tags, in order.
    let tags = harness.runtime.tags.lock().unwrap();
    assert_eq!(tags.len(), 2);
    assert_eq!(tags[0].2, "v1");
    assert_eq!(tags[1].2, "latest");
    assert_eq!(tags[0].1, "registry.example.com/team/app");

    let pushes = harness.runtime.pushes.lock().unwrap();
    assert_eq!(pushes.len(), 2);

    assert_eq!(metadata.image_id, BUILT_IMAGE_ID);
    assert!(!metadata.digests.is_empty());
}

#[tokio::test]
async fn test_cache_hit_primes_and_cleans_up() {
    let url = serve_tgz(&[("Dockerfile", "FROM alpine:3.18\n")]).await;
    let manager = MockManager { cached_tag: "v0".into(), ..Default::default() };
    let harness = Harness::new(manager, MockRuntime::default());

    harness.run(args_for(url, &["v1"])).await.unwrap();

    assert_eq!(
        harness.phases(),
        vec![
            Phase::Unpacking,
            Phase::Pulling,
            Phase::CheckingCache,
            Phase::PrimingCache,
            Phase::Building,
            Phase::Pushing,
            Phase::Complete,
        ]
    );

    // Base pull plus the cache-priming pull.
    let pulls = harness.runtime.pulls.lock().unwrap().clone();
    assert_eq!(
        pulls,
        vec![
            ("alpine".to_string(), "3.18".to_string()),
            ("registry.example.com/team/app".to_string(), "v0".to_string()),
        ]
    );

    // The primed tag feeds the build as a cache source.
    let builds = harness.runtime.builds.lock().unwrap();
    assert_eq!(builds[0].cache_from, vec!["registry.example.com/team/app:v0".to_string()]);

    // Cleanup removes the cache image, the base image and the built
    // image.
    let removals = harness.runtime.removals.lock().unwrap().clone();
    assert_eq!(
        removals,
        vec![
            "registry.example.com/team/app:v0".to_string(),
            "alpine:3.18".to_string(),
            BUILT_IMAGE_ID.to_string(),
        ]
    );
    assert_eq!(*harness.runtime.prunes.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_cache_lookup_failure_is_advisory() {
    let url = serve_tgz(&[("Dockerfile", "FROM alpine:3.18\n")]).await;
    let manager = MockManager { fail_cached_tag: true, ..Default::default() };
    let harness = Harness::new(manager, MockRuntime::default());

    harness.run(args_for(url, &["v1"])).await.unwrap();

    // No priming phase, empty cache sources, overall success.
    assert!(!harness.phases().contains(&Phase::PrimingCache));
    let builds = harness.runtime.builds.lock().unwrap();
    assert!(builds[0].cache_from.is_empty());
}

#[tokio::test]
async fn test_invalid_dockerfile_stops_after_unpacking() {
    let url = serve_tgz(&[("Dockerfile", "ADD . .\n")]).await;
    let harness = Harness::new(MockManager::default(), MockRuntime::default());

    let err = harness.run(args_for(url, &["v1"])).await.unwrap_err();
    match err {
        KilnError::InvalidDockerfile { reason } => {
            assert_eq!(reason, "First line in Dockerfile isn't FROM or ARG")
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The failing stage was announced; nothing further happened.
    assert_eq!(harness.phases(), vec![Phase::Unpacking]);
    assert!(harness.runtime.pulls.lock().unwrap().is_empty());
    assert!(harness.runtime.builds.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_scratch_base_image_skips_pull() {
    let url = serve_tgz(&[("Dockerfile", "FROM scratch\n")]).await;
    let harness = Harness::new(MockManager::default(), MockRuntime::default());

    harness.run(args_for(url, &["v1"])).await.unwrap();

    // No pull happened, but the cache lookup still ran with the
    // well-known scratch image ID.
    assert!(harness.runtime.pulls.lock().unwrap().is_empty());
    let queries = harness.manager.tag_queries.lock().unwrap();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].base_image, "scratch");
    assert_eq!(
        queries[0].base_image_id,
        "511136ea3c5a64f264b78b5433614aec563103b4d4702f3ba7d4d2698e22c158"
    );
}

#[tokio::test]
async fn test_push_retry_succeeds_on_third_attempt() {
    let url = serve_tgz(&[("Dockerfile", "FROM alpine:3.18\n")]).await;
    let runtime = MockRuntime { push_failures: Mutex::new(2), ..Default::default() };
    let harness = Harness::new(MockManager::default(), runtime);

    harness.run(args_for(url, &["v1"])).await.unwrap();

    // Two failed attempts and the final success are all visible.
    let pushes = harness.runtime.pushes.lock().unwrap();
    assert_eq!(pushes.len(), 3);
    assert!(pushes.iter().all(|(_, tag)| tag == "v1"));
}

#[tokio::test]
async fn test_push_exhaustion_fails_the_job() {
    let url = serve_tgz(&[("Dockerfile", "FROM alpine:3.18\n")]).await;
    let runtime = MockRuntime { push_failures: Mutex::new(3), ..Default::default() };
    let harness = Harness::new(MockManager::default(), runtime);

    let err = harness.run(args_for(url, &["v1"])).await.unwrap_err();
    assert!(matches!(err, KilnError::Push { .. }));
    assert_eq!(err.kind(), "PushError");
}

#[tokio::test]
async fn test_cleanup_is_best_effort() {
    let url = serve_tgz(&[("Dockerfile", "FROM alpine:3.18\n")]).await;
    let manager = MockManager { cached_tag: "v0".into(), ..Default::default() };
    let runtime = MockRuntime { removals_fail: true, ..Default::default() };
    let harness = Harness::new(manager, runtime);

    // Every removal fails, the job still completes.
    harness.run(args_for(url, &["v1"])).await.unwrap();

    // All three removals were attempted, and the prune still ran.
    assert_eq!(harness.runtime.removals.lock().unwrap().len(), 3);
    assert_eq!(*harness.runtime.prunes.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_build_log_stream_reaches_the_manager() {
    let url = serve_tgz(&[("Dockerfile", "FROM alpine:3.18\n")]).await;
    let harness = Harness::new(MockManager::default(), MockRuntime::default());

    harness.run(args_for(url, &["v1"])).await.unwrap();

    let entries = harness.manager.entries.lock().unwrap();
    assert!(entries.iter().any(|e| e.contains("Pulling fs layer")));
    assert!(entries.iter().any(|e| e.contains("Step 1/1")));
}

#[tokio::test]
async fn test_raw_dockerfile_buildpack() {
    // A plaintext body becomes the workspace's Dockerfile.
    let body = "FROM alpine:3.18\n";
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body_owned = body.to_string();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut discard = [0u8; 1024];
        let _ = socket.read(&mut discard).await;
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n",
            body_owned.len()
        );
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(body_owned.as_bytes()).await;
    });

    let harness = Harness::new(MockManager::default(), MockRuntime::default());
    harness.run(args_for(format!("http://{addr}/Dockerfile"), &["v1"])).await.unwrap();

    assert_eq!(
        harness.runtime.pulls.lock().unwrap().clone(),
        vec![("alpine".to_string(), "3.18".to_string())]
    );
}
