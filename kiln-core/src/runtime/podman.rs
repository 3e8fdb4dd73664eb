//! Podman adapter.
//!
//! Drives the podman CLI. Unlike the Docker daemon, podman's build path
//! emits plain text lines rather than a JSON stream, so this adapter
//! pairs with the plain log-writer variant and failures surface through
//! exit codes, never the output stream.

use super::{
    BuildImageOptions, ContainerRuntime, ImageDetails, PruneReport, PullImageOptions,
    PushImageOptions, RegistryAuth, TagImageOptions,
};
use crate::error::{KilnError, Result};
use crate::logstream::LogWriter;
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Adapter for a podman service.
pub struct PodmanRuntime {
    host: String,
}

impl PodmanRuntime {
    pub fn new(host: &str) -> Self {
        Self { host: host.to_string() }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new("podman");
        cmd.arg("--url").arg(&self.host).args(args);
        debug!("podman {}", args.join(" "));
        cmd
    }

    /// Runs podman to completion, forwarding interleaved output lines to
    /// the log writer.
    async fn run_streaming(&self, args: &[String], output: &dyn LogWriter) -> Result<()> {
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|err| KilnError::Internal(format!("failed to run podman: {err}")))?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut stdout_open = true;
        let mut stderr_open = true;
        while stdout_open || stderr_open {
            let line = tokio::select! {
                line = stdout_lines.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(line)) => Some(line),
                        _ => {
                            stdout_open = false;
                            None
                        }
                    }
                }
                line = stderr_lines.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => Some(line),
                        _ => {
                            stderr_open = false;
                            None
                        }
                    }
                }
            };

            if let Some(line) = line {
                output.write(format!("{line}\n").as_bytes()).await?;
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|err| KilnError::Internal(format!("failed to wait for podman: {err}")))?;
        if !status.success() {
            return Err(KilnError::Internal(format!("podman exited with {status}")));
        }
        Ok(())
    }

    /// Runs podman to completion, capturing stdout; stderr is folded
    /// into the error on failure.
    async fn run_captured(&self, args: &[String]) -> Result<String> {
        let output = self
            .command(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| KilnError::Internal(format!("failed to run podman: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(KilnError::Internal(format!(
                "podman exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn image_path(repository: &str, tag: &str) -> String {
    format!("{repository}:{tag}")
}

fn creds_args(auth: &RegistryAuth) -> Vec<String> {
    if auth.is_empty() {
        return Vec::new();
    }
    vec!["--creds".to_string(), format!("{}:{}", auth.username, auth.password)]
}

fn build_args(opts: &BuildImageOptions) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "--file".to_string(),
        opts.dockerfile.clone(),
        "--tag".to_string(),
        opts.name.clone(),
    ];
    if opts.no_cache {
        args.push("--no-cache".to_string());
    }
    if !opts.rm_tmp_container {
        args.push("--rm=false".to_string());
    }
    if opts.force_rm_tmp_container {
        args.push("--force-rm".to_string());
    }
    for cache_image in &opts.cache_from {
        args.push("--cache-from".to_string());
        args.push(cache_image.clone());
    }
    args.push(opts.context_dir.display().to_string());
    args
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn build_image(&self, opts: BuildImageOptions, output: &dyn LogWriter) -> Result<()> {
        self.run_streaming(&build_args(&opts), output).await
    }

    async fn pull_image(
        &self,
        opts: PullImageOptions,
        auth: RegistryAuth,
        output: &dyn LogWriter,
    ) -> Result<()> {
        let mut args = vec!["pull".to_string()];
        args.extend(creds_args(&auth));
        args.push(image_path(&opts.repository, &opts.tag));
        self.run_streaming(&args, output).await
    }

    async fn push_image(
        &self,
        opts: PushImageOptions,
        auth: RegistryAuth,
        output: &dyn LogWriter,
    ) -> Result<()> {
        let mut args = vec!["push".to_string()];
        args.extend(creds_args(&auth));
        args.push(image_path(&opts.repository, &opts.tag));
        self.run_streaming(&args, output).await
    }

    async fn tag_image(&self, name: &str, opts: TagImageOptions) -> Result<()> {
        let args = vec![
            "tag".to_string(),
            name.to_string(),
            image_path(&opts.repository, &opts.tag),
        ];
        self.run_captured(&args).await.map(|_| ())
    }

    async fn inspect_image(&self, name: &str) -> Result<ImageDetails> {
        #[derive(Deserialize)]
        struct Inspect {
            #[serde(rename = "Id")]
            id: String,
            #[serde(default, rename = "RepoDigests")]
            repo_digests: Vec<String>,
        }

        let args = vec!["image".to_string(), "inspect".to_string(), name.to_string()];
        let stdout = self.run_captured(&args).await?;

        // podman prints a JSON array, one element per inspected image.
        let mut inspects: Vec<Inspect> = serde_json::from_str(&stdout)
            .map_err(|err| KilnError::Internal(format!("failed to parse image inspect: {err}")))?;
        let inspect = inspects
            .pop()
            .ok_or_else(|| KilnError::Internal(format!("no such image: {name}")))?;

        Ok(ImageDetails { id: inspect.id, repo_digests: inspect.repo_digests })
    }

    async fn remove_image(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["rmi".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(name.to_string());
        self.run_captured(&args).await.map(|_| ())
    }

    async fn prune_images(&self) -> Result<PruneReport> {
        let args =
            vec!["image".to_string(), "prune".to_string(), "--force".to_string()];
        let stdout = self.run_captured(&args).await?;

        // Output is one deleted image ID per line; podman does not
        // report reclaimed space.
        let images_deleted =
            stdout.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect();
        Ok(PruneReport { images_deleted, space_reclaimed: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_build_args_minimal() {
        let opts = BuildImageOptions {
            name: "4a6151f5-fb30-4a27-b1d9-b8ab44ed5ed4".into(),
            dockerfile: "Dockerfile".into(),
            context_dir: PathBuf::from("/tmp/build_pack123"),
            rm_tmp_container: true,
            ..Default::default()
        };
        assert_eq!(
            build_args(&opts),
            vec![
                "build",
                "--file",
                "Dockerfile",
                "--tag",
                "4a6151f5-fb30-4a27-b1d9-b8ab44ed5ed4",
                "/tmp/build_pack123",
            ]
        );
    }

    #[test]
    fn test_build_args_with_cache_sources() {
        let opts = BuildImageOptions {
            name: "img".into(),
            dockerfile: "Dockerfile".into(),
            context_dir: PathBuf::from("/ctx"),
            rm_tmp_container: true,
            force_rm_tmp_container: true,
            cache_from: vec!["registry.example.com/app:v0".into()],
            ..Default::default()
        };
        let args = build_args(&opts);
        assert!(args.contains(&"--force-rm".to_string()));
        let pos = args.iter().position(|a| a == "--cache-from").unwrap();
        assert_eq!(args[pos + 1], "registry.example.com/app:v0");
    }

    #[test]
    fn test_creds_args() {
        assert!(creds_args(&RegistryAuth::default()).is_empty());
        assert_eq!(
            creds_args(&RegistryAuth { username: "$token".into(), password: "jwt".into() }),
            vec!["--creds", "$token:jwt"]
        );
    }

    #[test]
    fn test_image_path() {
        assert_eq!(image_path("registry.example.com/team/app", "v1"), "registry.example.com/team/app:v1");
    }
}
