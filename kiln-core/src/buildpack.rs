//! Build-pack acquisition.
//!
//! A build's source arrives either as an archive URL or as a git spec.
//! Both paths land in a `build_pack*` temporary directory whose lifetime
//! is owned by the orchestrator; archives are staged through a
//! `build_archive*` temp file that is dropped right after extraction.

use crate::error::{KilnError, Result};
use crate::types::BuildArgs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Kill a subprocess that has written nothing for this long.
const PROCESS_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Kill a subprocess that has run for this long in total. Submodule
/// updates can be legitimately quiet for minutes, so they get a total
/// budget instead of an idle one.
const PROCESS_TOTAL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Wrapper script handed to git via GIT_SSH; it picks the key up from
/// the PKEY environment variable.
const GIT_SSH_WRAPPER: &str = "/ssh-git.sh";

const SUBMODULE_DOCS_URL: &str = "https://docs.kiln.build/guides/git-submodules";

/// A downloaded and expanded build pack. Dropping it deletes the backing
/// directory.
#[derive(Debug)]
pub struct Buildpack {
    root: TempDir,
    context_dir: PathBuf,
}

impl Buildpack {
    fn new(root: TempDir, context: &str) -> Self {
        let context_dir = root.path().join(context);
        Self { root, context_dir }
    }

    /// The directory holding the Dockerfile and build context.
    pub fn context_dir(&self) -> &Path {
        &self.context_dir
    }

    /// Deletes the build pack from the filesystem now rather than at
    /// drop time, reporting failures.
    pub fn remove(self) {
        let path = self.root.path().display().to_string();
        match self.root.close() {
            Ok(()) => info!("removed build dir: {path}"),
            Err(err) => warn!("failed to remove build pack from filesystem: {err}"),
        }
    }
}

/// Downloads (or clones) the build pack described by `args` and returns
/// the expanded workspace.
pub async fn fetch(args: &BuildArgs) -> Result<Buildpack> {
    let root = match (&args.git, args.build_package.as_str()) {
        (Some(git), _) => {
            info!("cloning buildpack: {} at {}", git.sha, git.url);
            clone_repository(&git.url, &git.sha, &git.private_key).await?
        }
        (None, url) if !url.is_empty() => {
            info!("downloading buildpack: {url}");
            download(url).await?
        }
        _ => {
            return Err(KilnError::BuildPack { reason: "insufficient buildpack args".to_string() })
        }
    };

    Ok(Buildpack::new(root, &args.context))
}

/// Downloads and extracts a non-git build pack.
async fn download(url: &str) -> Result<TempDir> {
    let mut response = reqwest::get(url)
        .await
        .map_err(|err| KilnError::BuildPack { reason: err.to_string() })?;

    if !response.status().is_success() {
        return Err(KilnError::BuildPack {
            reason: format!("failed to download build package: HTTP {}", response.status()),
        });
    }

    let header_mimetype = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    // Stage the body in a temp file; buildpacks can be large.
    let mut archive = tempfile::Builder::new()
        .prefix("build_archive")
        .tempfile()
        .map_err(|err| KilnError::BuildPack { reason: err.to_string() })?;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| KilnError::BuildPack { reason: err.to_string() })?
    {
        archive
            .write_all(&chunk)
            .map_err(|err| KilnError::BuildPack { reason: err.to_string() })?;
    }

    // Without a Content-Type header, sniff the first 512 bytes.
    let mimetype = match header_mimetype {
        Some(mime) if !mime.is_empty() => mime,
        _ => {
            let mut head = [0u8; 512];
            archive
                .seek(SeekFrom::Start(0))
                .map_err(|err| KilnError::BuildPack { reason: err.to_string() })?;
            let n = archive
                .read(&mut head)
                .map_err(|err| KilnError::BuildPack { reason: err.to_string() })?;
            sniff_mime(&head[..n]).to_string()
        }
    };

    // Strip any parameters (charset etc.) from the mimetype.
    let mimetype = mimetype.split(';').next().unwrap_or("").trim().to_string();

    extract_package(archive.path(), &mimetype)
}

/// Extracts an archive file into a fresh `build_pack*` directory
/// according to its MIME type.
fn extract_package(archive: &Path, mimetype: &str) -> Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix("build_pack")
        .tempdir()
        .map_err(|err| KilnError::BuildPack { reason: err.to_string() })?;

    match mimetype {
        "application/zip" | "application/x-zip-compressed" => {
            info!("buildpack identified as zip");
            let file = std::fs::File::open(archive)
                .map_err(|err| KilnError::BuildPack { reason: err.to_string() })?;
            zip::ZipArchive::new(file)
                .and_then(|mut zip| zip.extract(dir.path()))
                .map_err(|err| KilnError::BuildPack { reason: err.to_string() })?;
        }

        "application/x-tar" | "application/gzip" | "application/x-gzip" => {
            info!("buildpack identified as tar");
            extract_tar(archive, dir.path())?;
        }

        "text/plain" | "application/octet-stream" => {
            info!("buildpack identified as plain Dockerfile");
            std::fs::copy(archive, dir.path().join("Dockerfile"))
                .map_err(|err| KilnError::BuildPack { reason: err.to_string() })?;
        }

        other => {
            return Err(KilnError::InvalidDockerfile {
                reason: format!("Unsupported kind of build package: {other}"),
            })
        }
    }

    Ok(dir)
}

/// Unpacks a tar archive, transparently un-gzipping when the magic bytes
/// say so (the x-tar MIME covers bare tars).
fn extract_tar(archive: &Path, dest: &Path) -> Result<()> {
    let mut file =
        std::fs::File::open(archive).map_err(|err| KilnError::BuildPack { reason: err.to_string() })?;

    let mut magic = [0u8; 2];
    let gzipped = file.read(&mut magic).map(|n| n == 2 && magic == [0x1f, 0x8b]).unwrap_or(false);
    file.seek(SeekFrom::Start(0))
        .map_err(|err| KilnError::BuildPack { reason: err.to_string() })?;

    let unpack = if gzipped {
        tar::Archive::new(flate2::read::GzDecoder::new(file)).unpack(dest)
    } else {
        tar::Archive::new(file).unpack(dest)
    };
    unpack.map_err(|err| KilnError::BuildPack { reason: err.to_string() })
}

/// Minimal content sniffing for the formats the worker accepts.
fn sniff_mime(head: &[u8]) -> &'static str {
    if head.starts_with(&[0x1f, 0x8b]) {
        "application/x-gzip"
    } else if head.starts_with(b"PK\x03\x04") {
        "application/zip"
    } else if head.len() >= 262 && &head[257..262] == b"ustar" {
        "application/x-tar"
    } else if !head.contains(&0) {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}

/// Clones a repository into a fresh `build_pack*` directory, checks out
/// the requested commit and initialises submodules.
async fn clone_repository(url: &str, sha: &str, private_key: &str) -> Result<TempDir> {
    // The clone subprocess reads the key from a 0600 temp file.
    let mut key_file = tempfile::Builder::new()
        .prefix("ssh_key")
        .permissions(std::fs::Permissions::from_mode(0o600))
        .tempfile()
        .map_err(KilnError::internal)?;
    key_file.write_all(private_key.as_bytes()).map_err(KilnError::internal)?;
    let key_path = key_file.path().to_path_buf();

    let dir = tempfile::Builder::new()
        .prefix("build_pack")
        .tempdir()
        .map_err(KilnError::internal)?;

    let mut cmd = Command::new("git");
    cmd.args(["clone", "--progress", url])
        .arg(dir.path())
        .env("GIT_SSH", GIT_SSH_WRAPPER)
        .env("PKEY", &key_path);
    let output = run_command(cmd, TimeoutPolicy::Idle(PROCESS_IDLE_TIMEOUT))
        .await
        .map_err(|failure| KilnError::GitClone {
            reason: if failure.timed_out {
                format!("Timed out while trying to clone git repository\n{}", failure.output)
            } else {
                format!("Error cloning git repository ({})\n{}", failure.reason, failure.output)
            },
        })?;
    info!("git clone output: {output}");

    // git submodule fails to find the work tree when handed GIT_DIR /
    // GIT_WORK_TREE, so every follow-up command runs from inside the
    // clone instead.
    let mut cmd = Command::new("git");
    cmd.args(["checkout", sha]).current_dir(dir.path());
    let output = run_command(cmd, TimeoutPolicy::Idle(PROCESS_IDLE_TIMEOUT)).await.map_err(
        |failure| {
            if failure.timed_out {
                KilnError::GitClone {
                    reason: format!(
                        "Timed out while trying to checkout SHA {sha} in git repository\n{}",
                        failure.output
                    ),
                }
            } else {
                KilnError::GitCheckout {
                    reason: format!(
                        "Error checking out git commit ({})\n{}",
                        failure.reason, failure.output
                    ),
                }
            }
        },
    )?;
    info!("git checkout output: {output}");

    // Still exits 0 when there are no submodules.
    let mut cmd = Command::new("git");
    cmd.args(["submodule", "update", "--init", "--recursive"]).current_dir(dir.path());
    let output =
        run_command(cmd, TimeoutPolicy::Total(PROCESS_TOTAL_TIMEOUT)).await.map_err(|failure| {
            if failure.timed_out {
                KilnError::GitClone {
                    reason: format!(
                        "Timed out while trying to update submodules in git repository\n{}",
                        failure.output
                    ),
                }
            } else {
                KilnError::GitCheckout {
                    reason: format!(
                        "Error initializing git submodules ({}): See submodule documentation at {}\n{}",
                        failure.reason, SUBMODULE_DOCS_URL, failure.output
                    ),
                }
            }
        })?;
    info!("git submodule output: {output}");

    Ok(dir)
}

/// How a subprocess is allowed to spend its time.
#[derive(Debug, Clone, Copy)]
enum TimeoutPolicy {
    /// Killed after this much time without output.
    Idle(Duration),
    /// Killed after this much wall-clock time, however chatty.
    Total(Duration),
}

/// A subprocess that did not exit cleanly.
#[derive(Debug)]
struct CommandFailure {
    reason: String,
    output: String,
    timed_out: bool,
}

/// Runs a command to completion, capturing interleaved stdout/stderr,
/// killing it when the timeout policy says so.
async fn run_command(
    mut cmd: Command,
    policy: TimeoutPolicy,
) -> std::result::Result<String, CommandFailure> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|err| CommandFailure {
        reason: err.to_string(),
        output: String::new(),
        timed_out: false,
    })?;

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, tx.clone()));
    }
    drop(tx);

    let deadline = tokio::time::Instant::now()
        + match policy {
            TimeoutPolicy::Idle(idle) => idle,
            TimeoutPolicy::Total(total) => total,
        };

    let mut captured = Vec::new();
    loop {
        let chunk = match policy {
            // The sleep is re-armed every iteration, so output resets it.
            TimeoutPolicy::Idle(idle) => tokio::select! {
                chunk = rx.recv() => chunk,
                _ = tokio::time::sleep(idle) => {
                    return Err(kill_for_timeout(&mut child, captured).await);
                }
            },
            TimeoutPolicy::Total(_) => tokio::select! {
                chunk = rx.recv() => chunk,
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(kill_for_timeout(&mut child, captured).await);
                }
            },
        };

        match chunk {
            Some(bytes) => captured.extend_from_slice(&bytes),
            None => break,
        }
    }

    // Pipes are closed; the exit status should follow promptly.
    let status = match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            return Err(CommandFailure {
                reason: err.to_string(),
                output: String::from_utf8_lossy(&captured).into_owned(),
                timed_out: false,
            })
        }
        Err(_) => return Err(kill_for_timeout(&mut child, captured).await),
    };

    let output = String::from_utf8_lossy(&captured).into_owned();
    if status.success() {
        Ok(output)
    } else {
        Err(CommandFailure { reason: status.to_string(), output, timed_out: false })
    }
}

async fn kill_for_timeout(child: &mut tokio::process::Child, captured: Vec<u8>) -> CommandFailure {
    warn!("killing subprocess after timeout");
    if let Err(err) = child.kill().await {
        warn!("failed to kill hung process: {err}");
    }
    CommandFailure {
        reason: "killed process due to inactivity".to_string(),
        output: String::from_utf8_lossy(&captured).into_owned(),
        timed_out: true,
    }
}

async fn pump(mut reader: impl tokio::io::AsyncRead + Unpin, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}
