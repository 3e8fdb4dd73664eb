//! Worker configuration.
//!
//! The worker is configured entirely through the environment: it is
//! launched once per build job by the build manager's executor and never
//! reads a config file.

use crate::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which container runtime the worker drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            other => Err(KilnError::Config {
                reason: format!("invalid container runtime: {other}"),
            }),
        }
    }
}

/// Runtime configuration for a single worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// host:port of the build manager.
    pub server: String,
    /// Registration JWT presented to the manager.
    pub token: String,
    /// Container runtime socket URI.
    pub docker_host: String,
    /// Which runtime adapter (and log-writer variant) to use.
    pub runtime: RuntimeKind,
    /// Optional PEM bundle for client TLS against the manager.
    pub tls_cert_path: Option<PathBuf>,
    /// Disables TLS entirely when true.
    pub insecure: bool,
    /// Maximum connection attempts before giving up; backoff doubles
    /// between attempts.
    pub max_connect_attempts: u32,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// `SERVER` and `TOKEN` are required; everything else has a default.
    pub fn from_env() -> Result<Self> {
        let server = require_env("SERVER")?;
        let token = require_env("TOKEN")?;

        let docker_host = std::env::var("DOCKER_HOST")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "unix:///var/run/docker.sock".to_string());

        let runtime = match std::env::var("CONTAINER_RUNTIME") {
            Ok(v) if !v.is_empty() => RuntimeKind::parse(&v)?,
            _ => RuntimeKind::Docker,
        };

        let tls_cert_path = std::env::var("TLS_CERT_PATH")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let insecure = std::env::var("INSECURE")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            server,
            token,
            docker_host,
            runtime,
            tls_cert_path,
            insecure,
            max_connect_attempts: 5,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty()).ok_or_else(|| KilnError::Config {
        reason: format!("missing or empty {name} env var"),
    })
}
