//! Shared types for a build job.
//!
//! These mirror the build manager's view of a job: the arguments handed
//! out at registration, the lifecycle phases the worker reports back, and
//! the metadata exchanged around pulls, cache lookups and the finished
//! artifact.

use serde::{Deserialize, Serialize};

// scratch is a special case, empty base image. It is not listed by the
// runtime, but pulling it reveals a fixed ID which stands in for an
// inspect result.
pub const SCRATCH_IMAGE_NAME: &str = "scratch";
pub const SCRATCH_IMAGE_ID: &str =
    "511136ea3c5a64f264b78b5433614aec563103b4d4702f3ba7d4d2698e22c158";

/// Credentials for pulling the base image, if any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseImageAuth {
    pub username: String,
    pub password: String,
}

/// Git source for a build: repository URL, commit to check out, and the
/// ssh private key needed to clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSource {
    pub url: String,
    pub sha: String,
    pub private_key: String,
}

/// Everything needed to run one build, as returned by the manager at
/// registration. Exactly one of `build_package` / `git` is populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildArgs {
    /// URL of an archive (or raw Dockerfile) to download.
    pub build_package: String,
    /// Git source, when the build comes from a repository instead.
    pub git: Option<GitSource>,
    /// Subdirectory of the source that holds the build context.
    pub context: String,
    /// Dockerfile path relative to the context.
    pub dockerfile_path: String,
    /// Repository the built image belongs to.
    pub repository: String,
    /// Registry the build is for (e.g. "registry.example.com").
    pub registry: String,
    /// Token used to pull the cache image.
    pub pull_token: String,
    /// Token used to push the built image.
    pub push_token: String,
    /// Tags to apply to the built image, in push order.
    pub tag_names: Vec<String>,
    /// Credentials for the base-image pull, if any.
    pub base_image: BaseImageAuth,
}

impl BuildArgs {
    /// The registry-qualified repository name.
    pub fn full_repo_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

/// Milestones in progressing through a build, in lifecycle order.
///
/// The worker reports each transition to the manager with a strictly
/// increasing sequence number. `CheckingCache` and `PrimingCache` share a
/// wire value with `Pulling`; the distinction only exists worker-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Waiting,
    Unpacking,
    Pulling,
    CheckingCache,
    PrimingCache,
    Building,
    Pushing,
    Complete,
    Error,
}

/// Metadata attached to the `Pulling` phase transition.
#[derive(Debug, Clone, Default)]
pub struct PullMetadata {
    pub registry_url: String,
    pub base_image: String,
    pub base_image_tag: String,
    pub pull_username: String,
}

/// A base image's identity, sent to the manager when asking for the most
/// similar cached tag.
#[derive(Debug, Clone, Default)]
pub struct TagMetadata {
    pub base_image: String,
    pub base_image_tag: String,
    pub base_image_id: String,
}

/// Metadata about the successfully created build artifact.
#[derive(Debug, Clone, Default)]
pub struct BuildMetadata {
    pub image_id: String,
    pub digests: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_repo_name() {
        let args = BuildArgs {
            registry: "registry.example.com".into(),
            repository: "team/app".into(),
            ..Default::default()
        };
        assert_eq!(args.full_repo_name(), "registry.example.com/team/app");
    }
}
