use std::path::PathBuf;

use rollout_core::installer::InstallerError;
use rollout_core::self_update::SelfUpdateError;
use rollout_core::{ManifestError, PipelineError};
use rollout_host::HostError;
use rollout_platform::AppPathsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Installer(#[from] InstallerError),
    #[error(transparent)]
    SelfUpdate(#[from] SelfUpdateError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Paths(#[from] AppPathsError),
    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no installed version found in {}", .0.display())]
    NoInstalledVersion(PathBuf),
    #[error("refusing to start '{name}': {reason}")]
    InvalidExecutable { name: String, reason: String },
    #[error("failed to encode download summary: {0}")]
    Summary(#[from] serde_json::Error),
}

impl CliError {
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    pub fn invalid_executable(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidExecutable {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
