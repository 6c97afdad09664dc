//! Replacing an installed application's updater with the running binary.

use std::path::{Path, PathBuf};

use log::info;
use rollout_platform::{AppPaths, AppPathsError, UPDATER_BINARY, wait_for_parent_exit};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelfUpdateError {
    #[error("refusing to update '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },
    #[error(transparent)]
    Paths(#[from] AppPathsError),
    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SelfUpdateError {
    fn invalid(target: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.to_string(),
            reason: reason.into(),
        }
    }
}

/// Wait for the launching process to exit, then copy the running binary over
/// the updater of `app_name` under the per-user application data root.
///
/// # Errors
/// Returns [`SelfUpdateError::InvalidTarget`] when the target is missing,
/// escapes the application data root or is the running binary itself.
pub async fn replace_self(app_name: &str) -> Result<PathBuf, SelfUpdateError> {
    wait_for_parent_exit().await;

    let paths = AppPaths::new()?;
    let current_exe = std::env::current_exe().map_err(|source| SelfUpdateError::Io {
        context: "failed to locate running binary",
        path: PathBuf::from(app_name),
        source,
    })?;
    replace_updater_in(&paths.app_data_root, app_name, &current_exe)
}

/// Copy `current_exe` to `<root>/<app_name>/Update(.exe)` after checking that
/// the target directory exists, sits strictly inside `root`, and is not the
/// running binary or its directory.
///
/// # Errors
/// Returns [`SelfUpdateError::InvalidTarget`] for any rejected target and an
/// I/O error when the copy fails.
pub fn replace_updater_in(
    root: &Path,
    app_name: &str,
    current_exe: &Path,
) -> Result<PathBuf, SelfUpdateError> {
    if app_name.trim().is_empty() {
        return Err(SelfUpdateError::invalid(app_name, "empty application name"));
    }

    let root = root
        .canonicalize()
        .map_err(|_| SelfUpdateError::invalid(app_name, "application data root does not exist"))?;
    let target_dir = root
        .join(app_name)
        .canonicalize()
        .map_err(|_| SelfUpdateError::invalid(app_name, "application is not installed"))?;

    if !target_dir.is_dir() {
        return Err(SelfUpdateError::invalid(app_name, "target is not a directory"));
    }
    if target_dir == root || !target_dir.starts_with(&root) {
        return Err(SelfUpdateError::invalid(
            app_name,
            "target is outside the application data root",
        ));
    }

    let current = current_exe
        .canonicalize()
        .unwrap_or_else(|_| current_exe.to_path_buf());
    let target = target_dir.join(UPDATER_BINARY);
    let target_resolved = target.canonicalize().unwrap_or_else(|_| target.clone());
    if target_dir == current || target_resolved == current {
        return Err(SelfUpdateError::invalid(
            app_name,
            "target is the running binary",
        ));
    }

    std::fs::copy(&current, &target).map_err(|source| SelfUpdateError::Io {
        context: "failed to replace updater",
        path: target.clone(),
        source,
    })?;
    info!("Replaced {} with {}", target.display(), current.display());
    Ok(target)
}
