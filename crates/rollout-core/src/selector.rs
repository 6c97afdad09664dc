use log::debug;
use semver::Version;
use thiserror::Error;

use crate::manifest::{Manifest, ReleaseEntry};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("no update available: installed {installed}, newest release {latest}")]
    NoUpdateAvailable { installed: Version, latest: Version },
    #[error("manifest has no full release for {package_id}")]
    NoFullRelease { package_id: String },
}

/// Outcome of an update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub currently_installed: ReleaseEntry,
    pub future_release: ReleaseEntry,
    /// Oldest to newest. Either one delta or one full entry.
    pub releases_to_apply: Vec<ReleaseEntry>,
}

impl UpdateInfo {
    #[must_use]
    pub fn is_delta_plan(&self) -> bool {
        self.releases_to_apply.iter().any(ReleaseEntry::is_delta)
    }
}

/// Newest full release of the same package that is strictly older than
/// `candidate`. This is the base a delta for `candidate` is built against.
#[must_use]
pub fn select_previous<'a>(
    manifest: &'a Manifest,
    candidate: &ReleaseEntry,
) -> Option<&'a ReleaseEntry> {
    manifest
        .full_releases(candidate.package_id())
        .filter(|entry| entry.version() < candidate.version())
        .last()
}

/// Decide what to download to move `installed` to the newest full release.
///
/// A delta is planned only when one targets the newest version and its base
/// is exactly the installed version; otherwise the newest full package is
/// planned. No delta chains are considered.
///
/// # Errors
/// Returns [`SelectError::NoUpdateAvailable`] when the installed version is
/// already the newest, and [`SelectError::NoFullRelease`] when the manifest
/// has no full package for the installed package id.
pub fn plan_update(
    manifest: &Manifest,
    installed: &ReleaseEntry,
    ignore_deltas: bool,
) -> Result<UpdateInfo, SelectError> {
    let future = manifest.newest_full(installed.package_id()).ok_or_else(|| {
        SelectError::NoFullRelease {
            package_id: installed.package_id().to_string(),
        }
    })?;

    if installed.version() >= future.version() {
        return Err(SelectError::NoUpdateAvailable {
            installed: installed.version().clone(),
            latest: future.version().clone(),
        });
    }

    let delta = if ignore_deltas {
        None
    } else {
        manifest.entries().iter().find(|entry| {
            entry.is_delta()
                && entry.package_id() == future.package_id()
                && entry.version() == future.version()
                && select_previous(manifest, entry)
                    .is_some_and(|base| base.version() == installed.version())
        })
    };

    let step = delta.unwrap_or(future);
    debug!(
        "Planned {} -> {} via {}",
        installed.version(),
        future.version(),
        step.file_name()
    );

    Ok(UpdateInfo {
        currently_installed: installed.clone(),
        future_release: future.clone(),
        releases_to_apply: vec![step.clone()],
    })
}
