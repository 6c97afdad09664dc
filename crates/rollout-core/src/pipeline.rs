use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::try_join_all;
use log::{debug, error, info, warn};
use reqwest::Url;
use rollout_host::{HostError, InstallMetadata, NullShellIntegration, UninstallRegistry};
use rollout_platform::AppLayout;
use semver::Version;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::archive::{self, ArchiveError};
use crate::delta::{DeltaCoordinator, DeltaError};
use crate::digest::sha256_file;
use crate::manifest::{Manifest, ManifestError, PACKAGE_EXTENSION, ReleaseEntry};
use crate::package::PackageMetadata;
use crate::progress::Progress;
use crate::selector::{SelectError, UpdateInfo, plan_update};

const RELEASES_FILE: &str = "RELEASES";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("downloaded package {file_name} failed verification: {reason}")]
    DownloadIntegrity { file_name: String, reason: String },
    #[error("{context} {url}: {source}")]
    Http {
        context: &'static str,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} failed with status {status}")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("invalid release location '{value}': {reason}")]
    InvalidLocation { value: String, reason: String },
    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no installed release found under {}", root.display())]
    NotInstalled { root: PathBuf },
    #[error("planned package {file_name} was not downloaded")]
    NotStaged { file_name: String },
}

impl PipelineError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    fn http(context: &'static str, url: &Url, source: reqwest::Error) -> Self {
        Self::Http {
            context,
            url: url.to_string(),
            source,
        }
    }

    fn integrity(entry: &ReleaseEntry, reason: impl Into<String>) -> Self {
        Self::DownloadIntegrity {
            file_name: entry.file_name().to_string(),
            reason: reason.into(),
        }
    }

    /// Whether another attempt without deltas could succeed. Bad manifest
    /// data and a missing install fail the same way every time.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Manifest(_) | Self::NotInstalled { .. })
    }
}

/// Where releases are fetched from: an http(s) base URL or a local directory
/// holding `RELEASES` and the packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseSource {
    Remote(Url),
    Local(PathBuf),
}

impl ReleaseSource {
    /// Treat `http://` and `https://` values as remote, anything else as a
    /// directory path.
    ///
    /// # Errors
    /// Returns [`PipelineError::InvalidLocation`] for a malformed URL.
    pub fn parse(value: &str) -> Result<Self, PipelineError> {
        let lower = value.to_ascii_lowercase();
        if !(lower.starts_with("http://") || lower.starts_with("https://")) {
            return Ok(Self::Local(PathBuf::from(value)));
        }

        let with_slash = if value.ends_with('/') {
            value.to_string()
        } else {
            format!("{value}/")
        };
        Url::parse(&with_slash)
            .map(Self::Remote)
            .map_err(|error| PipelineError::InvalidLocation {
                value: value.to_string(),
                reason: error.to_string(),
            })
    }

    fn resolve(&self, relative: &str) -> Result<Location, PipelineError> {
        match self {
            Self::Remote(base) => {
                base.join(relative)
                    .map(Location::Url)
                    .map_err(|error| PipelineError::InvalidLocation {
                        value: relative.to_string(),
                        reason: error.to_string(),
                    })
            }
            Self::Local(dir) => Ok(Location::File(dir.join(relative))),
        }
    }

    fn package_location(&self, entry: &ReleaseEntry) -> Result<Location, PipelineError> {
        match entry.base_url() {
            Some(base) => {
                let joined = format!("{base}{}", entry.file_name());
                match Url::parse(&joined) {
                    Ok(url) => Ok(Location::Url(url)),
                    Err(_) => self.resolve(&joined),
                }
            }
            None => self.resolve(entry.file_name()),
        }
    }
}

impl std::fmt::Display for ReleaseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(url) => write!(f, "{url}"),
            Self::Local(dir) => write!(f, "{}", dir.display()),
        }
    }
}

#[derive(Debug, Clone)]
enum Location {
    Url(Url),
    File(PathBuf),
}

/// A downloaded package that passed size and hash verification. The file is
/// deleted when the value is dropped unless it was moved away first.
#[derive(Debug)]
pub struct StagedPackage {
    entry: ReleaseEntry,
    path: PathBuf,
    _area: Option<Arc<TempDir>>,
}

impl StagedPackage {
    #[must_use]
    pub fn new(entry: ReleaseEntry, path: PathBuf) -> Self {
        Self {
            entry,
            path,
            _area: None,
        }
    }

    #[must_use]
    pub fn entry(&self) -> &ReleaseEntry {
        &self.entry
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedPackage {
    fn drop(&mut self) {
        if self.path.exists()
            && let Err(error) = std::fs::remove_file(&self.path)
        {
            debug!(
                "Failed to remove staged package {}: {error}",
                self.path.display()
            );
        }
    }
}

/// Whether an attempt may plan a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaPolicy {
    Allowed,
    Disallowed,
}

/// One delta-allowed attempt, then exactly one full-package attempt.
pub const FALLBACK_ATTEMPTS: [DeltaPolicy; 2] = [DeltaPolicy::Allowed, DeltaPolicy::Disallowed];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate {
        version: Version,
    },
    Updated {
        from: Version,
        to: Version,
        app_dir: PathBuf,
    },
}

/// The three phases of an update run, driven by [`update_with_fallback`].
#[async_trait]
pub trait UpdateSteps: Send + Sync {
    async fn check_for_update(
        &self,
        ignore_deltas: bool,
        progress: &Progress,
    ) -> Result<UpdateInfo, PipelineError>;

    async fn download_releases(
        &self,
        entries: &[ReleaseEntry],
        progress: &Progress,
    ) -> Result<Vec<StagedPackage>, PipelineError>;

    /// Apply the staged packages oldest to newest and return the new
    /// version's application directory.
    async fn apply_releases(
        &self,
        info: &UpdateInfo,
        staged: Vec<StagedPackage>,
        progress: &Progress,
    ) -> Result<PathBuf, PipelineError>;
}

/// Run check, download and apply under [`FALLBACK_ATTEMPTS`]. A failed
/// attempt is followed by one attempt that ignores deltas; a failure there
/// is returned as-is.
///
/// # Errors
/// Returns the error of the last attempt, or the first error that another
/// attempt cannot fix.
pub async fn update_with_fallback<S>(
    steps: &S,
    progress: &Progress,
) -> Result<UpdateOutcome, PipelineError>
where
    S: UpdateSteps + ?Sized,
{
    let (final_policy, earlier) = FALLBACK_ATTEMPTS
        .split_last()
        .map_or((DeltaPolicy::Disallowed, &[][..]), |(last, rest)| (*last, rest));

    for policy in earlier {
        match run_attempt(steps, *policy, progress).await {
            Ok(outcome) => return Ok(outcome),
            Err(error) if !error.is_retryable() => return Err(error),
            Err(error) => {
                warn!("Update attempt with {policy:?} deltas failed, retrying with full package: {error}");
            }
        }
    }

    run_attempt(steps, final_policy, progress)
        .await
        .inspect_err(|error| error!("Update failed after full package retry: {error}"))
}

async fn run_attempt<S>(
    steps: &S,
    policy: DeltaPolicy,
    progress: &Progress,
) -> Result<UpdateOutcome, PipelineError>
where
    S: UpdateSteps + ?Sized,
{
    let ignore_deltas = policy == DeltaPolicy::Disallowed;
    let info = match steps
        .check_for_update(ignore_deltas, &progress.phase(0, 33))
        .await
    {
        Ok(info) => info,
        Err(PipelineError::Select(SelectError::NoUpdateAvailable { installed, .. })) => {
            info!("Already up to date at {installed}");
            progress.complete();
            return Ok(UpdateOutcome::UpToDate { version: installed });
        }
        Err(error) => return Err(error),
    };

    let staged = steps
        .download_releases(&info.releases_to_apply, &progress.phase(33, 66))
        .await?;
    let app_dir = steps
        .apply_releases(&info, staged, &progress.phase(66, 100))
        .await?;
    progress.complete();

    Ok(UpdateOutcome::Updated {
        from: info.currently_installed.version().clone(),
        to: info.future_release.version().clone(),
        app_dir,
    })
}

/// Read `RELEASES` from a directory, or build a manifest from the full
/// packages it contains when the file is absent.
///
/// # Errors
/// Returns an error when the directory or a package cannot be read.
pub fn manifest_in_directory(dir: &Path) -> Result<Manifest, PipelineError> {
    let releases = dir.join(RELEASES_FILE);
    if releases.exists() {
        return Ok(Manifest::read_from(&releases)?);
    }

    let entries = std::fs::read_dir(dir)
        .map_err(|error| PipelineError::io("failed to list packages", dir, error))?;
    let mut manifest = Manifest::new();
    for entry in entries {
        let entry =
            entry.map_err(|error| PipelineError::io("failed to list packages", dir, error))?;
        let path = entry.path();
        let is_package = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(PACKAGE_EXTENSION));
        if !is_package || !path.is_file() {
            continue;
        }
        let release = ReleaseEntry::generate_from_file(&path, None)?;
        if !release.is_delta() {
            manifest.push(release)?;
        }
    }
    debug!(
        "Generated manifest with {} entries from {}",
        manifest.len(),
        dir.display()
    );
    Ok(manifest)
}

/// Update pipeline for one installed application.
pub struct UpdateManager {
    client: reqwest::Client,
    layout: AppLayout,
    source: ReleaseSource,
    deltas: DeltaCoordinator,
    registry: Arc<dyn UninstallRegistry>,
}

impl UpdateManager {
    #[must_use]
    pub fn new(client: reqwest::Client, layout: AppLayout, source: ReleaseSource) -> Self {
        Self {
            client,
            layout,
            source,
            deltas: DeltaCoordinator::default(),
            registry: Arc::new(NullShellIntegration),
        }
    }

    #[must_use]
    pub fn with_delta_coordinator(mut self, deltas: DeltaCoordinator) -> Self {
        self.deltas = deltas;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn UninstallRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn layout(&self) -> &AppLayout {
        &self.layout
    }

    /// Check, download and apply with the delta-to-full fallback, then
    /// refresh the uninstall registration.
    ///
    /// # Errors
    /// Returns the error of the final failed attempt.
    pub async fn update_app(&self, progress: &Progress) -> Result<UpdateOutcome, PipelineError> {
        let outcome = update_with_fallback(self, progress).await?;
        if let UpdateOutcome::Updated { to, .. } = &outcome {
            info!("Updated {} to {to}", self.layout.root().display());
            self.register_installed().await;
        }
        Ok(outcome)
    }

    /// Check and download without applying. Verified packages are kept in
    /// the packages directory for a later update run.
    ///
    /// # Errors
    /// Returns check or download failures, including
    /// [`SelectError::NoUpdateAvailable`].
    pub async fn download_only(&self, progress: &Progress) -> Result<UpdateInfo, PipelineError> {
        let info = self.check_for_update(false, &progress.phase(0, 50)).await?;
        let staged = self
            .download_releases(&info.releases_to_apply, &progress.phase(50, 100))
            .await?;
        for package in &staged {
            self.keep_in_packages(package)?;
        }
        progress.complete();
        Ok(info)
    }

    /// First install from the configured source: copy the updater binary
    /// into place, install the newest full package and register the
    /// uninstaller.
    ///
    /// # Errors
    /// Returns an error when the source has no full release or copying,
    /// verification or extraction fails.
    pub async fn full_install(
        &self,
        updater_binary: &Path,
        progress: &Progress,
    ) -> Result<PathBuf, PipelineError> {
        self.layout.ensure_dirs().map_err(|error| {
            PipelineError::io("failed to create install directory", self.layout.root(), error)
        })?;
        self.copy_updater(updater_binary)?;
        progress.report(5);

        let source = self.fetch_remote_manifest().await?;
        let package_id = source
            .primary_package_id()
            .ok_or_else(|| SelectError::NoFullRelease {
                package_id: self.layout.app_name().unwrap_or_default().to_string(),
            })?
            .to_string();
        let newest = source
            .newest_full(&package_id)
            .ok_or(SelectError::NoFullRelease { package_id })?
            .clone();
        progress.report(10);

        let staged = self
            .download_releases(std::slice::from_ref(&newest), &progress.phase(10, 60))
            .await?;
        let package = staged.into_iter().next().ok_or_else(|| PipelineError::NotStaged {
            file_name: newest.file_name().to_string(),
        })?;
        let full_path = self.keep_in_packages(&package)?;
        let app_dir = self.install_full_package(&full_path, &newest)?;
        progress.report(90);

        self.register_installed().await;
        progress.complete();
        info!("Installed {} into {}", newest.file_name(), app_dir.display());
        Ok(app_dir)
    }

    /// Local manifest, created from the packages directory when missing.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotInstalled`] when there is no packages
    /// directory.
    pub fn local_manifest(&self) -> Result<Manifest, PipelineError> {
        let packages = self.layout.packages_dir();
        if !packages.is_dir() {
            return Err(PipelineError::NotInstalled {
                root: self.layout.root().to_path_buf(),
            });
        }

        let releases = self.layout.releases_file();
        if releases.exists() {
            return Ok(Manifest::read_from(&releases)?);
        }
        let manifest = manifest_in_directory(&packages)?;
        manifest.write_atomic(&releases)?;
        Ok(manifest)
    }

    fn installed_release(&self, local: &Manifest) -> Result<ReleaseEntry, PipelineError> {
        local
            .primary_package_id()
            .and_then(|id| local.newest_full(id))
            .cloned()
            .ok_or_else(|| PipelineError::NotInstalled {
                root: self.layout.root().to_path_buf(),
            })
    }

    async fn fetch_remote_manifest(&self) -> Result<Manifest, PipelineError> {
        let url = match &self.source {
            ReleaseSource::Local(dir) => return manifest_in_directory(dir),
            ReleaseSource::Remote(base) => {
                base.join(RELEASES_FILE)
                    .map_err(|error| PipelineError::InvalidLocation {
                        value: base.to_string(),
                        reason: error.to_string(),
                    })?
            }
        };

        debug!("Fetching manifest from {url}");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|error| PipelineError::http("manifest request failed", &url, error))?;
        if !response.status().is_success() {
            return Err(PipelineError::HttpStatus {
                url: url.to_string(),
                status: response.status(),
            });
        }
        let text = response
            .text()
            .await
            .map_err(|error| PipelineError::http("failed to read manifest", &url, error))?;
        Ok(Manifest::parse(&text)?)
    }

    async fn stage_one(
        &self,
        index: usize,
        entry: &ReleaseEntry,
        area: &Arc<TempDir>,
        progress: &FileProgress<'_>,
    ) -> Result<StagedPackage, PipelineError> {
        let dest = area.path().join(entry.file_name());
        let staged = StagedPackage {
            entry: entry.clone(),
            path: dest.clone(),
            _area: Some(Arc::clone(area)),
        };

        match self.source.package_location(entry)? {
            Location::Url(url) => {
                download_file(&self.client, &url, &dest, entry.file_size(), |pct| {
                    progress.update(index, pct);
                })
                .await?;
            }
            Location::File(path) => {
                tokio::fs::copy(&path, &dest)
                    .await
                    .map_err(|error| PipelineError::io("failed to copy package", &path, error))?;
            }
        }
        progress.update(index, 100);

        verify_package(entry, &dest)?;
        Ok(staged)
    }

    fn keep_in_packages(&self, package: &StagedPackage) -> Result<PathBuf, PipelineError> {
        let dest = self.layout.packages_dir().join(package.entry.file_name());
        crate::fs::move_file(&package.path, &dest)
            .map_err(|error| PipelineError::io("failed to store package", &dest, error))?;
        Ok(dest)
    }

    fn copy_updater(&self, updater_binary: &Path) -> Result<(), PipelineError> {
        let dest = self.layout.updater_binary();
        let same = match (updater_binary.canonicalize(), dest.canonicalize()) {
            (Ok(src), Ok(existing)) => src == existing,
            _ => false,
        };
        if same {
            return Ok(());
        }
        std::fs::copy(updater_binary, &dest)
            .map_err(|error| PipelineError::io("failed to copy updater binary", &dest, error))?;
        Ok(())
    }

    /// Extract a full package into `app-<version>` through a temporary
    /// sibling directory, then record it in the local manifest.
    fn install_full_package(
        &self,
        package: &Path,
        entry: &ReleaseEntry,
    ) -> Result<PathBuf, PipelineError> {
        let root = self.layout.root();
        let app_dir = self.layout.app_dir_for(entry.version());
        let staging = tempfile::Builder::new()
            .prefix(".installing-")
            .tempdir_in(root)
            .map_err(|error| PipelineError::io("failed to create install staging", root, error))?;
        archive::extract_package(package, staging.path())?;

        if app_dir.exists() {
            warn!("Replacing existing {}", app_dir.display());
            std::fs::remove_dir_all(&app_dir).map_err(|error| {
                PipelineError::io("failed to remove previous app directory", &app_dir, error)
            })?;
        }
        std::fs::rename(staging.path(), &app_dir).map_err(|error| {
            PipelineError::io("failed to move app directory into place", &app_dir, error)
        })?;

        let mut local = match Manifest::read_from(&self.layout.releases_file()) {
            Ok(manifest) => manifest,
            Err(ManifestError::Io { .. }) => Manifest::new(),
            Err(error) => return Err(error.into()),
        };
        let local_entry = ReleaseEntry::new(
            entry.content_hash(),
            entry.file_name(),
            entry.file_size(),
            None,
        )?;
        let already_recorded = local.entries().iter().any(|existing| {
            !existing.is_delta()
                && existing.package_id() == local_entry.package_id()
                && existing.version() == local_entry.version()
        });
        if !already_recorded {
            local.push(local_entry)?;
        }
        local.write_atomic(&self.layout.releases_file())?;

        info!("Installed {} into {}", entry.version(), app_dir.display());
        Ok(app_dir)
    }

    async fn register_installed(&self) {
        let metadata = match self.install_metadata() {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Skipping uninstall registration: {error}");
                return;
            }
        };
        if let Err(error) = self.registry.register(&metadata).await {
            warn!("Failed to register uninstaller: {error}");
        }
    }

    /// What the uninstall registration and shortcuts record about the
    /// installed release.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotInstalled`] when nothing is installed and
    /// archive errors when the installed package cannot be read.
    pub fn install_metadata(&self) -> Result<InstallMetadata, PipelineError> {
        let local = self.local_manifest()?;
        let installed = self.installed_release(&local)?;
        let package_path = self.layout.packages_dir().join(installed.file_name());
        let metadata = PackageMetadata::read(&package_path, &installed)?;

        Ok(InstallMetadata {
            app_name: self
                .layout
                .app_name()
                .unwrap_or(installed.package_id())
                .to_string(),
            display_name: metadata.display_name().to_string(),
            version: installed.version().to_string(),
            publisher: metadata.authors.clone(),
            install_dir: self.layout.root().to_path_buf(),
            updater_path: self.layout.updater_binary(),
        })
    }
}

#[async_trait]
impl UpdateSteps for UpdateManager {
    async fn check_for_update(
        &self,
        ignore_deltas: bool,
        progress: &Progress,
    ) -> Result<UpdateInfo, PipelineError> {
        progress.report(0);
        let local = self.local_manifest()?;
        let installed = self.installed_release(&local)?;
        progress.report(33);

        let remote = self.fetch_remote_manifest().await?;
        progress.report(66);

        let info = plan_update(&remote, &installed, ignore_deltas)?;
        info!(
            "Update available from {}: {} -> {} ({} package(s))",
            self.source,
            info.currently_installed.version(),
            info.future_release.version(),
            info.releases_to_apply.len()
        );
        progress.complete();
        Ok(info)
    }

    async fn download_releases(
        &self,
        entries: &[ReleaseEntry],
        progress: &Progress,
    ) -> Result<Vec<StagedPackage>, PipelineError> {
        let packages = self.layout.packages_dir();
        std::fs::create_dir_all(&packages)
            .map_err(|error| PipelineError::io("failed to create packages directory", &packages, error))?;
        let area = Arc::new(
            tempfile::Builder::new()
                .prefix(".download-")
                .tempdir_in(&packages)
                .map_err(|error| {
                    PipelineError::io("failed to create download directory", &packages, error)
                })?,
        );

        progress.report(0);
        let file_progress = FileProgress::new(entries.len(), progress);
        let staged = try_join_all(
            entries
                .iter()
                .enumerate()
                .map(|(index, entry)| self.stage_one(index, entry, &area, &file_progress)),
        )
        .await?;

        progress.complete();
        Ok(staged)
    }

    async fn apply_releases(
        &self,
        info: &UpdateInfo,
        mut staged: Vec<StagedPackage>,
        progress: &Progress,
    ) -> Result<PathBuf, PipelineError> {
        let packages = self.layout.packages_dir();
        let mut current_full = packages.join(info.currently_installed.file_name());
        let steps = info.releases_to_apply.len().max(1);

        for (step, entry) in info.releases_to_apply.iter().enumerate() {
            let position = staged
                .iter()
                .position(|package| package.entry.file_name() == entry.file_name())
                .ok_or_else(|| PipelineError::NotStaged {
                    file_name: entry.file_name().to_string(),
                })?;
            let package = staged.swap_remove(position);

            current_full = if entry.is_delta() {
                let full_path = packages.join(rebuilt_file_name(entry, &info.future_release));
                debug!(
                    "Applying delta {} onto {}",
                    entry.file_name(),
                    current_full.display()
                );
                self.deltas
                    .apply_delta(&current_full, &package.path, &full_path)?;
                full_path
            } else {
                self.keep_in_packages(&package)?
            };

            let done = u8::try_from((step + 1) * 80 / steps).unwrap_or(80);
            progress.report(done);
        }

        let future = &info.future_release;
        let final_hash = sha256_file(&current_full)
            .map_err(|error| PipelineError::io("failed to hash package", &current_full, error))?;
        if final_hash != future.content_hash() {
            return Err(DeltaError::Apply {
                package: future.file_name().to_string(),
                reason: format!(
                    "rebuilt package hash {final_hash} does not match {}",
                    future.content_hash()
                ),
            }
            .into());
        }

        let app_dir = self.install_full_package(&current_full, future)?;
        progress.complete();
        Ok(app_dir)
    }
}

/// Where a delta's rebuilt full package is stored. The delta for the future
/// release takes that entry's own file name, so the local manifest and the
/// packages directory agree even for an unsuffixed full package.
fn rebuilt_file_name(delta: &ReleaseEntry, future: &ReleaseEntry) -> String {
    if delta.package_id() == future.package_id() && delta.version() == future.version() {
        future.file_name().to_string()
    } else {
        delta.full_file_name()
    }
}

/// Per-file completion shared by concurrent downloads; the reported value is
/// the unweighted average.
struct FileProgress<'a> {
    percents: Mutex<Vec<u8>>,
    progress: &'a Progress,
}

impl<'a> FileProgress<'a> {
    fn new(files: usize, progress: &'a Progress) -> Self {
        Self {
            percents: Mutex::new(vec![0; files]),
            progress,
        }
    }

    fn update(&self, index: usize, percent: u8) {
        let Ok(mut percents) = self.percents.lock() else {
            return;
        };
        if let Some(slot) = percents.get_mut(index) {
            *slot = percent.min(100);
        }
        let total: usize = percents.iter().map(|pct| usize::from(*pct)).sum();
        let average = total / percents.len().max(1);
        drop(percents);
        self.progress.report(u8::try_from(average).unwrap_or(100));
    }
}

async fn download_file(
    client: &reqwest::Client,
    url: &Url,
    dest: &Path,
    expected_size: u64,
    mut on_progress: impl FnMut(u8),
) -> Result<(), PipelineError> {
    use futures_util::StreamExt;

    info!("Downloading {url}");
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|error| PipelineError::http("download request failed", url, error))?;
    if !response.status().is_success() {
        return Err(PipelineError::HttpStatus {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let total = response.content_length().unwrap_or(expected_size).max(1);
    let mut downloaded: u64 = 0;
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|error| PipelineError::io("failed to create download file", dest, error))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| PipelineError::http("download stream error", url, error))?;
        file.write_all(&chunk)
            .await
            .map_err(|error| PipelineError::io("failed to write download data", dest, error))?;
        downloaded += chunk.len() as u64;
        on_progress(u8::try_from(downloaded.min(total) * 100 / total).unwrap_or(100));
    }

    file.flush()
        .await
        .map_err(|error| PipelineError::io("failed to flush download file", dest, error))?;
    debug!("Download complete: {downloaded} bytes from {url}");
    Ok(())
}

/// Size first, then content hash. Nothing unverified reaches apply.
fn verify_package(entry: &ReleaseEntry, path: &Path) -> Result<(), PipelineError> {
    let size = std::fs::metadata(path)
        .map_err(|error| PipelineError::io("failed to inspect download", path, error))?
        .len();
    if size != entry.file_size() {
        return Err(PipelineError::integrity(
            entry,
            format!("size {size} does not match expected {}", entry.file_size()),
        ));
    }

    let hash = sha256_file(path)
        .map_err(|error| PipelineError::io("failed to hash download", path, error))?;
    if hash != entry.content_hash() {
        return Err(PipelineError::integrity(
            entry,
            format!("hash {hash} does not match expected {}", entry.content_hash()),
        ));
    }
    debug!("Verified {}", entry.file_name());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use semver::Version;

    use super::{
        PipelineError, ReleaseSource, StagedPackage, UpdateOutcome, UpdateSteps,
        update_with_fallback,
    };
    use crate::delta::DeltaError;
    use crate::manifest::{ManifestError, ReleaseEntry};
    use crate::progress::Progress;
    use crate::selector::{SelectError, UpdateInfo};

    fn entry(name: &str) -> ReleaseEntry {
        let hash = crate::digest::sha256_bytes(name.as_bytes());
        ReleaseEntry::new(&hash, name, 10, None).expect("entry should be valid")
    }

    enum Script {
        DeltaFailsOnce,
        AlwaysFails,
        UpToDate,
        BadManifest,
    }

    struct ScriptedSteps {
        script: Script,
        checks: Mutex<Vec<bool>>,
    }

    impl ScriptedSteps {
        fn new(script: Script) -> Self {
            Self {
                script,
                checks: Mutex::new(Vec::new()),
            }
        }

        fn checks(&self) -> Vec<bool> {
            self.checks.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl UpdateSteps for ScriptedSteps {
        async fn check_for_update(
            &self,
            ignore_deltas: bool,
            _progress: &Progress,
        ) -> Result<UpdateInfo, PipelineError> {
            self.checks.lock().expect("lock").push(ignore_deltas);
            match self.script {
                Script::UpToDate => {
                    return Err(SelectError::NoUpdateAvailable {
                        installed: Version::new(2, 0, 0),
                        latest: Version::new(2, 0, 0),
                    }
                    .into());
                }
                Script::BadManifest => {
                    return Err(ManifestError::Format {
                        line: 1,
                        reason: "bad".to_string(),
                    }
                    .into());
                }
                Script::DeltaFailsOnce | Script::AlwaysFails => {}
            }
            let step = if ignore_deltas {
                entry("app-2.0.0-full.nupkg")
            } else {
                entry("app-2.0.0-delta.nupkg")
            };
            Ok(UpdateInfo {
                currently_installed: entry("app-1.0.0-full.nupkg"),
                future_release: entry("app-2.0.0-full.nupkg"),
                releases_to_apply: vec![step],
            })
        }

        async fn download_releases(
            &self,
            entries: &[ReleaseEntry],
            _progress: &Progress,
        ) -> Result<Vec<StagedPackage>, PipelineError> {
            Ok(entries
                .iter()
                .map(|entry| {
                    StagedPackage::new(entry.clone(), PathBuf::from("/nonexistent/staged"))
                })
                .collect())
        }

        async fn apply_releases(
            &self,
            info: &UpdateInfo,
            _staged: Vec<StagedPackage>,
            _progress: &Progress,
        ) -> Result<PathBuf, PipelineError> {
            let fails = match self.script {
                Script::DeltaFailsOnce => info.is_delta_plan(),
                _ => true,
            };
            if fails {
                return Err(DeltaError::Apply {
                    package: info.releases_to_apply[0].file_name().to_string(),
                    reason: "corrupt".to_string(),
                }
                .into());
            }
            Ok(PathBuf::from("app-2.0.0"))
        }
    }

    #[tokio::test]
    async fn delta_failure_retries_once_with_full_package() {
        let steps = ScriptedSteps::new(Script::DeltaFailsOnce);

        let outcome = update_with_fallback(&steps, &Progress::silent())
            .await
            .expect("fallback should succeed");

        assert_eq!(steps.checks(), vec![false, true]);
        assert_eq!(
            outcome,
            UpdateOutcome::Updated {
                from: Version::new(1, 0, 0),
                to: Version::new(2, 0, 0),
                app_dir: PathBuf::from("app-2.0.0"),
            }
        );
    }

    #[tokio::test]
    async fn second_failure_is_propagated() {
        let steps = ScriptedSteps::new(Script::AlwaysFails);

        let error = update_with_fallback(&steps, &Progress::silent())
            .await
            .expect_err("both attempts fail");

        assert_eq!(steps.checks(), vec![false, true]);
        match error {
            PipelineError::Delta(DeltaError::Apply { package, .. }) => {
                assert_eq!(package, "app-2.0.0-full.nupkg");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn up_to_date_is_not_an_error() {
        let steps = ScriptedSteps::new(Script::UpToDate);

        let outcome = update_with_fallback(&steps, &Progress::silent())
            .await
            .expect("up to date should succeed");

        assert_eq!(
            outcome,
            UpdateOutcome::UpToDate {
                version: Version::new(2, 0, 0)
            }
        );
        assert_eq!(steps.checks(), vec![false]);
    }

    #[tokio::test]
    async fn manifest_errors_are_not_retried() {
        let steps = ScriptedSteps::new(Script::BadManifest);

        let error = update_with_fallback(&steps, &Progress::silent())
            .await
            .expect_err("bad manifest should fail");

        assert!(matches!(error, PipelineError::Manifest(_)));
        assert_eq!(steps.checks(), vec![false]);
    }

    #[test]
    fn release_source_distinguishes_urls_and_directories() {
        match ReleaseSource::parse("https://example.com/releases").expect("valid url") {
            ReleaseSource::Remote(url) => assert_eq!(url.as_str(), "https://example.com/releases/"),
            ReleaseSource::Local(_) => panic!("expected remote source"),
        }
        assert_eq!(
            ReleaseSource::parse("/srv/releases").expect("path"),
            ReleaseSource::Local(PathBuf::from("/srv/releases"))
        );
        assert!(ReleaseSource::parse("https://exa mple.com").is_err());
    }

    #[test]
    fn package_location_prefers_entry_base_url() {
        let source = ReleaseSource::parse("https://example.com/feed").expect("valid url");
        let hash = crate::digest::sha256_bytes(b"x");
        let with_base = ReleaseEntry::new(
            &hash,
            "app-1.0.0-full.nupkg",
            1,
            Some("https://cdn.example.com/files".to_string()),
        )
        .expect("entry");

        match source.package_location(&with_base).expect("location") {
            super::Location::Url(url) => {
                assert_eq!(url.as_str(), "https://cdn.example.com/files/app-1.0.0-full.nupkg");
            }
            super::Location::File(_) => panic!("expected url"),
        }
        match source
            .package_location(&entry("app-1.0.0-full.nupkg"))
            .expect("location")
        {
            super::Location::Url(url) => {
                assert_eq!(url.as_str(), "https://example.com/feed/app-1.0.0-full.nupkg");
            }
            super::Location::File(_) => panic!("expected url"),
        }
    }
}
