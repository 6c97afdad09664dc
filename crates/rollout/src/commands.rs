use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use rollout_core::installer::{
    InstallerAssembler, ReleasifyReport, ReleasifyRequest, SigningOptions, default_editor,
};
use rollout_core::tools::{ProcessToolRunner, RESOURCE_TOOL, SIGN_TOOL};
use rollout_core::{
    PackageMetadata, PipelineError, Progress, ReleaseEntry, ReleaseSource, UpdateInfo,
    UpdateManager, UpdateOutcome, manifest_in_directory, parse_version,
};
use rollout_host::{
    InstallMetadata, ProcessLauncher, ShortcutLocation, ShortcutManager, UninstallRegistry,
    parse_shortcut_locations,
};
use rollout_platform::{AppLayout, AppPaths, wait_for_parent_exit};
use serde::Serialize;

use crate::error::CliError;
use crate::settings::UpdaterSettings;

/// The install the running updater belongs to: its own directory.
pub fn current_layout(current_exe: &Path) -> AppLayout {
    AppLayout::new(current_exe.parent().unwrap_or_else(|| Path::new(".")))
}

pub async fn install(
    settings: &UpdaterSettings,
    source_dir: &Path,
    current_exe: &Path,
    registry: Arc<dyn UninstallRegistry>,
    progress: &Progress,
) -> Result<PathBuf, CliError> {
    let manifest = manifest_in_directory(source_dir)?;
    let releases = source_dir.join("RELEASES");
    if !releases.exists()
        && let Err(error) = manifest.write_atomic(&releases)
    {
        warn!("Could not write {}: {error}", releases.display());
    }

    let app_name = manifest
        .primary_package_id()
        .ok_or_else(|| PipelineError::NotInstalled {
            root: source_dir.to_path_buf(),
        })?
        .to_string();
    let paths = AppPaths::new()?;
    let layout = AppLayout::new(paths.root_app_dir(&app_name));
    info!("Installing {app_name} from {}", source_dir.display());

    let manager = UpdateManager::new(
        settings.http_client(),
        layout,
        ReleaseSource::Local(source_dir.to_path_buf()),
    )
    .with_registry(registry);
    Ok(manager.full_install(current_exe, progress).await?)
}

pub async fn update(
    settings: &UpdaterSettings,
    layout: AppLayout,
    url: &str,
    registry: Arc<dyn UninstallRegistry>,
    progress: &Progress,
) -> Result<UpdateOutcome, CliError> {
    let manager = UpdateManager::new(settings.http_client(), layout, ReleaseSource::parse(url)?)
        .with_registry(registry);
    Ok(manager.update_app(progress).await?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSummary {
    pub current_version: String,
    pub future_version: String,
    pub releases_to_apply: Vec<PlannedRelease>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedRelease {
    pub version: String,
    pub file_name: String,
    pub release_notes: Option<String>,
}

impl DownloadSummary {
    /// Summarise a download whose packages were kept in `packages_dir`.
    /// Release notes come from each package's metadata; a package without
    /// readable metadata has none.
    pub fn new(info: &UpdateInfo, packages_dir: &Path) -> Self {
        Self {
            current_version: info.currently_installed.version().to_string(),
            future_version: info.future_release.version().to_string(),
            releases_to_apply: info
                .releases_to_apply
                .iter()
                .map(|entry| PlannedRelease {
                    version: entry.version().to_string(),
                    file_name: entry.file_name().to_string(),
                    release_notes: release_notes(&packages_dir.join(entry.file_name()), entry),
                })
                .collect(),
        }
    }
}

fn release_notes(package: &Path, entry: &ReleaseEntry) -> Option<String> {
    match PackageMetadata::read(package, entry) {
        Ok(metadata) => metadata.release_notes,
        Err(error) => {
            warn!("No release notes for {}: {error}", entry.file_name());
            None
        }
    }
}

pub async fn download(
    settings: &UpdaterSettings,
    layout: AppLayout,
    url: &str,
    progress: &Progress,
) -> Result<DownloadSummary, CliError> {
    let manager = UpdateManager::new(settings.http_client(), layout, ReleaseSource::parse(url)?);
    let info = manager.download_only(progress).await?;
    Ok(DownloadSummary::new(&info, &manager.layout().packages_dir()))
}

#[derive(Debug, Clone, Default)]
pub struct ReleasifyOptions {
    pub package: PathBuf,
    pub release_dir: PathBuf,
    pub bootstrapper: Option<PathBuf>,
    pub setup_output: Option<PathBuf>,
    pub base_url: Option<String>,
    pub loading_gif: Option<PathBuf>,
    pub setup_icon: Option<PathBuf>,
    pub sign_with_params: Option<String>,
    pub no_version_stamp: bool,
}

pub fn default_bootstrapper(current_exe: &Path) -> PathBuf {
    let name = format!("Setup{}", std::env::consts::EXE_SUFFIX);
    current_exe
        .parent()
        .map_or_else(|| PathBuf::from(&name), |dir| dir.join(&name))
}

pub async fn releasify(
    settings: &UpdaterSettings,
    options: ReleasifyOptions,
    current_exe: &Path,
) -> Result<ReleasifyReport, CliError> {
    let mut tools = ProcessToolRunner::new();
    if let Some(path) = &settings.signtool_path {
        tools = tools.with_override(SIGN_TOOL, path);
    }
    if let Some(path) = &settings.rcedit_path {
        tools = tools.with_override(RESOURCE_TOOL, path);
    }

    let assembler = InstallerAssembler::new(Arc::new(tools), Arc::from(default_editor()))
        .with_stamp_retry_delays(settings.stamp_retry_delays());

    let request = ReleasifyRequest {
        package: options.package,
        release_dir: options.release_dir,
        updater_binary: current_exe.to_path_buf(),
        bootstrapper_template: options
            .bootstrapper
            .unwrap_or_else(|| default_bootstrapper(current_exe)),
        setup_output: options.setup_output,
        base_url: options.base_url,
        signing: options
            .sign_with_params
            .filter(|params| !params.trim().is_empty())
            .map(|parameters| SigningOptions { parameters }),
        loading_gif: options.loading_gif,
        icon: options.setup_icon,
        skip_version_stamp: options.no_version_stamp,
    };
    Ok(assembler.releasify(&request).await?)
}

/// The `app-<version>` directory with the highest version. Directories whose
/// suffix is not a version are ignored.
pub fn newest_app_dir(layout: &AppLayout) -> Result<PathBuf, CliError> {
    let dirs = layout
        .installed_app_dirs()
        .map_err(|error| CliError::io("failed to list install directory", layout.root(), error))?;
    dirs.into_iter()
        .filter_map(|(version, path)| parse_version(&version).map(|version| (version, path)))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path)
        .ok_or_else(|| CliError::NoInstalledVersion(layout.root().to_path_buf()))
}

/// Resolve `name` inside `app_dir`, rejecting anything that would leave it.
pub fn resolve_executable(app_dir: &Path, name: &str) -> Result<PathBuf, CliError> {
    if name.trim().is_empty() {
        return Err(CliError::invalid_executable(name, "empty executable name"));
    }
    let relative = Path::new(name);
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(CliError::invalid_executable(
            name,
            "path escapes the application directory",
        ));
    }

    let base = app_dir
        .canonicalize()
        .map_err(|error| CliError::io("failed to resolve", app_dir, error))?;
    let resolved = app_dir
        .join(relative)
        .canonicalize()
        .map_err(|_| CliError::invalid_executable(name, "executable not found"))?;
    if !resolved.starts_with(&base) {
        return Err(CliError::invalid_executable(
            name,
            "path escapes the application directory",
        ));
    }
    if !resolved.is_file() {
        return Err(CliError::invalid_executable(name, "not a file"));
    }
    Ok(resolved)
}

pub async fn process_start(
    layout: &AppLayout,
    exe_name: &str,
    arguments: Option<&str>,
    launcher: &dyn ProcessLauncher,
) -> Result<(), CliError> {
    wait_for_parent_exit().await;
    start_newest(layout, exe_name, arguments, launcher)
}

fn start_newest(
    layout: &AppLayout,
    exe_name: &str,
    arguments: Option<&str>,
    launcher: &dyn ProcessLauncher,
) -> Result<(), CliError> {
    let executable = resolve_executable(&newest_app_dir(layout)?, exe_name)?;
    launcher.launch(&executable, arguments.unwrap_or_default())?;
    Ok(())
}

fn installed_metadata(layout: &AppLayout) -> Result<InstallMetadata, CliError> {
    let manager = UpdateManager::new(
        reqwest::Client::new(),
        layout.clone(),
        ReleaseSource::Local(layout.packages_dir()),
    );
    Ok(manager.install_metadata()?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutAction {
    Create,
    Remove,
}

pub async fn shortcut(
    layout: &AppLayout,
    exe_name: &str,
    locations: Option<&str>,
    action: ShortcutAction,
    shortcuts: &dyn ShortcutManager,
) -> Result<(), CliError> {
    let locations = parse_shortcut_locations(locations)?;
    let executable = resolve_executable(&newest_app_dir(layout)?, exe_name)?;
    let metadata = installed_metadata(layout)?;
    match action {
        ShortcutAction::Create => {
            shortcuts
                .create_shortcuts(&executable, &locations, &metadata)
                .await?;
        }
        ShortcutAction::Remove => {
            shortcuts
                .remove_shortcuts(&executable, &locations, &metadata)
                .await?;
        }
    }
    Ok(())
}

fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(windows)]
    {
        path.extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path).is_ok_and(|meta| meta.permissions().mode() & 0o111 != 0)
    }
    #[cfg(not(any(windows, unix)))]
    {
        true
    }
}

fn app_executables(app_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(app_dir) else {
        return Vec::new();
    };
    let mut executables: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| is_executable(path))
        .collect();
    executables.sort();
    executables
}

/// Remove shortcuts and the uninstall registration, then delete the install
/// root. The running updater is left in place when it lives inside the root.
pub async fn uninstall(
    layout: &AppLayout,
    current_exe: &Path,
    shortcuts: &dyn ShortcutManager,
    registry: &dyn UninstallRegistry,
) -> Result<(), CliError> {
    if !layout.packages_dir().is_dir() {
        return Err(PipelineError::NotInstalled {
            root: layout.root().to_path_buf(),
        }
        .into());
    }

    let metadata = installed_metadata(layout);
    let app_name = match &metadata {
        Ok(metadata) => metadata.app_name.clone(),
        Err(error) => {
            warn!("Uninstalling without package metadata: {error}");
            layout.app_name().unwrap_or_default().to_string()
        }
    };

    if let (Ok(metadata), Ok(app_dir)) = (&metadata, newest_app_dir(layout)) {
        for executable in app_executables(&app_dir) {
            if let Err(error) = shortcuts
                .remove_shortcuts(&executable, &ShortcutLocation::ALL, metadata)
                .await
            {
                warn!("Failed to remove shortcuts for {}: {error}", executable.display());
            }
        }
    }

    if let Err(error) = registry.unregister(&app_name).await {
        warn!("Failed to remove uninstall registration for {app_name}: {error}");
    }

    remove_install_root(layout.root(), current_exe)?;
    info!("Uninstalled {app_name} from {}", layout.root().display());
    Ok(())
}

fn remove_install_root(root: &Path, current_exe: &Path) -> Result<(), CliError> {
    let running = current_exe
        .canonicalize()
        .unwrap_or_else(|_| current_exe.to_path_buf());
    let entries = std::fs::read_dir(root)
        .map_err(|error| CliError::io("failed to list install directory", root, error))?;

    let mut kept_running_binary = false;
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path.canonicalize().is_ok_and(|resolved| resolved == running) {
            kept_running_binary = true;
            continue;
        }
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(error) = result {
            warn!("Failed to remove {}: {error}", path.display());
        }
    }

    if kept_running_binary {
        info!("Left running updater {} in place", running.display());
    } else if let Err(error) = std::fs::remove_dir(root) {
        warn!("Failed to remove {}: {error}", root.display());
    }
    Ok(())
}
