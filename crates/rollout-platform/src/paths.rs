use std::fmt::Display;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the updater binary inside every root app directory.
pub const UPDATER_BINARY: &str = if cfg!(windows) { "Update.exe" } else { "Update" };

const RELEASES_FILE: &str = "RELEASES";
const PACKAGES_DIR: &str = "packages";
const APP_DIR_PREFIX: &str = "app-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AppPathsError {
    #[error("Could not determine home directory")]
    HomeDirUnavailable,
    #[error("Could not determine config directory")]
    ConfigDirUnavailable,
    #[error("Could not determine local application data directory")]
    DataDirUnavailable,
}

/// Per-user locations the updater reads and writes outside of an install.
pub struct AppPaths {
    /// Root under which every installed application gets its own directory.
    pub app_data_root: PathBuf,
    pub config_dir: PathBuf,
}

impl AppPaths {
    /// Build updater paths for the current platform.
    ///
    /// # Errors
    /// Returns an error when a required base directory (for example the user
    /// home, config or local data directory) cannot be determined.
    pub fn new() -> Result<Self, AppPathsError> {
        #[cfg(target_os = "macos")]
        {
            let home = dirs::home_dir().ok_or(AppPathsError::HomeDirUnavailable)?;
            Ok(Self {
                app_data_root: home.join("Library/Application Support"),
                config_dir: home.join("Library/Application Support/rollout"),
            })
        }

        #[cfg(not(target_os = "macos"))]
        {
            Ok(Self {
                app_data_root: dirs::data_local_dir().ok_or(AppPathsError::DataDirUnavailable)?,
                config_dir: dirs::config_dir()
                    .ok_or(AppPathsError::ConfigDirUnavailable)?
                    .join("rollout"),
            })
        }
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    #[must_use]
    pub fn root_app_dir(&self, app_name: &str) -> PathBuf {
        self.app_data_root.join(app_name)
    }
}

/// Directory layout of one installed application.
///
/// ```text
/// <root>/Update(.exe)
/// <root>/packages/RELEASES
/// <root>/packages/*.nupkg
/// <root>/app-<version>/
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLayout {
    root: PathBuf,
}

impl AppLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Name of the application, taken from the root directory name.
    #[must_use]
    pub fn app_name(&self) -> Option<&str> {
        self.root.file_name().and_then(|name| name.to_str())
    }

    #[must_use]
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join(PACKAGES_DIR)
    }

    #[must_use]
    pub fn releases_file(&self) -> PathBuf {
        self.packages_dir().join(RELEASES_FILE)
    }

    #[must_use]
    pub fn updater_binary(&self) -> PathBuf {
        self.root.join(UPDATER_BINARY)
    }

    #[must_use]
    pub fn app_dir_for(&self, version: &impl Display) -> PathBuf {
        self.root.join(format!("{APP_DIR_PREFIX}{version}"))
    }

    /// Every `app-<version>` directory currently present, paired with the raw
    /// version text from its name.
    ///
    /// # Errors
    /// Returns an error if the root directory cannot be listed.
    pub fn installed_app_dirs(&self) -> std::io::Result<Vec<(String, PathBuf)>> {
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(version) = name.to_str().and_then(|n| n.strip_prefix(APP_DIR_PREFIX)) else {
                continue;
            };
            if entry.path().is_dir() {
                dirs.push((version.to_string(), entry.path()));
            }
        }
        Ok(dirs)
    }

    /// Ensure the root and packages directories exist on disk.
    ///
    /// # Errors
    /// Returns an error if any directory cannot be created.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.packages_dir())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{AppLayout, UPDATER_BINARY};

    #[test]
    fn layout_paths_use_expected_names() {
        let layout = AppLayout::new("/data/MyApp");

        assert_eq!(layout.app_name(), Some("MyApp"));
        assert!(
            layout
                .releases_file()
                .ends_with(Path::new("packages").join("RELEASES"))
        );
        assert!(layout.updater_binary().ends_with(UPDATER_BINARY));
        assert!(layout.app_dir_for(&"1.2.0").ends_with("app-1.2.0"));
    }

    #[test]
    fn installed_app_dirs_only_lists_version_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = AppLayout::new(temp.path().join("MyApp"));
        layout.ensure_dirs().expect("layout dirs should be created");
        std::fs::create_dir(layout.app_dir_for(&"1.0.0")).expect("app dir should be created");
        std::fs::create_dir(layout.app_dir_for(&"1.1.0")).expect("app dir should be created");
        std::fs::write(layout.root().join("app-2.0.0"), b"not a dir")
            .expect("decoy file should be written");

        let mut found: Vec<String> = layout
            .installed_app_dirs()
            .expect("root should be listable")
            .into_iter()
            .map(|(version, _)| version)
            .collect();
        found.sort();

        assert_eq!(found, vec!["1.0.0".to_string(), "1.1.0".to_string()]);
    }
}
