use async_trait::async_trait;
use log::{debug, info};
use std::path::Path;

use rollout_platform::HideWindow;

use crate::error::HostError;
use crate::traits::{ProcessLauncher, ShortcutManager, UninstallRegistry};
use crate::types::{InstallMetadata, ShortcutLocation};

/// Shell integration for platforms without shortcuts or an uninstall
/// registry. Every request is logged and accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullShellIntegration;

#[async_trait]
impl ShortcutManager for NullShellIntegration {
    async fn create_shortcuts(
        &self,
        executable: &Path,
        locations: &[ShortcutLocation],
        metadata: &InstallMetadata,
    ) -> Result<(), HostError> {
        info!(
            "Skipping shortcut creation for {} ({}) at {locations:?}",
            executable.display(),
            metadata.app_name
        );
        Ok(())
    }

    async fn remove_shortcuts(
        &self,
        executable: &Path,
        locations: &[ShortcutLocation],
        metadata: &InstallMetadata,
    ) -> Result<(), HostError> {
        info!(
            "Skipping shortcut removal for {} ({}) at {locations:?}",
            executable.display(),
            metadata.app_name
        );
        Ok(())
    }
}

#[async_trait]
impl UninstallRegistry for NullShellIntegration {
    async fn register(&self, metadata: &InstallMetadata) -> Result<(), HostError> {
        info!(
            "Skipping uninstall registration for {} {}",
            metadata.app_name, metadata.version
        );
        Ok(())
    }

    async fn unregister(&self, app_name: &str) -> Result<(), HostError> {
        info!("Skipping uninstall deregistration for {app_name}");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessLauncher;

impl ProcessLauncher for SystemProcessLauncher {
    fn launch(&self, executable: &Path, arguments: &str) -> Result<(), HostError> {
        let args = shell_words::split(arguments).map_err(|error| HostError::InvalidArguments {
            details: error.to_string(),
        })?;

        debug!("Launching {} {}", executable.display(), args.join(" "));
        let mut cmd = std::process::Command::new(executable);
        cmd.args(&args);
        if let Some(dir) = executable.parent() {
            cmd.current_dir(dir);
        }
        cmd.hide_window()
            .spawn()
            .map(drop)
            .map_err(|error| HostError::Launch {
                path: executable.display().to_string(),
                message: error.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{NullShellIntegration, SystemProcessLauncher};
    use crate::{HostError, InstallMetadata, ProcessLauncher, UninstallRegistry};

    #[test]
    fn launcher_rejects_unbalanced_quotes() {
        let result = SystemProcessLauncher.launch(Path::new("app"), "--flag \"unterminated");
        assert!(matches!(result, Err(HostError::InvalidArguments { .. })));
    }

    #[test]
    fn launcher_reports_missing_executable() {
        let result = SystemProcessLauncher.launch(Path::new("/definitely/not/here/app"), "");
        assert!(matches!(result, Err(HostError::Launch { .. })));
    }

    #[tokio::test]
    async fn null_registry_accepts_registration() {
        let metadata = InstallMetadata {
            app_name: "MyApp".to_string(),
            display_name: "My App".to_string(),
            version: "1.0.0".to_string(),
            publisher: None,
            install_dir: PathBuf::from("/apps/MyApp"),
            updater_path: PathBuf::from("/apps/MyApp/Update"),
        };

        assert!(NullShellIntegration.register(&metadata).await.is_ok());
        assert!(NullShellIntegration.unregister("MyApp").await.is_ok());
    }
}
