use async_trait::async_trait;
use std::path::Path;

use crate::error::HostError;
use crate::types::{InstallMetadata, ShortcutLocation};

#[async_trait]
pub trait ShortcutManager: Send + Sync {
    async fn create_shortcuts(
        &self,
        executable: &Path,
        locations: &[ShortcutLocation],
        metadata: &InstallMetadata,
    ) -> Result<(), HostError>;

    async fn remove_shortcuts(
        &self,
        executable: &Path,
        locations: &[ShortcutLocation],
        metadata: &InstallMetadata,
    ) -> Result<(), HostError>;
}

#[async_trait]
pub trait UninstallRegistry: Send + Sync {
    /// Create or refresh the uninstall entry for an installed application.
    async fn register(&self, metadata: &InstallMetadata) -> Result<(), HostError>;

    async fn unregister(&self, app_name: &str) -> Result<(), HostError>;
}

pub trait ProcessLauncher: Send + Sync {
    /// Start `executable` detached from the updater.
    fn launch(&self, executable: &Path, arguments: &str) -> Result<(), HostError>;
}
