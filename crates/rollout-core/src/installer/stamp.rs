use std::path::Path;

use log::{info, warn};

use super::{InstallerAssembler, InstallerError};
use crate::package::PackageMetadata;
use crate::tools::RESOURCE_TOOL;

fn stamp_args(
    bootstrapper: &Path,
    metadata: &PackageMetadata,
    icon: Option<&Path>,
) -> Vec<String> {
    let mut args = vec![bootstrapper.display().to_string()];
    for (key, value) in [
        ("CompanyName", metadata.company()),
        ("FileDescription", metadata.description_or_default()),
        ("ProductName", metadata.display_name()),
    ] {
        args.extend([
            "--set-version-string".to_string(),
            key.to_string(),
            value.to_string(),
        ]);
    }
    args.extend([
        "--set-file-version".to_string(),
        metadata.version.clone(),
        "--set-product-version".to_string(),
        metadata.version.clone(),
    ]);
    if let Some(icon) = icon {
        args.extend(["--set-icon".to_string(), icon.display().to_string()]);
    }
    args
}

impl InstallerAssembler {
    /// Set the version strings, file and product versions and optionally the
    /// icon of the bootstrapper from package metadata. The tool is retried
    /// with the configured delays because it can briefly fail to lock a file
    /// that was just written.
    ///
    /// # Errors
    /// Returns [`InstallerError::ToolFailed`] once every attempt has failed.
    pub async fn stamp_version_metadata(
        &self,
        bootstrapper: &Path,
        metadata: &PackageMetadata,
        icon: Option<&Path>,
    ) -> Result<(), InstallerError> {
        let args = stamp_args(bootstrapper, metadata, icon);
        let mut delays = self.stamp_retry_delays.iter();

        loop {
            let failure = match self.tools.invoke(RESOURCE_TOOL, &args).await {
                Ok(output) if output.success() => {
                    info!(
                        "Stamped {} with version {}",
                        bootstrapper.display(),
                        metadata.version
                    );
                    return Ok(());
                }
                Ok(output) => InstallerError::ToolFailed {
                    tool: RESOURCE_TOOL,
                    exit_code: output.exit_code,
                    output: output.output.trim().to_string(),
                },
                Err(error) => InstallerError::ToolFailed {
                    tool: RESOURCE_TOOL,
                    exit_code: -1,
                    output: error.to_string(),
                },
            };

            let Some(delay) = delays.next() else {
                return Err(failure);
            };
            warn!("Version stamping failed, retrying in {delay:?}: {failure}");
            tokio::time::sleep(*delay).await;
        }
    }
}
