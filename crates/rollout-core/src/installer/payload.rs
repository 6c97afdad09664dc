use std::path::Path;

use log::{debug, info};
use rollout_platform::UPDATER_BINARY;
use tempfile::TempPath;

use super::{InstallerAssembler, InstallerError, SigningOptions};
use crate::archive;
use crate::manifest::{Manifest, ReleaseEntry};

const RELEASES_FILE: &str = "RELEASES";
const LOADING_GIF: &str = "background.gif";

impl InstallerAssembler {
    /// Stage the updater binary, the full package, a one-entry manifest and
    /// the optional loading animation, sign the executables when asked, and
    /// zip the result. The staging directory is removed on every path; the
    /// returned zip is deleted when the [`TempPath`] is dropped.
    ///
    /// The zip only depends on the input bytes, so identical inputs give
    /// identical archives.
    ///
    /// # Errors
    /// Returns [`InstallerError::Staging`] when a file cannot be copied into
    /// the staging directory, and signing or archive errors from later steps.
    pub async fn build_payload_zip(
        &self,
        full_package: &Path,
        updater_binary: &Path,
        loading_gif: Option<&Path>,
        signing: Option<&SigningOptions>,
    ) -> Result<TempPath, InstallerError> {
        let staging = tempfile::Builder::new()
            .prefix("rollout-payload-")
            .tempdir()
            .map_err(|error| {
                InstallerError::staging("failed to create staging directory", &std::env::temp_dir(), error)
            })?;
        let dir = staging.path();

        copy_into(updater_binary, &dir.join(UPDATER_BINARY))?;

        let package_name = full_package.file_name().ok_or_else(|| {
            InstallerError::staging(
                "package path has no file name",
                full_package,
                std::io::ErrorKind::InvalidInput.into(),
            )
        })?;
        let staged_package = dir.join(package_name);
        copy_into(full_package, &staged_package)?;

        let entry = ReleaseEntry::generate_from_file(&staged_package, None)?;
        Manifest::from_entries([entry])?.write_atomic(&dir.join(RELEASES_FILE))?;

        if let Some(gif) = loading_gif {
            copy_into(gif, &dir.join(LOADING_GIF))?;
        }

        if let Some(signing) = signing {
            self.sign_executables_in(dir, signing).await?;
        }

        let zip_path = tempfile::Builder::new()
            .prefix("rollout-payload-")
            .suffix(".zip")
            .tempfile()
            .map_err(|error| {
                InstallerError::staging("failed to create payload zip", &std::env::temp_dir(), error)
            })?
            .into_temp_path();
        archive::zip_directory(dir, &zip_path)?;

        info!(
            "Built setup payload {} from {}",
            zip_path.display(),
            full_package.display()
        );
        Ok(zip_path)
    }
}

fn copy_into(source: &Path, dest: &Path) -> Result<(), InstallerError> {
    std::fs::copy(source, dest)
        .map_err(|error| InstallerError::staging("failed to copy", source, error))?;
    debug!("Staged {} as {}", source.display(), dest.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::tests::{RecordingTools, assembler};
    use super::super::{InstallerError, SigningOptions};
    use crate::archive::tests::write_zip;

    fn inputs(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let package = dir.join("app-1.0.0-full.nupkg");
        write_zip(&package, &[("lib/net45/app.exe", b"app")]);
        let updater = dir.join("Update.exe");
        std::fs::write(&updater, b"updater binary").expect("updater written");
        (package, updater)
    }

    #[tokio::test]
    async fn payload_contains_updater_package_and_manifest() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (package, updater) = inputs(temp.path());
        let tools = Arc::new(RecordingTools::default());

        let zip = assembler(&tools)
            .build_payload_zip(&package, &updater, None, None)
            .await
            .expect("payload should build");

        let out = temp.path().join("out");
        crate::archive::extract_zip(&zip, &out).expect("payload should extract");
        assert_eq!(
            std::fs::read(out.join(rollout_platform::UPDATER_BINARY)).expect("updater"),
            b"updater binary"
        );
        assert!(out.join("app-1.0.0-full.nupkg").exists());
        let manifest =
            crate::manifest::Manifest::read_from(&out.join("RELEASES")).expect("manifest");
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.entries()[0].file_name(), "app-1.0.0-full.nupkg");
    }

    #[tokio::test]
    async fn signing_runs_once_per_executable() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (package, _) = inputs(temp.path());
        let updater = temp.path().join("Updater.exe");
        std::fs::write(&updater, b"updater").expect("updater written");
        let tools = Arc::new(RecordingTools::default());
        let signing = SigningOptions {
            parameters: "/a".to_string(),
        };

        assembler(&tools)
            .build_payload_zip(&package, &updater, None, Some(&signing))
            .await
            .expect("payload should build");

        let executables = tools
            .calls_to("signtool")
            .iter()
            .filter(|args| args.last().is_some_and(|file| file.ends_with(".exe")))
            .count();
        let expected = usize::from(rollout_platform::UPDATER_BINARY.ends_with(".exe"));
        assert_eq!(executables, expected);
    }

    #[tokio::test]
    async fn missing_input_is_a_staging_error() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (package, _) = inputs(temp.path());
        let tools = Arc::new(RecordingTools::default());

        let error = assembler(&tools)
            .build_payload_zip(&package, &temp.path().join("missing"), None, None)
            .await
            .expect_err("missing updater should fail");
        assert!(matches!(error, InstallerError::Staging { .. }));
    }
}
