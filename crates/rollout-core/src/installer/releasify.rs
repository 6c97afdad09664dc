use std::path::{Path, PathBuf};

use log::{info, warn};
use reqwest::Url;

use super::{InstallerAssembler, InstallerError, SigningOptions};
use crate::archive;
use crate::manifest::{Manifest, ReleaseEntry, full_name_for, is_plain_package};
use crate::package::PackageMetadata;
use crate::selector::select_previous;

const RELEASES_FILE: &str = "RELEASES";
const SETUP_FILE: &str = "Setup.exe";

/// Inputs of one release build.
#[derive(Debug, Clone, Default)]
pub struct ReleasifyRequest {
    /// The new package, plain (`app-1.2.0.nupkg`) or already `-full`.
    pub package: PathBuf,
    pub release_dir: PathBuf,
    pub updater_binary: PathBuf,
    /// Bootstrapper stub copied to the setup output before embedding.
    pub bootstrapper_template: PathBuf,
    /// Defaults to `Setup.exe` in the release directory.
    pub setup_output: Option<PathBuf>,
    pub base_url: Option<String>,
    pub signing: Option<SigningOptions>,
    pub loading_gif: Option<PathBuf>,
    pub icon: Option<PathBuf>,
    pub skip_version_stamp: bool,
}

#[derive(Debug, Clone)]
pub struct ReleasifyReport {
    pub full_entry: ReleaseEntry,
    pub delta_entry: Option<ReleaseEntry>,
    pub manifest_path: PathBuf,
    pub setup_path: PathBuf,
    /// False when embedding failed and the bootstrapper kept its old payload.
    pub payload_embedded: bool,
}

fn normalize_base_url(value: &str) -> Result<String, InstallerError> {
    let invalid = |reason: String| InstallerError::InvalidBaseUrl {
        value: value.to_string(),
        reason,
    };
    let url = Url::parse(value).map_err(|error| invalid(error.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("must be an http or https URL".to_string()));
    }
    Ok(if value.ends_with('/') {
        value.to_string()
    } else {
        format!("{value}/")
    })
}

impl InstallerAssembler {
    /// Add a package to a release directory and rebuild its setup
    /// bootstrapper.
    ///
    /// The package becomes a `-full` package (with its executables signed
    /// when signing is requested), a delta against the previous full release
    /// is built when one exists, the manifest is rewritten, plain package
    /// files are removed and the bootstrapper is embedded with the newest
    /// full release, stamped and signed. A failed embed is logged and the
    /// build continues; a failed signature aborts it.
    ///
    /// A version the manifest already lists is rejected before anything in
    /// the release directory is written.
    ///
    /// # Errors
    /// Returns an error for an invalid base URL, a delta or already released
    /// package, a manifest, staging or delta failure, version stamping that
    /// keeps failing, and any signing failure.
    pub async fn releasify(
        &self,
        request: &ReleasifyRequest,
    ) -> Result<ReleasifyReport, InstallerError> {
        let base_url = request
            .base_url
            .as_deref()
            .map(normalize_base_url)
            .transpose()?;
        let release_dir = &request.release_dir;
        let manifest_path = release_dir.join(RELEASES_FILE);
        let mut manifest = if manifest_path.exists() {
            Manifest::read_from(&manifest_path)?
        } else {
            Manifest::new()
        };

        let incoming = incoming_package(&request.package)?;
        manifest.ensure_absent(incoming.package_id(), incoming.version(), false)?;
        manifest.ensure_absent(incoming.package_id(), incoming.version(), true)?;
        let payload_release = newer_release_on_disk(&manifest, &incoming, release_dir)?;

        std::fs::create_dir_all(release_dir).map_err(|error| {
            InstallerError::io("failed to create release directory", release_dir, error)
        })?;
        let full_path = self
            .prepare_full_package(&request.package, release_dir, request.signing.as_ref())
            .await?;

        let full_entry = ReleaseEntry::generate_from_file(&full_path, base_url.as_deref())?;
        let delta_entry = match select_previous(&manifest, &full_entry) {
            Some(previous) => {
                let base = release_dir.join(previous.file_name());
                if base.exists() {
                    Some(self.deltas.build_delta(
                        &base,
                        &full_path,
                        release_dir,
                        base_url.as_deref(),
                    )?)
                } else {
                    warn!(
                        "Previous release {} is not in {}, skipping delta",
                        previous.file_name(),
                        release_dir.display()
                    );
                    None
                }
            }
            None => None,
        };

        manifest.push(full_entry.clone())?;
        if let Some(delta) = &delta_entry {
            manifest.push(delta.clone())?;
        }
        manifest.write_atomic(&manifest_path)?;
        remove_plain_packages(release_dir)?;

        let (payload_path, payload_entry) = match payload_release {
            Some(newer) => (release_dir.join(newer.file_name()), newer),
            None => (full_path, full_entry.clone()),
        };
        let setup_path = request
            .setup_output
            .clone()
            .unwrap_or_else(|| release_dir.join(SETUP_FILE));
        let payload_embedded = self
            .build_bootstrapper(request, &payload_path, &payload_entry, &setup_path)
            .await?;

        info!(
            "Released {} ({} manifest entries) into {}, setup carries {}",
            full_entry.file_name(),
            manifest.len(),
            release_dir.display(),
            payload_entry.version()
        );
        Ok(ReleasifyReport {
            full_entry,
            delta_entry,
            manifest_path,
            setup_path,
            payload_embedded,
        })
    }

    /// Copy or convert the input package into `<id>-<version>-full.nupkg`
    /// inside the release directory.
    async fn prepare_full_package(
        &self,
        package: &Path,
        release_dir: &Path,
        signing: Option<&SigningOptions>,
    ) -> Result<PathBuf, InstallerError> {
        let file_name = package_file_name(package)?;
        let full_path = release_dir.join(full_name_for(file_name));
        match signing {
            Some(signing) => {
                let contents = tempfile::Builder::new()
                    .prefix("rollout-sign-")
                    .tempdir()
                    .map_err(|error| {
                        InstallerError::staging("failed to create signing directory", package, error)
                    })?;
                archive::extract_zip(package, contents.path())?;
                self.sign_executables_in(contents.path(), signing).await?;
                archive::zip_directory(contents.path(), &full_path)?;
            }
            None => {
                let already_in_place = matches!(
                    (package.canonicalize(), full_path.canonicalize()),
                    (Ok(source), Ok(dest)) if source == dest
                );
                if !already_in_place {
                    std::fs::copy(package, &full_path).map_err(|error| {
                        InstallerError::io("failed to copy package", &full_path, error)
                    })?;
                }
            }
        }
        Ok(full_path)
    }

    /// Create the setup bootstrapper. Returns whether the payload was
    /// embedded.
    async fn build_bootstrapper(
        &self,
        request: &ReleasifyRequest,
        full_path: &Path,
        full_entry: &ReleaseEntry,
        setup_path: &Path,
    ) -> Result<bool, InstallerError> {
        let payload = self
            .build_payload_zip(
                full_path,
                &request.updater_binary,
                request.loading_gif.as_deref(),
                request.signing.as_ref(),
            )
            .await?;

        std::fs::copy(&request.bootstrapper_template, setup_path).map_err(|error| {
            InstallerError::staging(
                "failed to copy bootstrapper",
                &request.bootstrapper_template,
                error,
            )
        })?;

        let payload_embedded = match self.embed_payload(setup_path, &payload) {
            Ok(()) => true,
            Err(error) => {
                warn!("Continuing without embedded payload: {error}");
                false
            }
        };

        if request.skip_version_stamp {
            info!("Skipping version stamping of {}", setup_path.display());
        } else {
            let metadata = PackageMetadata::read(full_path, full_entry)?;
            self.stamp_version_metadata(setup_path, &metadata, request.icon.as_deref())
                .await?;
        }

        self.sign_final_bootstrapper(setup_path, request.signing.as_ref())
            .await?;
        Ok(payload_embedded)
    }
}

fn package_file_name(package: &Path) -> Result<&str, InstallerError> {
    package
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| InstallerError::InvalidPackage {
            file_name: package.display().to_string(),
            reason: "path has no file name".to_string(),
        })
}

/// Identity of the package being released. Delta packages are refused.
fn incoming_package(package: &Path) -> Result<ReleaseEntry, InstallerError> {
    let file_name = package_file_name(package)?;
    let entry = ReleaseEntry::generate_from_file(package, None)?;
    if entry.is_delta() {
        return Err(InstallerError::InvalidPackage {
            file_name: file_name.to_string(),
            reason: "delta packages cannot be released directly".to_string(),
        });
    }
    Ok(entry)
}

/// The listed full release newer than `incoming`, if any. The setup must
/// carry it instead of the incoming package, so its file has to be present.
fn newer_release_on_disk(
    manifest: &Manifest,
    incoming: &ReleaseEntry,
    release_dir: &Path,
) -> Result<Option<ReleaseEntry>, InstallerError> {
    let Some(newest) = manifest
        .newest_full(incoming.package_id())
        .filter(|newest| newest.version() > incoming.version())
    else {
        return Ok(None);
    };
    if !release_dir.join(newest.file_name()).is_file() {
        return Err(InstallerError::InvalidPackage {
            file_name: newest.file_name().to_string(),
            reason: format!(
                "newest release is listed but missing from {}",
                release_dir.display()
            ),
        });
    }
    Ok(Some(newest.clone()))
}

fn remove_plain_packages(release_dir: &Path) -> Result<(), InstallerError> {
    let entries = std::fs::read_dir(release_dir).map_err(|error| {
        InstallerError::io("failed to list release directory", release_dir, error)
    })?;
    for entry in entries {
        let entry = entry.map_err(|error| {
            InstallerError::io("failed to list release directory", release_dir, error)
        })?;
        let name = entry.file_name();
        if name.to_str().is_some_and(is_plain_package) && entry.path().is_file() {
            std::fs::remove_file(entry.path()).map_err(|error| {
                InstallerError::io("failed to remove plain package", &entry.path(), error)
            })?;
            info!("Removed superseded package {}", entry.path().display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::normalize_base_url;

    #[test]
    fn base_url_gets_trailing_slash() {
        assert_eq!(
            normalize_base_url("https://cdn.example.com/app").expect("valid"),
            "https://cdn.example.com/app/"
        );
        assert_eq!(
            normalize_base_url("http://cdn.example.com/").expect("valid"),
            "http://cdn.example.com/"
        );
    }

    #[test]
    fn base_url_must_be_http() {
        assert!(normalize_base_url("ftp://cdn.example.com/app").is_err());
        assert!(normalize_base_url("not a url").is_err());
    }
}
