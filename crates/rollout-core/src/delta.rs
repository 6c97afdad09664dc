use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::{self, ArchiveError, METADATA_ENTRY};
use crate::digest::sha256_bytes;
use crate::manifest::{ManifestError, ReleaseEntry, delta_name_for};

const DELTA_MANIFEST_ENTRY: &str = "delta.json";
const PATCH_ENTRY: &str = "patch.bin";

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("cannot diff {base} against {target}: packages differ or are not full releases")]
    IncompatiblePackage { base: String, target: String },
    #[error("failed to apply delta {package}: {reason}")]
    Apply { package: String, reason: String },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DeltaError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    fn apply(package: &Path, reason: impl Into<String>) -> Self {
        Self::Apply {
            package: package.display().to_string(),
            reason: reason.into(),
        }
    }
}

/// Binary diff primitive. Implementations only see bytes; naming, hashing
/// and packaging are handled by [`DeltaCoordinator`].
pub trait DeltaEngine: Send + Sync {
    /// Stable identifier written into every delta package.
    fn name(&self) -> &'static str;

    fn diff(&self, base: &[u8], target: &[u8]) -> Vec<u8>;

    /// # Errors
    /// Returns a description of why `delta` cannot be applied to `base`.
    fn apply(&self, base: &[u8], delta: &[u8]) -> Result<Vec<u8>, String>;
}

/// Byte-wise XOR against the base, with the tail of a longer target stored
/// verbatim. Unchanged regions become zero runs that deflate well.
#[derive(Debug, Default, Clone, Copy)]
pub struct XorDeltaEngine;

impl DeltaEngine for XorDeltaEngine {
    fn name(&self) -> &'static str {
        "xor"
    }

    fn diff(&self, base: &[u8], target: &[u8]) -> Vec<u8> {
        let mut delta = Vec::with_capacity(target.len());
        delta.extend(target.iter().zip(base).map(|(new, old)| new ^ old));
        if target.len() > base.len() {
            delta.extend_from_slice(&target[base.len()..]);
        }
        delta
    }

    fn apply(&self, base: &[u8], delta: &[u8]) -> Result<Vec<u8>, String> {
        let mut target = Vec::with_capacity(delta.len());
        target.extend(delta.iter().zip(base).map(|(patch, old)| patch ^ old));
        if delta.len() > base.len() {
            target.extend_from_slice(&delta[base.len()..]);
        }
        Ok(target)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DeltaHeader {
    base_sha256: String,
    target_sha256: String,
    target_size: u64,
    engine: String,
}

/// Builds and applies delta packages around a [`DeltaEngine`].
#[derive(Clone)]
pub struct DeltaCoordinator {
    engine: Arc<dyn DeltaEngine>,
}

impl Default for DeltaCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(XorDeltaEngine))
    }
}

impl std::fmt::Debug for DeltaCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaCoordinator")
            .field("engine", &self.engine.name())
            .finish()
    }
}

impl DeltaCoordinator {
    #[must_use]
    pub fn new(engine: Arc<dyn DeltaEngine>) -> Self {
        Self { engine }
    }

    /// Diff two full packages of the same package id and write the delta
    /// package into `output_dir`, named after the target with a `-delta`
    /// suffix. Returns the manifest entry for the new file.
    ///
    /// # Errors
    /// Returns [`DeltaError::IncompatiblePackage`] when the inputs belong to
    /// different packages or either one is a delta, and I/O or archive errors
    /// when reading the inputs or writing the output fails.
    pub fn build_delta(
        &self,
        base_full: &Path,
        target_full: &Path,
        output_dir: &Path,
        base_url: Option<&str>,
    ) -> Result<ReleaseEntry, DeltaError> {
        let base = ReleaseEntry::generate_from_file(base_full, None)?;
        let target = ReleaseEntry::generate_from_file(target_full, None)?;
        if base.is_delta() || target.is_delta() || base.package_id() != target.package_id() {
            return Err(DeltaError::IncompatiblePackage {
                base: base.file_name().to_string(),
                target: target.file_name().to_string(),
            });
        }

        let base_bytes = std::fs::read(base_full)
            .map_err(|error| DeltaError::io("failed to read base package", base_full, error))?;
        let target_bytes = std::fs::read(target_full)
            .map_err(|error| DeltaError::io("failed to read target package", target_full, error))?;

        let patch = self.engine.diff(&base_bytes, &target_bytes);
        let header = DeltaHeader {
            base_sha256: base.content_hash().to_string(),
            target_sha256: target.content_hash().to_string(),
            target_size: target.file_size(),
            engine: self.engine.name().to_string(),
        };
        let header = serde_json::to_vec_pretty(&header).map_err(|error| {
            DeltaError::io("failed to encode delta header", target_full, error.into())
        })?;

        // The target's metadata rides along so release notes are readable
        // from the delta alone.
        let metadata = archive::read_entry(target_full, METADATA_ENTRY)?;
        let mut entries = vec![
            (DELTA_MANIFEST_ENTRY, header.as_slice()),
            (PATCH_ENTRY, patch.as_slice()),
        ];
        if let Some(metadata) = &metadata {
            entries.push((METADATA_ENTRY, metadata.as_slice()));
        }

        let output = output_dir.join(delta_name_for(target.file_name()));
        archive::write_entries(&output, &entries)?;

        info!(
            "Built delta {} ({} -> {})",
            output.display(),
            base.version(),
            target.version()
        );
        Ok(ReleaseEntry::generate_from_file(&output, base_url)?)
    }

    /// Rebuild the target full package from `base_full` and a delta package,
    /// writing it to `output_full`. Nothing is written unless the result
    /// matches the target hash and size recorded in the delta.
    ///
    /// # Errors
    /// Returns [`DeltaError::Apply`] for an unreadable or corrupt delta, a
    /// base package that is not the one the delta was built against, or a
    /// result that does not match the recorded target.
    pub fn apply_delta(
        &self,
        base_full: &Path,
        delta_package: &Path,
        output_full: &Path,
    ) -> Result<(), DeltaError> {
        let read = |name: &str| -> Result<Vec<u8>, DeltaError> {
            archive::read_entry(delta_package, name)
                .map_err(|error| DeltaError::apply(delta_package, error.to_string()))?
                .ok_or_else(|| DeltaError::apply(delta_package, format!("missing {name}")))
        };

        let header: DeltaHeader = serde_json::from_slice(&read(DELTA_MANIFEST_ENTRY)?)
            .map_err(|error| DeltaError::apply(delta_package, format!("bad header: {error}")))?;
        if header.engine != self.engine.name() {
            return Err(DeltaError::apply(
                delta_package,
                format!(
                    "built with engine '{}', expected '{}'",
                    header.engine,
                    self.engine.name()
                ),
            ));
        }

        let base_bytes = std::fs::read(base_full)
            .map_err(|error| DeltaError::io("failed to read base package", base_full, error))?;
        let base_hash = sha256_bytes(&base_bytes);
        if !base_hash.eq_ignore_ascii_case(&header.base_sha256) {
            return Err(DeltaError::apply(
                delta_package,
                format!(
                    "base hash {base_hash} does not match expected {}",
                    header.base_sha256
                ),
            ));
        }

        let patch = read(PATCH_ENTRY)?;
        let target = self
            .engine
            .apply(&base_bytes, &patch)
            .map_err(|reason| DeltaError::apply(delta_package, reason))?;

        if target.len() as u64 != header.target_size {
            return Err(DeltaError::apply(
                delta_package,
                format!(
                    "result is {} bytes, expected {}",
                    target.len(),
                    header.target_size
                ),
            ));
        }
        let target_hash = sha256_bytes(&target);
        if !target_hash.eq_ignore_ascii_case(&header.target_sha256) {
            return Err(DeltaError::apply(
                delta_package,
                format!(
                    "result hash {target_hash} does not match expected {}",
                    header.target_sha256
                ),
            ));
        }

        crate::fs::write_atomic(output_full, &target).map_err(|error| {
            DeltaError::io("failed to write rebuilt package", output_full, error)
        })?;
        debug!(
            "Applied {} onto {} -> {}",
            delta_package.display(),
            base_full.display(),
            output_full.display()
        );
        Ok(())
    }
}
