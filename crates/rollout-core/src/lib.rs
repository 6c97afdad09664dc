//! Release manifest and update pipeline for rollout.
//!
//! This crate holds everything between the CLI and the operating system:
//! - The `RELEASES` manifest model and its text format.
//! - Package selection (delta or full) for an installed version.
//! - Delta package construction and application around an opaque engine.
//! - The check, download and apply pipeline with its delta-to-full fallback.
//! - Assembly of the self-extracting setup bootstrapper.
//! - Replacement of an installed updater binary by the running one.

pub mod archive;
mod delta;
mod digest;
mod fs;
pub mod installer;
mod manifest;
mod package;
mod pipeline;
mod progress;
mod selector;
pub mod self_update;
pub mod tools;
mod version;

/// Delta engine contract and the coordinator that names and applies deltas.
pub use delta::{DeltaCoordinator, DeltaEngine, DeltaError, XorDeltaEngine};
/// Lowercase hex SHA-256 helpers used for manifest content hashes.
pub use digest::{sha256_bytes, sha256_file};
/// Manifest model, entry type and text format.
pub use manifest::{Manifest, ManifestError, PACKAGE_EXTENSION, ReleaseEntry};
/// Package metadata carried inside full packages.
pub use package::PackageMetadata;
/// Update pipeline, retry policy and staged downloads.
pub use pipeline::{
    DeltaPolicy, FALLBACK_ATTEMPTS, PipelineError, ReleaseSource, StagedPackage, UpdateManager,
    UpdateOutcome, UpdateSteps, manifest_in_directory, update_with_fallback,
};
/// Progress reporting in 0-100 steps.
pub use progress::Progress;
/// Previous-release lookup and update planning.
pub use selector::{SelectError, UpdateInfo, plan_update, select_previous};
/// Lenient semantic version parsing.
pub use version::parse_version;
