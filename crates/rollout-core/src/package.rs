use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::archive::{self, ArchiveError, METADATA_ENTRY};
use crate::manifest::ReleaseEntry;

/// Descriptive fields of a full package, used for version stamping and the
/// uninstall registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageMetadata {
    pub id: String,
    pub version: String,
    pub authors: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub release_notes: Option<String>,
}

impl PackageMetadata {
    /// Metadata derived from the package file name alone.
    #[must_use]
    pub fn from_entry(entry: &ReleaseEntry) -> Self {
        Self {
            id: entry.package_id().to_string(),
            version: entry.version().to_string(),
            ..Self::default()
        }
    }

    /// Read `metadata.json` from a package, filling gaps from the file name.
    /// A missing or unparsable metadata file is not an error.
    ///
    /// # Errors
    /// Returns an error when the package itself cannot be opened.
    pub fn read(package: &Path, entry: &ReleaseEntry) -> Result<Self, ArchiveError> {
        let fallback = Self::from_entry(entry);
        let Some(data) = archive::read_entry(package, METADATA_ENTRY)? else {
            return Ok(fallback);
        };

        match serde_json::from_slice::<Self>(&data) {
            Ok(mut metadata) => {
                if metadata.id.is_empty() {
                    metadata.id = fallback.id;
                }
                if metadata.version.is_empty() {
                    metadata.version = fallback.version;
                }
                Ok(metadata)
            }
            Err(error) => {
                debug!("Ignoring unreadable package metadata in {}: {error}", package.display());
                Ok(fallback)
            }
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }

    #[must_use]
    pub fn description_or_default(&self) -> &str {
        self.description
            .as_deref()
            .or(self.summary.as_deref())
            .unwrap_or_else(|| self.display_name())
    }

    #[must_use]
    pub fn company(&self) -> &str {
        self.authors.as_deref().unwrap_or(&self.id)
    }
}
