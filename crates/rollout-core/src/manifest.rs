use std::fmt;
use std::path::{Path, PathBuf};

use log::debug;
use semver::Version;
use thiserror::Error;

use crate::digest::{is_sha256_hex, sha256_file};
use crate::version::parse_version;

/// Extension used for every package file.
pub const PACKAGE_EXTENSION: &str = "nupkg";

const DELTA_SUFFIX: &str = "-delta";
const FULL_SUFFIX: &str = "-full";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("malformed manifest line {line}: {reason}")]
    Format { line: usize, reason: String },
    #[error("invalid package file name '{file_name}'")]
    InvalidFileName { file_name: String },
    #[error("duplicate {kind} entry for {package_id} {version}")]
    Duplicate {
        package_id: String,
        version: Version,
        kind: &'static str,
    },
    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ManifestError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    fn format(line: usize, reason: impl Into<String>) -> Self {
        Self::Format {
            line,
            reason: reason.into(),
        }
    }
}

/// Package identity decoded from `{packageId}-{version}[-delta|-full].{ext}`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PackageName {
    package_id: String,
    version: Version,
    is_delta: bool,
}

impl PackageName {
    fn parse(file_name: &str) -> Option<Self> {
        let (stem, extension) = file_name.rsplit_once('.')?;
        if !extension.starts_with(|ch: char| ch.is_ascii_alphabetic()) {
            return None;
        }

        let (stem, is_delta) = match stem.strip_suffix(DELTA_SUFFIX) {
            Some(stem) => (stem, true),
            None => (stem.strip_suffix(FULL_SUFFIX).unwrap_or(stem), false),
        };

        stem.match_indices('-').find_map(|(idx, _)| {
            let (package_id, rest) = (&stem[..idx], &stem[idx + 1..]);
            if package_id.is_empty() || !rest.starts_with(|ch: char| ch.is_ascii_digit()) {
                return None;
            }
            Some(Self {
                package_id: package_id.to_string(),
                version: parse_version(rest)?,
                is_delta,
            })
        })
    }
}

/// One line of the `RELEASES` manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseEntry {
    content_hash: String,
    file_name: String,
    file_size: u64,
    base_url: Option<String>,
    name: PackageName,
}

impl ReleaseEntry {
    /// Build an entry, validating the hash and decoding the file name.
    ///
    /// # Errors
    /// Returns [`ManifestError::InvalidFileName`] when the file name does not
    /// follow the package naming scheme, or [`ManifestError::Format`] for a
    /// hash that is not a hex SHA-256 digest.
    pub fn new(
        content_hash: &str,
        file_name: &str,
        file_size: u64,
        base_url: Option<String>,
    ) -> Result<Self, ManifestError> {
        if !is_sha256_hex(content_hash) {
            return Err(ManifestError::format(
                0,
                format!("'{content_hash}' is not a SHA-256 hex digest"),
            ));
        }
        let name = PackageName::parse(file_name).ok_or_else(|| ManifestError::InvalidFileName {
            file_name: file_name.to_string(),
        })?;

        Ok(Self {
            content_hash: content_hash.to_ascii_lowercase(),
            file_name: file_name.to_string(),
            file_size,
            base_url: base_url.filter(|url| !url.is_empty()).map(|url| {
                if url.ends_with('/') {
                    url
                } else {
                    format!("{url}/")
                }
            }),
            name,
        })
    }

    /// Hash and measure a package file on disk.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or its name is not a
    /// package name.
    pub fn generate_from_file(path: &Path, base_url: Option<&str>) -> Result<Self, ManifestError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ManifestError::InvalidFileName {
                file_name: path.display().to_string(),
            })?;
        let file_size = std::fs::metadata(path)
            .map_err(|error| ManifestError::io("failed to stat package", path, error))?
            .len();
        let content_hash = sha256_file(path)
            .map_err(|error| ManifestError::io("failed to hash package", path, error))?;

        debug!("Generated release entry for {file_name} ({file_size} bytes)");
        Self::new(
            &content_hash,
            file_name,
            file_size,
            base_url.map(str::to_string),
        )
    }

    fn parse_line(line: &str, line_number: usize) -> Result<Self, ManifestError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [hash, location, size] = fields.as_slice() else {
            return Err(ManifestError::format(
                line_number,
                format!("expected 3 fields, found {}", fields.len()),
            ));
        };

        let file_size = size.parse::<u64>().map_err(|_| {
            ManifestError::format(line_number, format!("invalid file size '{size}'"))
        })?;

        let (base_url, file_name) = match location.rfind('/') {
            Some(idx) => (Some(location[..=idx].to_string()), &location[idx + 1..]),
            None => (None, *location),
        };
        if file_name.is_empty() {
            return Err(ManifestError::format(line_number, "missing file name"));
        }

        Self::new(hash, file_name, file_size, base_url).map_err(|error| match error {
            ManifestError::Format { reason, .. } => ManifestError::format(line_number, reason),
            ManifestError::InvalidFileName { file_name } => ManifestError::format(
                line_number,
                format!("'{file_name}' is not a package file name"),
            ),
            other => other,
        })
    }

    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    #[must_use]
    pub fn package_id(&self) -> &str {
        &self.name.package_id
    }

    #[must_use]
    pub fn version(&self) -> &Version {
        &self.name.version
    }

    #[must_use]
    pub fn is_delta(&self) -> bool {
        self.name.is_delta
    }

    /// File name of the full package this entry materializes, so
    /// `app-1.2.0-delta.nupkg` maps to `app-1.2.0-full.nupkg`.
    #[must_use]
    pub fn full_file_name(&self) -> String {
        full_name_for(&self.file_name)
    }

    fn sort_key(&self) -> (&Version, bool, &str, &str) {
        (
            &self.name.version,
            self.name.is_delta,
            &self.name.package_id,
            &self.file_name,
        )
    }
}

impl fmt::Display for ReleaseEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{} {}",
            self.content_hash,
            self.base_url.as_deref().unwrap_or_default(),
            self.file_name,
            self.file_size
        )
    }
}

/// Rewrite a package file name with the given kind suffix, dropping any
/// existing `-full`/`-delta` suffix first.
fn with_kind_suffix(file_name: &str, suffix: &str) -> String {
    let (stem, extension) = file_name
        .rsplit_once('.')
        .unwrap_or((file_name, PACKAGE_EXTENSION));
    let stem = stem
        .strip_suffix(DELTA_SUFFIX)
        .or_else(|| stem.strip_suffix(FULL_SUFFIX))
        .unwrap_or(stem);
    format!("{stem}{suffix}.{extension}")
}

pub(crate) fn full_name_for(file_name: &str) -> String {
    with_kind_suffix(file_name, FULL_SUFFIX)
}

pub(crate) fn delta_name_for(file_name: &str) -> String {
    with_kind_suffix(file_name, DELTA_SUFFIX)
}

/// True for a package file that carries neither a `-full` nor a `-delta`
/// suffix, the form package authors hand to release builds.
pub(crate) fn is_plain_package(file_name: &str) -> bool {
    let Some((stem, extension)) = file_name.rsplit_once('.') else {
        return false;
    };
    extension.eq_ignore_ascii_case(PACKAGE_EXTENSION)
        && !stem.ends_with(DELTA_SUFFIX)
        && !stem.ends_with(FULL_SUFFIX)
}

/// The set of known releases. Entries are kept sorted by version, full
/// before delta, and `(package, version, kind)` is unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ReleaseEntry>,
}

impl Manifest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manifest from entries in any order.
    ///
    /// # Errors
    /// Returns [`ManifestError::Duplicate`] if two entries share package id,
    /// version and kind.
    pub fn from_entries(
        entries: impl IntoIterator<Item = ReleaseEntry>,
    ) -> Result<Self, ManifestError> {
        let mut manifest = Self::new();
        for entry in entries {
            manifest.push(entry)?;
        }
        Ok(manifest)
    }

    /// Parse `RELEASES` text. Blank lines are skipped.
    ///
    /// # Errors
    /// Returns [`ManifestError::Format`] for a malformed line and
    /// [`ManifestError::Duplicate`] for a repeated release.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut manifest = Self::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim_start_matches('\u{feff}').trim();
            if line.is_empty() {
                continue;
            }
            manifest.push(ReleaseEntry::parse_line(line, idx + 1)?)?;
        }
        Ok(manifest)
    }

    /// One line per entry, newline terminated, in the stable sort order.
    #[must_use]
    pub fn serialize(&self) -> String {
        self.entries
            .iter()
            .map(|entry| format!("{entry}\n"))
            .collect()
    }

    /// Read and parse a manifest file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or does not parse.
    pub fn read_from(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path)
            .map_err(|error| ManifestError::io("failed to read manifest", path, error))?;
        Self::parse(&text)
    }

    /// Serialize and atomically replace `path`. On failure the previous file
    /// is left as it was.
    ///
    /// # Errors
    /// Returns an error if the temp file cannot be written or renamed.
    pub fn write_atomic(&self, path: &Path) -> Result<(), ManifestError> {
        crate::fs::write_atomic(path, self.serialize().as_bytes())
            .map_err(|error| ManifestError::io("failed to write manifest", path, error))?;
        debug!("Wrote {} manifest entries to {}", self.len(), path.display());
        Ok(())
    }

    /// Insert an entry at its sorted position.
    ///
    /// # Errors
    /// Returns [`ManifestError::Duplicate`] if an entry of the same package,
    /// version and kind is already present.
    pub fn push(&mut self, entry: ReleaseEntry) -> Result<(), ManifestError> {
        self.ensure_absent(entry.package_id(), entry.version(), entry.is_delta())?;

        let idx = self
            .entries
            .partition_point(|existing| existing.sort_key() <= entry.sort_key());
        self.entries.insert(idx, entry);
        Ok(())
    }

    /// Fail if the manifest already lists this package, version and kind.
    ///
    /// # Errors
    /// Returns [`ManifestError::Duplicate`] for a listed release.
    pub fn ensure_absent(
        &self,
        package_id: &str,
        version: &Version,
        is_delta: bool,
    ) -> Result<(), ManifestError> {
        let listed = self.entries.iter().any(|existing| {
            existing.package_id() == package_id
                && existing.version() == version
                && existing.is_delta() == is_delta
        });
        if listed {
            return Err(ManifestError::Duplicate {
                package_id: package_id.to_string(),
                version: version.clone(),
                kind: if is_delta { "delta" } else { "full" },
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn entries(&self) -> &[ReleaseEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Full entries of one package, oldest first. The items borrow the
    /// manifest only, not `package_id`.
    pub fn full_releases<'a>(
        &'a self,
        package_id: &str,
    ) -> impl Iterator<Item = &'a ReleaseEntry> {
        self.entries
            .iter()
            .filter(move |entry| !entry.is_delta() && entry.package_id() == package_id)
    }

    #[must_use]
    pub fn newest_full(&self, package_id: &str) -> Option<&ReleaseEntry> {
        self.full_releases(package_id).last()
    }

    /// Package id of the first entry, which names the application.
    #[must_use]
    pub fn primary_package_id(&self) -> Option<&str> {
        self.entries.first().map(ReleaseEntry::package_id)
    }
}

#[cfg(test)]
mod tests {
    use semver::Version;

    use super::{Manifest, ManifestError, ReleaseEntry, delta_name_for, full_name_for};

    const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const HASH_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const HASH_C: &str = "cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

    fn entry(hash: &str, name: &str, size: u64) -> ReleaseEntry {
        ReleaseEntry::new(hash, name, size, None).expect("entry should be valid")
    }

    #[test]
    fn derives_identity_from_file_name() {
        let full = entry(HASH_A, "my-app-1.2.0-full.nupkg", 10);
        assert_eq!(full.package_id(), "my-app");
        assert_eq!(full.version(), &Version::new(1, 2, 0));
        assert!(!full.is_delta());

        let delta = entry(HASH_B, "my-app-1.3.0-beta.1-delta.nupkg", 5);
        assert_eq!(delta.package_id(), "my-app");
        assert_eq!(
            delta.version(),
            &Version::parse("1.3.0-beta.1").expect("version")
        );
        assert!(delta.is_delta());

        let plain = entry(HASH_C, "tool2-3.nupkg", 1);
        assert_eq!(plain.package_id(), "tool2");
        assert_eq!(plain.version(), &Version::new(3, 0, 0));
    }

    #[test]
    fn rejects_file_names_without_version() {
        assert!(matches!(
            ReleaseEntry::new(HASH_A, "my-app.nupkg", 1, None),
            Err(ManifestError::InvalidFileName { .. })
        ));
        assert!(matches!(
            ReleaseEntry::new(HASH_A, "my-app-1.0.0", 1, None),
            Err(ManifestError::InvalidFileName { .. })
        ));
    }

    #[test]
    fn parse_reads_base_url_prefix_and_skips_blank_lines() {
        let text = format!(
            "\n{HASH_A} app-1.0.0-full.nupkg 100\n\n{HASH_B} https://cdn.example.com/rel/app-1.1.0-full.nupkg 200\n"
        );
        let manifest = Manifest::parse(&text).expect("manifest should parse");

        assert_eq!(manifest.len(), 2);
        let newest = manifest.newest_full("app").expect("newest full");
        assert_eq!(newest.file_name(), "app-1.1.0-full.nupkg");
        assert_eq!(newest.base_url(), Some("https://cdn.example.com/rel/"));
        assert_eq!(newest.file_size(), 200);
    }

    #[test]
    fn parse_reports_malformed_lines() {
        let cases = [
            format!("{HASH_A} app-1.0.0-full.nupkg"),
            format!("{HASH_A} app-1.0.0-full.nupkg 12 extra"),
            "nothex app-1.0.0-full.nupkg 12".to_string(),
            format!("{HASH_A} app-1.0.0-full.nupkg twelve"),
            format!("{HASH_A} app-full.nupkg 12"),
        ];

        for case in cases {
            let text = format!("{HASH_B} app-0.9.0-full.nupkg 1\n{case}\n");
            assert!(
                matches!(
                    Manifest::parse(&text),
                    Err(ManifestError::Format { line: 2, .. })
                ),
                "line should be rejected: {case}"
            );
        }
    }

    #[test]
    fn parse_rejects_duplicate_full_entries() {
        let text = format!(
            "{HASH_A} app-1.0.0-full.nupkg 10\n{HASH_B} https://mirror/app-1.0.0-full.nupkg 10\n"
        );
        assert!(matches!(
            Manifest::parse(&text),
            Err(ManifestError::Duplicate { kind: "full", .. })
        ));
    }

    #[test]
    fn full_and_delta_of_same_version_may_coexist() {
        let text =
            format!("{HASH_A} app-1.0.0-delta.nupkg 10\n{HASH_B} app-1.0.0-full.nupkg 10\n");
        let manifest = Manifest::parse(&text).expect("manifest should parse");
        assert_eq!(manifest.len(), 2);
    }

    #[test]
    fn full_release_lookup_outlives_the_package_id() {
        let manifest = Manifest::from_entries([
            entry(HASH_A, "app-1.0.0-full.nupkg", 1),
            entry(HASH_B, "app-2.0.0-full.nupkg", 2),
            entry(HASH_C, "app-2.0.0-delta.nupkg", 3),
        ])
        .expect("entries should be unique");

        let (newest, fulls) = {
            let package_id = String::from("app");
            let fulls: Vec<&ReleaseEntry> = manifest.full_releases(&package_id).collect();
            (manifest.newest_full(&package_id), fulls)
        };

        assert_eq!(
            newest.map(ReleaseEntry::file_name),
            Some("app-2.0.0-full.nupkg")
        );
        assert_eq!(fulls.len(), 2);
    }

    #[test]
    fn serialize_orders_by_version_then_full_before_delta() {
        let manifest = Manifest::from_entries([
            entry(HASH_C, "app-2.0.0-delta.nupkg", 3),
            entry(HASH_B, "app-2.0.0-full.nupkg", 2),
            entry(HASH_A, "app-10.0.0-full.nupkg", 1),
            entry(HASH_A, "app-1.0.0-full.nupkg", 1),
        ])
        .expect("entries should be unique");

        let text = manifest.serialize();
        let names: Vec<&str> = text
            .lines()
            .map(|line| line.split(' ').nth(1).expect("file name field"))
            .collect();
        assert_eq!(
            names,
            vec![
                "app-1.0.0-full.nupkg",
                "app-2.0.0-full.nupkg",
                "app-2.0.0-delta.nupkg",
                "app-10.0.0-full.nupkg",
            ]
        );
    }

    #[test]
    fn serialize_then_parse_preserves_entries() {
        let manifest = Manifest::from_entries([
            entry(HASH_B, "app-1.1.0-delta.nupkg", 30),
            ReleaseEntry::new(
                HASH_A,
                "app-1.0.0-full.nupkg",
                1024,
                Some("https://example.com/releases/".to_string()),
            )
            .expect("entry with base url"),
            entry(HASH_C, "app-1.1.0-full.nupkg", 2048),
        ])
        .expect("entries should be unique");

        let reparsed = Manifest::parse(&manifest.serialize()).expect("round trip should parse");
        assert_eq!(reparsed, manifest);
        assert_eq!(reparsed.serialize(), manifest.serialize());
    }

    #[test]
    fn generate_from_file_hashes_contents() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("app-1.0.0-delta.nupkg");
        std::fs::write(&path, b"abc").expect("package should be written");

        let generated = ReleaseEntry::generate_from_file(&path, Some("https://host/pkgs/"))
            .expect("entry should be generated");

        assert_eq!(
            generated.content_hash(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(generated.file_size(), 3);
        assert!(generated.is_delta());
        assert_eq!(generated.base_url(), Some("https://host/pkgs/"));
    }

    #[test]
    fn write_atomic_then_read_from_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("RELEASES");
        let manifest = Manifest::from_entries([entry(HASH_A, "app-1.0.0-full.nupkg", 7)])
            .expect("entries should be unique");

        manifest.write_atomic(&path).expect("manifest should be written");

        assert_eq!(
            Manifest::read_from(&path).expect("manifest should be read"),
            manifest
        );
    }

    #[test]
    fn kind_suffix_rewrites() {
        assert_eq!(full_name_for("app-1.0.0.nupkg"), "app-1.0.0-full.nupkg");
        assert_eq!(full_name_for("app-1.0.0-delta.nupkg"), "app-1.0.0-full.nupkg");
        assert_eq!(delta_name_for("app-1.0.0-full.nupkg"), "app-1.0.0-delta.nupkg");
        assert!(super::is_plain_package("app-1.0.0.nupkg"));
        assert!(!super::is_plain_package("app-1.0.0-full.nupkg"));
        assert!(!super::is_plain_package("notes.txt"));
    }
}
