//! Release authoring: full and delta packages, the release manifest and the
//! self-extracting setup bootstrapper.

mod payload;
mod releasify;
mod resource;
mod stamp;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use log::{debug, info};
use thiserror::Error;

use crate::archive::ArchiveError;
use crate::delta::{DeltaCoordinator, DeltaError};
use crate::manifest::ManifestError;
use crate::tools::{SIGN_TOOL, ToolRunner};

pub use releasify::{ReleasifyReport, ReleasifyRequest};
#[cfg(windows)]
pub use resource::Win32ResourceEditor;
pub use resource::{
    ResourceEditor, ResourceError, ResourceSession, ResourceSlot, SETUP_PAYLOAD,
    TrailerResourceEditor, default_editor, read_trailer_resource,
};

/// Delays between version stamping attempts.
pub const DEFAULT_STAMP_RETRY_DELAYS: [Duration; 4] = [
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
];

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("staging failed, {context} {}: {source}", path.display())]
    Staging {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    ResourceEdit(#[from] ResourceError),
    #[error("signing {} failed: {output}", path.display())]
    Signing { path: PathBuf, output: String },
    #[error("{tool} exited with code {exit_code}: {output}")]
    ToolFailed {
        tool: &'static str,
        exit_code: i32,
        output: String,
    },
    #[error("invalid base URL '{value}': {reason}")]
    InvalidBaseUrl { value: String, reason: String },
    #[error("cannot release {file_name}: {reason}")]
    InvalidPackage { file_name: String, reason: String },
    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl InstallerError {
    fn staging(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Staging {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Parameters passed to the signing tool before the file path, as one
/// shell-style string such as `/a /f cert.pfx /p secret`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningOptions {
    pub parameters: String,
}

impl SigningOptions {
    fn args_for(&self, file: &Path) -> Result<Vec<String>, InstallerError> {
        let mut args = vec!["sign".to_string()];
        args.extend(shell_words::split(&self.parameters).map_err(|error| {
            InstallerError::Signing {
                path: file.to_path_buf(),
                output: format!("invalid signing parameters: {error}"),
            }
        })?);
        args.push(file.display().to_string());
        Ok(args)
    }
}

/// Builds setup bootstrappers and release directories.
pub struct InstallerAssembler {
    tools: Arc<dyn ToolRunner>,
    resources: Arc<dyn ResourceEditor>,
    deltas: DeltaCoordinator,
    stamp_retry_delays: Vec<Duration>,
}

impl InstallerAssembler {
    #[must_use]
    pub fn new(tools: Arc<dyn ToolRunner>, resources: Arc<dyn ResourceEditor>) -> Self {
        Self {
            tools,
            resources,
            deltas: DeltaCoordinator::default(),
            stamp_retry_delays: DEFAULT_STAMP_RETRY_DELAYS.to_vec(),
        }
    }

    #[must_use]
    pub fn with_delta_coordinator(mut self, deltas: DeltaCoordinator) -> Self {
        self.deltas = deltas;
        self
    }

    #[must_use]
    pub fn with_stamp_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.stamp_retry_delays = delays;
        self
    }

    /// Write the payload zip into the bootstrapper's [`SETUP_PAYLOAD`] slot.
    ///
    /// # Errors
    /// Returns [`InstallerError::ResourceEdit`] when the resources cannot be
    /// opened, written or committed, and an I/O error when the zip cannot be
    /// read.
    pub fn embed_payload(&self, bootstrapper: &Path, zip_path: &Path) -> Result<(), InstallerError> {
        let data = std::fs::read(zip_path)
            .map_err(|error| InstallerError::io("failed to read payload zip", zip_path, error))?;

        let mut session = self.resources.begin(bootstrapper)?;
        session.update(SETUP_PAYLOAD, &data)?;
        session.commit()?;

        info!(
            "Embedded {} byte payload into {}",
            data.len(),
            bootstrapper.display()
        );
        Ok(())
    }

    /// Sign the finished bootstrapper. Without signing options this does
    /// nothing.
    ///
    /// # Errors
    /// Returns [`InstallerError::Signing`] when the signing tool cannot run
    /// or exits nonzero.
    pub async fn sign_final_bootstrapper(
        &self,
        bootstrapper: &Path,
        signing: Option<&SigningOptions>,
    ) -> Result<(), InstallerError> {
        let Some(signing) = signing else {
            debug!("No signing options, leaving {} unsigned", bootstrapper.display());
            return Ok(());
        };
        self.sign_file(bootstrapper, signing).await
    }

    async fn sign_file(&self, file: &Path, signing: &SigningOptions) -> Result<(), InstallerError> {
        let args = signing.args_for(file)?;
        let output = self
            .tools
            .invoke(SIGN_TOOL, &args)
            .await
            .map_err(|error| InstallerError::Signing {
                path: file.to_path_buf(),
                output: error.to_string(),
            })?;

        if !output.success() {
            return Err(InstallerError::Signing {
                path: file.to_path_buf(),
                output: format!("exit code {}: {}", output.exit_code, output.output.trim()),
            });
        }
        info!("Signed {}", file.display());
        Ok(())
    }

    /// Sign every `.exe` directly inside or below `dir`, one tool run per
    /// file, concurrently.
    async fn sign_executables_in(
        &self,
        dir: &Path,
        signing: &SigningOptions,
    ) -> Result<(), InstallerError> {
        let executables = find_executables(dir)?;
        try_join_all(
            executables
                .iter()
                .map(|file| self.sign_file(file, signing)),
        )
        .await?;
        Ok(())
    }
}

fn find_executables(dir: &Path) -> Result<Vec<PathBuf>, InstallerError> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current)
            .map_err(|error| InstallerError::io("failed to list directory", &current, error))?;
        for entry in entries {
            let entry = entry
                .map_err(|error| InstallerError::io("failed to list directory", &current, error))?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
            {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::{InstallerAssembler, InstallerError, SigningOptions, TrailerResourceEditor};
    use crate::tools::{ToolOutput, ToolRunner};

    /// Records every call and answers with a fixed exit code per tool.
    #[derive(Default)]
    pub(crate) struct RecordingTools {
        pub(crate) calls: Mutex<Vec<(String, Vec<String>)>>,
        pub(crate) failing: Mutex<Vec<(String, usize)>>,
    }

    impl RecordingTools {
        /// Make the next `times` runs of `tool` exit with code 1.
        pub(crate) fn fail(&self, tool: &str, times: usize) {
            self.failing
                .lock()
                .expect("lock")
                .push((tool.to_string(), times));
        }

        pub(crate) fn calls_to(&self, tool: &str) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .expect("lock")
                .iter()
                .filter(|(name, _)| name == tool)
                .map(|(_, args)| args.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ToolRunner for RecordingTools {
        async fn invoke(&self, tool: &str, args: &[String]) -> std::io::Result<ToolOutput> {
            self.calls
                .lock()
                .expect("lock")
                .push((tool.to_string(), args.to_vec()));
            let mut failing = self.failing.lock().expect("lock");
            let fail = failing
                .iter_mut()
                .find(|(name, remaining)| name == tool && *remaining > 0)
                .map(|(_, remaining)| *remaining -= 1)
                .is_some();
            Ok(ToolOutput {
                exit_code: i32::from(fail),
                output: if fail { "locked".to_string() } else { String::new() },
            })
        }
    }

    pub(crate) fn assembler(tools: &Arc<RecordingTools>) -> InstallerAssembler {
        InstallerAssembler::new(tools.clone(), Arc::new(TrailerResourceEditor))
            .with_stamp_retry_delays(vec![std::time::Duration::ZERO; 2])
    }

    fn signing() -> SigningOptions {
        SigningOptions {
            parameters: "/a /f \"my cert.pfx\"".to_string(),
        }
    }

    #[tokio::test]
    async fn final_signing_is_skipped_without_options() {
        let tools = Arc::new(RecordingTools::default());
        assembler(&tools)
            .sign_final_bootstrapper(Path::new("Setup.exe"), None)
            .await
            .expect("unsigned build should succeed");
        assert!(tools.calls_to("signtool").is_empty());
    }

    #[tokio::test]
    async fn final_signing_passes_split_parameters() {
        let tools = Arc::new(RecordingTools::default());
        assembler(&tools)
            .sign_final_bootstrapper(Path::new("Setup.exe"), Some(&signing()))
            .await
            .expect("signing should succeed");

        assert_eq!(
            tools.calls_to("signtool"),
            vec![vec![
                "sign".to_string(),
                "/a".to_string(),
                "/f".to_string(),
                "my cert.pfx".to_string(),
                "Setup.exe".to_string(),
            ]]
        );
    }

    #[tokio::test]
    async fn final_signing_failure_is_fatal() {
        let tools = Arc::new(RecordingTools::default());
        tools.fail("signtool", 1);

        let error = assembler(&tools)
            .sign_final_bootstrapper(Path::new("Setup.exe"), Some(&signing()))
            .await
            .expect_err("signing failure should propagate");
        assert!(matches!(error, InstallerError::Signing { .. }));
    }

    #[test]
    fn embed_failure_is_a_resource_error() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let zip = temp.path().join("payload.zip");
        std::fs::write(&zip, b"zip").expect("zip written");
        let tools = Arc::new(RecordingTools::default());

        let error = assembler(&tools)
            .embed_payload(&temp.path().join("missing-setup.exe"), &zip)
            .expect_err("missing bootstrapper should fail");
        assert!(matches!(error, InstallerError::ResourceEdit(_)));
    }
}
