//! External helper tools (code signing, version stamping) behind a single
//! `invoke(name, args)` capability.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use rollout_platform::tool_command;
use which::which;

/// Name of the code-signing tool.
pub const SIGN_TOOL: &str = "signtool";
/// Name of the resource and version-info editor.
pub const RESOURCE_TOOL: &str = "rcedit";

/// Exit code and combined stdout/stderr of one tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub output: String,
}

impl ToolOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run `tool` with `args`. A nonzero exit is reported in the output, not
    /// as an error.
    ///
    /// # Errors
    /// Returns an error only when the tool cannot be started.
    async fn invoke(&self, tool: &str, args: &[String]) -> std::io::Result<ToolOutput>;
}

/// Spawns real processes. A tool is looked up in the explicit overrides,
/// then next to the running binary, then on `PATH`.
#[derive(Debug, Default, Clone)]
pub struct ProcessToolRunner {
    overrides: HashMap<String, PathBuf>,
    search_dir: Option<PathBuf>,
}

impl ProcessToolRunner {
    #[must_use]
    pub fn new() -> Self {
        let search_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self {
            overrides: HashMap::new(),
            search_dir,
        }
    }

    #[must_use]
    pub fn with_override(mut self, tool: &str, path: impl Into<PathBuf>) -> Self {
        self.overrides.insert(tool.to_string(), path.into());
        self
    }

    #[must_use]
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dir = Some(dir.into());
        self
    }

    fn resolve(&self, tool: &str) -> PathBuf {
        if let Some(path) = self.overrides.get(tool) {
            return path.clone();
        }

        if let Some(dir) = &self.search_dir {
            let local = dir.join(format!("{tool}{}", std::env::consts::EXE_SUFFIX));
            if local.is_file() {
                return local;
            }
        }

        which(tool).unwrap_or_else(|_| PathBuf::from(tool))
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn invoke(&self, tool: &str, args: &[String]) -> std::io::Result<ToolOutput> {
        let program = self.resolve(tool);
        debug!("Running {} {}", program.display(), args.join(" "));

        let output = tool_command(&program).args(args).output().await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        Ok(ToolOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: text,
        })
    }
}
