#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rollout_core::tools::{ToolOutput, ToolRunner};
use rollout_core::{Manifest, ReleaseEntry};

/// Write `{id}-{version}{suffix}.nupkg` whose application binary contains
/// `payload`. Use `-full` for release packages and `""` for a plain one.
pub fn write_package(dir: &Path, id: &str, version: &str, suffix: &str, payload: &[u8]) -> PathBuf {
    let path = dir.join(format!("{id}-{version}{suffix}.nupkg"));
    let metadata = format!(
        r#"{{"id":"{id}","version":"{version}","authors":"Example Ltd","title":"Example App"}}"#
    );
    rollout_core::archive::write_entries(
        &path,
        &[
            ("metadata.json", metadata.as_bytes()),
            ("lib/net45/app.exe", payload),
            ("lib/net45/readme.txt", b"shared between versions"),
        ],
    )
    .expect("package should be written");
    path
}

pub fn entry_for(path: &Path) -> ReleaseEntry {
    ReleaseEntry::generate_from_file(path, None).expect("entry should be generated")
}

pub fn manifest_of(entries: impl IntoIterator<Item = ReleaseEntry>) -> Manifest {
    Manifest::from_entries(entries).expect("entries should be unique")
}

/// Answers every tool run with exit code 0 unless told to fail, and keeps a
/// log of invocations.
#[derive(Default)]
pub struct StubTools {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    failing_tool: Mutex<Option<String>>,
}

impl StubTools {
    pub fn failing(tool: &str) -> Self {
        Self {
            failing_tool: Mutex::new(Some(tool.to_string())),
            ..Self::default()
        }
    }

    pub fn calls_to(&self, tool: &str) -> Vec<Vec<String>> {
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
impl ToolRunner for StubTools {
    async fn invoke(&self, tool: &str, args: &[String]) -> std::io::Result<ToolOutput> {
        self.calls
            .lock()
            .expect("lock")
            .push((tool.to_string(), args.to_vec()));
        let fail = self.failing_tool.lock().expect("lock").as_deref() == Some(tool);
        Ok(ToolOutput {
            exit_code: i32::from(fail),
            output: if fail {
                "certificate not found".to_string()
            } else {
                "ok".to_string()
            },
        })
    }
}
