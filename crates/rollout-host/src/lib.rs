//! Narrow contracts for the operating-system shell collaborators the updater
//! talks to: shortcuts, the uninstall registration and process launch.
//!
//! The update core only ever sees these traits. [`NullShellIntegration`] and
//! [`SystemProcessLauncher`] are the implementations the CLI wires in.

mod error;
mod system;
mod traits;
mod types;

pub use error::HostError;
pub use system::{NullShellIntegration, SystemProcessLauncher};
pub use traits::{ProcessLauncher, ShortcutManager, UninstallRegistry};
pub use types::{InstallMetadata, ShortcutLocation, parse_shortcut_locations};
