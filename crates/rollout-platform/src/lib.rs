mod commands;
mod paths;
mod process;

pub use commands::{HideWindow, tool_command};
pub use paths::{AppLayout, AppPaths, AppPathsError, UPDATER_BINARY};
pub use process::{parent_process_id, wait_for_parent_exit, wait_for_process_exit};
