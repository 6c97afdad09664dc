use std::ffi::OsStr;
use std::process::Stdio;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Keeps spawned console tools from flashing a window on Windows.
pub trait HideWindow {
    fn hide_window(&mut self) -> &mut Self;
}

impl HideWindow for tokio::process::Command {
    #[cfg(windows)]
    fn hide_window(&mut self) -> &mut Self {
        self.creation_flags(CREATE_NO_WINDOW)
    }

    #[cfg(not(windows))]
    fn hide_window(&mut self) -> &mut Self {
        self
    }
}

impl HideWindow for std::process::Command {
    #[cfg(windows)]
    fn hide_window(&mut self) -> &mut Self {
        self.creation_flags(CREATE_NO_WINDOW)
    }

    #[cfg(not(windows))]
    fn hide_window(&mut self) -> &mut Self {
        self
    }
}

/// Command for an external helper tool whose output is captured.
#[must_use]
pub fn tool_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .hide_window();
    cmd
}

#[cfg(test)]
mod tests {
    use super::{HideWindow, tool_command};

    #[test]
    fn std_command_hide_window_is_chainable() {
        let mut cmd = std::process::Command::new("echo");
        let before = &raw mut cmd;
        let after = cmd.hide_window() as *mut std::process::Command;
        assert_eq!(before, after);
    }

    #[test]
    fn tool_command_keeps_program_name() {
        let cmd = tool_command("signtool");
        assert_eq!(cmd.as_std().get_program(), "signtool");
    }
}
