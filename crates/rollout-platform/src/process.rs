use std::time::Duration;

use log::{debug, info};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Process id of whoever launched the current process.
#[must_use]
pub fn parent_process_id() -> Option<u32> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid)?.parent().map(Pid::as_u32)
}

/// Wait until `pid` is gone. There is no timeout.
pub async fn wait_for_process_exit(pid: u32) {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();

    loop {
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            None => return,
            Some(process) if process.status() == ProcessStatus::Zombie => return,
            Some(_) => tokio::time::sleep(POLL_INTERVAL).await,
        }
    }
}

/// Wait for the launching process to exit so it releases any handles it
/// holds inside the install directory.
pub async fn wait_for_parent_exit() {
    let Some(parent) = parent_process_id() else {
        debug!("No parent process found, nothing to wait for");
        return;
    };

    info!("Waiting for parent process {parent} to exit");
    wait_for_process_exit(parent).await;
    debug!("Parent process {parent} exited");
}
