use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(debug_assertions)]
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use simplelog::{CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, WriteLogger};

pub const LOG_FILE_NAME: &str = "rollout-setup.log";

/// Where one updater run logs to.
///
/// Installed apps keep their log next to the updater. Uninstalling, or
/// running from an unknown location, logs to the temp directory because the
/// install root may be deleted while the run is still going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    primary: PathBuf,
    fallback: PathBuf,
}

impl LogTarget {
    pub fn for_invocation(updater_dir: Option<&Path>, uninstalling: bool) -> Self {
        let fallback = std::env::temp_dir().join(LOG_FILE_NAME);
        let primary = match updater_dir {
            Some(dir) if !uninstalling => dir.join(LOG_FILE_NAME),
            _ => fallback.clone(),
        };
        Self { primary, fallback }
    }

    pub fn path(&self) -> &Path {
        &self.primary
    }
}

/// Appends to the primary log and moves to the fallback once the primary's
/// directory disappears. A removed install directory is never recreated just
/// to hold a log file.
struct FollowingWriter {
    target: LogTarget,
    current: PathBuf,
    file: File,
}

impl FollowingWriter {
    fn open(target: LogTarget) -> io::Result<Self> {
        let (current, file) = match open_append(&target.primary) {
            Ok(file) => (target.primary.clone(), file),
            Err(_) => (target.fallback.clone(), open_fallback(&target.fallback)?),
        };
        Ok(Self {
            target,
            current,
            file,
        })
    }

    fn follow_if_removed(&mut self) -> io::Result<()> {
        if self.current.exists() {
            return Ok(());
        }
        self.file = open_fallback(&self.target.fallback)?;
        self.current = self.target.fallback.clone();
        Ok(())
    }
}

impl Write for FollowingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.follow_if_removed()?;
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn open_fallback(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    open_append(path)
}

fn rotated_path(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_owned();
    name.push(".old");
    PathBuf::from(name)
}

/// Moves a log over `max_log_size` aside to `<name>.old`, replacing the one
/// kept by the previous rotation. Returns whether it rotated.
fn rotate_if_oversized(log_path: &Path, max_log_size: u64) -> io::Result<bool> {
    match fs::metadata(log_path) {
        Ok(metadata) if metadata.len() > max_log_size => {
            fs::rename(log_path, rotated_path(log_path))?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

/// Installs the file logger (and the stderr logger in debug builds), then
/// marks the start of this run in the log with the command being executed.
pub fn init_logging(target: &LogTarget, command: &str, debug_enabled: bool, max_log_size: u64) {
    let rotation = rotate_if_oversized(target.path(), max_log_size);

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("rollout")
        .build();

    let level = if debug_enabled {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    #[cfg(debug_assertions)]
    loggers.push(TermLogger::new(
        level,
        config.clone(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    ));
    let opened = FollowingWriter::open(target.clone()).map(|writer| {
        loggers.push(WriteLogger::new(level, config, writer));
    });
    let _ = CombinedLogger::init(loggers);

    log::info!("---- rollout {command} (pid {}) ----", std::process::id());
    match rotation {
        Ok(true) => log::info!(
            "Previous log moved to {}",
            rotated_path(target.path()).display()
        ),
        Ok(false) => {}
        Err(error) => log::warn!("Could not rotate {}: {error}", target.path().display()),
    }
    if let Err(error) = opened {
        eprintln!("failed to open log file {}: {error}", target.path().display());
    }
}
