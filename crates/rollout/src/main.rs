//! `rollout`: installs, updates, starts and uninstalls an application, and
//! builds release directories with a setup bootstrapper.

mod commands;
mod error;
mod logging;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info};
use rollout_core::{Progress, UpdateOutcome};
use rollout_host::{NullShellIntegration, SystemProcessLauncher};
use tokio::sync::mpsc;

use crate::commands::{ReleasifyOptions, ShortcutAction};
use crate::error::CliError;
use crate::settings::UpdaterSettings;

/// Prefix of the lifecycle notifications an installed application passes
/// back to its updater.
const HOOK_ARG_PREFIX: &str = "--rollout-";

#[derive(Debug, Parser)]
#[command(name = "rollout", version, about = "Install, update and release desktop applications")]
struct Cli {
    /// Log debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Do not print progress to stdout
    #[arg(short, long, global = true)]
    silent: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install the app whose packages are in the given directory
    Install { source_dir: PathBuf },

    /// Uninstall the app this updater belongs to
    Uninstall,

    /// Download the newest release without applying it
    Download { url: String },

    /// Update the app to the newest release at the given URL or directory
    Update { url: String },

    /// Add a package to a release directory and build the setup bootstrapper
    Releasify {
        package: PathBuf,

        #[arg(short, long, default_value = "Releases")]
        release_dir: PathBuf,

        /// Setup bootstrapper template; defaults to Setup next to the updater
        #[arg(short, long)]
        bootstrapper: Option<PathBuf>,

        /// Where to write the setup bootstrapper; defaults to the release directory
        #[arg(long)]
        setup_output: Option<PathBuf>,

        /// Absolute http(s) URL prefixed to package names in RELEASES
        #[arg(long)]
        base_url: Option<String>,

        /// Animated GIF shown while installing
        #[arg(short = 'g', long)]
        loading_gif: Option<PathBuf>,

        /// Icon for the setup bootstrapper
        #[arg(short = 'i', long)]
        setup_icon: Option<PathBuf>,

        /// Sign executables with signtool using these parameters
        #[arg(short = 'n', long, allow_hyphen_values = true)]
        sign_with_params: Option<String>,

        /// Skip writing version metadata into the bootstrapper
        #[arg(long)]
        no_version_stamp: bool,
    },

    /// Copy this updater over the installed updater of the given app
    UpdateSelf { app_name: String },

    /// Start an executable from the newest installed version
    ProcessStart {
        exe_name: String,

        /// Arguments passed to the started executable
        #[arg(short = 'a', long, allow_hyphen_values = true)]
        process_start_args: Option<String>,
    },

    /// Create shortcuts for an executable of the newest installed version
    CreateShortcut {
        exe_name: String,

        /// Comma-separated locations, e.g. Desktop,StartMenu
        #[arg(short = 'l', long)]
        shortcut_locations: Option<String>,
    },

    /// Remove shortcuts created for an executable
    RemoveShortcut {
        exe_name: String,

        #[arg(short = 'l', long)]
        shortcut_locations: Option<String>,
    },
}

impl Command {
    /// The subcommand as typed on the command line.
    fn name(&self) -> &'static str {
        match self {
            Self::Install { .. } => "install",
            Self::Uninstall => "uninstall",
            Self::Download { .. } => "download",
            Self::Update { .. } => "update",
            Self::Releasify { .. } => "releasify",
            Self::UpdateSelf { .. } => "update-self",
            Self::ProcessStart { .. } => "process-start",
            Self::CreateShortcut { .. } => "create-shortcut",
            Self::RemoveShortcut { .. } => "remove-shortcut",
        }
    }
}

fn is_install_hook(args: &[String]) -> bool {
    args.get(1)
        .is_some_and(|arg| arg.starts_with(HOOK_ARG_PREFIX))
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<u8>) {
    while let Some(value) = rx.recv().await {
        println!("{value}");
    }
}

async fn run(cli: Cli, settings: UpdaterSettings, current_exe: PathBuf) -> Result<(), CliError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_progress(rx));
    let progress = if cli.silent {
        drop(tx);
        Progress::silent()
    } else {
        Progress::new(tx)
    };

    let layout = commands::current_layout(&current_exe);
    let shell = NullShellIntegration;

    // Lines printed once every progress value has been written.
    let result: Result<Option<String>, CliError> = match cli.command {
        Command::Install { source_dir } => commands::install(
            &settings,
            &source_dir,
            &current_exe,
            Arc::new(shell),
            &progress,
        )
        .await
        .map(|app_dir| {
            info!("Installed into {}", app_dir.display());
            None
        }),
        Command::Uninstall => {
            commands::uninstall(&layout, &current_exe, &shell, &shell)
                .await
                .map(|()| None)
        }
        Command::Download { url } => {
            match commands::download(&settings, layout, &url, &progress).await {
                Ok(summary) => serde_json::to_string(&summary)
                    .map(Some)
                    .map_err(CliError::from),
                Err(error) => Err(error),
            }
        }
        Command::Update { url } => {
            commands::update(&settings, layout, &url, Arc::new(shell), &progress)
                .await
                .map(|outcome| {
                    match outcome {
                        UpdateOutcome::UpToDate { version } => {
                            info!("Already up to date at {version}");
                        }
                        UpdateOutcome::Updated { from, to, .. } => {
                            info!("Updated from {from} to {to}");
                        }
                    }
                    None
                })
        }
        Command::Releasify {
            package,
            release_dir,
            bootstrapper,
            setup_output,
            base_url,
            loading_gif,
            setup_icon,
            sign_with_params,
            no_version_stamp,
        } => {
            let options = ReleasifyOptions {
                package,
                release_dir,
                bootstrapper,
                setup_output,
                base_url,
                loading_gif,
                setup_icon,
                sign_with_params,
                no_version_stamp,
            };
            commands::releasify(&settings, options, &current_exe)
                .await
                .map(|report| {
                    info!(
                        "Released {} into {}, setup at {}",
                        report.full_entry.file_name(),
                        report.manifest_path.display(),
                        report.setup_path.display()
                    );
                    None
                })
        }
        Command::UpdateSelf { app_name } => rollout_core::self_update::replace_self(&app_name)
            .await
            .map(|target| {
                info!("Updated {}", target.display());
                None
            })
            .map_err(CliError::from),
        Command::ProcessStart {
            exe_name,
            process_start_args,
        } => commands::process_start(
            &layout,
            &exe_name,
            process_start_args.as_deref(),
            &SystemProcessLauncher,
        )
        .await
        .map(|()| None),
        Command::CreateShortcut {
            exe_name,
            shortcut_locations,
        } => commands::shortcut(
            &layout,
            &exe_name,
            shortcut_locations.as_deref(),
            ShortcutAction::Create,
            &shell,
        )
        .await
        .map(|()| None),
        Command::RemoveShortcut {
            exe_name,
            shortcut_locations,
        } => commands::shortcut(
            &layout,
            &exe_name,
            shortcut_locations.as_deref(),
            ShortcutAction::Remove,
            &shell,
        )
        .await
        .map(|()| None),
    };

    drop(progress);
    let _ = printer.await;
    if let Some(line) = result? {
        println!("{line}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if is_install_hook(&args) {
        return ExitCode::SUCCESS;
    }
    let cli = Cli::parse_from(args);

    let settings = UpdaterSettings::load();
    let current_exe = match std::env::current_exe() {
        Ok(path) => path,
        Err(error) => {
            eprintln!("failed to locate the running binary: {error}");
            return ExitCode::FAILURE;
        }
    };

    let uninstalling = matches!(cli.command, Command::Uninstall);
    let log_target = logging::LogTarget::for_invocation(current_exe.parent(), uninstalling);
    logging::init_logging(
        &log_target,
        cli.command.name(),
        cli.debug || settings.debug_logging,
        settings.max_log_size_bytes,
    );
    info!("Starting rollout {}", env!("CARGO_PKG_VERSION"));

    match run(cli, settings, current_exe).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command, is_install_hook};

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn hook_arguments_are_recognised() {
        for hook in [
            "--rollout-install",
            "--rollout-updated",
            "--rollout-obsolete",
            "--rollout-uninstall",
            "--rollout-firstrun",
        ] {
            assert!(is_install_hook(&args(&["rollout", hook, "1.0.0"])));
        }
        assert!(!is_install_hook(&args(&["rollout", "update", "https://x"])));
        assert!(!is_install_hook(&args(&["rollout"])));
    }

    #[test]
    fn releasify_accepts_short_flags() {
        let cli = Cli::try_parse_from([
            "rollout",
            "releasify",
            "app-1.0.0.nupkg",
            "-g",
            "loading.gif",
            "-n",
            "/a /f cert.pfx",
            "--base-url",
            "https://downloads.example.com",
        ])
        .expect("arguments should parse");

        let Command::Releasify {
            release_dir,
            sign_with_params,
            loading_gif,
            base_url,
            ..
        } = cli.command
        else {
            panic!("expected releasify");
        };
        assert_eq!(release_dir, std::path::PathBuf::from("Releases"));
        assert_eq!(sign_with_params.as_deref(), Some("/a /f cert.pfx"));
        assert_eq!(loading_gif, Some(std::path::PathBuf::from("loading.gif")));
        assert_eq!(base_url.as_deref(), Some("https://downloads.example.com"));
    }

    #[test]
    fn process_start_arguments_may_look_like_flags() {
        let cli = Cli::try_parse_from([
            "rollout",
            "process-start",
            "app.exe",
            "-a",
            "--minimized --profile work",
        ])
        .expect("arguments should parse");

        assert!(matches!(
            cli.command,
            Command::ProcessStart { ref exe_name, ref process_start_args }
                if exe_name == "app.exe"
                    && process_start_args.as_deref() == Some("--minimized --profile work")
        ));
    }

    #[test]
    fn command_names_match_the_command_line() {
        for line in [
            vec!["uninstall"],
            vec!["update-self", "MyApp"],
            vec!["process-start", "app.exe"],
            vec!["create-shortcut", "app.exe"],
        ] {
            let cli = Cli::try_parse_from(std::iter::once("rollout").chain(line.iter().copied()))
                .expect("arguments should parse");
            assert_eq!(cli.command.name(), line[0]);
        }
    }

    #[test]
    fn debug_flag_is_global() {
        let cli = Cli::try_parse_from(["rollout", "update", "https://example.com/app", "--debug"])
            .expect("arguments should parse");
        assert!(cli.debug);
    }
}
