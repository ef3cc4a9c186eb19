mod discovery;
mod engine;
mod guard;
mod htmldiff;
mod refresh;
mod session;
mod settings;
mod watcher;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crate::guard::UnixReaperGuard;
use crate::htmldiff::HtmlDiffEngine;
use crate::session::{ComparisonSession, SessionOptions};
use crate::settings::SettingsStore;

/// Compare two documents side by side in an external viewer, keeping the
/// comparison fresh while the sources change on disk.
#[derive(Parser, Debug)]
#[command(
    name = "docdiff",
    version,
    about,
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
pub struct Cli {
    /// Path to the first document
    #[arg(value_name = "PATH1", required = true)]
    path1: Option<PathBuf>,

    /// Path to the second document
    #[arg(value_name = "PATH2", required = true)]
    path2: Option<PathBuf>,

    /// Hide source documents in the comparison view. The default can be set
    /// via the set-quiet command
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    quiet: Option<bool>,

    /// Rebuild the comparison whenever either document changes on disk
    #[arg(long)]
    watch: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Set the default value for the quiet option
    SetQuiet {
        /// true to enable quiet mode by default, false to disable
        #[arg(value_name = "VALUE", action = clap::ArgAction::Set)]
        value: bool,
    },
    /// Display the settings path and current contents
    Settings,
    /// Internal helper that keeps spawned viewers tied to the session
    #[command(name = "__reaper", hide = true)]
    Reaper,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::Reaper)) {
        // The reaper stays silent; it shares the terminal with the session.
        return guard::run_reaper();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Some(Command::SetQuiet { value }) => set_quiet(value),
        Some(Command::Settings) => show_settings(),
        Some(Command::Reaper) => ExitCode::SUCCESS,
        None => match (cli.path1, cli.path2) {
            (Some(path1), Some(path2)) => compare(path1, path2, cli.quiet, cli.watch).await,
            _ => {
                eprintln!("Two document paths are required.");
                ExitCode::FAILURE
            }
        },
    }
}

fn set_quiet(value: bool) -> ExitCode {
    let store = SettingsStore::from_default_location();
    match store.set_quiet(value) {
        Ok(_) => {
            println!("Quiet mode default set to: {value}");
            println!("Settings saved to: {}", store.path().display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to save settings");
            ExitCode::FAILURE
        }
    }
}

fn show_settings() -> ExitCode {
    let store = SettingsStore::from_default_location();
    println!("{}", store.path().display());
    match std::fs::read_to_string(store.path()) {
        Ok(contents) => println!("{contents}"),
        Err(_) => println!("No settings file found."),
    }
    ExitCode::SUCCESS
}

async fn compare(path1: PathBuf, path2: PathBuf, quiet: Option<bool>, watch: bool) -> ExitCode {
    for path in [&path1, &path2] {
        if !path.exists() {
            eprintln!("File does not exist: {}", path.display());
            return ExitCode::FAILURE;
        }
    }

    let settings = SettingsStore::from_default_location().load();
    let quiet = quiet.unwrap_or(settings.quiet);
    tracing::debug!(quiet, watch, "resolved session options");

    let engine = match HtmlDiffEngine::new() {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize the comparison engine");
            return ExitCode::FAILURE;
        }
    };
    let guard = match UnixReaperGuard::create() {
        Ok(guard) => guard,
        Err(e) => {
            tracing::error!(error = %e, "process guard unavailable");
            return ExitCode::FAILURE;
        }
    };

    let mut options = SessionOptions::new(path1, path2);
    options.quiet = quiet;
    options.watch = watch;

    let mut session = ComparisonSession::new(options, Box::new(engine), Box::new(guard));
    match session.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "session failed");
            ExitCode::FAILURE
        }
    }
}
