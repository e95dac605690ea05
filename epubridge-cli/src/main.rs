use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use epubridge_core::config::{project_dirs, LoggingConfig};
use epubridge_core::decorations::decoration_id;
use epubridge_core::selection::TRANSLATE_ACTION;
use epubridge_core::{
    BridgeConfig, BridgeError, BridgeEvent, BridgeResult, FileDescriptor, Highlight,
    HighlightAction, HostPhase, Location, Locator, ReaderHost, Rect, SettingsMap,
};
use epubridge_epub::{CoverService, EpubNavigatorFactory, InteractionHandle, Publication};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "epubridge", version, about = "Reader bridge for EPUB publications")]
struct Args {
    /// Configuration file (TOML); defaults to the per-user config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract cover images and print one file URI per publication
    Cover {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Guide box width; zero or less leaves the width unconstrained
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        width: f64,

        /// Guide box height; zero or less leaves the height unconstrained
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        height: f64,

        /// Directory the covers are written to
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
    /// Print the table of contents as JSON
    Toc { file: PathBuf },
    /// Mount a reader over FILE, read JSON commands from stdin and write
    /// bridge events to stdout, one per line
    Read {
        /// Path or file:// URL of the publication
        file: String,

        /// Initial location, as locator or link JSON
        #[arg(long)]
        location: Option<String>,
    },
}

/// One line of reader input.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum HostCommand {
    Location(Location),
    Settings(SettingsMap),
    Highlights(Vec<Highlight>),
    Select(Locator),
    Translate(bool),
    Activate(Activation),
    Menu(MenuChoice),
    Goto(String),
}

#[derive(Debug, Deserialize)]
struct Activation {
    id: i64,
    rect: Rect,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum MenuChoice {
    Show,
    Delete,
    Dismiss,
}

enum Step {
    Line(Option<String>),
    Ticked(BridgeResult<bool>),
}

#[derive(Debug, Serialize)]
struct Rejection<'a> {
    code: &'a str,
    message: String,
}

#[derive(Debug, Serialize)]
struct RejectionLine<'a> {
    error: Rejection<'a>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = BridgeConfig::load_or_default(args.config.as_deref())?;
    let project_dirs = project_dirs()?;
    let _log_guard = init_logging(&project_dirs, &config.logging)?;

    match args.command {
        Commands::Cover {
            files,
            width,
            height,
            cache_dir,
        } => extract_covers(&config, files, width, height, cache_dir),
        Commands::Toc { file } => print_toc(file),
        Commands::Read { file, location } => run_reader(&config, file, location).await,
    }
}

fn extract_covers(
    config: &BridgeConfig,
    files: Vec<PathBuf>,
    width: f64,
    height: f64,
    cache_dir: Option<PathBuf>,
) -> Result<()> {
    let service = match cache_dir {
        Some(dir) => CoverService::new(dir),
        None => CoverService::from_config(config)?,
    };

    let results = service.store_covers(&files, width, height);
    let mut failed = 0;
    let mut stdout = io::stdout().lock();
    for (path, result) in files.iter().zip(results) {
        match result {
            Ok(uri) => writeln!(stdout, "{uri}")?,
            Err(err) => {
                failed += 1;
                eprintln!("{}: {err}", path.display());
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{failed} of {} covers could not be extracted", files.len()));
    }
    Ok(())
}

fn print_toc(file: PathBuf) -> Result<()> {
    let publication =
        Publication::open(&file).with_context(|| format!("failed to open {:?}", file))?;
    let toc = serde_json::to_string_pretty(publication.table_of_contents())?;
    println!("{toc}");
    Ok(())
}

async fn run_reader(config: &BridgeConfig, file: String, location: Option<String>) -> Result<()> {
    let factory = Arc::new(EpubNavigatorFactory::new());
    let (mut host, mut events) = ReaderHost::with_config(factory.clone(), config);

    let mut descriptor = FileDescriptor::new(file);
    if let Some(raw) = location {
        let location: Location = serde_json::from_str(&raw).context("invalid --location JSON")?;
        descriptor = descriptor.with_initial_location(location);
    }
    host.set_file(descriptor);
    host.wait_ready().await?;
    let interaction = factory
        .interaction()
        .ok_or_else(|| anyhow!("navigator did not expose an interaction handle"))?;
    info!("reader ready; waiting for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        write_events(&mut events)?;
        let step = if host.phase() == HostPhase::Ready {
            tokio::select! {
                line = lines.next_line() => Step::Line(line?),
                ticked = host.tick() => Step::Ticked(ticked),
            }
        } else {
            Step::Line(lines.next_line().await?)
        };
        let line = match step {
            Step::Line(line) => line,
            Step::Ticked(Ok(true)) => continue,
            Step::Ticked(Ok(false)) => lines.next_line().await?,
            Step::Ticked(Err(err)) => {
                write_rejection(&err)?;
                continue;
            }
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<HostCommand>(&line) {
            Ok(command) => {
                if let Err(err) = apply_command(&mut host, &interaction, command) {
                    write_rejection(&err)?;
                }
            }
            Err(err) => warn!(%err, %line, "ignoring malformed command"),
        }
        if let Err(err) = host.pump() {
            write_rejection(&err)?;
        }
    }

    write_events(&mut events)?;
    host.unmount();
    Ok(())
}

fn apply_command(
    host: &mut ReaderHost,
    interaction: &InteractionHandle,
    command: HostCommand,
) -> Result<(), BridgeError> {
    debug!(?command, "host command");
    match command {
        HostCommand::Location(location) => host.set_location(location),
        HostCommand::Settings(map) => host.set_settings(map)?,
        HostCommand::Highlights(highlights) => host.set_highlights(highlights),
        HostCommand::Select(locator) => {
            if !interaction.select(locator) {
                warn!("selection is outside the publication");
            }
        }
        HostCommand::Translate(true) => {
            interaction.press_selection_action(TRANSLATE_ACTION);
        }
        HostCommand::Translate(false) => {}
        HostCommand::Activate(Activation { id, rect }) => {
            if !interaction.tap_decoration(&decoration_id(id), rect) {
                warn!(id, "no highlight with that id is shown");
            }
        }
        HostCommand::Menu(MenuChoice::Show) => {
            host.choose_highlight_action(HighlightAction::Show);
        }
        HostCommand::Menu(MenuChoice::Delete) => {
            host.choose_highlight_action(HighlightAction::Delete);
        }
        HostCommand::Menu(MenuChoice::Dismiss) => host.dismiss_highlight_menu(),
        HostCommand::Goto(href) => {
            if !interaction.turn_to(&href) {
                warn!(%href, "resource is not in the reading order");
            }
        }
    }
    Ok(())
}

fn write_events(events: &mut UnboundedReceiver<BridgeEvent>) -> Result<()> {
    let mut stdout = io::stdout().lock();
    while let Ok(event) = events.try_recv() {
        serde_json::to_writer(&mut stdout, &event)?;
        writeln!(stdout)?;
    }
    stdout.flush()?;
    Ok(())
}

fn write_rejection(err: &BridgeError) -> Result<()> {
    let line = RejectionLine {
        error: Rejection {
            code: err.code(),
            message: err.to_string(),
        },
    };
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, &line)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs, logging: &LoggingConfig) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "epubridge.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
