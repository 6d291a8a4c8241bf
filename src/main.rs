use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use partgen::partgen_config::TransportMode;
use partgen::ui::UiMode;

mod cmd;

#[derive(Parser)]
#[command(name = "partgen")]
#[command(version, about = "AI-assisted part generation for a project timeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Inference service base URL. Overrides partgen.toml and PARTGEN_BRIDGE_URL.
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Transport: auto, http, curl
    #[arg(long, global = true)]
    pub transport: Option<TransportMode>,

    /// Output mode: full, minimal, json
    #[arg(long, global = true, default_value = "full")]
    pub ui: String,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn ui_mode(&self) -> UiMode {
        UiMode::parse(&self.ui)
    }
}

/// Options shared by every generating command.
#[derive(Args, Debug, Clone)]
pub struct GenerationArgs {
    /// Window start in seconds
    #[arg(long, default_value = "0")]
    pub start: f64,

    /// Window end in seconds
    #[arg(long)]
    pub end: f64,

    #[arg(short, long)]
    pub prompt: Option<String>,

    /// melody, chords, bass, arpeggio, ...
    #[arg(long = "type")]
    pub generation_type: Option<String>,

    #[arg(long)]
    pub style: Option<String>,

    /// Key such as "D minor", or "auto" to estimate it
    #[arg(long)]
    pub key: Option<String>,

    /// Let the service change the tempo map
    #[arg(long)]
    pub allow_tempo_changes: bool,

    /// Ignore instrument range and articulation constraints
    #[arg(long)]
    pub free: bool,

    /// Profile preset, remembered on the track
    #[arg(long)]
    pub preset: Option<String>,

    #[arg(long)]
    pub provider: Option<String>,

    #[arg(long)]
    pub model: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a partgen project in the current directory
    Init {
        #[arg(long, default_value = "120")]
        bpm: f64,

        #[arg(long, default_value = "4/4")]
        time_sig: String,
    },
    /// Generate one part into one track
    Generate {
        /// Existing track name. Defaults to the first selected track.
        #[arg(short, long, conflicts_with = "new_track")]
        track: Option<String>,

        /// Create a track with this name
        #[arg(long)]
        new_track: Option<String>,

        /// Instrument profile id, overriding the one matched from the track
        #[arg(long)]
        profile: Option<String>,

        #[arg(long)]
        articulation: Option<String>,

        #[command(flatten)]
        args: GenerationArgs,
    },
    /// Compose parts for several tracks, one after another
    Compose {
        /// Tracks in order; missing ones are created
        #[arg(short, long, value_delimiter = ',', required = true)]
        tracks: Vec<String>,

        /// Skip the planning call
        #[arg(long)]
        no_plan: bool,

        #[command(flatten)]
        args: GenerationArgs,
    },
    /// Arrange the notes of a sketch track across several tracks
    Arrange {
        /// Track holding the sketch
        #[arg(short, long)]
        source: String,

        #[arg(short, long, value_delimiter = ',', required = true)]
        tracks: Vec<String>,

        #[arg(long)]
        no_plan: bool,

        #[command(flatten)]
        args: GenerationArgs,
    },
    /// Rewrite a prompt into a more detailed one
    Enhance {
        prompt: String,

        #[arg(short, long, value_delimiter = ',')]
        tracks: Vec<String>,

        #[arg(long)]
        start: Option<f64>,

        #[arg(long)]
        end: Option<f64>,

        #[arg(long, default_value = "auto")]
        key: String,
    },
    /// Show project and service status
    Status,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default partgen.toml file
    Init,
}

/// File logging under `.partgen/logs` once the project exists; stderr with `--verbose`.
fn init_logging(project_dir: &Path, verbose: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = if verbose { "partgen=debug" } else { "partgen=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_dir = partgen::init::get_partgen_dir(project_dir).join("logs");
    let (file_layer, guard) = if log_dir.is_dir() {
        let appender = tracing_appender::rolling::daily(&log_dir, "partgen.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };
    let stderr_layer = verbose.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init();
    guard
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let _log_guard = init_logging(&project_dir, cli.verbose);

    match &cli.command {
        Commands::Init { bpm, time_sig } => cmd::cmd_init(&project_dir, *bpm, time_sig)?,
        Commands::Generate {
            track,
            new_track,
            profile,
            articulation,
            args,
        } => {
            cmd::cmd_generate(
                &cli,
                &project_dir,
                track.as_deref(),
                new_track.as_deref(),
                profile.as_deref(),
                articulation.as_deref(),
                args,
            )
            .await?
        }
        Commands::Compose {
            tracks,
            no_plan,
            args,
        } => cmd::cmd_compose(&cli, &project_dir, None, tracks, !*no_plan, args).await?,
        Commands::Arrange {
            source,
            tracks,
            no_plan,
            args,
        } => {
            cmd::cmd_compose(&cli, &project_dir, Some(source), tracks, !*no_plan, args).await?
        }
        Commands::Enhance {
            prompt,
            tracks,
            start,
            end,
            key,
        } => cmd::cmd_enhance(&cli, &project_dir, prompt, tracks, *start, *end, key).await?,
        Commands::Status => cmd::cmd_status(&cli, &project_dir).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
