//! Generating commands: `generate`, `compose`, `arrange`, `enhance`.

use anyhow::{Context, Result, bail};
use std::path::Path;

use partgen::config::Config;
use partgen::engine::{Engine, EngineEvent};
use partgen::host::{DestinationId, ProjectTimeline, Timeline};
use partgen::music::TimeWindow;
use partgen::orchestrator::{
    DestinationChoice, EnhanceInputs, GenerationSettings, SequentialInputs, SessionKind,
    SingleInputs,
};
use partgen::partgen_config::CliOverrides;
use partgen::settings::ProviderSettings;
use partgen::ui::SessionUI;
use partgen::ui::progress::describe;

use super::super::{Cli, GenerationArgs};

/// Load the configuration and the project timeline.
pub(crate) fn load_project(cli: &Cli, project_dir: &Path) -> Result<(Config, ProjectTimeline)> {
    let config = Config::new(
        project_dir.to_path_buf(),
        CliOverrides {
            base_url: cli.base_url.clone(),
            transport: cli.transport,
            verbose: cli.verbose,
        },
    )?;
    if !config.is_initialized() {
        bail!(
            "No partgen project found at {}. Run 'partgen init' first.",
            config.project_dir.display()
        );
    }
    config.ensure_directories()?;
    let project = ProjectTimeline::load(&config.project_file)?;
    Ok((config, project))
}

/// Settings for this run: flags first, then what the project remembers, then partgen.toml.
fn settings_for(config: &Config, host: &dyn Timeline, args: &GenerationArgs) -> GenerationSettings {
    let mut settings = GenerationSettings::from_config(config.settings());
    let remembered = ProviderSettings::read(host);

    if let Some(provider) = args.provider.clone().or(remembered.provider) {
        settings.model.provider = provider;
    }
    if let Some(model) = args.model.clone().or(remembered.model_name) {
        settings.model.model_name = Some(model);
    }
    if let Some(base_url) = remembered.base_url {
        settings.model.base_url = Some(base_url);
    }
    if let Some(t) = &args.generation_type {
        settings.generation_type = t.clone();
    }
    if let Some(style) = &args.style {
        settings.generation_style = style.clone();
    }
    if let Some(key) = &args.key {
        settings.key = key.clone();
    }
    if let Some(prompt) = &args.prompt {
        settings.user_prompt = prompt.clone();
    }
    if let Some(preset) = &args.preset {
        settings.preset_name = Some(preset.clone());
    }
    settings.allow_tempo_changes |= args.allow_tempo_changes;
    settings.free_mode |= args.free;
    settings
}

/// Existing tracks by name, created when missing.
fn find_or_create(host: &mut dyn Timeline, names: &[String]) -> Vec<DestinationId> {
    names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(|name| match host.find_destination(name) {
            Some(id) => id,
            None => {
                tracing::info!(track = %name, "Creating track");
                host.create_destination(name)
            }
        })
        .collect()
}

/// Drive the engine until idle, save the project, and turn failures into an error.
async fn run_and_save(
    mut engine: Engine<ProjectTimeline>,
    cli: &Cli,
    config: &Config,
) -> Result<Vec<EngineEvent>> {
    let ui = SessionUI::new(cli.ui_mode());
    let mut events = Vec::new();
    engine
        .run_until_idle(|event| {
            ui.handle_event(event);
            events.push(event.clone());
        })
        .await;

    engine
        .into_host()
        .save(&config.project_file)
        .context("Failed to save project")?;

    if let Some(failure) = events.iter().find(|e| {
        matches!(
            e,
            EngineEvent::Failed { .. } | EngineEvent::SessionAborted { .. }
        )
    }) {
        bail!("{}", describe(failure));
    }
    Ok(events)
}

pub async fn cmd_generate(
    cli: &Cli,
    project_dir: &Path,
    track: Option<&str>,
    new_track: Option<&str>,
    profile: Option<&str>,
    articulation: Option<&str>,
    args: &GenerationArgs,
) -> Result<()> {
    let (config, project) = load_project(cli, project_dir)?;
    let mut settings = settings_for(&config, &project, args);
    settings.articulation = articulation.map(str::to_string);

    let destination = match (track, new_track) {
        (_, Some(name)) => DestinationChoice::New(name.to_string()),
        (Some(name), None) => DestinationChoice::Named(name.to_string()),
        (None, None) => DestinationChoice::Selected,
    };

    let mut engine = Engine::from_config(project, config.settings())?;
    engine.start_single(SingleInputs {
        window: TimeWindow::new(args.start, args.end),
        destination,
        profile_id: profile.map(str::to_string),
        settings,
    })?;
    run_and_save(engine, cli, &config).await?;
    Ok(())
}

/// Compose when `source` is `None`, arrange from the `source` track otherwise.
pub async fn cmd_compose(
    cli: &Cli,
    project_dir: &Path,
    source: Option<&String>,
    tracks: &[String],
    plan: bool,
    args: &GenerationArgs,
) -> Result<()> {
    let (config, mut project) = load_project(cli, project_dir)?;
    let settings = settings_for(&config, &project, args);

    let kind = match source {
        Some(name) => SessionKind::Arrange {
            source: project
                .find_destination(name)
                .with_context(|| format!("Source track '{}' not found", name))?,
        },
        None => SessionKind::Compose,
    };
    let destinations = find_or_create(&mut project, tracks);

    let mut engine = Engine::from_config(project, config.settings())?;
    engine.start_sequential(SequentialInputs {
        kind,
        window: TimeWindow::new(args.start, args.end),
        destinations,
        settings,
        plan,
    })?;
    run_and_save(engine, cli, &config).await?;
    Ok(())
}

pub async fn cmd_enhance(
    cli: &Cli,
    project_dir: &Path,
    prompt: &str,
    tracks: &[String],
    start: Option<f64>,
    end: Option<f64>,
    key: &str,
) -> Result<()> {
    let (config, project) = load_project(cli, project_dir)?;
    let model = GenerationSettings::from_config(config.settings()).model;
    let destinations = tracks
        .iter()
        .filter_map(|name| project.find_destination(name))
        .collect();
    let window = end.map(|end| TimeWindow::new(start.unwrap_or(0.0), end));

    let mut engine = Engine::from_config(project, config.settings())?;
    engine.start_enhance(EnhanceInputs {
        user_prompt: prompt.to_string(),
        destinations,
        window,
        key: key.to_string(),
        model,
    })?;
    run_and_save(engine, cli, &config).await?;
    Ok(())
}
