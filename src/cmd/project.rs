//! Project initialization and status commands.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;
use std::time::Duration;

use partgen::host::Timeline;
use partgen::init::{InitOptions, init_project, is_initialized};
use partgen::music::TimeSignature;
use partgen::task::TaskRunner;
use partgen::task::transport::check_health;

use super::super::Cli;
use super::generate::load_project;

pub fn cmd_init(project_dir: &Path, bpm: f64, time_sig: &str) -> Result<()> {
    let Ok(time_sig) = time_sig.parse::<TimeSignature>() else {
        bail!("Invalid time signature '{}'. Expected N/D, e.g. 3/4", time_sig);
    };
    if !(20.0..=300.0).contains(&bpm) {
        bail!("Tempo {} BPM is outside 20..=300", bpm);
    }

    let was_initialized = is_initialized(project_dir);
    let result = init_project(project_dir, InitOptions { bpm, time_sig })?;

    if result.created {
        println!(
            "Initialized partgen project at {}",
            result.partgen_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .partgen/");
        println!("  ├── partgen.toml  # Service, transport and generation defaults");
        println!("  ├── project.json  # Timeline at {} BPM, {}", bpm, time_sig);
        println!("  ├── profiles/     # Instrument profiles (*.json)");
        println!("  ├── staging/      # In-flight request files");
        println!("  └── logs/");
        println!();
        println!("Next steps:");
        println!("  1. Check the service with `partgen status`");
        println!("  2. Run `partgen generate --new-track Piano --end 8`");
    } else if was_initialized {
        println!(
            "partgen project already initialized at {}",
            result.partgen_dir.display()
        );
        println!("Directory structure verified.");
    }
    Ok(())
}

pub async fn cmd_status(cli: &Cli, project_dir: &Path) -> Result<()> {
    let (config, project) = load_project(cli, project_dir)?;
    let settings = config.settings();

    println!();
    println!("{}", style("Project").bold());
    let (bpm, time_sig) = project.tempo_at(0.0);
    println!("  tempo: {} BPM, {}", bpm, time_sig);
    println!("  tempo markers: {}", project.tempo_markers().len());
    if project.tracks().is_empty() {
        println!("  tracks: none");
    } else {
        println!("  tracks:");
        for track in project.tracks() {
            println!(
                "    {} {} ({} notes, {} controllers)",
                style(track.id).dim(),
                track.name,
                track.notes.len(),
                track.controllers.len()
            );
        }
    }
    if let Some(last) = project.undo_history().last() {
        println!("  last edit: {} at {}", last.label, last.at.format("%Y-%m-%d %H:%M:%S"));
    }

    println!();
    println!("{}", style("Service").bold());
    let base_url = settings.base_url();
    println!("  url: {}", base_url);
    let runner = TaskRunner::from_config(settings);
    match runner.available_transport() {
        Some(name) => println!("  transport: {}", name),
        None => println!("  transport: {}", style("none available").red()),
    }
    match check_health(&base_url, Duration::from_secs(3)).await {
        Ok(health) => println!("  health: {}", style(health.status).green()),
        Err(e) => println!("  health: {} ({})", style("unreachable").red(), e),
    }
    println!();
    Ok(())
}
