//! `partgen config`: view, validate and initialize configuration.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use partgen::init::get_partgen_dir;
    use partgen::partgen_config::{PartgenConfig, PartgenToml};

    let partgen_dir = get_partgen_dir(project_dir);
    let config_path = partgen_dir.join("partgen.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("partgen Configuration");
            println!("=====================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                PartgenToml::load(&config_path)?
            } else {
                println!("No partgen.toml found at {}", config_path.display());
                println!("Using default configuration.");
                PartgenToml::default()
            };
            println!();

            println!("[service]");
            println!("  base_url = \"{}\"", toml.service.base_url);
            println!();
            println!("[transport]");
            println!("  mode = \"{}\"", toml.transport.mode);
            println!("  generate_timeout_secs = {}", toml.transport.generate_timeout_secs);
            println!("  plan_timeout_secs = {}", toml.transport.plan_timeout_secs);
            println!("  enhance_timeout_secs = {}", toml.transport.enhance_timeout_secs);
            println!("  grace_ms = {}", toml.transport.grace_ms);
            println!("  tick_ms = {}", toml.transport.tick_ms);
            println!();
            println!("[commit]");
            println!("  chunk_size = {}", toml.commit.chunk_size);
            println!("  legato_overlap_q = {}", toml.commit.legato_overlap_q);
            println!("  legato_max_gap_q = {}", toml.commit.legato_max_gap_q);
            println!("  min_note_gap_q = {}", toml.commit.min_note_gap_q);
            println!();
            println!("[tempo]");
            println!("  min_bpm = {}", toml.tempo.min_bpm);
            println!("  max_bpm = {}", toml.tempo.max_bpm);
            println!("  min_spacing_q = {}", toml.tempo.min_spacing_q);
            println!("  max_points = {}", toml.tempo.max_points);
            println!();
            println!("[model]");
            println!("  provider = \"{}\"", toml.model.provider);
            println!("  model_name = \"{}\"", toml.model.model_name);
            println!("  temperature = {}", toml.model.temperature);
            if let Some(url) = &toml.model.base_url {
                println!("  base_url = \"{}\"", url);
            }
            if toml.model.api_key.is_some() {
                println!("  api_key = \"***\"");
            }
            println!();
            println!("[defaults]");
            println!("  generation_type = \"{}\"", toml.defaults.generation_type);
            println!("  generation_style = \"{}\"", toml.defaults.generation_style);
            println!("  key = \"{}\"", toml.defaults.key);
            println!("  allow_tempo_changes = {}", toml.defaults.allow_tempo_changes);
            println!("  free_mode = {}", toml.defaults.free_mode);
            println!();

            if partgen_dir.exists() {
                let config = PartgenConfig::new(project_dir.to_path_buf())?;
                println!("Effective values (with env overrides):");
                println!("  base_url = \"{}\"", config.base_url());
                println!("  transport = \"{}\"", config.transport_mode());
                println!();
            } else {
                println!("Run 'partgen config init' to create a partgen.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No partgen.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = PartgenToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("partgen.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&partgen_dir)?;
            PartgenToml::default().save(&config_path)?;

            println!("Created partgen.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [service] base_url of the inference service");
            println!("  - [transport] timeouts and polling cadence");
            println!("  - [model] provider, model_name, temperature");
            println!("  - [defaults] generation type, style and key");
            println!();
        }
    }

    Ok(())
}
