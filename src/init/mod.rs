//! `partgen init`: create the `.partgen/` directory in a project.
//!
//! ```text
//! .partgen/
//! ├── partgen.toml     # Configuration (defaults written on first init)
//! ├── project.json     # The timeline: tempo map and tracks
//! ├── profiles/        # Instrument profiles (*.json)
//! ├── staging/         # Request/response files of in-flight calls
//! └── logs/            # Rolling log files
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::host::ProjectTimeline;
use crate::music::TimeSignature;
use crate::partgen_config::PartgenToml;

pub const PARTGEN_DIR: &str = ".partgen";

#[derive(Debug)]
pub struct InitResult {
    pub partgen_dir: PathBuf,
    /// False when the directory already existed
    pub created: bool,
}

/// Tempo of a freshly created project timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitOptions {
    pub bpm: f64,
    pub time_sig: TimeSignature,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            time_sig: TimeSignature::COMMON,
        }
    }
}

pub fn get_partgen_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(PARTGEN_DIR)
}

pub fn is_initialized(project_dir: &Path) -> bool {
    get_partgen_dir(project_dir).exists()
}

/// Initialize, or complete, the `.partgen/` structure. Existing files are kept.
pub fn init_project(project_dir: &Path, options: InitOptions) -> Result<InitResult> {
    let partgen_dir = get_partgen_dir(project_dir);
    let created = !partgen_dir.exists();

    for dir in ["profiles", "staging", "logs"] {
        let path = partgen_dir.join(dir);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    }

    let config_file = partgen_dir.join("partgen.toml");
    if !config_file.exists() {
        PartgenToml::default().save(&config_file)?;
    }

    let project_file = partgen_dir.join("project.json");
    if !project_file.exists() {
        ProjectTimeline::new(options.bpm, options.time_sig).save(&project_file)?;
    }

    Ok(InitResult {
        partgen_dir,
        created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Timeline;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_structure() {
        let dir = tempdir().unwrap();
        let result = init_project(dir.path(), InitOptions::default()).unwrap();
        assert!(result.created);
        for sub in ["profiles", "staging", "logs"] {
            assert!(result.partgen_dir.join(sub).is_dir(), "missing {}", sub);
        }
        assert!(result.partgen_dir.join("partgen.toml").is_file());
        assert!(result.partgen_dir.join("project.json").is_file());
        assert!(is_initialized(dir.path()));
    }

    #[test]
    fn test_init_uses_requested_tempo() {
        let dir = tempdir().unwrap();
        let options = InitOptions {
            bpm: 90.0,
            time_sig: TimeSignature::COMMON,
        };
        let result = init_project(dir.path(), options).unwrap();
        let project = ProjectTimeline::load(&result.partgen_dir.join("project.json")).unwrap();
        assert_eq!(project.tempo_at(0.0).0, 90.0);
    }

    #[test]
    fn test_reinit_keeps_existing_files() {
        let dir = tempdir().unwrap();
        init_project(dir.path(), InitOptions::default()).unwrap();
        let config = get_partgen_dir(dir.path()).join("partgen.toml");
        std::fs::write(&config, "[service]\nbase_url = \"http://elsewhere:9000\"\n").unwrap();

        let result = init_project(dir.path(), InitOptions::default()).unwrap();
        assert!(!result.created);
        let content = std::fs::read_to_string(&config).unwrap();
        assert!(content.contains("elsewhere"));
    }
}
