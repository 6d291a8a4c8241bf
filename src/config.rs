use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::partgen_config::{CliOverrides, PartgenConfig};

/// Runtime configuration for partgen.
///
/// Bridges the layered PartgenConfig with the paths the CLI needs at run
/// time: where requests are staged, where logs go, and where the project
/// timeline and instrument profiles live.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub partgen_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub log_dir: PathBuf,
    pub project_file: PathBuf,
    pub profiles_dir: PathBuf,
    pub verbose: bool,
    settings: PartgenConfig,
}

impl Config {
    pub fn new(project_dir: PathBuf, overrides: CliOverrides) -> Result<Self> {
        let verbose = overrides.verbose;
        let settings = PartgenConfig::with_cli_args(project_dir, overrides)
            .context("Failed to load partgen configuration")?;

        Ok(Self {
            project_dir: settings.project_dir.clone(),
            partgen_dir: settings.partgen_dir.clone(),
            staging_dir: settings.staging_dir(),
            log_dir: settings.log_dir(),
            project_file: settings.project_file(),
            profiles_dir: settings.profiles_dir(),
            verbose,
            settings,
        })
    }

    /// The layered file/env/CLI settings.
    pub fn settings(&self) -> &PartgenConfig {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        self.partgen_dir.exists()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.staging_dir)
            .context("Failed to create staging directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.profiles_dir)
            .context("Failed to create profiles directory")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_paths_in_partgen_directory() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), CliOverrides::default()).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.project_dir, root);
        assert_eq!(config.staging_dir, root.join(".partgen/staging"));
        assert_eq!(config.log_dir, root.join(".partgen/logs"));
        assert_eq!(config.project_file, root.join(".partgen/project.json"));
        assert!(!config.is_initialized());
    }

    #[test]
    fn test_config_carries_verbose_flag() {
        let dir = tempdir().unwrap();
        let overrides = CliOverrides {
            verbose: true,
            ..Default::default()
        };
        let config = Config::new(dir.path().to_path_buf(), overrides).unwrap();
        assert!(config.verbose);
        assert!(config.settings().verbose());
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), CliOverrides::default()).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.staging_dir.exists());
        assert!(config.log_dir.exists());
        assert!(config.profiles_dir.exists());
        assert!(config.is_initialized());
    }

    #[test]
    fn test_config_missing_project_dir() {
        let result = Config::new(PathBuf::from("/nonexistent/partgen/project"), CliOverrides::default());
        assert!(result.is_err());
    }
}
