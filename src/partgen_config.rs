//! Unified configuration for partgen.
//!
//! Reads `.partgen/partgen.toml`. Values are layered file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [service]
//! base_url = "http://127.0.0.1:8000"
//!
//! [transport]
//! mode = "auto"
//! generate_timeout_secs = 180
//! plan_timeout_secs = 120
//! enhance_timeout_secs = 60
//! grace_ms = 1500
//! tick_ms = 25
//!
//! [commit]
//! chunk_size = 256
//! legato_overlap_q = 0.0625
//! legato_max_gap_q = 0.25
//! min_note_gap_q = 0.03125
//!
//! [tempo]
//! min_bpm = 20.0
//! max_bpm = 300.0
//! min_spacing_q = 1.0
//! max_points = 64
//!
//! [model]
//! provider = "local"
//! model_name = "default"
//! temperature = 0.7
//!
//! [defaults]
//! generation_type = "melody"
//! generation_style = "auto"
//! key = "auto"
//! allow_tempo_changes = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the engine reaches the inference service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Prefer the in-process HTTP client, fall back to curl
    #[default]
    Auto,
    Http,
    Curl,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Auto => write!(f, "auto"),
            TransportMode::Http => write!(f, "http"),
            TransportMode::Curl => write!(f, "curl"),
        }
    }
}

impl std::str::FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(TransportMode::Auto),
            "http" => Ok(TransportMode::Http),
            "curl" => Ok(TransportMode::Curl),
            _ => anyhow::bail!(
                "Invalid transport mode '{}'. Valid values: auto, http, curl",
                s
            ),
        }
    }
}

/// Inference service location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

/// Transport timeouts and polling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    #[serde(default)]
    pub mode: TransportMode,
    #[serde(default = "default_generate_timeout")]
    pub generate_timeout_secs: u64,
    #[serde(default = "default_plan_timeout")]
    pub plan_timeout_secs: u64,
    #[serde(default = "default_enhance_timeout")]
    pub enhance_timeout_secs: u64,
    /// Unparseable output younger than this is treated as still being written
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Scheduler turn interval
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_generate_timeout() -> u64 {
    180
}

fn default_plan_timeout() -> u64 {
    120
}

fn default_enhance_timeout() -> u64 {
    60
}

fn default_grace_ms() -> u64 {
    1500
}

fn default_tick_ms() -> u64 {
    25
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            generate_timeout_secs: default_generate_timeout(),
            plan_timeout_secs: default_plan_timeout(),
            enhance_timeout_secs: default_enhance_timeout(),
            grace_ms: default_grace_ms(),
            tick_ms: default_tick_ms(),
        }
    }
}

/// Commit pacing and note shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSection {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_legato_overlap")]
    pub legato_overlap_q: f64,
    #[serde(default = "default_legato_max_gap")]
    pub legato_max_gap_q: f64,
    #[serde(default = "default_min_note_gap")]
    pub min_note_gap_q: f64,
}

fn default_chunk_size() -> usize {
    256
}

fn default_legato_overlap() -> f64 {
    0.0625
}

fn default_legato_max_gap() -> f64 {
    0.25
}

fn default_min_note_gap() -> f64 {
    0.03125
}

impl Default for CommitSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            legato_overlap_q: default_legato_overlap(),
            legato_max_gap_q: default_legato_max_gap(),
            min_note_gap_q: default_min_note_gap(),
        }
    }
}

/// Tempo point normalization limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempoSection {
    #[serde(default = "default_min_bpm")]
    pub min_bpm: f64,
    #[serde(default = "default_max_bpm")]
    pub max_bpm: f64,
    #[serde(default = "default_min_spacing")]
    pub min_spacing_q: f64,
    #[serde(default = "default_max_points")]
    pub max_points: usize,
}

fn default_min_bpm() -> f64 {
    20.0
}

fn default_max_bpm() -> f64 {
    300.0
}

fn default_min_spacing() -> f64 {
    1.0
}

fn default_max_points() -> usize {
    64
}

impl Default for TempoSection {
    fn default() -> Self {
        Self {
            min_bpm: default_min_bpm(),
            max_bpm: default_max_bpm(),
            min_spacing_q: default_min_spacing(),
            max_points: default_max_points(),
        }
    }
}

/// Model/provider parameters forwarded with every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Base URL of the model backend, when it differs from the provider default
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_provider() -> String {
    "local".to_string()
}

fn default_model_name() -> String {
    "default".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_name: default_model_name(),
            temperature: default_temperature(),
            base_url: None,
            api_key: None,
        }
    }
}

/// Generation defaults used when neither the CLI nor sticky settings say otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    #[serde(default = "default_generation_type")]
    pub generation_type: String,
    #[serde(default = "default_generation_style")]
    pub generation_style: String,
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default)]
    pub allow_tempo_changes: bool,
    #[serde(default)]
    pub free_mode: bool,
}

fn default_generation_type() -> String {
    "melody".to_string()
}

fn default_generation_style() -> String {
    "auto".to_string()
}

fn default_key() -> String {
    "auto".to_string()
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            generation_type: default_generation_type(),
            generation_style: default_generation_style(),
            key: default_key(),
            allow_tempo_changes: false,
            free_mode: false,
        }
    }
}

/// The complete partgen.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PartgenToml {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub commit: CommitSection,
    #[serde(default)]
    pub tempo: TempoSection,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
}

impl PartgenToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse partgen.toml")
    }

    /// Load configuration from the default location (.partgen/partgen.toml).
    /// Returns default configuration if file doesn't exist.
    pub fn load_or_default(partgen_dir: &Path) -> Result<Self> {
        let config_path = partgen_dir.join("partgen.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize partgen.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.service.base_url.starts_with("http://")
            && !self.service.base_url.starts_with("https://")
        {
            warnings.push(format!(
                "Invalid service.base_url '{}': should start with http:// or https://",
                self.service.base_url
            ));
        }

        if self.commit.chunk_size == 0 {
            warnings.push("commit.chunk_size must be at least 1".to_string());
        }
        for (name, value) in [
            ("commit.legato_overlap_q", self.commit.legato_overlap_q),
            ("commit.legato_max_gap_q", self.commit.legato_max_gap_q),
            ("commit.min_note_gap_q", self.commit.min_note_gap_q),
        ] {
            if !value.is_finite() || value < 0.0 {
                warnings.push(format!("{} must be a non-negative number, got {}", name, value));
            }
        }

        if !(self.tempo.min_bpm > 0.0 && self.tempo.min_bpm < self.tempo.max_bpm) {
            warnings.push(format!(
                "Invalid tempo range {}..{}: min_bpm must be positive and below max_bpm",
                self.tempo.min_bpm, self.tempo.max_bpm
            ));
        }
        if self.tempo.max_points == 0 {
            warnings.push("tempo.max_points must be at least 1".to_string());
        }

        for (name, secs) in [
            ("transport.generate_timeout_secs", self.transport.generate_timeout_secs),
            ("transport.plan_timeout_secs", self.transport.plan_timeout_secs),
            ("transport.enhance_timeout_secs", self.transport.enhance_timeout_secs),
        ] {
            if secs == 0 {
                warnings.push(format!("{} must be at least 1", name));
            }
        }
        if self.transport.tick_ms == 0 {
            warnings.push("transport.tick_ms must be at least 1".to_string());
        }

        if !(0.0..=2.0).contains(&self.model.temperature) {
            warnings.push(format!(
                "model.temperature {} is outside 0.0..=2.0",
                self.model.temperature
            ));
        }

        warnings
    }
}

/// CLI-level overrides applied on top of file and environment values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub base_url: Option<String>,
    pub transport: Option<TransportMode>,
    pub verbose: bool,
}

/// Unified configuration that combines PartgenToml with runtime settings.
///
/// Merges settings from:
/// 1. partgen.toml file
/// 2. Environment variables
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct PartgenConfig {
    pub project_dir: PathBuf,
    pub partgen_dir: PathBuf,
    pub toml: PartgenToml,
    pub overrides: CliOverrides,
}

impl PartgenConfig {
    /// Create a new PartgenConfig from a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let partgen_dir = project_dir.join(".partgen");
        let toml = PartgenToml::load_or_default(&partgen_dir)?;

        Ok(Self {
            project_dir,
            partgen_dir,
            toml,
            overrides: CliOverrides::default(),
        })
    }

    /// Create PartgenConfig with CLI overrides.
    pub fn with_cli_args(project_dir: PathBuf, overrides: CliOverrides) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.overrides = overrides;
        Ok(config)
    }

    /// Service base URL (CLI → env → file).
    pub fn base_url(&self) -> String {
        self.overrides
            .base_url
            .clone()
            .or_else(|| std::env::var("PARTGEN_BRIDGE_URL").ok())
            .unwrap_or_else(|| self.toml.service.base_url.clone())
            .trim_end_matches('/')
            .to_string()
    }

    /// Transport mode (CLI → env → file). Unparseable env values are ignored.
    pub fn transport_mode(&self) -> TransportMode {
        if let Some(mode) = self.overrides.transport {
            return mode;
        }
        std::env::var("PARTGEN_TRANSPORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.toml.transport.mode)
    }

    /// API key for the model backend (env → file).
    pub fn api_key(&self) -> Option<String> {
        std::env::var("PARTGEN_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.toml.model.api_key.clone())
    }

    pub fn verbose(&self) -> bool {
        self.overrides.verbose
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.toml.transport.grace_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.toml.transport.tick_ms.max(1))
    }

    pub fn config_file(&self) -> PathBuf {
        self.partgen_dir.join("partgen.toml")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.partgen_dir.join("staging")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.partgen_dir.join("logs")
    }

    pub fn project_file(&self) -> PathBuf {
        self.partgen_dir.join("project.json")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.partgen_dir.join("profiles")
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
