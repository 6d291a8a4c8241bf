use serde::{Deserialize, Serialize};

fn default_pitch() -> f64 {
    60.0
}

fn default_velocity() -> f64 {
    100.0
}

fn default_channel() -> f64 {
    1.0
}

/// A generated note, relative to the window start. Channel is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    #[serde(default)]
    pub start_q: f64,
    #[serde(default)]
    pub dur_q: f64,
    #[serde(default = "default_pitch")]
    pub pitch: f64,
    #[serde(default = "default_velocity")]
    pub vel: f64,
    #[serde(default = "default_channel")]
    pub chan: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CcEvent {
    #[serde(default)]
    pub time_q: f64,
    pub cc: f64,
    pub value: f64,
    #[serde(default = "default_channel")]
    pub chan: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyswitchEvent {
    #[serde(default)]
    pub time_q: f64,
    pub pitch: f64,
    #[serde(default = "default_velocity")]
    pub vel: f64,
    #[serde(default = "default_channel")]
    pub chan: f64,
    #[serde(default)]
    pub dur_q: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgramChangeEvent {
    #[serde(default)]
    pub time_q: f64,
    pub program: f64,
    #[serde(default = "default_channel")]
    pub chan: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TempoMarkerEvent {
    #[serde(default)]
    pub time_q: f64,
    #[serde(default)]
    pub bpm: Option<f64>,
    #[serde(default)]
    pub num: Option<u32>,
    #[serde(default)]
    pub denom: Option<u32>,
    #[serde(default)]
    pub linear: Option<bool>,
}

/// Body returned by `/generate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    #[serde(default)]
    pub notes: Vec<NoteEvent>,
    #[serde(default)]
    pub cc_events: Vec<CcEvent>,
    #[serde(default)]
    pub keyswitches: Vec<KeyswitchEvent>,
    #[serde(default)]
    pub program_changes: Vec<ProgramChangeEvent>,
    #[serde(default)]
    pub tempo_markers: Vec<TempoMarkerEvent>,
    #[serde(default)]
    pub articulation: Option<String>,
    #[serde(default)]
    pub motif: Option<serde_json::Value>,
    #[serde(default)]
    pub generation_type: Option<String>,
    #[serde(default)]
    pub generation_style: Option<String>,
}

impl GenerationResponse {
    pub fn has_tempo(&self) -> bool {
        !self.tempo_markers.is_empty()
    }
}

/// Body returned by `/enhance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhanceResponse {
    pub enhanced_prompt: String,
    #[serde(default)]
    pub original_prompt: Option<String>,
}

/// Body returned by `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}
