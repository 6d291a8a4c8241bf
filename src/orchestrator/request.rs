//! Request construction.
//!
//! Builders take immutable inputs and return a fresh request; nothing here
//! touches the host except to read it.

use crate::commit::{CommitPayload, PreparedNote};
use crate::errors::EngineError;
use crate::host::{ControllerKind, DestinationId, Timeline};
use crate::model::{
    CcEvent, ContextNote, EnsembleInstrument, GeneratedPart, GenerationRequest, ModelInfo,
    MusicInfo, MusicalContext, TargetInfo, TimeInfo,
};
use crate::music::{QnWindow, TimeSignature, TimeWindow};
use crate::partgen_config::PartgenConfig;
use crate::profiles::InstrumentProfile;
use crate::settings::{ProviderSettings, StickySettings};

pub const AUTO: &str = "auto";
pub const UNKNOWN_KEY: &str = "unknown";

/// User-level choices shared by every request in a flow.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub generation_type: String,
    pub generation_style: String,
    /// A key name, or `auto` to ask the key estimator
    pub key: String,
    pub user_prompt: String,
    pub free_mode: bool,
    pub allow_tempo_changes: bool,
    pub articulation: Option<String>,
    /// Profile preset to ask for; the profile's first preset when unset
    pub preset_name: Option<String>,
    pub model: ModelInfo,
}

impl GenerationSettings {
    pub fn from_config(config: &PartgenConfig) -> Self {
        let defaults = &config.toml.defaults;
        let model = &config.toml.model;
        Self {
            generation_type: defaults.generation_type.clone(),
            generation_style: defaults.generation_style.clone(),
            key: defaults.key.clone(),
            user_prompt: String::new(),
            free_mode: defaults.free_mode,
            allow_tempo_changes: defaults.allow_tempo_changes,
            articulation: None,
            preset_name: None,
            model: ModelInfo {
                provider: model.provider.clone(),
                model_name: Some(model.model_name.clone()),
                temperature: Some(model.temperature),
                base_url: model.base_url.clone(),
                api_key: config.api_key(),
            },
        }
    }

    /// Fill values left open (empty prompt, `auto` style or key) from what
    /// the destination remembered.
    pub fn with_sticky(&self, sticky: &StickySettings) -> Self {
        let mut merged = self.clone();
        if merged.user_prompt.trim().is_empty()
            && let Some(prompt) = &sticky.prompt
        {
            merged.user_prompt = prompt.clone();
        }
        if merged.generation_style.eq_ignore_ascii_case(AUTO)
            && let Some(style) = &sticky.generation_style
        {
            merged.generation_style = style.clone();
        }
        if merged.key.eq_ignore_ascii_case(AUTO)
            && let Some(key) = &sticky.key_mode
        {
            merged.key = key.clone();
        }
        if merged.preset_name.is_none() {
            merged.preset_name = sticky.preset_name.clone();
        }
        merged
    }

    /// What to remember on a destination after a successful commit.
    pub fn sticky_for(&self, profile_id: &str) -> StickySettings {
        StickySettings {
            profile_id: Some(profile_id.to_string()),
            generation_type: Some(self.generation_type.clone()),
            generation_style: Some(self.generation_style.clone()),
            prompt: Some(self.user_prompt.clone()).filter(|p| !p.trim().is_empty()),
            key_mode: Some(self.key.clone()),
            preset_name: self.preset_name.clone(),
        }
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            provider: Some(self.model.provider.clone()),
            model_name: self.model.model_name.clone(),
            base_url: self.model.base_url.clone(),
        }
    }
}

/// A validated time window with the tempo in effect at its start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowInfo {
    pub time: TimeWindow,
    pub qn: QnWindow,
    pub bpm: f64,
    pub time_sig: TimeSignature,
}

impl WindowInfo {
    pub fn resolve(host: &dyn Timeline, time: TimeWindow) -> Result<Self, EngineError> {
        if !time.is_valid() {
            return Err(EngineError::InvalidWindow {
                start_sec: time.start_sec,
                end_sec: time.end_sec,
            });
        }
        let (bpm, time_sig) = host.tempo_at(time.start_sec);
        Ok(Self {
            time,
            qn: QnWindow {
                start_qn: host.time_to_qn(time.start_sec),
                end_qn: host.time_to_qn(time.end_sec),
            },
            bpm,
            time_sig,
        })
    }

    /// Re-read seconds and tempo after the tempo map changed.
    ///
    /// The quarter-note span is what gets committed, so it stays fixed.
    pub fn resync(&mut self, host: &dyn Timeline) {
        self.time = TimeWindow::new(
            host.qn_to_time(self.qn.start_qn),
            host.qn_to_time(self.qn.end_qn),
        );
        let (bpm, time_sig) = host.tempo_at(self.time.start_sec);
        self.bpm = bpm;
        self.time_sig = time_sig;
    }

    pub fn bars(&self) -> u32 {
        self.qn.bars(self.time_sig)
    }

    pub fn time_info(&self) -> TimeInfo {
        TimeInfo {
            start_sec: self.time.start_sec,
            end_sec: self.time.end_sec,
            length_bars: self.bars(),
        }
    }

    pub fn music_info(&self, key: &str) -> MusicInfo {
        MusicInfo {
            bpm: self.bpm,
            time_sig: self.time_sig.to_string(),
            key: key.to_string(),
        }
    }
}

/// How the destination of a single generation is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationChoice {
    /// First selected track
    Selected,
    Id(DestinationId),
    /// An existing track by name
    Named(String),
    /// A track created for this generation
    New(String),
}

pub fn resolve_destination(
    host: &mut dyn Timeline,
    choice: &DestinationChoice,
) -> Result<DestinationId, EngineError> {
    match choice {
        DestinationChoice::Selected => host
            .selected_destinations()
            .into_iter()
            .find(|d| host.is_alive(*d))
            .ok_or(EngineError::NoDestination),
        DestinationChoice::Id(id) if host.is_alive(*id) => Ok(*id),
        DestinationChoice::Id(_) => Err(EngineError::NoDestination),
        DestinationChoice::Named(name) => {
            host.find_destination(name).ok_or(EngineError::NoDestination)
        }
        DestinationChoice::New(name) => Ok(host.create_destination(name)),
    }
}

/// Key to send: explicit names pass through, `auto` asks the estimator.
pub fn resolve_key(
    settings: &GenerationSettings,
    estimate: impl FnOnce() -> Option<String>,
) -> String {
    if settings.key.eq_ignore_ascii_case(AUTO) || settings.key.trim().is_empty() {
        estimate().unwrap_or_else(|| UNKNOWN_KEY.to_string())
    } else {
        settings.key.clone()
    }
}

pub fn describe_instrument(
    position: usize,
    track_name: &str,
    profile: &InstrumentProfile,
    role: &str,
) -> EnsembleInstrument {
    EnsembleInstrument {
        index: position,
        track_name: track_name.to_string(),
        profile_id: profile.id.clone(),
        profile_name: profile.name.clone(),
        family: profile.family.clone(),
        role: role.to_string(),
        range: profile.range.absolute.as_ref().map(|_| profile.range.clone()),
        description: profile.description.clone().unwrap_or_default(),
    }
}

/// Target block with the preset resolved against the profile.
fn target_info(settings: &GenerationSettings, profile: &InstrumentProfile) -> TargetInfo {
    let preset_name = profile.resolve_preset(settings.preset_name.as_deref());
    let profile_overrides = preset_name
        .as_ref()
        .and_then(|name| profile.ai.presets.get(name))
        .filter(|overrides| !overrides.is_null())
        .cloned();
    TargetInfo {
        profile_id: profile.id.clone(),
        articulation: settings.articulation.clone(),
        // Without presets on the profile the requested name goes out as is
        preset_name: preset_name.or_else(|| settings.preset_name.clone()),
        profile_overrides,
    }
}

pub fn build_generation_request(
    settings: &GenerationSettings,
    window: &WindowInfo,
    key: &str,
    profile: &InstrumentProfile,
    context: Option<MusicalContext>,
) -> GenerationRequest {
    GenerationRequest {
        time: window.time_info(),
        music: window.music_info(key),
        target: target_info(settings, profile),
        generation_type: settings.generation_type.clone(),
        generation_style: settings.generation_style.clone(),
        free_mode: settings.free_mode,
        allow_tempo_changes: settings.allow_tempo_changes,
        user_prompt: settings.user_prompt.clone(),
        model: settings.model.clone(),
        context,
        ensemble: None,
    }
}

fn context_note(note: &PreparedNote) -> ContextNote {
    ContextNote {
        start_q: note.start_q,
        dur_q: note.end_q - note.start_q,
        pitch: note.pitch as i32,
        vel: note.velocity as i32,
        chan: note.channel as i32 + 1,
    }
}

/// Record of a committed part, as later requests see it.
pub fn generated_part(
    track_name: &str,
    profile: &InstrumentProfile,
    role: &str,
    payload: &CommitPayload,
) -> GeneratedPart {
    GeneratedPart {
        track_name: track_name.to_string(),
        profile_name: profile.name.clone(),
        role: role.to_string(),
        notes: payload.notes.iter().map(context_note).collect(),
        cc_events: payload
            .controllers
            .iter()
            .filter_map(|c| match c.kind {
                ControllerKind::Cc { number, value } => Some(CcEvent {
                    time_q: c.time_q,
                    cc: number as f64,
                    value: value as f64,
                    chan: c.channel as f64 + 1.0,
                }),
                ControllerKind::ProgramChange { .. } => None,
            })
            .collect(),
    }
}
