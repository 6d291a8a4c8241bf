use serde::{Deserialize, Serialize};

use crate::profiles::ProfileRange;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeInfo {
    pub start_sec: f64,
    pub end_sec: f64,
    pub length_bars: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicInfo {
    pub bpm: f64,
    /// `N/D`
    pub time_sig: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub profile_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub articulation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset_name: Option<String>,
    /// Settings of the chosen preset, merged over the profile by the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_overrides: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// A note in quarter notes relative to the window start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextNote {
    pub start_q: f64,
    pub dur_q: f64,
    pub pitch: i32,
    pub vel: i32,
    /// 1-based channel
    pub chan: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PitchRange {
    pub min: i32,
    pub max: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizontalContext {
    #[serde(default)]
    pub before: Vec<ContextNote>,
    #[serde(default)]
    pub after: Vec<ContextNote>,
    /// `start`, `middle`, `end` or `isolated`
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextTrack {
    pub name: String,
    pub notes: Vec<ContextNote>,
}

/// Surrounding material sampled from the timeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MusicalContext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub existing_notes: Vec<ContextNote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch_range: Option<PitchRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal: Option<HorizontalContext>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_tracks: Vec<ContextTrack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_notes: Option<String>,
}

impl MusicalContext {
    pub fn is_empty(&self) -> bool {
        self.existing_notes.is_empty()
            && self.horizontal.is_none()
            && self.context_tracks.is_empty()
            && self.context_notes.is_none()
    }
}

/// One destination as described to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleInstrument {
    /// 1-based position in generation order
    pub index: usize,
    pub track_name: String,
    pub profile_id: String,
    pub profile_name: String,
    pub family: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ProfileRange>,
    #[serde(default)]
    pub description: String,
}

/// A part already committed earlier in the same session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedPart {
    pub track_name: String,
    pub profile_name: String,
    pub role: String,
    pub notes: Vec<ContextNote>,
    #[serde(default)]
    pub cc_events: Vec<crate::model::CcEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleInfo {
    pub total_instruments: usize,
    pub instruments: Vec<EnsembleInstrument>,
    pub generation_style: String,
    #[serde(default)]
    pub shared_prompt: String,
    #[serde(default)]
    pub plan_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<serde_json::Value>,
    pub current_instrument_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_instrument: Option<EnsembleInstrument>,
    pub generation_order: usize,
    pub is_sequential: bool,
    #[serde(default)]
    pub previously_generated: Vec<GeneratedPart>,
}

/// Body of a `/generate` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub time: TimeInfo,
    pub music: MusicInfo,
    pub target: TargetInfo,
    pub generation_type: String,
    pub generation_style: String,
    pub free_mode: bool,
    pub allow_tempo_changes: bool,
    pub user_prompt: String,
    pub model: ModelInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<MusicalContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensemble: Option<EnsembleInfo>,
}

/// The source material an arrangement is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SketchInfo {
    pub track_name: String,
    pub notes: Vec<ContextNote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch_range: Option<PitchRange>,
}

/// Body of a `/plan` or `/arrange_plan` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub time: TimeInfo,
    pub music: MusicInfo,
    pub user_prompt: String,
    pub generation_style: String,
    pub allow_tempo_changes: bool,
    pub instruments: Vec<EnsembleInstrument>,
    pub model: ModelInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sketch: Option<SketchInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhanceInstrument {
    pub track_name: String,
    pub profile_name: String,
    pub family: String,
    pub role: String,
}

/// Body of an `/enhance` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhanceRequest {
    pub user_prompt: String,
    pub instruments: Vec<EnhanceInstrument>,
    pub key: String,
    pub bpm: f64,
    pub time_sig: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_bars: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_q: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_notes: Option<String>,
    pub model: ModelInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_request() -> GenerationRequest {
        GenerationRequest {
            time: TimeInfo {
                start_sec: 0.0,
                end_sec: 8.0,
                length_bars: 4,
            },
            music: MusicInfo {
                bpm: 120.0,
                time_sig: "4/4".into(),
                key: "C major".into(),
            },
            target: TargetInfo {
                profile_id: "piano".into(),
                articulation: None,
                preset_name: None,
                profile_overrides: None,
            },
            generation_type: "melody".into(),
            generation_style: "auto".into(),
            free_mode: false,
            allow_tempo_changes: false,
            user_prompt: String::new(),
            model: ModelInfo {
                provider: "local".into(),
                model_name: None,
                temperature: Some(0.7),
                base_url: None,
                api_key: None,
            },
            context: None,
            ensemble: None,
        }
    }

    #[test]
    fn test_request_omits_absent_optional_blocks() {
        let json = serde_json::to_value(minimal_request()).unwrap();
        assert!(json.get("context").is_none());
        assert!(json.get("ensemble").is_none());
        assert!(json["target"].get("articulation").is_none());
        assert_eq!(json["time"]["length_bars"], 4);
        assert_eq!(json["music"]["time_sig"], "4/4");
        assert_eq!(json["model"]["temperature"], 0.7);
    }

    #[test]
    fn test_empty_context_fields_are_skipped() {
        let ctx = MusicalContext::default();
        assert!(ctx.is_empty());
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }

    #[test]
    fn test_ensemble_block_shape() {
        let mut request = minimal_request();
        request.ensemble = Some(EnsembleInfo {
            total_instruments: 2,
            instruments: vec![],
            generation_style: "auto".into(),
            shared_prompt: "hymn".into(),
            plan_summary: String::new(),
            plan: None,
            current_instrument_index: 2,
            current_instrument: None,
            generation_order: 2,
            is_sequential: true,
            previously_generated: vec![GeneratedPart {
                track_name: "Piano".into(),
                profile_name: "Piano".into(),
                role: "harmony".into(),
                notes: vec![ContextNote {
                    start_q: 0.0,
                    dur_q: 1.0,
                    pitch: 60,
                    vel: 90,
                    chan: 1,
                }],
                cc_events: vec![],
            }],
        });
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["ensemble"]["is_sequential"], true);
        assert_eq!(
            json["ensemble"]["previously_generated"][0]["notes"][0]["pitch"],
            60
        );
    }
}
