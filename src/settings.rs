//! Persisted user choices.
//!
//! Per-destination sticky settings live in the destination's metadata;
//! global provider settings live in the `partgen` ext-state section. Both
//! are flat string key/value pairs, read at session start and written only
//! after a successful generation.

use crate::host::{DestinationId, Timeline};

pub const PROFILE_ID_KEY: &str = "partgen.profile_id";
pub const GENERATION_TYPE_KEY: &str = "partgen.generation_type";
pub const GENERATION_STYLE_KEY: &str = "partgen.generation_style";
pub const PROMPT_KEY: &str = "partgen.prompt";
pub const KEY_MODE_KEY: &str = "partgen.key_mode";
pub const PRESET_NAME_KEY: &str = "partgen.preset_name";

pub const EXT_SECTION: &str = "partgen";

/// Choices remembered on a destination between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StickySettings {
    pub profile_id: Option<String>,
    pub generation_type: Option<String>,
    pub generation_style: Option<String>,
    pub prompt: Option<String>,
    pub key_mode: Option<String>,
    pub preset_name: Option<String>,
}

impl StickySettings {
    pub fn read(timeline: &dyn Timeline, dest: DestinationId) -> Self {
        let get = |key: &str| {
            timeline
                .destination_meta(dest, key)
                .filter(|v| !v.is_empty())
        };
        Self {
            profile_id: get(PROFILE_ID_KEY),
            generation_type: get(GENERATION_TYPE_KEY),
            generation_style: get(GENERATION_STYLE_KEY),
            prompt: get(PROMPT_KEY),
            key_mode: get(KEY_MODE_KEY),
            preset_name: get(PRESET_NAME_KEY),
        }
    }

    /// Write every present value. Returns false if the destination is gone.
    pub fn write(&self, timeline: &mut dyn Timeline, dest: DestinationId) -> bool {
        if !timeline.is_alive(dest) {
            return false;
        }
        for (key, value) in [
            (PROFILE_ID_KEY, &self.profile_id),
            (GENERATION_TYPE_KEY, &self.generation_type),
            (GENERATION_STYLE_KEY, &self.generation_style),
            (PROMPT_KEY, &self.prompt),
            (KEY_MODE_KEY, &self.key_mode),
            (PRESET_NAME_KEY, &self.preset_name),
        ] {
            if let Some(value) = value {
                timeline.set_destination_meta(dest, key, value);
            }
        }
        true
    }
}

/// Provider choices shared by every destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderSettings {
    pub provider: Option<String>,
    pub model_name: Option<String>,
    pub base_url: Option<String>,
}

impl ProviderSettings {
    pub fn read(timeline: &dyn Timeline) -> Self {
        let get = |key: &str| {
            timeline
                .ext_state(EXT_SECTION, key)
                .filter(|v| !v.is_empty())
        };
        Self {
            provider: get("provider"),
            model_name: get("model_name"),
            base_url: get("base_url"),
        }
    }

    pub fn write(&self, timeline: &mut dyn Timeline) {
        for (key, value) in [
            ("provider", &self.provider),
            ("model_name", &self.model_name),
            ("base_url", &self.base_url),
        ] {
            if let Some(value) = value {
                timeline.set_ext_state(EXT_SECTION, key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ProjectTimeline;

    #[test]
    fn test_sticky_roundtrip_skips_absent_values() {
        let mut project = ProjectTimeline::default();
        let dest = project.create_destination("Horn");
        let sticky = StickySettings {
            profile_id: Some("horn".into()),
            generation_style: Some("romantic".into()),
            ..Default::default()
        };
        assert!(sticky.write(&mut project, dest));
        assert_eq!(StickySettings::read(&project, dest), sticky);
        assert!(project.destination_meta(dest, PROMPT_KEY).is_none());
    }

    #[test]
    fn test_sticky_write_to_dead_destination() {
        let mut project = ProjectTimeline::default();
        assert!(!StickySettings::default().write(&mut project, DestinationId(7)));
    }

    #[test]
    fn test_provider_settings_in_ext_state() {
        let mut project = ProjectTimeline::default();
        let settings = ProviderSettings {
            provider: Some("openai".into()),
            model_name: Some("gpt".into()),
            base_url: None,
        };
        settings.write(&mut project);
        assert_eq!(project.ext_state(EXT_SECTION, "provider").as_deref(), Some("openai"));
        assert_eq!(ProviderSettings::read(&project), settings);
    }
}
