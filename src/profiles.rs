//! Instrument profiles and the registry that resolves them for destinations.

use anyhow::{Context, Result};
use glob::glob;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::host::{DestinationId, Timeline};
use crate::settings::PROFILE_ID_KEY;
use crate::util::normalize_name;

/// A pitch given either as a MIDI number or a note name like `C#3`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PitchSpec {
    Number(i32),
    Name(String),
}

impl PitchSpec {
    /// Resolve to a MIDI number where C4 = 60.
    pub fn to_midi(&self) -> Option<i32> {
        match self {
            PitchSpec::Number(n) => Some(*n),
            PitchSpec::Name(name) => note_name_to_midi(name),
        }
    }
}

/// Parse names such as `C4`, `F#2`, `Bb-1`.
pub fn note_name_to_midi(name: &str) -> Option<i32> {
    let name = name.trim();
    if let Ok(n) = name.parse::<i32>() {
        return Some(n);
    }
    let mut chars = name.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let mut semitone = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let rest: &str = chars.as_str();
    let octave_str = if let Some(r) = rest.strip_prefix('#') {
        semitone += 1;
        r
    } else if let Some(r) = rest.strip_prefix('b') {
        semitone -= 1;
        r
    } else {
        rest
    };
    let octave: i32 = octave_str.parse().ok()?;
    Some((octave + 1) * 12 + semitone)
}

/// Name a MIDI pitch, using sharps.
pub fn midi_to_note_name(pitch: i32) -> String {
    const NAMES: [&str; 12] = [
        "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
    ];
    let octave = pitch.div_euclid(12) - 1;
    format!("{}{}", NAMES[pitch.rem_euclid(12) as usize], octave)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticulationMode {
    Keyswitch,
    Cc,
    ProgramChange,
    Channel,
    #[default]
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArticulationEntry {
    #[serde(default)]
    pub pitch: Option<PitchSpec>,
    #[serde(default)]
    pub cc_value: Option<i32>,
    #[serde(default)]
    pub program: Option<i32>,
    #[serde(default)]
    pub chan: Option<u8>,
    #[serde(default)]
    pub vel: Option<i32>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArticulationConfig {
    #[serde(default)]
    pub mode: ArticulationMode,
    #[serde(default)]
    pub cc_number: Option<u8>,
    #[serde(default)]
    pub octave_offset: i32,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub map: BTreeMap<String, ArticulationEntry>,
}

impl ArticulationConfig {
    fn keyswitch_pitch(&self, entry: &ArticulationEntry) -> Option<i32> {
        entry
            .pitch
            .as_ref()
            .and_then(PitchSpec::to_midi)
            .map(|p| p + self.octave_offset * 12)
    }

    /// Articulation triggered by a keyswitch note, if the pitch is mapped.
    pub fn by_keyswitch(&self, pitch: i32) -> Option<&str> {
        if self.mode != ArticulationMode::Keyswitch {
            return None;
        }
        self.map
            .iter()
            .find(|(_, e)| self.keyswitch_pitch(e) == Some(pitch))
            .map(|(name, _)| name.as_str())
    }

    pub fn by_cc(&self, number: u8, value: i32) -> Option<&str> {
        if self.mode != ArticulationMode::Cc || self.cc_number != Some(number) {
            return None;
        }
        self.map
            .iter()
            .find(|(_, e)| e.cc_value == Some(value))
            .map(|(name, _)| name.as_str())
    }

    pub fn by_program(&self, program: i32) -> Option<&str> {
        if self.mode != ArticulationMode::ProgramChange {
            return None;
        }
        self.map
            .iter()
            .find(|(_, e)| e.program == Some(program))
            .map(|(name, _)| name.as_str())
    }

    /// Every mapped keyswitch pitch; notes on these pitches are not musical content.
    pub fn keyswitch_pitches(&self) -> Vec<i32> {
        if self.mode != ArticulationMode::Keyswitch {
            return Vec::new();
        }
        self.map
            .values()
            .filter_map(|e| self.keyswitch_pitch(e))
            .collect()
    }
}

/// A single keyswitch whose velocity turns legato on or off.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegatoConfig {
    #[serde(default)]
    pub mode: ArticulationMode,
    #[serde(default)]
    pub keyswitch: Option<PitchSpec>,
    #[serde(default)]
    pub velocity_on: Option<i32>,
    #[serde(default)]
    pub velocity_off: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegatoSwitch {
    On,
    Off,
    /// Velocity between the thresholds flips the current state
    Toggle,
}

impl LegatoSwitch {
    pub fn set(legato: bool) -> Self {
        if legato {
            LegatoSwitch::On
        } else {
            LegatoSwitch::Off
        }
    }
}

impl LegatoConfig {
    pub fn keyswitch_pitch(&self) -> Option<i32> {
        if self.mode != ArticulationMode::Keyswitch {
            return None;
        }
        self.keyswitch.as_ref().and_then(PitchSpec::to_midi)
    }

    /// What a keyswitch note does to legato, if it is the legato keyswitch.
    pub fn switch_for(&self, pitch: i32, velocity: i32) -> Option<LegatoSwitch> {
        if self.keyswitch_pitch()? != pitch {
            return None;
        }
        if self.velocity_on.is_some_and(|on| velocity >= on) {
            Some(LegatoSwitch::On)
        } else if self.velocity_off.is_some_and(|off| velocity <= off) {
            Some(LegatoSwitch::Off)
        } else {
            Some(LegatoSwitch::Toggle)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRange {
    #[serde(default)]
    pub absolute: Option<[PitchSpec; 2]>,
    #[serde(default)]
    pub comfortable: Option<[PitchSpec; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MidiSettings {
    /// 1-based MIDI channel
    #[serde(default = "default_channel")]
    pub channel: u8,
    #[serde(default)]
    pub polyphony: Option<String>,
    #[serde(default)]
    pub is_drum: bool,
}

fn default_channel() -> u8 {
    1
}

impl Default for MidiSettings {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            polyphony: None,
            is_drum: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub range: ProfileRange,
    #[serde(default)]
    pub midi: MidiSettings,
    #[serde(default)]
    pub articulations: ArticulationConfig,
    #[serde(default)]
    pub legato: LegatoConfig,
    /// Named setting bundles under `ai.presets`
    #[serde(default)]
    pub ai: AiSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiSettings {
    #[serde(default)]
    pub presets: BTreeMap<String, serde_json::Value>,
}

impl InstrumentProfile {
    /// Fallback used when nothing in the registry matches a destination.
    pub fn generic(name: &str) -> Self {
        Self {
            id: "generic".to_string(),
            name: name.to_string(),
            family: "unknown".to_string(),
            description: None,
            range: ProfileRange::default(),
            midi: MidiSettings::default(),
            articulations: ArticulationConfig::default(),
            legato: LegatoConfig::default(),
            ai: AiSettings::default(),
        }
    }

    /// The preset to send: the requested one when the profile has it,
    /// otherwise the first declared. `None` when the profile has no presets.
    pub fn resolve_preset(&self, requested: Option<&str>) -> Option<String> {
        match requested {
            Some(name) if self.ai.presets.contains_key(name) => Some(name.to_string()),
            _ => self.ai.presets.keys().next().cloned(),
        }
    }

    /// Absolute range as `low-high` note names.
    pub fn range_label(&self) -> Option<String> {
        let [low, high] = self.range.absolute.as_ref()?;
        Some(format!(
            "{}-{}",
            midi_to_note_name(low.to_midi()?),
            midi_to_note_name(high.to_midi()?)
        ))
    }

    /// Default articulation name, if the profile declares one.
    pub fn default_articulation(&self) -> Option<&str> {
        self.articulations.default.as_deref()
    }
}

/// Source of instrument profiles.
pub trait ProfileRegistry {
    fn get(&self, id: &str) -> Option<&InstrumentProfile>;
    /// Best profile for a free-form track name.
    fn match_name(&self, name: &str) -> Option<&InstrumentProfile>;
    fn all(&self) -> Vec<&InstrumentProfile>;
}

/// Resolve the profile for a destination: the stored profile id wins, then the track name.
pub fn resolve_profile(
    registry: &dyn ProfileRegistry,
    timeline: &dyn Timeline,
    dest: DestinationId,
) -> InstrumentProfile {
    if let Some(id) = timeline.destination_meta(dest, PROFILE_ID_KEY)
        && let Some(profile) = registry.get(&id)
    {
        return profile.clone();
    }
    let name = timeline.destination_name(dest).unwrap_or_default();
    match registry.match_name(&name) {
        Some(profile) => profile.clone(),
        None => {
            debug!(destination = %name, "No profile matched, using generic");
            InstrumentProfile::generic(&name)
        }
    }
}

/// Profiles shared by every project, in `~/.partgen/profiles`.
pub fn global_profiles_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".partgen").join("profiles"))
}

/// Profiles loaded from `*.json` files in a directory.
#[derive(Debug, Clone, Default)]
pub struct ProfileDirectory {
    profiles: Vec<InstrumentProfile>,
}

impl ProfileDirectory {
    pub fn from_profiles(profiles: Vec<InstrumentProfile>) -> Self {
        Self { profiles }
    }

    /// Load every parseable profile in `dir`. Invalid files are skipped with a warning.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            return Ok(Self::default());
        }
        let pattern = dir.join("*.json").to_string_lossy().to_string();
        let mut paths: Vec<_> = glob(&pattern)
            .context("Failed to read glob pattern")?
            .filter_map(|entry| entry.ok())
            .collect();
        paths.sort();

        let mut profiles = Vec::new();
        for path in paths {
            let parsed = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_json::from_str::<InstrumentProfile>(&c).map_err(Into::into));
            match parsed {
                Ok(profile) => profiles.push(profile),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid profile"),
            }
        }
        debug!(count = profiles.len(), dir = %dir.display(), "Loaded instrument profiles");
        Ok(Self { profiles })
    }

    /// Project profiles layered over the user's global library.
    ///
    /// A project profile shadows a global one with the same id.
    pub fn load_layered(project_dir: &Path, global_dir: Option<&Path>) -> Result<Self> {
        let mut merged = Self::load(project_dir)?;
        if let Some(global_dir) = global_dir {
            let global = Self::load(global_dir)?;
            for profile in global.profiles {
                if merged.get(&profile.id).is_none() {
                    merged.profiles.push(profile);
                }
            }
        }
        Ok(merged)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl ProfileRegistry for ProfileDirectory {
    fn get(&self, id: &str) -> Option<&InstrumentProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    fn match_name(&self, name: &str) -> Option<&InstrumentProfile> {
        let wanted = normalize_name(name);
        if wanted.is_empty() {
            return None;
        }
        if let Some(exact) = self
            .profiles
            .iter()
            .find(|p| normalize_name(&p.name) == wanted || p.id.eq_ignore_ascii_case(&wanted))
        {
            return Some(exact);
        }
        // Longest profile name contained in the track name
        self.profiles
            .iter()
            .filter(|p| {
                let pname = normalize_name(&p.name);
                !pname.is_empty() && wanted.contains(&pname)
            })
            .max_by_key(|p| p.name.len())
    }

    fn all(&self) -> Vec<&InstrumentProfile> {
        self.profiles.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ProjectTimeline;
    use tempfile::tempdir;

    fn strings_profile() -> InstrumentProfile {
        serde_json::from_str(
            r#"{
                "id": "violin_solo",
                "name": "Violin",
                "family": "strings",
                "range": {"absolute": ["G3", "A7"]},
                "midi": {"channel": 1},
                "articulations": {
                    "mode": "keyswitch",
                    "default": "sustain",
                    "map": {
                        "sustain": {"pitch": "C0"},
                        "legato": {"pitch": "C#0"},
                        "staccato": {"pitch": 14}
                    }
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_note_names() {
        assert_eq!(note_name_to_midi("C4"), Some(60));
        assert_eq!(note_name_to_midi("A4"), Some(69));
        assert_eq!(note_name_to_midi("Bb-1"), Some(10));
        assert_eq!(note_name_to_midi("F#2"), Some(42));
        assert_eq!(note_name_to_midi("H2"), None);
        assert_eq!(midi_to_note_name(60), "C4");
        assert_eq!(midi_to_note_name(0), "C-1");
    }

    #[test]
    fn test_keyswitch_lookup() {
        let profile = strings_profile();
        let arts = &profile.articulations;
        assert_eq!(arts.by_keyswitch(13), Some("legato"));
        assert_eq!(arts.by_keyswitch(14), Some("staccato"));
        assert_eq!(arts.by_keyswitch(99), None);
        assert_eq!(arts.by_cc(1, 10), None);
        let mut pitches = arts.keyswitch_pitches();
        pitches.sort();
        assert_eq!(pitches, vec![12, 13, 14]);
    }

    #[test]
    fn test_legato_keyswitch_velocity() {
        let profile: InstrumentProfile = serde_json::from_str(
            r#"{"id": "hn", "name": "Horn", "legato": {"mode": "keyswitch",
                "keyswitch": "C0", "velocity_on": 96, "velocity_off": 32}}"#,
        )
        .unwrap();
        let legato = &profile.legato;
        assert_eq!(legato.keyswitch_pitch(), Some(12));
        assert_eq!(legato.switch_for(12, 96), Some(LegatoSwitch::On));
        assert_eq!(legato.switch_for(12, 32), Some(LegatoSwitch::Off));
        assert_eq!(legato.switch_for(12, 64), Some(LegatoSwitch::Toggle));
        assert_eq!(legato.switch_for(13, 127), None);
        // Only keyswitch mode defines a legato pitch
        assert_eq!(InstrumentProfile::generic("Horn").legato.keyswitch_pitch(), None);
    }

    #[test]
    fn test_resolve_preset() {
        let profile: InstrumentProfile = serde_json::from_str(
            r#"{"id": "pno", "name": "Piano", "ai": {"presets": {"bright": {}, "dark": {}}}}"#,
        )
        .unwrap();
        assert_eq!(profile.resolve_preset(Some("dark")).as_deref(), Some("dark"));
        assert_eq!(profile.resolve_preset(Some("missing")).as_deref(), Some("bright"));
        assert_eq!(profile.resolve_preset(None).as_deref(), Some("bright"));
        assert_eq!(InstrumentProfile::generic("Piano").resolve_preset(Some("dark")), None);
    }

    #[test]
    fn test_range_label() {
        assert_eq!(strings_profile().range_label().as_deref(), Some("G3-A7"));
        assert_eq!(InstrumentProfile::generic("x").range_label(), None);
    }

    #[test]
    fn test_match_name_prefers_exact_then_longest() {
        let mut cello = InstrumentProfile::generic("Cello");
        cello.id = "cello".into();
        let mut violin = strings_profile();
        violin.name = "Violin".into();
        let mut violins = InstrumentProfile::generic("Violin Section");
        violins.id = "violins".into();
        let registry = ProfileDirectory::from_profiles(vec![cello, violin, violins]);

        assert_eq!(registry.match_name("violin").unwrap().id, "violin_solo");
        assert_eq!(registry.match_name("Violin Section 1").unwrap().id, "violins");
        assert_eq!(registry.match_name("Solo Cello").unwrap().id, "cello");
        assert!(registry.match_name("Drums").is_none());
    }

    #[test]
    fn test_resolve_profile_prefers_stored_id() {
        let mut cello = InstrumentProfile::generic("Cello");
        cello.id = "cello".into();
        let registry = ProfileDirectory::from_profiles(vec![cello, strings_profile()]);
        let mut project = ProjectTimeline::default();
        let dest = project.create_destination("Cello");
        assert_eq!(resolve_profile(&registry, &project, dest).id, "cello");

        project.set_destination_meta(dest, PROFILE_ID_KEY, "violin_solo");
        assert_eq!(resolve_profile(&registry, &project, dest).id, "violin_solo");

        let other = project.create_destination("Kazoo");
        assert_eq!(resolve_profile(&registry, &project, other).id, "generic");
    }

    #[test]
    fn test_load_directory_skips_invalid() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("violin.json"),
            serde_json::to_string(&strings_profile()).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = ProfileDirectory::load(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("violin_solo").is_some());
    }

    #[test]
    fn test_project_profiles_shadow_global_ones() {
        let project_dir = tempdir().unwrap();
        let global_dir = tempdir().unwrap();
        let mut local = strings_profile();
        local.name = "House Violin".into();
        let mut cello = strings_profile();
        cello.id = "cello".into();
        cello.name = "Cello".into();
        let write = |dir: &Path, file: &str, profile: &InstrumentProfile| {
            std::fs::write(dir.join(file), serde_json::to_string(profile).unwrap()).unwrap();
        };
        write(project_dir.path(), "violin.json", &local);
        write(global_dir.path(), "violin.json", &strings_profile());
        write(global_dir.path(), "cello.json", &cello);

        let registry =
            ProfileDirectory::load_layered(project_dir.path(), Some(global_dir.path())).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("violin_solo").unwrap().name, "House Violin");
        assert!(registry.get("cello").is_some());
    }

    #[test]
    fn test_load_missing_directory_is_empty() {
        let registry = ProfileDirectory::load(Path::new("/nonexistent/profiles")).unwrap();
        assert!(registry.is_empty());
    }
}
