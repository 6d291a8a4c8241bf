//! JSON-file-backed timeline used by the CLI.
//!
//! A project is a tempo map plus a list of tracks. Each track keeps its
//! notes and controller units sorted by position, a list of item spans
//! (containers), and flat string metadata. Undo blocks are recorded as a
//! labelled history so callers can see one entry per commit.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::{
    ContainerInfo, ControllerUnit, DestinationId, NoteUnit, TempoMarker, Tick, Timeline,
};
use crate::music::TimeSignature;
use crate::util::normalize_name;

const DEFAULT_BPM: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSpan {
    pub start: Tick,
    pub end: Tick,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: DestinationId,
    pub name: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub items: Vec<ItemSpan>,
    #[serde(default)]
    pub notes: Vec<NoteUnit>,
    #[serde(default)]
    pub controllers: Vec<ControllerUnit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoEntry {
    pub label: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectTimeline {
    #[serde(default)]
    tempo_markers: Vec<TempoMarker>,
    #[serde(default)]
    tracks: Vec<Track>,
    #[serde(default)]
    selected: Vec<DestinationId>,
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    ext_state: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    undo_history: Vec<UndoEntry>,
    #[serde(skip)]
    undo_open: bool,
    #[serde(skip)]
    redraws: u64,
}

impl Default for ProjectTimeline {
    fn default() -> Self {
        Self::new(DEFAULT_BPM, TimeSignature::COMMON)
    }
}

impl ProjectTimeline {
    /// An empty project with one tempo marker at zero.
    pub fn new(bpm: f64, time_sig: TimeSignature) -> Self {
        Self {
            tempo_markers: vec![TempoMarker {
                time_sec: 0.0,
                bpm,
                time_sig,
                linear: false,
            }],
            tracks: Vec::new(),
            selected: Vec::new(),
            next_id: 1,
            ext_state: BTreeMap::new(),
            undo_history: Vec::new(),
            undo_open: false,
            redraws: 0,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read project file: {}", path.display()))?;
        let mut project: ProjectTimeline = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse project file: {}", path.display()))?;
        project.normalize();
        Ok(project)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize project to JSON")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write project file: {}", path.display()))?;
        Ok(())
    }

    /// Restore ordering invariants on hand-edited files.
    fn normalize(&mut self) {
        if self.tempo_markers.is_empty() {
            self.tempo_markers.push(TempoMarker {
                time_sec: 0.0,
                bpm: DEFAULT_BPM,
                time_sig: TimeSignature::COMMON,
                linear: false,
            });
        }
        self.tempo_markers
            .sort_by(|a, b| a.time_sec.total_cmp(&b.time_sec));
        for track in &mut self.tracks {
            track.notes.sort_by_key(|n| n.start);
            track.controllers.sort_by_key(|c| c.tick);
        }
        let max_id = self.tracks.iter().map(|t| t.id.0).max().unwrap_or(0);
        self.next_id = self.next_id.max(max_id + 1);
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, dest: DestinationId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == dest)
    }

    fn track_mut(&mut self, dest: DestinationId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == dest)
    }

    pub fn remove_track(&mut self, dest: DestinationId) -> bool {
        let before = self.tracks.len();
        self.tracks.retain(|t| t.id != dest);
        self.selected.retain(|d| *d != dest);
        self.tracks.len() != before
    }

    pub fn select(&mut self, dests: &[DestinationId]) {
        self.selected = dests
            .iter()
            .copied()
            .filter(|d| self.track(*d).is_some())
            .collect();
    }

    pub fn undo_history(&self) -> &[UndoEntry] {
        &self.undo_history
    }

    pub fn is_undo_open(&self) -> bool {
        self.undo_open
    }

    pub fn redraw_count(&self) -> u64 {
        self.redraws
    }

    /// Position of the segment containing `sec`: (segment start sec, start qn, bpm).
    fn segment_for_time(&self, sec: f64) -> (f64, f64, f64) {
        let mut seg_time = 0.0;
        let mut seg_qn = 0.0;
        let mut bpm = self
            .tempo_markers
            .first()
            .map(|m| m.bpm)
            .unwrap_or(DEFAULT_BPM);
        for marker in &self.tempo_markers {
            if marker.time_sec > sec {
                break;
            }
            seg_qn += (marker.time_sec - seg_time) * bpm / 60.0;
            seg_time = marker.time_sec;
            bpm = marker.bpm;
        }
        (seg_time, seg_qn, bpm)
    }
}

impl Timeline for ProjectTimeline {
    fn destinations(&self) -> Vec<DestinationId> {
        self.tracks.iter().map(|t| t.id).collect()
    }

    fn selected_destinations(&self) -> Vec<DestinationId> {
        self.selected
            .iter()
            .copied()
            .filter(|d| self.track(*d).is_some())
            .collect()
    }

    fn create_destination(&mut self, name: &str) -> DestinationId {
        let id = DestinationId(self.next_id);
        self.next_id += 1;
        self.tracks.push(Track {
            id,
            name: name.to_string(),
            meta: BTreeMap::new(),
            items: Vec::new(),
            notes: Vec::new(),
            controllers: Vec::new(),
        });
        id
    }

    fn find_destination(&self, name: &str) -> Option<DestinationId> {
        let wanted = normalize_name(name);
        self.tracks
            .iter()
            .find(|t| normalize_name(&t.name) == wanted)
            .map(|t| t.id)
    }

    fn destination_name(&self, dest: DestinationId) -> Option<String> {
        self.track(dest).map(|t| t.name.clone())
    }

    fn is_alive(&self, dest: DestinationId) -> bool {
        self.track(dest).is_some()
    }

    fn prepare_container(
        &mut self,
        dest: DestinationId,
        start: Tick,
        end: Tick,
    ) -> Option<ContainerInfo> {
        let track = self.track_mut(dest)?;
        if let Some(item) = track
            .items
            .iter_mut()
            .find(|i| i.start < end && i.end > start)
        {
            item.start = item.start.min(start);
            item.end = item.end.max(end);
            return Some(ContainerInfo {
                start: item.start,
                end: item.end,
                freshly_created: false,
            });
        }
        let loose = track.notes.iter().any(|n| n.intersects(start, end))
            || track.controllers.iter().any(|c| c.within(start, end));
        track.items.push(ItemSpan { start, end });
        track.items.sort_by_key(|i| i.start);
        Some(ContainerInfo {
            start,
            end,
            freshly_created: !loose,
        })
    }

    fn note_count(&self, dest: DestinationId) -> usize {
        self.track(dest).map(|t| t.notes.len()).unwrap_or(0)
    }

    fn note(&self, dest: DestinationId, index: usize) -> Option<NoteUnit> {
        self.track(dest)?.notes.get(index).copied()
    }

    fn delete_note(&mut self, dest: DestinationId, index: usize) -> bool {
        match self.track_mut(dest) {
            Some(track) if index < track.notes.len() => {
                track.notes.remove(index);
                true
            }
            _ => false,
        }
    }

    fn insert_note(&mut self, dest: DestinationId, note: NoteUnit) -> bool {
        let Some(track) = self.track_mut(dest) else {
            return false;
        };
        let at = track.notes.partition_point(|n| n.start <= note.start);
        track.notes.insert(at, note);
        true
    }

    fn controller_count(&self, dest: DestinationId) -> usize {
        self.track(dest).map(|t| t.controllers.len()).unwrap_or(0)
    }

    fn controller(&self, dest: DestinationId, index: usize) -> Option<ControllerUnit> {
        self.track(dest)?.controllers.get(index).copied()
    }

    fn delete_controller(&mut self, dest: DestinationId, index: usize) -> bool {
        match self.track_mut(dest) {
            Some(track) if index < track.controllers.len() => {
                track.controllers.remove(index);
                true
            }
            _ => false,
        }
    }

    fn insert_controller(&mut self, dest: DestinationId, unit: ControllerUnit) -> bool {
        let Some(track) = self.track_mut(dest) else {
            return false;
        };
        let at = track.controllers.partition_point(|c| c.tick <= unit.tick);
        track.controllers.insert(at, unit);
        true
    }

    fn time_to_qn(&self, sec: f64) -> f64 {
        let (seg_time, seg_qn, bpm) = self.segment_for_time(sec);
        seg_qn + (sec - seg_time) * bpm / 60.0
    }

    fn qn_to_time(&self, qn: f64) -> f64 {
        let mut seg_time = 0.0;
        let mut seg_qn = 0.0;
        let mut bpm = self
            .tempo_markers
            .first()
            .map(|m| m.bpm)
            .unwrap_or(DEFAULT_BPM);
        for marker in &self.tempo_markers {
            let marker_qn = seg_qn + (marker.time_sec - seg_time) * bpm / 60.0;
            if marker_qn > qn {
                break;
            }
            seg_qn = marker_qn;
            seg_time = marker.time_sec;
            bpm = marker.bpm;
        }
        seg_time + (qn - seg_qn) * 60.0 / bpm
    }

    fn begin_undo(&mut self) {
        self.undo_open = true;
    }

    fn end_undo(&mut self, label: &str) {
        if self.undo_open {
            self.undo_open = false;
            self.undo_history.push(UndoEntry {
                label: label.to_string(),
                at: Utc::now(),
            });
        }
    }

    fn abort_undo(&mut self, label: &str) {
        if self.undo_open {
            self.undo_open = false;
            self.undo_history.push(UndoEntry {
                label: format!("{} (aborted)", label),
                at: Utc::now(),
            });
        }
    }

    fn redraw(&mut self) {
        self.redraws += 1;
    }

    fn destination_meta(&self, dest: DestinationId, key: &str) -> Option<String> {
        self.track(dest)?.meta.get(key).cloned()
    }

    fn set_destination_meta(&mut self, dest: DestinationId, key: &str, value: &str) -> bool {
        match self.track_mut(dest) {
            Some(track) => {
                track.meta.insert(key.to_string(), value.to_string());
                true
            }
            None => false,
        }
    }

    fn ext_state(&self, section: &str, key: &str) -> Option<String> {
        self.ext_state.get(section)?.get(key).cloned()
    }

    fn set_ext_state(&mut self, section: &str, key: &str, value: &str) {
        self.ext_state
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    fn tempo_markers(&self) -> Vec<TempoMarker> {
        self.tempo_markers.clone()
    }

    fn set_tempo_marker(&mut self, index: usize, marker: TempoMarker) -> bool {
        match self.tempo_markers.get_mut(index) {
            Some(slot) => {
                *slot = marker;
                self.tempo_markers
                    .sort_by(|a, b| a.time_sec.total_cmp(&b.time_sec));
                true
            }
            None => false,
        }
    }

    fn insert_tempo_marker(&mut self, marker: TempoMarker) {
        let at = self
            .tempo_markers
            .partition_point(|m| m.time_sec <= marker.time_sec);
        self.tempo_markers.insert(at, marker);
    }

    fn tempo_at(&self, sec: f64) -> (f64, TimeSignature) {
        self.tempo_markers
            .iter()
            .take_while(|m| m.time_sec <= sec)
            .last()
            .or_else(|| self.tempo_markers.first())
            .map(|m| (m.bpm, m.time_sig))
            .unwrap_or((DEFAULT_BPM, TimeSignature::COMMON))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn note(start: Tick, end: Tick, pitch: u8) -> NoteUnit {
        NoteUnit {
            start,
            end,
            pitch,
            velocity: 100,
            channel: 0,
        }
    }

    #[test]
    fn test_time_conversion_constant_tempo() {
        let project = ProjectTimeline::new(120.0, TimeSignature::COMMON);
        assert!((project.time_to_qn(2.0) - 4.0).abs() < 1e-9);
        assert!((project.qn_to_time(8.0) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_conversion_across_tempo_change() {
        let mut project = ProjectTimeline::new(120.0, TimeSignature::COMMON);
        // 4 quarters at 120 = 2s, then 60 bpm
        project.insert_tempo_marker(TempoMarker {
            time_sec: 2.0,
            bpm: 60.0,
            time_sig: TimeSignature::COMMON,
            linear: false,
        });
        assert!((project.time_to_qn(3.0) - 5.0).abs() < 1e-9);
        assert!((project.qn_to_time(6.0) - 4.0).abs() < 1e-9);
        assert!((project.qn_to_time(2.0) - 1.0).abs() < 1e-9);
        let (bpm, _) = project.tempo_at(2.5);
        assert!((bpm - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_notes_stay_sorted_and_stable() {
        let mut project = ProjectTimeline::default();
        let dest = project.create_destination("Piano");
        assert!(project.insert_note(dest, note(960, 1920, 64)));
        assert!(project.insert_note(dest, note(0, 960, 60)));
        assert!(project.insert_note(dest, note(960, 1920, 67)));
        let pitches: Vec<u8> = (0..project.note_count(dest))
            .filter_map(|i| project.note(dest, i))
            .map(|n| n.pitch)
            .collect();
        assert_eq!(pitches, vec![60, 64, 67]);
    }

    #[test]
    fn test_prepare_container_fresh_then_reused() {
        let mut project = ProjectTimeline::default();
        let dest = project.create_destination("Bass");
        let first = project.prepare_container(dest, 0, 3840).unwrap();
        assert!(first.freshly_created);
        let second = project.prepare_container(dest, 1920, 7680).unwrap();
        assert!(!second.freshly_created);
        assert_eq!(second.start, 0);
        assert_eq!(second.end, 7680);
        assert!(project.prepare_container(DestinationId(99), 0, 10).is_none());
    }

    #[test]
    fn test_new_container_over_loose_notes_is_not_fresh() {
        let mut project = ProjectTimeline::default();
        let dest = project.create_destination("Piano");
        project.insert_note(dest, note(960, 1920, 60));
        let info = project.prepare_container(dest, 0, 3840).unwrap();
        assert!(!info.freshly_created);
        assert_eq!(project.track(dest).unwrap().items.len(), 1);
    }

    #[test]
    fn test_undo_history_records_labels() {
        let mut project = ProjectTimeline::default();
        project.begin_undo();
        assert!(project.is_undo_open());
        project.end_undo("partgen: generate");
        project.begin_undo();
        project.abort_undo("partgen: generate");
        // Closing without an open block is a no-op
        project.end_undo("stray");
        let labels: Vec<&str> = project
            .undo_history()
            .iter()
            .map(|e| e.label.as_str())
            .collect();
        assert_eq!(labels, vec!["partgen: generate", "partgen: generate (aborted)"]);
    }

    #[test]
    fn test_find_destination_is_case_insensitive() {
        let mut project = ProjectTimeline::default();
        let dest = project.create_destination("Violin  I");
        assert_eq!(project.find_destination("violin i"), Some(dest));
        assert_eq!(project.find_destination("Viola"), None);
    }

    #[test]
    fn test_removed_destination_is_not_alive() {
        let mut project = ProjectTimeline::default();
        let dest = project.create_destination("Flute");
        project.select(&[dest]);
        assert!(project.remove_track(dest));
        assert!(!project.is_alive(dest));
        assert!(project.selected_destinations().is_empty());
        assert!(!project.insert_note(dest, note(0, 10, 60)));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("project.json");
        let mut project = ProjectTimeline::new(90.0, TimeSignature { num: 3, denom: 4 });
        let dest = project.create_destination("Cello");
        project.insert_note(dest, note(0, 480, 48));
        project.set_destination_meta(dest, "partgen.profile_id", "cello");
        project.set_ext_state("partgen", "provider", "local");
        project.save(&path).unwrap();

        let loaded = ProjectTimeline::load(&path).unwrap();
        assert_eq!(loaded.note_count(dest), 1);
        assert_eq!(
            loaded.destination_meta(dest, "partgen.profile_id").as_deref(),
            Some("cello")
        );
        assert_eq!(loaded.ext_state("partgen", "provider").as_deref(), Some("local"));
        let (bpm, ts) = loaded.tempo_at(0.0);
        assert!((bpm - 90.0).abs() < 1e-9);
        assert_eq!(ts.num, 3);
        // New ids never collide with loaded ones
        let mut loaded = loaded;
        assert_ne!(loaded.create_destination("Harp"), dest);
    }

    #[test]
    fn test_load_fills_missing_tempo_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("project.json");
        std::fs::write(&path, r#"{"tracks": []}"#).unwrap();
        let loaded = ProjectTimeline::load(&path).unwrap();
        assert_eq!(loaded.tempo_markers().len(), 1);
    }
}
