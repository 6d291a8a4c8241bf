//! The timeline host contract.
//!
//! Everything the engine needs from the editing host lives behind the
//! [`Timeline`] trait: destinations (tracks), their note and controller
//! units, undo blocks, per-destination metadata, global key/value state and
//! the tempo map. Destination handles are plain ids and must be re-validated
//! with [`Timeline::is_alive`] before every use.

pub mod project;

pub use project::ProjectTimeline;

use serde::{Deserialize, Serialize};

use crate::music::{self, TimeSignature};

/// Native tick position.
pub type Tick = i64;

/// Opaque handle to a destination track.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DestinationId(pub u64);

impl std::fmt::Display for DestinationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A note as stored by the host. Channels are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteUnit {
    pub start: Tick,
    pub end: Tick,
    pub pitch: u8,
    pub velocity: u8,
    pub channel: u8,
}

impl NoteUnit {
    pub fn intersects(&self, start: Tick, end: Tick) -> bool {
        self.start < end && self.end > start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerKind {
    Cc { number: u8, value: u8 },
    ProgramChange { program: u8 },
}

/// A controller-lane unit: continuous controller or program change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerUnit {
    pub tick: Tick,
    pub channel: u8,
    #[serde(flatten)]
    pub kind: ControllerKind,
}

impl ControllerUnit {
    pub fn within(&self, start: Tick, end: Tick) -> bool {
        self.tick >= start && self.tick < end
    }
}

/// A tempo/time-signature marker on the global timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoMarker {
    pub time_sec: f64,
    pub bpm: f64,
    pub time_sig: TimeSignature,
    #[serde(default)]
    pub linear: bool,
}

/// The container (item) that will receive a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerInfo {
    pub start: Tick,
    pub end: Tick,
    /// No container overlapped the window before; nothing to clear.
    pub freshly_created: bool,
}

/// Host timeline operations used by the engine.
///
/// Index-based note and controller access follows the host's storage
/// order, which is sorted by position. Mutations return `false` when the
/// destination or index is invalid.
pub trait Timeline {
    fn destinations(&self) -> Vec<DestinationId>;
    fn selected_destinations(&self) -> Vec<DestinationId>;
    fn create_destination(&mut self, name: &str) -> DestinationId;
    fn find_destination(&self, name: &str) -> Option<DestinationId>;
    fn destination_name(&self, dest: DestinationId) -> Option<String>;
    fn is_alive(&self, dest: DestinationId) -> bool;

    /// Ensure a container spans `[start, end)` on the destination.
    fn prepare_container(&mut self, dest: DestinationId, start: Tick, end: Tick)
    -> Option<ContainerInfo>;

    fn note_count(&self, dest: DestinationId) -> usize;
    fn note(&self, dest: DestinationId, index: usize) -> Option<NoteUnit>;
    fn delete_note(&mut self, dest: DestinationId, index: usize) -> bool;
    fn insert_note(&mut self, dest: DestinationId, note: NoteUnit) -> bool;

    fn controller_count(&self, dest: DestinationId) -> usize;
    fn controller(&self, dest: DestinationId, index: usize) -> Option<ControllerUnit>;
    fn delete_controller(&mut self, dest: DestinationId, index: usize) -> bool;
    fn insert_controller(&mut self, dest: DestinationId, unit: ControllerUnit) -> bool;

    /// Seconds to absolute quarter notes through the tempo map.
    fn time_to_qn(&self, sec: f64) -> f64;
    fn qn_to_time(&self, qn: f64) -> f64;

    fn qn_to_tick(&self, qn: f64) -> Tick {
        music::qn_to_tick(qn)
    }

    fn tick_to_qn(&self, tick: Tick) -> f64 {
        music::tick_to_qn(tick)
    }

    fn begin_undo(&mut self);
    fn end_undo(&mut self, label: &str);
    /// Close the open undo block without keeping it as a named edit.
    fn abort_undo(&mut self, label: &str);
    fn redraw(&mut self);

    fn destination_meta(&self, dest: DestinationId, key: &str) -> Option<String>;
    fn set_destination_meta(&mut self, dest: DestinationId, key: &str, value: &str) -> bool;
    fn ext_state(&self, section: &str, key: &str) -> Option<String>;
    fn set_ext_state(&mut self, section: &str, key: &str, value: &str);

    /// Markers sorted by time.
    fn tempo_markers(&self) -> Vec<TempoMarker>;
    fn set_tempo_marker(&mut self, index: usize, marker: TempoMarker) -> bool;
    fn insert_tempo_marker(&mut self, marker: TempoMarker);
    /// Effective tempo and time signature at a position.
    fn tempo_at(&self, sec: f64) -> (f64, TimeSignature);
}
