//! Musical context sampled from the timeline around a generation window.
//!
//! Three collaborators live here: the context provider (what surrounds the
//! window), the key estimator, and the source sketch reader used by
//! arrange sessions.

use tracing::debug;

use crate::errors::EngineError;
use crate::host::{DestinationId, NoteUnit, Timeline};
use crate::model::{ContextNote, ContextTrack, HorizontalContext, MusicalContext, PitchRange, SketchInfo};
use crate::music::QnWindow;

/// Builds the `context` block of a generation request.
pub trait ContextProvider {
    fn build(
        &self,
        timeline: &dyn Timeline,
        dest: DestinationId,
        window: QnWindow,
    ) -> Option<MusicalContext>;
}

/// Estimates the musical key of a window, e.g. `"A minor"`.
pub trait KeyEstimator {
    fn estimate(&self, timeline: &dyn Timeline, window: QnWindow) -> Option<String>;
}

/// Convert a host note to a window-relative context note.
pub fn to_context_note(timeline: &dyn Timeline, note: &NoteUnit, window_start_qn: f64) -> ContextNote {
    let start = timeline.tick_to_qn(note.start);
    let end = timeline.tick_to_qn(note.end);
    ContextNote {
        start_q: round_q(start - window_start_qn),
        dur_q: round_q((end - start).max(0.0)),
        pitch: note.pitch as i32,
        vel: note.velocity as i32,
        chan: note.channel as i32 + 1,
    }
}

fn round_q(q: f64) -> f64 {
    (q * 1000.0).round() / 1000.0
}

fn notes_of(timeline: &dyn Timeline, dest: DestinationId) -> Vec<NoteUnit> {
    (0..timeline.note_count(dest))
        .filter_map(|i| timeline.note(dest, i))
        .collect()
}

fn pitch_range(notes: &[ContextNote]) -> Option<PitchRange> {
    let min = notes.iter().map(|n| n.pitch).min()?;
    let max = notes.iter().map(|n| n.pitch).max()?;
    Some(PitchRange { min, max })
}

/// Context sampled from the destination itself and from other tracks.
#[derive(Debug, Clone)]
pub struct TimelineContext {
    /// How far before and after the window to look, in quarter notes
    pub horizon_q: f64,
    /// Cap per note list
    pub max_notes: usize,
    pub include_other_tracks: bool,
}

impl Default for TimelineContext {
    fn default() -> Self {
        Self {
            horizon_q: 8.0,
            max_notes: 256,
            include_other_tracks: true,
        }
    }
}

impl ContextProvider for TimelineContext {
    fn build(
        &self,
        timeline: &dyn Timeline,
        dest: DestinationId,
        window: QnWindow,
    ) -> Option<MusicalContext> {
        let start_tick = timeline.qn_to_tick(window.start_qn);
        let end_tick = timeline.qn_to_tick(window.end_qn);
        let before_tick = timeline.qn_to_tick(window.start_qn - self.horizon_q);
        let after_tick = timeline.qn_to_tick(window.end_qn + self.horizon_q);

        let own = notes_of(timeline, dest);
        let to_ctx = |n: &NoteUnit| to_context_note(timeline, n, window.start_qn);

        let existing: Vec<ContextNote> = own
            .iter()
            .filter(|n| n.intersects(start_tick, end_tick))
            .take(self.max_notes)
            .map(to_ctx)
            .collect();
        let mut before: Vec<ContextNote> = own
            .iter()
            .filter(|n| n.end <= start_tick && n.end > before_tick)
            .map(to_ctx)
            .collect();
        if before.len() > self.max_notes {
            before.drain(..before.len() - self.max_notes);
        }
        let after: Vec<ContextNote> = own
            .iter()
            .filter(|n| n.start >= end_tick && n.start < after_tick)
            .take(self.max_notes)
            .map(to_ctx)
            .collect();

        let position = match (!before.is_empty(), !after.is_empty()) {
            (true, true) => "middle",
            (true, false) => "end",
            (false, true) => "start",
            (false, false) => "isolated",
        };
        let horizontal = if before.is_empty() && after.is_empty() {
            None
        } else {
            Some(HorizontalContext {
                before,
                after,
                position: position.to_string(),
            })
        };

        let mut context_tracks = Vec::new();
        if self.include_other_tracks {
            for other in timeline.destinations() {
                if other == dest {
                    continue;
                }
                let notes: Vec<ContextNote> = notes_of(timeline, other)
                    .iter()
                    .filter(|n| n.intersects(start_tick, end_tick))
                    .take(self.max_notes)
                    .map(to_ctx)
                    .collect();
                if !notes.is_empty() {
                    context_tracks.push(ContextTrack {
                        name: timeline.destination_name(other).unwrap_or_default(),
                        notes,
                    });
                }
            }
        }

        let context = MusicalContext {
            pitch_range: pitch_range(&existing),
            existing_notes: existing,
            horizontal,
            context_tracks,
            context_notes: None,
        };
        debug!(
            destination = %dest,
            existing = context.existing_notes.len(),
            tracks = context.context_tracks.len(),
            "Built musical context"
        );
        if context.is_empty() { None } else { Some(context) }
    }
}

/// Always reports the same key.
#[derive(Debug, Clone)]
pub struct FixedKey(pub String);

impl KeyEstimator for FixedKey {
    fn estimate(&self, _timeline: &dyn Timeline, _window: QnWindow) -> Option<String> {
        Some(self.0.clone())
    }
}

const MAJOR_PROFILE: [f64; 12] = [6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88];
const MINOR_PROFILE: [f64; 12] = [6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17];
const PITCH_NAMES: [&str; 12] = ["C", "C#", "D", "Eb", "E", "F", "F#", "G", "Ab", "A", "Bb", "B"];

/// Duration-weighted pitch-class profile matching over every track in the window.
#[derive(Debug, Clone, Default)]
pub struct PitchClassKeyEstimator;

impl PitchClassKeyEstimator {
    fn correlate(histogram: &[f64; 12], profile: &[f64; 12], tonic: usize) -> f64 {
        let n = 12.0;
        let mean_h = histogram.iter().sum::<f64>() / n;
        let mean_p = profile.iter().sum::<f64>() / n;
        let (mut num, mut den_h, mut den_p) = (0.0, 0.0, 0.0);
        for i in 0..12 {
            let h = histogram[(i + tonic) % 12] - mean_h;
            let p = profile[i] - mean_p;
            num += h * p;
            den_h += h * h;
            den_p += p * p;
        }
        if den_h == 0.0 || den_p == 0.0 {
            0.0
        } else {
            num / (den_h * den_p).sqrt()
        }
    }
}

impl KeyEstimator for PitchClassKeyEstimator {
    fn estimate(&self, timeline: &dyn Timeline, window: QnWindow) -> Option<String> {
        let start_tick = timeline.qn_to_tick(window.start_qn);
        let end_tick = timeline.qn_to_tick(window.end_qn);
        let mut histogram = [0.0f64; 12];
        for dest in timeline.destinations() {
            for note in notes_of(timeline, dest) {
                if note.intersects(start_tick, end_tick) && note.channel != 9 {
                    let overlap = note.end.min(end_tick) - note.start.max(start_tick);
                    histogram[(note.pitch % 12) as usize] += overlap.max(1) as f64;
                }
            }
        }
        if histogram.iter().all(|v| *v == 0.0) {
            return None;
        }

        let mut best: Option<(f64, String)> = None;
        for tonic in 0..12 {
            for (profile, mode) in [(&MAJOR_PROFILE, "major"), (&MINOR_PROFILE, "minor")] {
                let score = Self::correlate(&histogram, profile, tonic);
                if best.as_ref().is_none_or(|(b, _)| score > *b) {
                    best = Some((score, format!("{} {}", PITCH_NAMES[tonic], mode)));
                }
            }
        }
        best.map(|(_, key)| key)
    }
}

/// Read the notes of the source track inside the window.
pub fn read_sketch(
    timeline: &dyn Timeline,
    source: DestinationId,
    window: QnWindow,
) -> Result<SketchInfo, EngineError> {
    let name = timeline
        .destination_name(source)
        .ok_or_else(|| EngineError::Structural(format!("source track {} is gone", source)))?;
    let start_tick = timeline.qn_to_tick(window.start_qn);
    let end_tick = timeline.qn_to_tick(window.end_qn);
    let notes: Vec<ContextNote> = notes_of(timeline, source)
        .iter()
        .filter(|n| n.start >= start_tick && n.start < end_tick)
        .map(|n| to_context_note(timeline, n, window.start_qn))
        .collect();
    if notes.is_empty() {
        return Err(EngineError::MissingSketch(name));
    }
    Ok(SketchInfo {
        track_name: name,
        pitch_range: pitch_range(&notes),
        notes,
    })
}
