//! Turning an untrusted response into an insertable payload.
//!
//! Every field is validated, out-of-window events are dropped, and the note
//! list is shaped as a whole (legato stitching, then same-pitch overlap
//! resolution) before the commit starts. All times stay relative to the
//! window start, in quarter notes.

use tracing::debug;

use crate::host::ControllerKind;
use crate::model::{CcEvent, GenerationResponse, KeyswitchEvent, NoteEvent, ProgramChangeEvent};
use crate::music::QN_EPSILON;
use crate::partgen_config::CommitSection;
use crate::profiles::{InstrumentProfile, LegatoSwitch};

/// Length of an inserted keyswitch note when the response gives none.
pub const KEYSWITCH_DUR_Q: f64 = 0.125;

/// Note shaping parameters, in quarter notes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteShaping {
    /// Stitched notes end this far past the next onset
    pub legato_overlap_q: f64,
    /// Larger gaps between notes are phrasing, not legato
    pub legato_max_gap_q: f64,
    /// Minimum silence between repeated notes of one pitch
    pub min_note_gap_q: f64,
}

impl Default for NoteShaping {
    fn default() -> Self {
        Self {
            legato_overlap_q: 0.0625,
            legato_max_gap_q: 0.25,
            min_note_gap_q: 0.03125,
        }
    }
}

impl From<&CommitSection> for NoteShaping {
    fn from(section: &CommitSection) -> Self {
        Self {
            legato_overlap_q: section.legato_overlap_q,
            legato_max_gap_q: section.legato_max_gap_q,
            min_note_gap_q: section.min_note_gap_q,
        }
    }
}

/// A validated note. Channel is 0-based.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreparedNote {
    pub start_q: f64,
    pub end_q: f64,
    pub pitch: u8,
    pub velocity: u8,
    pub channel: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreparedController {
    pub time_q: f64,
    pub channel: u8,
    pub kind: ControllerKind,
}

/// Everything a commit inserts, grouped in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitPayload {
    pub program_changes: Vec<PreparedController>,
    pub keyswitches: Vec<PreparedNote>,
    pub controllers: Vec<PreparedController>,
    pub notes: Vec<PreparedNote>,
}

impl CommitPayload {
    /// Validate and shape a response for a window of `length_q` quarter notes.
    pub fn build(
        response: &GenerationResponse,
        profile: &InstrumentProfile,
        length_q: f64,
        shaping: &NoteShaping,
    ) -> Self {
        let mut notes = validate_notes(&response.notes, length_q);
        let keyswitches = validate_keyswitches(&response.keyswitches, length_q);
        let controllers = validate_cc_events(&response.cc_events, length_q);
        let program_changes = validate_program_changes(&response.program_changes, length_q);

        let articulation = ArticulationTimeline::build(response, profile);
        let stitched = stitch_legato(&mut notes, &articulation, shaping);
        let before = notes.len();
        resolve_same_pitch_overlaps(&mut notes, shaping.min_note_gap_q);

        debug!(
            received = response.notes.len(),
            kept = notes.len(),
            stitched,
            overlaps_removed = before - notes.len(),
            keyswitches = keyswitches.len(),
            controllers = controllers.len(),
            program_changes = program_changes.len(),
            "Prepared commit payload"
        );

        Self {
            program_changes,
            keyswitches,
            controllers,
            notes,
        }
    }

    pub fn unit_count(&self) -> usize {
        self.program_changes.len() + self.keyswitches.len() + self.controllers.len() + self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unit_count() == 0
    }
}

fn midi_byte(value: f64) -> Option<u8> {
    if !value.is_finite() {
        return None;
    }
    let rounded = value.round();
    if (0.0..=127.0).contains(&rounded) {
        Some(rounded as u8)
    } else {
        None
    }
}

fn clamp_byte(value: f64, min: u8, max: u8) -> u8 {
    if !value.is_finite() {
        return max;
    }
    value.round().clamp(min as f64, max as f64) as u8
}

/// 1-based channel in, 0-based out. Out-of-range channels clamp to 1..=16.
fn native_channel(chan: f64) -> u8 {
    if !chan.is_finite() {
        return 0;
    }
    chan.round().clamp(1.0, 16.0) as u8 - 1
}

fn in_window(time_q: f64, length_q: f64) -> bool {
    time_q.is_finite() && time_q >= 0.0 && time_q < length_q
}

/// Drop malformed or out-of-window notes and clamp ends to the window.
///
/// The result is sorted by start, then pitch.
pub fn validate_notes(events: &[NoteEvent], length_q: f64) -> Vec<PreparedNote> {
    let mut notes: Vec<PreparedNote> = events
        .iter()
        .filter_map(|e| {
            if !in_window(e.start_q, length_q) || !e.dur_q.is_finite() || e.dur_q <= 0.0 {
                return None;
            }
            let pitch = midi_byte(e.pitch)?;
            let end_q = (e.start_q + e.dur_q).min(length_q);
            if end_q - e.start_q <= QN_EPSILON {
                return None;
            }
            Some(PreparedNote {
                start_q: e.start_q,
                end_q,
                pitch,
                velocity: clamp_byte(e.vel, 1, 127),
                channel: native_channel(e.chan),
            })
        })
        .collect();
    notes.sort_by(|a, b| a.start_q.total_cmp(&b.start_q).then(a.pitch.cmp(&b.pitch)));
    notes
}

pub fn validate_keyswitches(events: &[KeyswitchEvent], length_q: f64) -> Vec<PreparedNote> {
    let mut out: Vec<PreparedNote> = events
        .iter()
        .filter_map(|e| {
            let start_q = if e.time_q.is_finite() { e.time_q.max(0.0) } else { return None };
            if start_q >= length_q {
                return None;
            }
            let pitch = midi_byte(e.pitch)?;
            let dur = e
                .dur_q
                .filter(|d| d.is_finite() && *d > 0.0)
                .unwrap_or(KEYSWITCH_DUR_Q);
            Some(PreparedNote {
                start_q,
                end_q: (start_q + dur).min(length_q),
                pitch,
                velocity: clamp_byte(e.vel, 1, 127),
                channel: native_channel(e.chan),
            })
        })
        .collect();
    out.sort_by(|a, b| a.start_q.total_cmp(&b.start_q));
    out
}

pub fn validate_cc_events(events: &[CcEvent], length_q: f64) -> Vec<PreparedController> {
    let mut out: Vec<PreparedController> = events
        .iter()
        .filter_map(|e| {
            if !in_window(e.time_q, length_q) {
                return None;
            }
            let number = midi_byte(e.cc)?;
            Some(PreparedController {
                time_q: e.time_q,
                channel: native_channel(e.chan),
                kind: ControllerKind::Cc {
                    number,
                    value: clamp_byte(e.value, 0, 127),
                },
            })
        })
        .collect();
    out.sort_by(|a, b| a.time_q.total_cmp(&b.time_q));
    out
}

pub fn validate_program_changes(
    events: &[ProgramChangeEvent],
    length_q: f64,
) -> Vec<PreparedController> {
    let mut out: Vec<PreparedController> = events
        .iter()
        .filter_map(|e| {
            if !in_window(e.time_q, length_q) {
                return None;
            }
            Some(PreparedController {
                time_q: e.time_q,
                channel: native_channel(e.chan),
                kind: ControllerKind::ProgramChange {
                    program: midi_byte(e.program)?,
                },
            })
        })
        .collect();
    out.sort_by(|a, b| a.time_q.total_cmp(&b.time_q));
    out
}

fn is_legato_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("legato") || lower.contains("slur")
}

/// Where legato articulation is in effect across the window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArticulationTimeline {
    initial_legato: bool,
    /// (time_q, legato) sorted by time
    changes: Vec<(f64, bool)>,
}

impl ArticulationTimeline {
    pub fn constant(legato: bool) -> Self {
        Self {
            initial_legato: legato,
            changes: Vec::new(),
        }
    }

    /// Read the response label and map articulation-change events through the profile.
    pub fn build(response: &GenerationResponse, profile: &InstrumentProfile) -> Self {
        let label = response
            .articulation
            .as_deref()
            .filter(|a| !a.eq_ignore_ascii_case("mixed"))
            .or(profile.default_articulation());
        let initial_legato = label.is_some_and(is_legato_name);

        let arts = &profile.articulations;
        let mut switches: Vec<(f64, LegatoSwitch)> = Vec::new();
        for ks in &response.keyswitches {
            let Some(pitch) = midi_byte(ks.pitch) else {
                continue;
            };
            let velocity = ks.vel.round() as i32;
            if let Some(switch) = profile.legato.switch_for(pitch as i32, velocity) {
                switches.push((ks.time_q, switch));
            } else if let Some(name) = arts.by_keyswitch(pitch as i32) {
                switches.push((ks.time_q, LegatoSwitch::set(is_legato_name(name))));
            }
        }
        for pc in &response.program_changes {
            if let Some(name) = midi_byte(pc.program).and_then(|p| arts.by_program(p as i32)) {
                switches.push((pc.time_q, LegatoSwitch::set(is_legato_name(name))));
            }
        }
        for cc in &response.cc_events {
            let (Some(number), Some(value)) = (midi_byte(cc.cc), midi_byte(cc.value)) else {
                continue;
            };
            if let Some(name) = arts.by_cc(number, value as i32) {
                switches.push((cc.time_q, LegatoSwitch::set(is_legato_name(name))));
            }
        }
        switches.retain(|(t, _)| t.is_finite());
        // Stable, so same-time switches keep response order
        switches.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut state = initial_legato;
        let changes = switches
            .into_iter()
            .map(|(time_q, switch)| {
                state = match switch {
                    LegatoSwitch::On => true,
                    LegatoSwitch::Off => false,
                    LegatoSwitch::Toggle => !state,
                };
                (time_q, state)
            })
            .collect();

        Self {
            initial_legato,
            changes,
        }
    }

    pub fn is_legato_at(&self, time_q: f64) -> bool {
        self.changes
            .iter()
            .take_while(|(t, _)| *t <= time_q + QN_EPSILON)
            .last()
            .map(|(_, legato)| *legato)
            .unwrap_or(self.initial_legato)
    }
}

/// Extend legato notes so they overlap the next onset on their channel.
///
/// Notes are never shortened. A note is stitched only when both it and the
/// next onset are in a legato region, the gap is at most
/// `legato_max_gap_q`, and the next onset is not a repeat of the same pitch.
/// `notes` must be sorted by start. Returns how many notes were extended.
pub fn stitch_legato(
    notes: &mut [PreparedNote],
    articulation: &ArticulationTimeline,
    shaping: &NoteShaping,
) -> usize {
    let mut stitched = 0;
    for i in 0..notes.len() {
        let current = notes[i];
        if !articulation.is_legato_at(current.start_q) {
            continue;
        }
        // Earliest later onset on the same channel
        let Some(next_start) = notes[i + 1..]
            .iter()
            .filter(|n| n.channel == current.channel && n.start_q > current.start_q + QN_EPSILON)
            .map(|n| n.start_q)
            .next()
        else {
            continue;
        };
        if !articulation.is_legato_at(next_start) {
            continue;
        }
        let repeats_pitch = notes[i + 1..].iter().any(|n| {
            n.channel == current.channel
                && n.pitch == current.pitch
                && (n.start_q - next_start).abs() <= QN_EPSILON
        });
        if repeats_pitch {
            continue;
        }
        let gap = next_start - current.end_q;
        if gap > shaping.legato_max_gap_q + QN_EPSILON {
            continue;
        }
        let target = next_start + shaping.legato_overlap_q;
        if current.end_q < target {
            notes[i].end_q = target;
            stitched += 1;
        }
    }
    stitched
}

/// Separate overlapping notes of the same pitch and channel.
///
/// For consecutive notes A, B of one pitch, if A does not end at least
/// `min_gap_q` before B starts, A is cut to end exactly there; if that
/// leaves A shorter than `min_gap_q` it is removed. The result is sorted
/// by start, then pitch.
pub fn resolve_same_pitch_overlaps(notes: &mut Vec<PreparedNote>, min_gap_q: f64) {
    notes.sort_by(|a, b| {
        a.channel
            .cmp(&b.channel)
            .then(a.pitch.cmp(&b.pitch))
            .then(a.start_q.total_cmp(&b.start_q))
    });

    let mut kept: Vec<PreparedNote> = Vec::with_capacity(notes.len());
    for note in notes.drain(..) {
        if let Some(prev) = kept.last_mut()
            && prev.channel == note.channel
            && prev.pitch == note.pitch
        {
            let limit = note.start_q - min_gap_q;
            if prev.end_q > limit {
                if limit - prev.start_q >= min_gap_q - QN_EPSILON {
                    prev.end_q = limit;
                } else {
                    kept.pop();
                }
            }
        }
        kept.push(note);
    }

    kept.sort_by(|a, b| a.start_q.total_cmp(&b.start_q).then(a.pitch.cmp(&b.pitch)));
    *notes = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::InstrumentProfile;

    fn n(start_q: f64, end_q: f64, pitch: u8) -> PreparedNote {
        PreparedNote {
            start_q,
            end_q,
            pitch,
            velocity: 100,
            channel: 0,
        }
    }

    fn ev(start_q: f64, dur_q: f64, pitch: f64) -> NoteEvent {
        NoteEvent {
            start_q,
            dur_q,
            pitch,
            vel: 90.0,
            chan: 1.0,
        }
    }

    #[test]
    fn test_validate_notes_drops_and_clamps() {
        let events = vec![
            ev(0.0, 1.0, 60.0),
            ev(-0.5, 1.0, 60.0),       // before window
            ev(16.0, 1.0, 60.0),       // at window end
            ev(1.0, 0.0, 60.0),        // zero length
            ev(1.0, f64::NAN, 60.0),   // bad duration
            ev(2.0, 1.0, 128.0),       // pitch out of range
            ev(15.5, 4.0, 62.0),       // end clamped
        ];
        let notes = validate_notes(&events, 16.0);
        assert_eq!(notes.len(), 2);
        assert!((notes[1].end_q - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_notes_clamps_velocity_and_channel() {
        let events = vec![NoteEvent {
            start_q: 0.0,
            dur_q: 1.0,
            pitch: 60.4,
            vel: 0.0,
            chan: 17.0,
        }];
        let notes = validate_notes(&events, 4.0);
        assert_eq!(notes[0].pitch, 60);
        assert_eq!(notes[0].velocity, 1);
        assert_eq!(notes[0].channel, 15);
    }

    #[test]
    fn test_validate_controllers() {
        let ccs = vec![
            CcEvent { time_q: 0.0, cc: 1.0, value: 200.0, chan: 1.0 },
            CcEvent { time_q: 1.0, cc: 300.0, value: 10.0, chan: 1.0 },
            CcEvent { time_q: 9.0, cc: 11.0, value: 10.0, chan: 1.0 },
        ];
        let out = validate_cc_events(&ccs, 8.0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, ControllerKind::Cc { number: 1, value: 127 });

        let pcs = vec![ProgramChangeEvent { time_q: 0.0, program: 41.0, chan: 2.0 }];
        let out = validate_program_changes(&pcs, 8.0);
        assert_eq!(out[0].kind, ControllerKind::ProgramChange { program: 41 });
        assert_eq!(out[0].channel, 1);
    }

    #[test]
    fn test_keyswitch_defaults_and_clamps() {
        let ks = vec![
            KeyswitchEvent { time_q: -1.0, pitch: 24.0, vel: 100.0, chan: 1.0, dur_q: None },
            KeyswitchEvent { time_q: 8.0, pitch: 24.0, vel: 100.0, chan: 1.0, dur_q: None },
        ];
        let out = validate_keyswitches(&ks, 8.0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start_q, 0.0);
        assert!((out[0].end_q - KEYSWITCH_DUR_Q).abs() < 1e-9);
    }

    #[test]
    fn test_legato_stitching_extends_to_next_onset() {
        let shaping = NoteShaping::default();
        let mut notes = vec![n(0.0, 0.9, 60), n(1.0, 1.8, 62), n(2.0, 3.0, 64)];
        let stitched = stitch_legato(&mut notes, &ArticulationTimeline::constant(true), &shaping);
        assert_eq!(stitched, 2);
        assert!(notes[0].end_q >= 1.0 + shaping.legato_overlap_q - 1e-9);
        assert!(notes[1].end_q >= 2.0 + shaping.legato_overlap_q - 1e-9);
        // Last note has no successor
        assert!((notes[2].end_q - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_legato_stitching_never_shortens() {
        let shaping = NoteShaping::default();
        let mut notes = vec![n(0.0, 1.5, 60), n(1.0, 2.0, 62)];
        stitch_legato(&mut notes, &ArticulationTimeline::constant(true), &shaping);
        assert!((notes[0].end_q - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_legato_stitching_respects_gap_and_region() {
        let shaping = NoteShaping::default();
        let mut notes = vec![n(0.0, 0.5, 60), n(1.0, 2.0, 62)];
        stitch_legato(&mut notes, &ArticulationTimeline::constant(true), &shaping);
        // Gap of 0.5 is phrasing
        assert!((notes[0].end_q - 0.5).abs() < 1e-9);

        let mut notes = vec![n(0.0, 0.9, 60), n(1.0, 2.0, 62)];
        stitch_legato(&mut notes, &ArticulationTimeline::constant(false), &shaping);
        assert!((notes[0].end_q - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_legato_skips_repeated_pitch() {
        let shaping = NoteShaping::default();
        let mut notes = vec![n(0.0, 0.9, 60), n(1.0, 2.0, 60)];
        stitch_legato(&mut notes, &ArticulationTimeline::constant(true), &shaping);
        assert!((notes[0].end_q - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_articulation_timeline_from_keyswitches() {
        let profile: InstrumentProfile = serde_json::from_str(
            r#"{"id": "v", "name": "Violin", "articulations": {"mode": "keyswitch",
                "map": {"sustain": {"pitch": 24}, "legato": {"pitch": 25}}}}"#,
        )
        .unwrap();
        let response = GenerationResponse {
            articulation: Some("sustain".into()),
            keyswitches: vec![KeyswitchEvent {
                time_q: 4.0,
                pitch: 25.0,
                vel: 100.0,
                chan: 1.0,
                dur_q: None,
            }],
            ..Default::default()
        };
        let timeline = ArticulationTimeline::build(&response, &profile);
        assert!(!timeline.is_legato_at(0.0));
        assert!(timeline.is_legato_at(4.0));
        assert!(timeline.is_legato_at(7.0));
    }

    #[test]
    fn test_legato_keyswitch_velocity_switches_stitching() {
        let profile: InstrumentProfile = serde_json::from_str(
            r#"{"id": "vc", "name": "Cello", "articulations": {"default": "sustain"},
                "legato": {"mode": "keyswitch", "keyswitch": 30,
                           "velocity_on": 100, "velocity_off": 10}}"#,
        )
        .unwrap();
        let ks = |time_q: f64, vel: f64| KeyswitchEvent {
            time_q,
            pitch: 30.0,
            vel,
            chan: 1.0,
            dur_q: None,
        };
        let response = GenerationResponse {
            keyswitches: vec![ks(2.0, 127.0), ks(6.0, 1.0), ks(8.0, 64.0)],
            ..Default::default()
        };
        let timeline = ArticulationTimeline::build(&response, &profile);
        assert!(!timeline.is_legato_at(0.0));
        assert!(timeline.is_legato_at(2.0));
        assert!(!timeline.is_legato_at(6.5));
        // In-between velocity flips whatever is active
        assert!(timeline.is_legato_at(8.0));

        let response = GenerationResponse {
            notes: vec![
                ev(0.0, 0.9, 60.0),
                ev(1.0, 0.9, 62.0),
                ev(2.0, 0.9, 64.0),
                ev(3.0, 0.9, 65.0),
            ],
            ..response
        };
        let payload = CommitPayload::build(&response, &profile, 16.0, &NoteShaping::default());
        let end_of = |pitch: u8| payload.notes.iter().find(|n| n.pitch == pitch).unwrap().end_q;
        // Before the switch nothing is stitched
        assert!((end_of(60) - 0.9).abs() < 1e-9);
        assert!((end_of(62) - 0.9 - 1.0).abs() < 1e-9);
        assert!(end_of(64) > 3.0);
    }

    #[test]
    fn test_same_pitch_overlap_truncates() {
        let mut notes = vec![n(0.0, 1.5, 60), n(1.0, 2.0, 60), n(0.5, 3.0, 64)];
        resolve_same_pitch_overlaps(&mut notes, 0.03125);
        let a = notes.iter().find(|x| x.pitch == 60 && x.start_q == 0.0).unwrap();
        assert!((a.end_q - (1.0 - 0.03125)).abs() < 1e-9);
        assert_eq!(notes.len(), 3);
        // Sorted by start afterwards
        assert!(notes.windows(2).all(|w| w[0].start_q <= w[1].start_q));
    }

    #[test]
    fn test_same_pitch_overlap_removes_degenerate() {
        let mut notes = vec![n(1.0, 2.0, 60), n(1.0, 1.5, 60), n(1.01, 2.0, 60)];
        resolve_same_pitch_overlaps(&mut notes, 0.03125);
        assert_eq!(notes.len(), 1);
        assert!((notes[0].start_q - 1.01).abs() < 1e-9);
        for note in &notes {
            assert!(note.end_q > note.start_q);
        }
    }

    #[test]
    fn test_stitching_and_overlap_resolution_together() {
        let profile = InstrumentProfile::generic("Cello");
        let response = GenerationResponse {
            articulation: Some("legato".into()),
            notes: vec![
                // Stitched past the next onset into the 60 at 1.0
                ev(0.0, 0.95, 60.0),
                ev(0.98, 0.5, 62.0),
                ev(1.0, 1.0, 60.0),
                // Three stacked repeats, the middle one only 0.05 before the last
                ev(4.0, 2.0, 64.0),
                ev(4.5, 1.0, 64.0),
                ev(4.55, 1.0, 64.0),
            ],
            ..Default::default()
        };
        let shaping = NoteShaping::default();
        let payload = CommitPayload::build(&response, &profile, 16.0, &shaping);

        for a in &payload.notes {
            assert!(
                a.end_q - a.start_q >= shaping.min_note_gap_q - 1e-9,
                "note at {} is {} long",
                a.start_q,
                a.end_q - a.start_q
            );
            for b in &payload.notes {
                if a.pitch == b.pitch && a.channel == b.channel && a.start_q < b.start_q {
                    assert!(
                        a.end_q <= b.start_q - shaping.min_note_gap_q + 1e-9,
                        "pitch {} at {} runs into {}",
                        a.pitch,
                        a.start_q,
                        b.start_q
                    );
                }
            }
        }

        let of = |pitch: u8| -> Vec<&PreparedNote> {
            payload.notes.iter().filter(|x| x.pitch == pitch).collect()
        };
        // The stitched 60 kept its onset but was cut back before the repeat
        let sixties = of(60);
        assert_eq!(sixties.len(), 2);
        assert!((sixties[0].end_q - (1.0 - shaping.min_note_gap_q)).abs() < 1e-9);
        // Cutting the middle repeat would leave less than the gap, so it goes
        let e_notes = of(64);
        assert_eq!(e_notes.len(), 2);
        assert!((e_notes[0].start_q - 4.0).abs() < 1e-9);
        assert!((e_notes[0].end_q - (4.5 - shaping.min_note_gap_q)).abs() < 1e-9);
        assert!((e_notes[1].start_q - 4.55).abs() < 1e-9);
    }

    #[test]
    fn test_same_pitch_leaves_other_channels_alone() {
        let mut notes = vec![n(0.0, 2.0, 60), PreparedNote { channel: 1, ..n(1.0, 2.0, 60) }];
        resolve_same_pitch_overlaps(&mut notes, 0.03125);
        assert!((notes[0].end_q - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_build_payload_groups_units() {
        let response = GenerationResponse {
            notes: vec![ev(0.0, 1.0, 60.0), ev(1.0, 1.0, 62.0)],
            cc_events: vec![CcEvent { time_q: 0.0, cc: 1.0, value: 64.0, chan: 1.0 }],
            program_changes: vec![ProgramChangeEvent { time_q: 0.0, program: 1.0, chan: 1.0 }],
            ..Default::default()
        };
        let payload = CommitPayload::build(
            &response,
            &InstrumentProfile::generic("Piano"),
            4.0,
            &NoteShaping::default(),
        );
        assert_eq!(payload.notes.len(), 2);
        assert_eq!(payload.controllers.len(), 1);
        assert_eq!(payload.program_changes.len(), 1);
        assert_eq!(payload.unit_count(), 4);
    }
}
