//! Tempo and time-signature changes.
//!
//! Points arrive relative to a window (from a generation response or a
//! plan's bar-indexed tempo map), are normalized against [`TempoLimits`],
//! then stamped into the host's tempo map inside their own undo block.

use tracing::{debug, info};

use crate::host::{TempoMarker, Timeline};
use crate::model::TempoMarkerEvent;
use crate::music::{QN_EPSILON, QnWindow, TimeSignature};
use crate::partgen_config::TempoSection;

/// Markers closer than this (seconds) are treated as the same position.
const MARKER_MATCH_SEC: f64 = 1e-3;

pub const TEMPO_UNDO_LABEL: &str = "partgen: tempo changes";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoLimits {
    pub min_bpm: f64,
    pub max_bpm: f64,
    pub min_spacing_q: f64,
    pub max_points: usize,
}

impl Default for TempoLimits {
    fn default() -> Self {
        Self::from(&TempoSection::default())
    }
}

impl From<&TempoSection> for TempoLimits {
    fn from(section: &TempoSection) -> Self {
        Self {
            min_bpm: section.min_bpm,
            max_bpm: section.max_bpm,
            min_spacing_q: section.min_spacing_q,
            max_points: section.max_points,
        }
    }
}

/// A tempo and/or time-signature change, relative to a window start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoPoint {
    pub time_q: f64,
    pub bpm: Option<f64>,
    pub time_sig: Option<TimeSignature>,
    pub linear: bool,
}

impl TempoPoint {
    pub fn bpm(time_q: f64, bpm: f64) -> Self {
        Self {
            time_q,
            bpm: Some(bpm),
            time_sig: None,
            linear: false,
        }
    }

    /// `None` when the event carries neither a tempo nor a valid meter.
    pub fn from_event(event: &TempoMarkerEvent) -> Option<Self> {
        let time_sig = match (event.num, event.denom) {
            (Some(num), Some(denom)) => TimeSignature::new(num, denom),
            _ => None,
        };
        if event.bpm.is_none() && time_sig.is_none() {
            return None;
        }
        Some(Self {
            time_q: event.time_q,
            bpm: event.bpm,
            time_sig,
            linear: event.linear.unwrap_or(false),
        })
    }
}

/// Result of one `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TempoOutcome {
    pub applied: bool,
    /// First tempo explicitly written, if any
    pub first_bpm: Option<f64>,
    pub points: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TempoApplier {
    limits: TempoLimits,
}

impl TempoApplier {
    pub fn new(limits: TempoLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &TempoLimits {
        &self.limits
    }

    /// Clamp, sort, thin and cap. Unusable points are dropped.
    pub fn normalize(&self, points: &[TempoPoint], length_q: f64) -> Vec<TempoPoint> {
        let length_q = if length_q.is_finite() { length_q.max(0.0) } else { 0.0 };
        let mut cleaned: Vec<TempoPoint> = points
            .iter()
            .filter_map(|p| {
                if !p.time_q.is_finite() || p.bpm.is_some_and(|b| !b.is_finite() || b <= 0.0) {
                    debug!(?p, "Dropping invalid tempo point");
                    return None;
                }
                if p.bpm.is_none() && p.time_sig.is_none() {
                    debug!(?p, "Dropping empty tempo point");
                    return None;
                }
                Some(TempoPoint {
                    time_q: p.time_q.clamp(0.0, length_q),
                    bpm: p.bpm.map(|b| b.clamp(self.limits.min_bpm, self.limits.max_bpm)),
                    ..*p
                })
            })
            .collect();
        cleaned.sort_by(|a, b| a.time_q.total_cmp(&b.time_q));

        let mut result: Vec<TempoPoint> = Vec::with_capacity(cleaned.len());
        for point in cleaned {
            if result.len() >= self.limits.max_points {
                break;
            }
            match result.last() {
                Some(last) if point.time_q - last.time_q < self.limits.min_spacing_q - QN_EPSILON => {
                    debug!(time_q = point.time_q, "Dropping tempo point too close to previous");
                }
                _ => result.push(point),
            }
        }
        result
    }

    /// Normalize `points` against `window` and write them to the host.
    ///
    /// Each point updates a marker already at its position or inserts a new
    /// one; whichever of tempo and meter the point leaves unspecified keeps
    /// the value in effect there. Positions are resolved one at a time so
    /// earlier changes shift later ones.
    pub fn apply(
        &self,
        host: &mut dyn Timeline,
        points: &[TempoPoint],
        window: QnWindow,
    ) -> TempoOutcome {
        let points = self.normalize(points, window.length_q());
        if points.is_empty() {
            return TempoOutcome::default();
        }

        host.begin_undo();
        let mut first_bpm = None;
        for point in &points {
            let sec = host.qn_to_time(window.start_qn + point.time_q);
            let markers = host.tempo_markers();
            let existing = markers
                .iter()
                .position(|m| (m.time_sec - sec).abs() <= MARKER_MATCH_SEC);

            let (base_bpm, base_sig) = match existing {
                Some(index) => (markers[index].bpm, markers[index].time_sig),
                None => host.tempo_at(sec),
            };
            let marker = TempoMarker {
                time_sec: existing.map(|i| markers[i].time_sec).unwrap_or(sec),
                bpm: point.bpm.unwrap_or(base_bpm),
                time_sig: point.time_sig.unwrap_or(base_sig),
                linear: point.linear,
            };
            match existing {
                Some(index) => {
                    host.set_tempo_marker(index, marker);
                }
                None => host.insert_tempo_marker(marker),
            }
            if first_bpm.is_none() {
                first_bpm = point.bpm;
            }
            debug!(
                time_sec = marker.time_sec,
                bpm = marker.bpm,
                time_sig = %marker.time_sig,
                updated = existing.is_some(),
                "Tempo marker written"
            );
        }
        host.end_undo(TEMPO_UNDO_LABEL);
        host.redraw();

        info!(points = points.len(), first_bpm, "Applied tempo changes");
        TempoOutcome {
            applied: true,
            first_bpm,
            points: points.len(),
        }
    }
}

/// Convert response markers, dropping the ones with nothing to apply.
pub fn points_from_events(events: &[TempoMarkerEvent]) -> Vec<TempoPoint> {
    events.iter().filter_map(TempoPoint::from_event).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ProjectTimeline;

    fn window(start_qn: f64, end_qn: f64) -> QnWindow {
        QnWindow { start_qn, end_qn }
    }

    #[test]
    fn test_normalize_clamps_sorts_and_thins() {
        let applier = TempoApplier::default();
        let points = vec![
            TempoPoint::bpm(8.0, 500.0),
            TempoPoint::bpm(-2.0, 90.0),
            TempoPoint::bpm(0.5, 100.0),
            TempoPoint::bpm(20.0, 10.0),
        ];
        let out = applier.normalize(&points, 16.0);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], TempoPoint::bpm(0.0, 90.0));
        // 0.5 is closer than one quarter to the point at 0
        assert_eq!(out[1], TempoPoint::bpm(8.0, 300.0));
        assert_eq!(out[2], TempoPoint::bpm(16.0, 20.0));
    }

    #[test]
    fn test_normalize_drops_invalid_and_caps() {
        let applier = TempoApplier::new(TempoLimits {
            max_points: 2,
            ..Default::default()
        });
        let points = vec![
            TempoPoint::bpm(f64::NAN, 100.0),
            TempoPoint::bpm(1.0, f64::INFINITY),
            TempoPoint {
                time_q: 2.0,
                bpm: None,
                time_sig: None,
                linear: false,
            },
            TempoPoint::bpm(3.0, 100.0),
            TempoPoint::bpm(5.0, 110.0),
            TempoPoint::bpm(7.0, 120.0),
        ];
        let out = applier.normalize(&points, 16.0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].time_q, 3.0);
    }

    #[test]
    fn test_from_event_requires_content() {
        let event = TempoMarkerEvent {
            time_q: 4.0,
            num: Some(3),
            denom: Some(4),
            ..Default::default()
        };
        let point = TempoPoint::from_event(&event).unwrap();
        assert_eq!(point.time_sig, TimeSignature::new(3, 4));
        assert!(point.bpm.is_none());

        let bad_meter = TempoMarkerEvent {
            num: Some(3),
            denom: Some(5),
            ..Default::default()
        };
        assert!(TempoPoint::from_event(&bad_meter).is_none());
    }

    #[test]
    fn test_apply_updates_existing_marker_and_preserves_meter() {
        let mut project = ProjectTimeline::new(120.0, TimeSignature::new(3, 4).unwrap());
        let applier = TempoApplier::default();
        let outcome = applier.apply(&mut project, &[TempoPoint::bpm(0.0, 90.0)], window(0.0, 8.0));
        assert!(outcome.applied);
        assert_eq!(outcome.first_bpm, Some(90.0));
        let markers = project.tempo_markers();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].bpm, 90.0);
        assert_eq!(markers[0].time_sig, TimeSignature::new(3, 4).unwrap());
    }

    #[test]
    fn test_apply_inserts_inside_window_in_one_undo_block() {
        let mut project = ProjectTimeline::default();
        let applier = TempoApplier::default();
        let points = vec![
            TempoPoint::bpm(0.0, 100.0),
            TempoPoint {
                time_q: 4.0,
                bpm: None,
                time_sig: TimeSignature::new(6, 8),
                linear: false,
            },
        ];
        let outcome = applier.apply(&mut project, &points, window(8.0, 16.0));
        assert_eq!(outcome.points, 2);

        let markers = project.tempo_markers();
        assert_eq!(markers.len(), 3);
        // qn 8 at 120 bpm is 4 seconds
        assert!((markers[1].time_sec - 4.0).abs() < 1e-9);
        assert_eq!(markers[1].bpm, 100.0);
        // qn 12 after the change to 100 bpm: 4 s + 4 q * 0.6 s
        assert!((markers[2].time_sec - 6.4).abs() < 1e-9);
        assert_eq!(markers[2].bpm, 100.0);
        assert_eq!(markers[2].time_sig, TimeSignature::new(6, 8).unwrap());

        assert_eq!(project.undo_history().len(), 1);
        assert_eq!(project.undo_history()[0].label, TEMPO_UNDO_LABEL);
    }

    #[test]
    fn test_apply_nothing_leaves_host_untouched() {
        let mut project = ProjectTimeline::default();
        let outcome = TempoApplier::default().apply(&mut project, &[], window(0.0, 4.0));
        assert!(!outcome.applied);
        assert!(project.undo_history().is_empty());
        assert_eq!(project.redraw_count(), 0);
    }
}
