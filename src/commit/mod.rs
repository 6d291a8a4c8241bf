//! Incremental, phased commit of a generation result into a destination.
//!
//! A [`CommitSession`] clears the window and inserts the prepared payload a
//! bounded chunk at a time, so the scheduler can interleave other work
//! between steps. Phases only move forward. The whole run is one undo
//! block, closed as a named edit on success or as aborted when the
//! destination disappears mid-run.

pub mod prepare;

pub use prepare::{CommitPayload, NoteShaping, PreparedController, PreparedNote};

use tracing::{debug, info, warn};

use crate::errors::{BusyKind, EngineError};
use crate::host::{ControllerUnit, DestinationId, NoteUnit, Tick, Timeline};
use crate::settings::PROFILE_ID_KEY;

pub const DEFAULT_CHUNK_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommitPhase {
    ClearNotes,
    ClearControllers,
    InsertProgramChanges,
    InsertKeyswitches,
    InsertControllers,
    InsertNotes,
    Finalize,
}

impl CommitPhase {
    pub fn next(self) -> Option<CommitPhase> {
        use CommitPhase::*;
        match self {
            ClearNotes => Some(ClearControllers),
            ClearControllers => Some(InsertProgramChanges),
            InsertProgramChanges => Some(InsertKeyswitches),
            InsertKeyswitches => Some(InsertControllers),
            InsertControllers => Some(InsertNotes),
            InsertNotes => Some(Finalize),
            Finalize => None,
        }
    }

    pub fn is_clear(self) -> bool {
        matches!(self, CommitPhase::ClearNotes | CommitPhase::ClearControllers)
    }
}

impl std::fmt::Display for CommitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommitPhase::ClearNotes => "clear-notes",
            CommitPhase::ClearControllers => "clear-controllers",
            CommitPhase::InsertProgramChanges => "insert-program-changes",
            CommitPhase::InsertKeyswitches => "insert-keyswitches",
            CommitPhase::InsertControllers => "insert-controllers",
            CommitPhase::InsertNotes => "insert-notes",
            CommitPhase::Finalize => "finalize",
        };
        write!(f, "{}", name)
    }
}

/// What to write and where.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub destination: DestinationId,
    /// Absolute quarter-note window; payload times are relative to `start_qn`.
    pub start_qn: f64,
    pub end_qn: f64,
    pub payload: CommitPayload,
    /// Persisted on the destination at finalize
    pub profile_id: Option<String>,
    /// Undo label
    pub label: String,
}

/// Counts of what a finished commit did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub destination: DestinationId,
    pub removed_notes: usize,
    pub removed_controllers: usize,
    pub program_changes: usize,
    pub keyswitches: usize,
    pub controllers: usize,
    pub notes: usize,
    pub steps: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(CommitSummary),
    Aborted(String),
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStep {
    Continue,
    Finished(CommitOutcome),
}

/// No note or controller of `dest` touches `[start, end)`.
fn window_is_empty(host: &dyn Timeline, dest: DestinationId, start: Tick, end: Tick) -> bool {
    let notes = (0..host.note_count(dest))
        .filter_map(|i| host.note(dest, i))
        .any(|n| n.intersects(start, end));
    let controllers = (0..host.controller_count(dest))
        .filter_map(|i| host.controller(dest, i))
        .any(|c| c.within(start, end));
    !notes && !controllers
}

/// One in-progress commit.
#[derive(Debug)]
pub struct CommitSession {
    request: CommitRequest,
    start_tick: Tick,
    end_tick: Tick,
    chunk_size: usize,
    phase: CommitPhase,
    /// Clear phases: indices still to examine, counting down.
    /// Insert phases: next payload index. `None` on phase entry.
    cursor: Option<usize>,
    summary: CommitSummary,
    outcome: Option<CommitOutcome>,
}

impl CommitSession {
    /// Prepare the container and open the undo block.
    pub fn begin(
        host: &mut dyn Timeline,
        request: CommitRequest,
        chunk_size: usize,
    ) -> Result<Self, EngineError> {
        let dest = request.destination;
        if !host.is_alive(dest) {
            return Err(EngineError::Structural(format!(
                "destination {} no longer exists",
                dest
            )));
        }
        let start_tick = host.qn_to_tick(request.start_qn);
        let end_tick = host.qn_to_tick(request.end_qn);
        if end_tick <= start_tick {
            return Err(EngineError::Structural(format!(
                "empty commit window {}..{}",
                start_tick, end_tick
            )));
        }
        host.begin_undo();
        let Some(container) = host.prepare_container(dest, start_tick, end_tick) else {
            host.abort_undo(&request.label);
            return Err(EngineError::Structural(format!(
                "cannot prepare container on {}",
                dest
            )));
        };

        // A new container can still sit over loose material
        let fresh = container.freshly_created && window_is_empty(host, dest, start_tick, end_tick);
        let phase = if fresh {
            CommitPhase::InsertProgramChanges
        } else {
            CommitPhase::ClearNotes
        };
        debug!(
            destination = %dest,
            start_tick,
            end_tick,
            units = request.payload.unit_count(),
            fresh,
            "Commit started"
        );

        Ok(Self {
            summary: CommitSummary {
                destination: dest,
                ..Default::default()
            },
            request,
            start_tick,
            end_tick,
            chunk_size: chunk_size.max(1),
            phase,
            cursor: None,
            outcome: None,
        })
    }

    pub fn phase(&self) -> CommitPhase {
        self.phase
    }

    pub fn destination(&self) -> DestinationId {
        self.request.destination
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&CommitOutcome> {
        self.outcome.as_ref()
    }

    /// Run one bounded chunk. After the session finishes, this only reports
    /// the outcome again and never touches the host.
    pub fn step(&mut self, host: &mut dyn Timeline) -> CommitStep {
        if let Some(outcome) = &self.outcome {
            return CommitStep::Finished(outcome.clone());
        }
        if !host.is_alive(self.request.destination) {
            return self.abort(host, format!("destination {} disappeared", self.request.destination));
        }
        self.summary.steps += 1;

        loop {
            let result = match self.phase {
                CommitPhase::ClearNotes => self.clear_notes(host),
                CommitPhase::ClearControllers => self.clear_controllers(host),
                CommitPhase::InsertProgramChanges | CommitPhase::InsertControllers => {
                    self.insert_controllers(host)
                }
                CommitPhase::InsertKeyswitches | CommitPhase::InsertNotes => {
                    self.insert_notes(host)
                }
                CommitPhase::Finalize => return self.finalize(host),
            };
            match result {
                Err(reason) => return self.abort(host, reason),
                // Work was done this step
                Ok(processed) if processed > 0 => {
                    if self.phase_exhausted() {
                        self.advance();
                    }
                    return CommitStep::Continue;
                }
                // Nothing left in this phase; move on within the same step
                Ok(_) => self.advance(),
            }
        }
    }

    fn advance(&mut self) {
        if let Some(next) = self.phase.next() {
            debug!(destination = %self.request.destination, phase = %next, "Commit phase");
            self.phase = next;
            self.cursor = None;
        }
    }

    fn phase_exhausted(&self) -> bool {
        let payload = &self.request.payload;
        match (self.phase, self.cursor) {
            (p, Some(c)) if p.is_clear() => c == 0,
            (CommitPhase::InsertProgramChanges, Some(c)) => c >= payload.program_changes.len(),
            (CommitPhase::InsertKeyswitches, Some(c)) => c >= payload.keyswitches.len(),
            (CommitPhase::InsertControllers, Some(c)) => c >= payload.controllers.len(),
            (CommitPhase::InsertNotes, Some(c)) => c >= payload.notes.len(),
            _ => false,
        }
    }

    /// Walk backward from the cursor, deleting notes that touch the window.
    fn clear_notes(&mut self, host: &mut dyn Timeline) -> Result<usize, String> {
        let dest = self.request.destination;
        let remaining = *self.cursor.get_or_insert_with(|| host.note_count(dest));
        let lower = remaining.saturating_sub(self.chunk_size);
        for index in (lower..remaining).rev() {
            if let Some(note) = host.note(dest, index)
                && note.intersects(self.start_tick, self.end_tick)
            {
                if !host.delete_note(dest, index) {
                    return Err(format!("failed to delete note {} on {}", index, dest));
                }
                self.summary.removed_notes += 1;
            }
        }
        self.cursor = Some(lower);
        Ok(remaining - lower)
    }

    fn clear_controllers(&mut self, host: &mut dyn Timeline) -> Result<usize, String> {
        let dest = self.request.destination;
        let remaining = *self.cursor.get_or_insert_with(|| host.controller_count(dest));
        let lower = remaining.saturating_sub(self.chunk_size);
        for index in (lower..remaining).rev() {
            if let Some(unit) = host.controller(dest, index)
                && unit.within(self.start_tick, self.end_tick)
            {
                if !host.delete_controller(dest, index) {
                    return Err(format!("failed to delete controller {} on {}", index, dest));
                }
                self.summary.removed_controllers += 1;
            }
        }
        self.cursor = Some(lower);
        Ok(remaining - lower)
    }

    fn insert_notes(&mut self, host: &mut dyn Timeline) -> Result<usize, String> {
        let dest = self.request.destination;
        let base = self.request.start_qn;
        let keyswitches = self.phase == CommitPhase::InsertKeyswitches;
        let units: &[PreparedNote] = if keyswitches {
            &self.request.payload.keyswitches
        } else {
            &self.request.payload.notes
        };
        let from = self.cursor.unwrap_or(0);
        let to = (from + self.chunk_size).min(units.len());
        for note in &units[from..to] {
            let start = host.qn_to_tick(base + note.start_q);
            let end = host.qn_to_tick(base + note.end_q).max(start + 1);
            let unit = NoteUnit {
                start,
                end,
                pitch: note.pitch,
                velocity: note.velocity,
                channel: note.channel,
            };
            if !host.insert_note(dest, unit) {
                return Err(format!("failed to insert note on {}", dest));
            }
        }
        let count = to - from;
        if keyswitches {
            self.summary.keyswitches += count;
        } else {
            self.summary.notes += count;
        }
        self.cursor = Some(to);
        Ok(count)
    }

    fn insert_controllers(&mut self, host: &mut dyn Timeline) -> Result<usize, String> {
        let dest = self.request.destination;
        let base = self.request.start_qn;
        let programs = self.phase == CommitPhase::InsertProgramChanges;
        let units: &[PreparedController] = if programs {
            &self.request.payload.program_changes
        } else {
            &self.request.payload.controllers
        };
        let from = self.cursor.unwrap_or(0);
        let to = (from + self.chunk_size).min(units.len());
        for unit in &units[from..to] {
            let unit = ControllerUnit {
                tick: host.qn_to_tick(base + unit.time_q),
                channel: unit.channel,
                kind: unit.kind,
            };
            if !host.insert_controller(dest, unit) {
                return Err(format!("failed to insert controller on {}", dest));
            }
        }
        let count = to - from;
        if programs {
            self.summary.program_changes += count;
        } else {
            self.summary.controllers += count;
        }
        self.cursor = Some(to);
        Ok(count)
    }

    fn finalize(&mut self, host: &mut dyn Timeline) -> CommitStep {
        let dest = self.request.destination;
        if let Some(profile_id) = &self.request.profile_id {
            host.set_destination_meta(dest, PROFILE_ID_KEY, profile_id);
        }
        host.end_undo(&self.request.label);
        host.redraw();

        info!(
            destination = %dest,
            notes = self.summary.notes,
            controllers = self.summary.controllers,
            removed_notes = self.summary.removed_notes,
            steps = self.summary.steps,
            "Commit finished"
        );
        let outcome = CommitOutcome::Committed(self.summary.clone());
        self.outcome = Some(outcome.clone());
        CommitStep::Finished(outcome)
    }

    fn abort(&mut self, host: &mut dyn Timeline, reason: String) -> CommitStep {
        warn!(
            destination = %self.request.destination,
            phase = %self.phase,
            reason = %reason,
            "Commit aborted"
        );
        host.abort_undo(&self.request.label);
        let outcome = CommitOutcome::Aborted(reason);
        self.outcome = Some(outcome.clone());
        CommitStep::Finished(outcome)
    }
}

/// The process-wide commit slot. Holds at most one session.
#[derive(Debug)]
pub struct CommitSlot {
    active: Option<CommitSession>,
    last_outcome: Option<CommitOutcome>,
    chunk_size: usize,
}

impl Default for CommitSlot {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl CommitSlot {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            active: None,
            last_outcome: None,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub fn active_destination(&self) -> Option<DestinationId> {
        self.active.as_ref().map(|s| s.destination())
    }

    pub fn start(
        &mut self,
        host: &mut dyn Timeline,
        request: CommitRequest,
    ) -> Result<(), EngineError> {
        if self.active.is_some() {
            return Err(EngineError::Busy(BusyKind::Commit));
        }
        self.active = Some(CommitSession::begin(host, request, self.chunk_size)?);
        Ok(())
    }

    /// Advance the active session by one chunk. Returns the outcome once
    /// it finishes; the slot is idle again afterwards.
    pub fn step(&mut self, host: &mut dyn Timeline) -> Option<CommitOutcome> {
        let session = self.active.as_mut()?;
        match session.step(host) {
            CommitStep::Continue => None,
            CommitStep::Finished(outcome) => {
                self.active = None;
                self.last_outcome = Some(outcome.clone());
                Some(outcome)
            }
        }
    }

    pub fn take_outcome(&mut self) -> Option<CommitOutcome> {
        self.last_outcome.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ControllerKind, ProjectTimeline};

    fn note(start: Tick, end: Tick, pitch: u8) -> NoteUnit {
        NoteUnit {
            start,
            end,
            pitch,
            velocity: 80,
            channel: 0,
        }
    }

    fn prepared(start_q: f64, end_q: f64, pitch: u8) -> PreparedNote {
        PreparedNote {
            start_q,
            end_q,
            pitch,
            velocity: 100,
            channel: 0,
        }
    }

    /// A track with material inside and outside bars 2-3 (qn 4..12).
    fn seeded_project() -> (ProjectTimeline, DestinationId) {
        let mut project = ProjectTimeline::default();
        let dest = project.create_destination("Strings");
        project.prepare_container(dest, 0, 20 * 960);
        for i in 0..20 {
            project.insert_note(dest, note(i * 960, i * 960 + 480, 60 + (i % 12) as u8));
        }
        for i in 0..20 {
            project.insert_controller(
                dest,
                ControllerUnit {
                    tick: i * 960,
                    channel: 0,
                    kind: ControllerKind::Cc {
                        number: 1,
                        value: i as u8,
                    },
                },
            );
        }
        (project, dest)
    }

    fn payload() -> CommitPayload {
        CommitPayload {
            program_changes: vec![PreparedController {
                time_q: 0.0,
                channel: 0,
                kind: ControllerKind::ProgramChange { program: 48 },
            }],
            keyswitches: vec![prepared(0.0, 0.125, 24)],
            controllers: (0..9)
                .map(|i| PreparedController {
                    time_q: i as f64 * 0.5,
                    channel: 0,
                    kind: ControllerKind::Cc {
                        number: 11,
                        value: 100,
                    },
                })
                .collect(),
            notes: (0..13).map(|i| prepared(i as f64 * 0.5, i as f64 * 0.5 + 0.5, 70)).collect(),
        }
    }

    fn request(dest: DestinationId) -> CommitRequest {
        CommitRequest {
            destination: dest,
            start_qn: 4.0,
            end_qn: 12.0,
            payload: payload(),
            profile_id: Some("strings".into()),
            label: "partgen: generate".into(),
        }
    }

    fn run_to_end(
        project: &mut ProjectTimeline,
        session: &mut CommitSession,
    ) -> (CommitOutcome, Vec<CommitPhase>) {
        let mut phases = vec![session.phase()];
        for _ in 0..10_000 {
            match session.step(project) {
                CommitStep::Continue => phases.push(session.phase()),
                CommitStep::Finished(outcome) => return (outcome, phases),
            }
        }
        panic!("commit did not finish");
    }

    #[test]
    fn test_phase_order() {
        let mut phase = CommitPhase::ClearNotes;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(next > phase);
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(seen.last(), Some(&CommitPhase::Finalize));
    }

    #[test]
    fn test_chunk_size_does_not_change_result() {
        let mut results = Vec::new();
        let total = payload().unit_count() + 40;
        for chunk in [1, 7, 256, total] {
            let (mut project, dest) = seeded_project();
            let mut session = CommitSession::begin(&mut project, request(dest), chunk).unwrap();
            let (outcome, _) = run_to_end(&mut project, &mut session);
            assert!(outcome.is_committed());
            let track = project.track(dest).unwrap();
            results.push((track.notes.clone(), track.controllers.clone()));
        }
        for other in &results[1..] {
            assert_eq!(other, &results[0]);
        }
    }

    #[test]
    fn test_clear_removes_only_window_material() {
        let (mut project, dest) = seeded_project();
        let mut session = CommitSession::begin(&mut project, request(dest), 7).unwrap();
        let (outcome, _) = run_to_end(&mut project, &mut session);
        let CommitOutcome::Committed(summary) = outcome else {
            panic!("expected commit");
        };
        // Notes starting at qn 4..11 intersect [4, 12)
        assert_eq!(summary.removed_notes, 8);
        assert_eq!(summary.removed_controllers, 8);
        assert_eq!(summary.notes, 13);
        assert_eq!(summary.keyswitches, 1);

        let track = project.track(dest).unwrap();
        let inside: Vec<_> = track
            .notes
            .iter()
            .filter(|n| n.intersects(4 * 960, 12 * 960))
            .collect();
        assert_eq!(inside.len(), 14);
        assert!(inside.iter().all(|n| n.pitch == 70 || n.pitch == 24));
        assert_eq!(track.notes.len(), 12 + 14);
    }

    #[test]
    fn test_phases_are_monotonic_and_finish_is_sticky() {
        let (mut project, dest) = seeded_project();
        let mut session = CommitSession::begin(&mut project, request(dest), 3).unwrap();
        let (outcome, phases) = run_to_end(&mut project, &mut session);
        assert!(phases.windows(2).all(|w| w[0] <= w[1]));

        let redraws = project.redraw_count();
        let history = project.undo_history().len();
        assert_eq!(session.step(&mut project), CommitStep::Finished(outcome));
        assert_eq!(project.redraw_count(), redraws);
        assert_eq!(project.undo_history().len(), history);
    }

    #[test]
    fn test_fresh_container_skips_clear() {
        let mut project = ProjectTimeline::default();
        let dest = project.create_destination("Flute");
        let session = CommitSession::begin(&mut project, request(dest), 256).unwrap();
        assert_eq!(session.phase(), CommitPhase::InsertProgramChanges);
    }

    #[test]
    fn test_new_container_over_loose_notes_clears_window() {
        let mut project = ProjectTimeline::default();
        let dest = project.create_destination("Organ");
        for i in 0..16 {
            project.insert_note(dest, note(i * 960, i * 960 + 480, 40));
        }
        assert!(project.track(dest).unwrap().items.is_empty());

        let mut session = CommitSession::begin(&mut project, request(dest), 5).unwrap();
        assert_eq!(session.phase(), CommitPhase::ClearNotes);
        assert!(project.is_undo_open());
        let (outcome, _) = run_to_end(&mut project, &mut session);
        assert!(outcome.is_committed());

        let track = project.track(dest).unwrap();
        let inside: Vec<_> = track
            .notes
            .iter()
            .filter(|n| n.intersects(4 * 960, 12 * 960))
            .collect();
        assert_eq!(inside.len(), 14);
        assert!(inside.iter().all(|n| n.pitch != 40));
        assert_eq!(track.notes.len(), 8 + 14);
        assert_eq!(project.undo_history().len(), 1);
    }

    #[test]
    fn test_finalize_writes_profile_and_one_undo_entry() {
        let (mut project, dest) = seeded_project();
        let mut session = CommitSession::begin(&mut project, request(dest), 256).unwrap();
        run_to_end(&mut project, &mut session);
        assert_eq!(
            project.destination_meta(dest, PROFILE_ID_KEY).as_deref(),
            Some("strings")
        );
        assert_eq!(project.undo_history().len(), 1);
        assert_eq!(project.undo_history()[0].label, "partgen: generate");
        assert!(!project.is_undo_open());
        assert_eq!(project.redraw_count(), 1);
    }

    #[test]
    fn test_destination_removed_mid_commit_aborts() {
        let (mut project, dest) = seeded_project();
        let mut session = CommitSession::begin(&mut project, request(dest), 1).unwrap();
        assert_eq!(session.step(&mut project), CommitStep::Continue);
        project.remove_track(dest);
        match session.step(&mut project) {
            CommitStep::Finished(CommitOutcome::Aborted(reason)) => {
                assert!(reason.contains("disappeared"))
            }
            other => panic!("expected abort, got {:?}", other),
        }
        assert!(!project.is_undo_open());
        assert!(project.undo_history()[0].label.ends_with("(aborted)"));
    }

    #[test]
    fn test_begin_on_dead_destination_is_structural() {
        let mut project = ProjectTimeline::default();
        let err = CommitSession::begin(&mut project, request(DestinationId(42)), 256).unwrap_err();
        assert!(matches!(err, EngineError::Structural(_)));
        assert!(!project.is_undo_open());
    }

    #[test]
    fn test_slot_rejects_second_commit() {
        let (mut project, dest) = seeded_project();
        let mut slot = CommitSlot::new(4);
        slot.start(&mut project, request(dest)).unwrap();
        assert!(!slot.is_idle());
        let err = slot.start(&mut project, request(dest)).unwrap_err();
        assert!(matches!(err, EngineError::Busy(BusyKind::Commit)));

        let mut outcome = None;
        for _ in 0..1000 {
            if let Some(o) = slot.step(&mut project) {
                outcome = Some(o);
                break;
            }
        }
        assert!(outcome.is_some_and(|o| o.is_committed()));
        assert!(slot.is_idle());
        assert!(slot.take_outcome().is_some());
        assert!(slot.take_outcome().is_none());
        assert!(slot.step(&mut project).is_none());
    }
}
