//! Generation flows.
//!
//! Each flow is an explicit state machine advanced one transition per
//! scheduler turn through [`FlowContext`]. Flows never block: service calls
//! are polled task handles and commits run in the shared [`CommitSlot`].

pub mod enhance;
pub mod plan;
pub mod request;
pub mod sequential;
pub mod single;

pub use enhance::{EnhanceFlow, EnhanceInputs};
pub use plan::{PlanResponse, assign_plan, match_score};
pub use request::{DestinationChoice, GenerationSettings, WindowInfo};
pub use sequential::{SequentialInputs, SequentialSession, SessionKind};
pub use single::{SingleFlow, SingleInputs};

use tracing::{debug, info};

use crate::commit::{CommitSlot, NoteShaping};
use crate::context::{ContextProvider, KeyEstimator, PitchClassKeyEstimator, TimelineContext};
use crate::engine::EngineEvent;
use crate::host::Timeline;
use crate::model::GenerationResponse;
use crate::profiles::{ProfileDirectory, ProfileRegistry};
use crate::task::TaskRunner;
use crate::tempo::{TempoApplier, TempoOutcome, points_from_events};

/// External collaborators the flows consult.
pub struct Collaborators {
    pub profiles: Box<dyn ProfileRegistry>,
    pub context: Box<dyn ContextProvider>,
    pub key: Box<dyn KeyEstimator>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            profiles: Box::new(ProfileDirectory::default()),
            context: Box::new(TimelineContext::default()),
            key: Box::new(PitchClassKeyEstimator),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("profiles", &self.profiles.all().len())
            .finish_non_exhaustive()
    }
}

/// Everything a flow may touch during one turn.
pub struct FlowContext<'a> {
    pub host: &'a mut dyn Timeline,
    pub runner: &'a TaskRunner,
    pub commits: &'a mut CommitSlot,
    pub tempo: &'a TempoApplier,
    pub shaping: &'a NoteShaping,
    pub collaborators: &'a Collaborators,
    pub events: &'a mut Vec<EngineEvent>,
}

impl FlowContext<'_> {
    pub fn emit(&mut self, event: EngineEvent) {
        self.events.push(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Running,
    Finished,
}

/// Apply or discard the tempo markers carried by a generation response.
///
/// `applied_once` is the session's bookkeeping: once set, later responses
/// cannot change the tempo map. After a change `window` follows the new
/// tempo so later requests report it.
pub(crate) fn handle_response_tempo(
    ctx: &mut FlowContext<'_>,
    response: &GenerationResponse,
    window: &mut WindowInfo,
    allow: bool,
    applied_once: &mut bool,
) -> Option<TempoOutcome> {
    if !response.has_tempo() {
        return None;
    }
    if !allow {
        info!(markers = response.tempo_markers.len(), "Tempo changes not allowed, discarding");
        ctx.emit(EngineEvent::TempoDiscarded {
            reason: "tempo changes are not allowed".to_string(),
        });
        return None;
    }
    if *applied_once {
        info!("Tempo already set in this session, discarding");
        ctx.emit(EngineEvent::TempoDiscarded {
            reason: "tempo already applied in this session".to_string(),
        });
        return None;
    }

    let points = points_from_events(&response.tempo_markers);
    let outcome = ctx.tempo.apply(ctx.host, &points, window.qn);
    if outcome.applied {
        *applied_once = true;
        window.resync(ctx.host);
        debug!(
            first_bpm = outcome.first_bpm,
            bpm = window.bpm,
            end_sec = window.time.end_sec,
            "Window follows new tempo"
        );
        ctx.emit(EngineEvent::TempoApplied {
            points: outcome.points,
            first_bpm: outcome.first_bpm,
            deferred: false,
        });
    }
    Some(outcome)
}
