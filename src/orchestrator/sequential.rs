//! Multi-destination sessions: compose from nothing, or arrange from a sketch.
//!
//! A session optionally asks the service for a plan, then generates each
//! destination strictly in order. Destination N+1's request is built only
//! after destination N's commit finished, so its ensemble block carries
//! every part committed so far.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::plan::{PlanResponse, PlanTarget, UNKNOWN_ROLE, assign_plan};
use super::request::{
    GenerationSettings, WindowInfo, build_generation_request, describe_instrument,
    generated_part, resolve_key,
};
use super::{FlowContext, FlowStatus, handle_response_tempo};
use crate::commit::{CommitOutcome, CommitPayload, CommitRequest};
use crate::context::read_sketch;
use crate::engine::EngineEvent;
use crate::errors::{BusyKind, EngineError};
use crate::host::DestinationId;
use crate::model::{
    ContextTrack, EnsembleInfo, GeneratedPart, GenerationResponse, MusicalContext, PlanRequest,
    SketchInfo,
};
use crate::music::TimeWindow;
use crate::profiles::{InstrumentProfile, resolve_profile};
use crate::settings::StickySettings;
use crate::task::{Endpoint, TaskHandle, TaskPoll};
use crate::tempo::TempoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Compose,
    /// Arrange the notes of `source` across the destinations
    Arrange { source: DestinationId },
}

impl SessionKind {
    pub fn busy_kind(&self) -> BusyKind {
        match self {
            SessionKind::Compose => BusyKind::Compose,
            SessionKind::Arrange { .. } => BusyKind::Arrange,
        }
    }

    fn plan_endpoint(&self) -> Endpoint {
        match self {
            SessionKind::Compose => Endpoint::Plan,
            SessionKind::Arrange { .. } => Endpoint::ArrangePlan,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SequentialInputs {
    pub kind: SessionKind,
    pub window: TimeWindow,
    pub destinations: Vec<DestinationId>,
    pub settings: GenerationSettings,
    /// Ask the service for a plan before generating
    pub plan: bool,
}

/// Progress of one destination within a session.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStatus {
    #[default]
    Pending,
    Generating,
    Committing,
    Committed {
        notes: usize,
    },
    Skipped {
        reason: String,
    },
}

impl DestinationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed { .. } | Self::Skipped { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SessionDestination {
    pub id: DestinationId,
    pub track_name: String,
    pub profile: InstrumentProfile,
    pub role: String,
    pub guidance: Option<String>,
    pub sticky: StickySettings,
    pub status: DestinationStatus,
}

#[derive(Debug)]
struct Staged {
    request: CommitRequest,
    part: GeneratedPart,
}

#[derive(Debug)]
enum Stage {
    Planning(TaskHandle),
    Next,
    Generating(TaskHandle),
    PendingCommit(Box<Staged>),
    Committing(Box<GeneratedPart>),
    Finished,
}

#[derive(Debug)]
pub struct SequentialSession {
    kind: SessionKind,
    window: WindowInfo,
    settings: GenerationSettings,
    key: String,
    sketch: Option<SketchInfo>,
    destinations: Vec<SessionDestination>,
    cursor: usize,
    stage: Stage,
    parts: Vec<GeneratedPart>,
    plan_summary: String,
    plan: Option<serde_json::Value>,
    tempo_applied: bool,
    deferred_tempo: Vec<TempoPoint>,
}

impl SequentialSession {
    pub fn start(
        ctx: &mut FlowContext<'_>,
        inputs: SequentialInputs,
    ) -> Result<Self, EngineError> {
        let window = WindowInfo::resolve(ctx.host, inputs.window)?;
        let sketch = match inputs.kind {
            SessionKind::Arrange { source } => Some(read_sketch(ctx.host, source, window.qn)?),
            SessionKind::Compose => None,
        };

        let registry = ctx.collaborators.profiles.as_ref();
        let mut seen = Vec::new();
        let mut destinations = Vec::new();
        for id in inputs.destinations {
            let is_source = matches!(inputs.kind, SessionKind::Arrange { source } if source == id);
            if is_source || seen.contains(&id) || !ctx.host.is_alive(id) {
                continue;
            }
            seen.push(id);
            destinations.push(SessionDestination {
                id,
                track_name: ctx.host.destination_name(id).unwrap_or_default(),
                profile: resolve_profile(registry, ctx.host, id),
                role: UNKNOWN_ROLE.to_string(),
                guidance: None,
                sticky: StickySettings::read(ctx.host, id),
                status: DestinationStatus::Pending,
            });
        }
        if destinations.is_empty() {
            return Err(EngineError::NoDestination);
        }

        let settings = inputs.settings;
        let key = resolve_key(&settings, || {
            ctx.collaborators.key.estimate(ctx.host, window.qn)
        });

        let mut session = Self {
            kind: inputs.kind,
            window,
            settings,
            key,
            sketch,
            destinations,
            cursor: 0,
            stage: Stage::Next,
            parts: Vec::new(),
            plan_summary: String::new(),
            plan: None,
            tempo_applied: false,
            deferred_tempo: Vec::new(),
        };

        if inputs.plan {
            let request = session.plan_request();
            let task = ctx.runner.start(session.kind.plan_endpoint(), &request)?;
            session.stage = Stage::Planning(task);
        }

        info!(
            kind = %session.kind.busy_kind(),
            destinations = session.destinations.len(),
            bars = window.bars(),
            key = %session.key,
            planning = inputs.plan,
            "Sequential session started"
        );
        ctx.emit(EngineEvent::SessionStarted {
            kind: session.kind.busy_kind(),
            destinations: session.destinations.len(),
        });
        Ok(session)
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn destinations(&self) -> &[SessionDestination] {
        &self.destinations
    }

    /// Parts committed so far, in generation order.
    pub fn parts(&self) -> &[GeneratedPart] {
        &self.parts
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.stage, Stage::Finished)
    }

    fn plan_request(&self) -> PlanRequest {
        PlanRequest {
            time: self.window.time_info(),
            music: self.window.music_info(&self.key),
            user_prompt: self.settings.user_prompt.clone(),
            generation_style: self.settings.generation_style.clone(),
            allow_tempo_changes: self.settings.allow_tempo_changes,
            instruments: self.instruments(),
            model: self.settings.model.clone(),
            source_sketch: self.sketch.clone(),
        }
    }

    fn instruments(&self) -> Vec<crate::model::EnsembleInstrument> {
        self.destinations
            .iter()
            .enumerate()
            .map(|(i, d)| describe_instrument(i + 1, &d.track_name, &d.profile, &d.role))
            .collect()
    }

    fn ensemble(&self) -> EnsembleInfo {
        let instruments = self.instruments();
        EnsembleInfo {
            total_instruments: instruments.len(),
            current_instrument: instruments.get(self.cursor).cloned(),
            instruments,
            generation_style: self.settings.generation_style.clone(),
            shared_prompt: self.settings.user_prompt.clone(),
            plan_summary: self.plan_summary.clone(),
            plan: self.plan.clone(),
            current_instrument_index: self.cursor + 1,
            generation_order: self.cursor + 1,
            is_sequential: true,
            previously_generated: self.parts.clone(),
        }
    }

    pub fn tick(&mut self, ctx: &mut FlowContext<'_>) -> FlowStatus {
        match std::mem::replace(&mut self.stage, Stage::Finished) {
            Stage::Planning(mut task) => match task.poll::<serde_json::Value>() {
                TaskPoll::Pending => self.stage = Stage::Planning(task),
                TaskPoll::Failed(e) => {
                    warn!(error = %e, "Planning failed, keeping original order");
                    ctx.emit(EngineEvent::PlanFailed {
                        error: e.to_string(),
                    });
                    self.stage = Stage::Next;
                }
                TaskPoll::Ready(value) => {
                    self.apply_plan(ctx, value);
                    self.stage = Stage::Next;
                }
            },
            Stage::Next => self.start_next(ctx),
            Stage::Generating(mut task) => match task.poll::<GenerationResponse>() {
                TaskPoll::Pending => self.stage = Stage::Generating(task),
                TaskPoll::Failed(e) => {
                    self.skip_current(ctx, e.to_string());
                    self.stage = Stage::Next;
                }
                TaskPoll::Ready(response) => {
                    let staged = self.stage_commit(ctx, &response);
                    self.stage = Stage::PendingCommit(Box::new(staged));
                }
            },
            Stage::PendingCommit(staged) => {
                if !ctx.commits.is_idle() {
                    self.stage = Stage::PendingCommit(staged);
                } else {
                    let Staged { request, part } = *staged;
                    match ctx.commits.start(ctx.host, request) {
                        Ok(()) => {
                            self.destinations[self.cursor].status = DestinationStatus::Committing;
                            self.stage = Stage::Committing(Box::new(part));
                        }
                        Err(e) => self.abort(ctx, e.to_string()),
                    }
                }
            }
            Stage::Committing(part) => match ctx.commits.take_outcome() {
                None => self.stage = Stage::Committing(part),
                Some(CommitOutcome::Committed(summary)) => {
                    self.record_committed(ctx, *part, summary.notes, summary.controllers);
                    self.stage = Stage::Next;
                }
                Some(CommitOutcome::Aborted(reason)) => {
                    ctx.emit(EngineEvent::CommitAborted {
                        track: self.destinations[self.cursor].track_name.clone(),
                        reason: reason.clone(),
                    });
                    self.abort(ctx, reason);
                }
            },
            Stage::Finished => {}
        }

        if self.is_finished() {
            FlowStatus::Finished
        } else {
            FlowStatus::Running
        }
    }

    fn apply_plan(&mut self, ctx: &mut FlowContext<'_>, value: serde_json::Value) {
        let plan: PlanResponse = match serde_json::from_value(value.clone()) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "Unusable plan, keeping original order");
                ctx.emit(EngineEvent::PlanFailed {
                    error: format!("malformed plan: {}", e),
                });
                return;
            }
        };

        let targets: Vec<PlanTarget> = self
            .destinations
            .iter()
            .map(|d| PlanTarget {
                track_name: d.track_name.clone(),
                profile_name: d.profile.name.clone(),
            })
            .collect();
        let slots = assign_plan(&targets, &plan);
        let mut ordered = Vec::with_capacity(slots.len());
        for slot in slots {
            let mut dest = self.destinations[slot.target].clone();
            dest.role = slot.role;
            dest.guidance = slot.guidance;
            ordered.push(dest);
        }
        self.destinations = ordered;
        self.plan_summary = plan.plan_summary.clone();
        self.plan = Some(value);

        if plan.has_tempo() {
            if self.settings.allow_tempo_changes {
                self.deferred_tempo = plan.tempo_points(self.window.time_sig);
                debug!(points = self.deferred_tempo.len(), "Plan tempo deferred to session end");
            } else {
                info!("Plan carries tempo changes but they are not allowed, discarding");
                ctx.emit(EngineEvent::TempoDiscarded {
                    reason: "tempo changes are not allowed".to_string(),
                });
            }
        }

        ctx.emit(EngineEvent::PlanReady {
            summary: self.plan_summary.clone(),
            order: self
                .destinations
                .iter()
                .map(|d| format!("{} ({})", d.track_name, d.role))
                .collect(),
        });
    }

    fn start_next(&mut self, ctx: &mut FlowContext<'_>) {
        let Some(dest) = self.destinations.get(self.cursor) else {
            self.finish(ctx);
            return;
        };
        if !ctx.host.is_alive(dest.id) {
            self.skip_current(ctx, "destination no longer exists".to_string());
            self.stage = Stage::Next;
            return;
        }

        let settings = self.settings.with_sticky(&dest.sticky);
        let mut context = ctx
            .collaborators
            .context
            .build(ctx.host, dest.id, self.window.qn)
            .unwrap_or_default();
        if let Some(sketch) = &self.sketch
            && !context.context_tracks.iter().any(|t| t.name == sketch.track_name)
        {
            context.context_tracks.push(ContextTrack {
                name: sketch.track_name.clone(),
                notes: sketch.notes.clone(),
            });
        }
        let context = Some(context).filter(|c: &MusicalContext| !c.is_empty());

        let mut request =
            build_generation_request(&settings, &self.window, &self.key, &dest.profile, context);
        if let Some(guidance) = &dest.guidance {
            request.user_prompt = if request.user_prompt.trim().is_empty() {
                guidance.clone()
            } else {
                format!("{}\n\n{}", request.user_prompt, guidance)
            };
        }
        request.ensemble = Some(self.ensemble());

        let position = self.cursor + 1;
        let total = self.destinations.len();
        let track = dest.track_name.clone();
        let role = dest.role.clone();
        match ctx.runner.start(Endpoint::Generate, &request) {
            Ok(task) => {
                info!(destination = %track, position, total, role = %role, "Generating destination");
                self.destinations[self.cursor].status = DestinationStatus::Generating;
                ctx.emit(EngineEvent::DestinationStarted {
                    track,
                    position,
                    total,
                    role,
                });
                self.stage = Stage::Generating(task);
            }
            Err(e) => {
                self.skip_current(ctx, e.to_string());
                self.stage = Stage::Next;
            }
        }
    }

    fn stage_commit(&mut self, ctx: &mut FlowContext<'_>, response: &GenerationResponse) -> Staged {
        handle_response_tempo(
            ctx,
            response,
            &mut self.window,
            self.settings.allow_tempo_changes,
            &mut self.tempo_applied,
        );
        let dest = &self.destinations[self.cursor];
        let payload =
            CommitPayload::build(response, &dest.profile, self.window.qn.length_q(), ctx.shaping);
        let part = generated_part(&dest.track_name, &dest.profile, &dest.role, &payload);
        Staged {
            request: CommitRequest {
                destination: dest.id,
                start_qn: self.window.qn.start_qn,
                end_qn: self.window.qn.end_qn,
                payload,
                profile_id: Some(dest.profile.id.clone()),
                label: format!("partgen: {} {}", self.kind_label(), dest.track_name),
            },
            part,
        }
    }

    fn kind_label(&self) -> &'static str {
        match self.kind {
            SessionKind::Compose => "compose",
            SessionKind::Arrange { .. } => "arrange",
        }
    }

    fn record_committed(
        &mut self,
        ctx: &mut FlowContext<'_>,
        part: GeneratedPart,
        notes: usize,
        controllers: usize,
    ) {
        let dest = &mut self.destinations[self.cursor];
        dest.status = DestinationStatus::Committed { notes };
        let sticky = self.settings.sticky_for(&dest.profile.id);
        sticky.write(ctx.host, dest.id);
        ctx.emit(EngineEvent::DestinationCommitted {
            track: dest.track_name.clone(),
            notes,
            controllers,
        });
        self.parts.push(part);
        self.cursor += 1;
    }

    fn skip_current(&mut self, ctx: &mut FlowContext<'_>, reason: String) {
        if let Some(dest) = self.destinations.get_mut(self.cursor) {
            warn!(destination = %dest.track_name, reason = %reason, "Skipping destination");
            ctx.emit(EngineEvent::DestinationSkipped {
                track: dest.track_name.clone(),
                reason: reason.clone(),
            });
            dest.status = DestinationStatus::Skipped { reason };
        }
        self.cursor += 1;
    }

    fn counts(&self) -> (usize, usize) {
        let committed = self
            .destinations
            .iter()
            .filter(|d| matches!(d.status, DestinationStatus::Committed { .. }))
            .count();
        let skipped = self
            .destinations
            .iter()
            .filter(|d| matches!(d.status, DestinationStatus::Skipped { .. }))
            .count();
        (committed, skipped)
    }

    fn finish(&mut self, ctx: &mut FlowContext<'_>) {
        if !self.deferred_tempo.is_empty() {
            let points = std::mem::take(&mut self.deferred_tempo);
            let outcome = ctx.tempo.apply(ctx.host, &points, self.window.qn);
            if outcome.applied {
                ctx.emit(EngineEvent::TempoApplied {
                    points: outcome.points,
                    first_bpm: outcome.first_bpm,
                    deferred: true,
                });
            }
        }
        if self.parts.is_empty() {
            debug!("Session produced no parts");
        } else {
            self.settings.provider_settings().write(ctx.host);
        }

        let (committed, skipped) = self.counts();
        info!(
            kind = %self.kind.busy_kind(),
            committed,
            skipped,
            "Sequential session finished"
        );
        ctx.emit(EngineEvent::SessionFinished {
            kind: self.kind.busy_kind(),
            committed,
            skipped,
        });
        self.stage = Stage::Finished;
    }

    fn abort(&mut self, ctx: &mut FlowContext<'_>, reason: String) {
        warn!(kind = %self.kind.busy_kind(), reason = %reason, "Sequential session aborted");
        for dest in self.destinations.iter_mut().skip(self.cursor) {
            if !dest.status.is_terminal() {
                dest.status = DestinationStatus::Skipped {
                    reason: "session aborted".to_string(),
                };
            }
        }
        ctx.emit(EngineEvent::SessionAborted {
            kind: self.kind.busy_kind(),
            reason,
        });
        self.stage = Stage::Finished;
    }
}
