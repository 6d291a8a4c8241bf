//! One request, one task, one commit.

use tracing::{debug, info, warn};

use super::request::{
    DestinationChoice, GenerationSettings, WindowInfo, build_generation_request,
    resolve_destination, resolve_key,
};
use super::{FlowContext, FlowStatus, handle_response_tempo};
use crate::commit::{CommitOutcome, CommitPayload, CommitRequest};
use crate::engine::EngineEvent;
use crate::errors::{BusyKind, EngineError};
use crate::host::DestinationId;
use crate::model::GenerationResponse;
use crate::music::TimeWindow;
use crate::profiles::{InstrumentProfile, resolve_profile};
use crate::settings::StickySettings;
use crate::task::{Endpoint, TaskHandle, TaskPoll};

#[derive(Debug, Clone)]
pub struct SingleInputs {
    pub window: TimeWindow,
    pub destination: DestinationChoice,
    /// Overrides the profile resolved from the destination
    pub profile_id: Option<String>,
    pub settings: GenerationSettings,
}

#[derive(Debug)]
enum Stage {
    Awaiting(TaskHandle),
    PendingCommit(Box<CommitRequest>),
    Committing,
    Done,
}

#[derive(Debug)]
pub struct SingleFlow {
    destination: DestinationId,
    track_name: String,
    profile: InstrumentProfile,
    window: WindowInfo,
    settings: GenerationSettings,
    stage: Stage,
    tempo_applied: bool,
}

impl SingleFlow {
    /// Resolve the destination, build the request and launch the call.
    pub fn start(ctx: &mut FlowContext<'_>, inputs: SingleInputs) -> Result<Self, EngineError> {
        let window = WindowInfo::resolve(ctx.host, inputs.window)?;
        let destination = resolve_destination(ctx.host, &inputs.destination)?;
        let track_name = ctx.host.destination_name(destination).unwrap_or_default();

        let sticky = StickySettings::read(ctx.host, destination);
        let settings = inputs.settings.with_sticky(&sticky);

        let registry = ctx.collaborators.profiles.as_ref();
        let profile = inputs
            .profile_id
            .as_deref()
            .and_then(|id| registry.get(id).cloned())
            .unwrap_or_else(|| resolve_profile(registry, ctx.host, destination));

        let key = resolve_key(&settings, || {
            ctx.collaborators.key.estimate(ctx.host, window.qn)
        });
        let context = ctx.collaborators.context.build(ctx.host, destination, window.qn);
        let request = build_generation_request(&settings, &window, &key, &profile, context);

        let task = ctx.runner.start(Endpoint::Generate, &request)?;
        info!(
            destination = %track_name,
            profile = %profile.id,
            bars = window.bars(),
            key = %key,
            "Single generation started"
        );
        ctx.emit(EngineEvent::SessionStarted {
            kind: BusyKind::Single,
            destinations: 1,
        });
        ctx.emit(EngineEvent::DestinationStarted {
            track: track_name.clone(),
            position: 1,
            total: 1,
            role: String::new(),
        });

        Ok(Self {
            destination,
            track_name,
            profile,
            window,
            settings,
            stage: Stage::Awaiting(task),
            tempo_applied: false,
        })
    }

    pub fn destination(&self) -> DestinationId {
        self.destination
    }

    pub fn is_done(&self) -> bool {
        matches!(self.stage, Stage::Done)
    }

    pub fn tick(&mut self, ctx: &mut FlowContext<'_>) -> FlowStatus {
        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Awaiting(mut task) => match task.poll::<GenerationResponse>() {
                TaskPoll::Pending => self.stage = Stage::Awaiting(task),
                TaskPoll::Failed(e) => {
                    warn!(destination = %self.track_name, error = %e, "Generation failed");
                    ctx.emit(EngineEvent::Failed {
                        kind: BusyKind::Single,
                        error: e.to_string(),
                    });
                }
                TaskPoll::Ready(response) => {
                    let request = self.stage_commit(ctx, &response);
                    self.stage = Stage::PendingCommit(Box::new(request));
                }
            },
            Stage::PendingCommit(request) => {
                if !ctx.commits.is_idle() {
                    self.stage = Stage::PendingCommit(request);
                } else if let Err(e) = ctx.commits.start(ctx.host, *request) {
                    warn!(destination = %self.track_name, error = %e, "Commit could not start");
                    ctx.emit(EngineEvent::Failed {
                        kind: BusyKind::Single,
                        error: e.to_string(),
                    });
                } else {
                    self.stage = Stage::Committing;
                }
            }
            Stage::Committing => match ctx.commits.take_outcome() {
                None => self.stage = Stage::Committing,
                Some(CommitOutcome::Committed(summary)) => {
                    let sticky = self.settings.sticky_for(&self.profile.id);
                    sticky.write(ctx.host, self.destination);
                    self.settings.provider_settings().write(ctx.host);
                    ctx.emit(EngineEvent::DestinationCommitted {
                        track: self.track_name.clone(),
                        notes: summary.notes,
                        controllers: summary.controllers,
                    });
                    ctx.emit(EngineEvent::SessionFinished {
                        kind: BusyKind::Single,
                        committed: 1,
                        skipped: 0,
                    });
                }
                Some(CommitOutcome::Aborted(reason)) => {
                    ctx.emit(EngineEvent::CommitAborted {
                        track: self.track_name.clone(),
                        reason,
                    });
                }
            },
            Stage::Done => {}
        }

        if self.is_done() {
            FlowStatus::Finished
        } else {
            FlowStatus::Running
        }
    }

    fn stage_commit(
        &mut self,
        ctx: &mut FlowContext<'_>,
        response: &GenerationResponse,
    ) -> CommitRequest {
        handle_response_tempo(
            ctx,
            response,
            &mut self.window,
            self.settings.allow_tempo_changes,
            &mut self.tempo_applied,
        );
        let payload = CommitPayload::build(
            response,
            &self.profile,
            self.window.qn.length_q(),
            ctx.shaping,
        );
        debug!(
            destination = %self.track_name,
            notes = payload.notes.len(),
            "Response staged for commit"
        );
        CommitRequest {
            destination: self.destination,
            start_qn: self.window.qn.start_qn,
            end_qn: self.window.qn.end_qn,
            payload,
            profile_id: Some(self.profile.id.clone()),
            label: format!("partgen: generate {}", self.track_name),
        }
    }
}
