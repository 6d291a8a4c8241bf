//! The cooperative scheduler that owns every session.
//!
//! The engine holds the host, the service runner and the three singleton
//! slots (single flow, sequential session, commit). One [`Engine::tick`]
//! steps the commit slot by one chunk and then gives each live flow one
//! transition. Nothing here blocks; [`Engine::run_until_idle`] only sleeps
//! between ticks so the host stays responsive.

use anyhow::Result;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::commit::{CommitOutcome, CommitRequest, CommitSlot, NoteShaping};
use crate::errors::{BusyKind, EngineError};
use crate::host::{DestinationId, Timeline};
use crate::orchestrator::{
    Collaborators, EnhanceFlow, EnhanceInputs, FlowContext, FlowStatus, SequentialInputs,
    SequentialSession, SingleFlow, SingleInputs,
};
use crate::partgen_config::PartgenConfig;
use crate::profiles::{ProfileDirectory, global_profiles_dir};
use crate::task::TaskRunner;
use crate::tempo::TempoApplier;

pub const DEFAULT_TICK: Duration = Duration::from_millis(25);

/// Progress reported by the engine, drained by the caller after each tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    SessionStarted {
        kind: BusyKind,
        destinations: usize,
    },
    PlanReady {
        summary: String,
        /// `track (role)` in generation order
        order: Vec<String>,
    },
    /// Planning failed; the session continues in the original order.
    PlanFailed {
        error: String,
    },
    DestinationStarted {
        track: String,
        position: usize,
        total: usize,
        role: String,
    },
    DestinationSkipped {
        track: String,
        reason: String,
    },
    DestinationCommitted {
        track: String,
        notes: usize,
        controllers: usize,
    },
    TempoApplied {
        points: usize,
        first_bpm: Option<f64>,
        /// Applied at session end from the plan
        deferred: bool,
    },
    TempoDiscarded {
        reason: String,
    },
    CommitAborted {
        track: String,
        reason: String,
    },
    SessionFinished {
        kind: BusyKind,
        committed: usize,
        skipped: usize,
    },
    SessionAborted {
        kind: BusyKind,
        reason: String,
    },
    Failed {
        kind: BusyKind,
        error: String,
    },
    PromptEnhanced {
        prompt: String,
    },
}

impl EngineEvent {
    /// Events after which the emitting session holds nothing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::SessionFinished { .. }
                | EngineEvent::SessionAborted { .. }
                | EngineEvent::Failed { .. }
                | EngineEvent::PromptEnhanced { .. }
        )
    }
}

#[derive(Debug, Default)]
struct Flows {
    single: Option<SingleFlow>,
    sequential: Option<SequentialSession>,
    enhance: Option<EnhanceFlow>,
    /// Destination of a commit started through `start_commit`
    direct_commit: Option<DestinationId>,
}

pub struct Engine<H: Timeline> {
    host: H,
    runner: TaskRunner,
    commits: CommitSlot,
    tempo: TempoApplier,
    shaping: NoteShaping,
    collaborators: Collaborators,
    flows: Flows,
    events: Vec<EngineEvent>,
    tick_interval: Duration,
}

impl<H: Timeline> std::fmt::Debug for Engine<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("busy", &self.busy())
            .field("enhancing", &self.flows.enhance.is_some())
            .field("pending_events", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl<H: Timeline> Engine<H> {
    pub fn new(host: H, runner: TaskRunner) -> Self {
        Self {
            host,
            runner,
            commits: CommitSlot::default(),
            tempo: TempoApplier::default(),
            shaping: NoteShaping::default(),
            collaborators: Collaborators::default(),
            flows: Flows::default(),
            events: Vec::new(),
            tick_interval: DEFAULT_TICK,
        }
    }

    /// Build an engine with every knob taken from `partgen.toml`.
    pub fn from_config(host: H, config: &PartgenConfig) -> Result<Self> {
        let global = global_profiles_dir();
        let profiles = ProfileDirectory::load_layered(&config.profiles_dir(), global.as_deref())?;
        debug!(profiles = profiles.len(), "Engine configured");
        Ok(Self::new(host, TaskRunner::from_config(config))
            .with_chunk_size(config.toml.commit.chunk_size)
            .with_shaping(NoteShaping::from(&config.toml.commit))
            .with_tempo(TempoApplier::new((&config.toml.tempo).into()))
            .with_collaborators(Collaborators {
                profiles: Box::new(profiles),
                ..Collaborators::default()
            })
            .with_tick_interval(config.tick_interval()))
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.commits = CommitSlot::new(chunk_size);
        self
    }

    pub fn with_shaping(mut self, shaping: NoteShaping) -> Self {
        self.shaping = shaping;
        self
    }

    pub fn with_tempo(mut self, tempo: TempoApplier) -> Self {
        self.tempo = tempo;
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn into_host(self) -> H {
        self.host
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// Which member of the single / sequential / commit triad holds the engine.
    pub fn busy(&self) -> Option<BusyKind> {
        if self.flows.single.is_some() {
            Some(BusyKind::Single)
        } else if let Some(session) = &self.flows.sequential {
            Some(session.kind().busy_kind())
        } else if !self.commits.is_idle() {
            Some(BusyKind::Commit)
        } else {
            None
        }
    }

    pub fn is_enhancing(&self) -> bool {
        self.flows.enhance.is_some()
    }

    /// Nothing running, nothing pending.
    pub fn is_idle(&self) -> bool {
        self.busy().is_none() && !self.is_enhancing()
    }

    pub fn sequential(&self) -> Option<&SequentialSession> {
        self.flows.sequential.as_ref()
    }

    fn ensure_free(&self) -> Result<(), EngineError> {
        match self.busy() {
            Some(kind) => Err(EngineError::Busy(kind)),
            None => Ok(()),
        }
    }

    fn split(&mut self) -> (FlowContext<'_>, &mut Flows) {
        (
            FlowContext {
                host: &mut self.host,
                runner: &self.runner,
                commits: &mut self.commits,
                tempo: &self.tempo,
                shaping: &self.shaping,
                collaborators: &self.collaborators,
                events: &mut self.events,
            },
            &mut self.flows,
        )
    }

    pub fn start_single(&mut self, inputs: SingleInputs) -> Result<(), EngineError> {
        self.ensure_free()?;
        let (mut ctx, flows) = self.split();
        flows.single = Some(SingleFlow::start(&mut ctx, inputs)?);
        Ok(())
    }

    pub fn start_sequential(&mut self, inputs: SequentialInputs) -> Result<(), EngineError> {
        self.ensure_free()?;
        let (mut ctx, flows) = self.split();
        flows.sequential = Some(SequentialSession::start(&mut ctx, inputs)?);
        Ok(())
    }

    /// Commit a prepared payload without a generation flow around it.
    pub fn start_commit(&mut self, request: CommitRequest) -> Result<(), EngineError> {
        self.ensure_free()?;
        let destination = request.destination;
        self.commits.start(&mut self.host, request)?;
        self.flows.direct_commit = Some(destination);
        self.events.push(EngineEvent::SessionStarted {
            kind: BusyKind::Commit,
            destinations: 1,
        });
        Ok(())
    }

    /// Start a prompt enhancement. Only another enhancement blocks it.
    pub fn start_enhance(&mut self, inputs: EnhanceInputs) -> Result<(), EngineError> {
        if self.flows.enhance.is_some() {
            return Err(EngineError::Busy(BusyKind::Enhance));
        }
        let (mut ctx, flows) = self.split();
        flows.enhance = Some(EnhanceFlow::start(&mut ctx, inputs)?);
        Ok(())
    }

    /// One scheduler turn.
    pub fn tick(&mut self) {
        if let Some(outcome) = self.commits.step(&mut self.host)
            && let Some(destination) = self.flows.direct_commit.take()
        {
            self.commits.take_outcome();
            self.report_direct_commit(destination, outcome);
        }

        let (mut ctx, flows) = self.split();
        if let Some(flow) = flows.single.as_mut()
            && flow.tick(&mut ctx) == FlowStatus::Finished
        {
            flows.single = None;
        }
        if let Some(session) = flows.sequential.as_mut()
            && session.tick(&mut ctx) == FlowStatus::Finished
        {
            flows.sequential = None;
        }
        if let Some(flow) = flows.enhance.as_mut()
            && flow.tick(&mut ctx) == FlowStatus::Finished
        {
            flows.enhance = None;
        }
    }

    fn report_direct_commit(&mut self, destination: DestinationId, outcome: CommitOutcome) {
        let track = self.host.destination_name(destination).unwrap_or_default();
        match outcome {
            CommitOutcome::Committed(summary) => {
                self.events.push(EngineEvent::DestinationCommitted {
                    track,
                    notes: summary.notes,
                    controllers: summary.controllers,
                });
                self.events.push(EngineEvent::SessionFinished {
                    kind: BusyKind::Commit,
                    committed: 1,
                    skipped: 0,
                });
            }
            CommitOutcome::Aborted(reason) => {
                self.events.push(EngineEvent::CommitAborted {
                    track,
                    reason: reason.clone(),
                });
                self.events.push(EngineEvent::SessionAborted {
                    kind: BusyKind::Commit,
                    reason,
                });
            }
        }
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Tick until every session has finished, handing each event to `on_event`.
    pub async fn run_until_idle(&mut self, mut on_event: impl FnMut(&EngineEvent)) {
        let mut ticks: u64 = 0;
        loop {
            self.tick();
            ticks += 1;
            for event in self.drain_events() {
                on_event(&event);
            }
            if self.is_idle() {
                break;
            }
            tokio::time::sleep(self.tick_interval).await;
        }
        info!(ticks, "Engine idle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitPayload;
    use crate::host::ProjectTimeline;
    use crate::model::ModelInfo;
    use crate::music::TimeWindow;
    use crate::orchestrator::{DestinationChoice, GenerationSettings, SessionKind};
    use crate::task::Endpoint;
    use crate::task::testing::{ScriptedReply, ScriptedTransport};
    use tempfile::tempdir;

    fn settings() -> GenerationSettings {
        GenerationSettings {
            generation_type: "melody".into(),
            generation_style: "auto".into(),
            key: "C major".into(),
            user_prompt: String::new(),
            free_mode: false,
            allow_tempo_changes: false,
            articulation: None,
            preset_name: None,
            model: ModelInfo {
                provider: "local".into(),
                model_name: None,
                temperature: None,
                base_url: None,
                api_key: None,
            },
        }
    }

    fn engine(dir: &std::path::Path, transport: &ScriptedTransport) -> Engine<ProjectTimeline> {
        let runner = TaskRunner::new(
            "http://service.test",
            dir.join("staging"),
            vec![Box::new(transport.clone())],
        );
        Engine::new(ProjectTimeline::default(), runner)
    }

    fn single_inputs(dest: DestinationId) -> SingleInputs {
        SingleInputs {
            window: TimeWindow::new(0.0, 8.0),
            destination: DestinationChoice::Id(dest),
            profile_id: None,
            settings: settings(),
        }
    }

    #[test]
    fn test_busy_single_blocks_everything_in_the_triad() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new();
        transport.push(Endpoint::Generate, ScriptedReply::Silent);
        let mut engine = engine(dir.path(), &transport);
        let dest = engine.host_mut().create_destination("Piano");

        engine.start_single(single_inputs(dest)).unwrap();
        assert_eq!(engine.busy(), Some(BusyKind::Single));

        let err = engine.start_single(single_inputs(dest)).unwrap_err();
        assert!(matches!(err, EngineError::Busy(BusyKind::Single)));
        let err = engine
            .start_sequential(SequentialInputs {
                kind: SessionKind::Compose,
                window: TimeWindow::new(0.0, 8.0),
                destinations: vec![dest],
                settings: settings(),
                plan: false,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Busy(BusyKind::Single)));
        let err = engine
            .start_commit(CommitRequest {
                destination: dest,
                start_qn: 0.0,
                end_qn: 16.0,
                payload: CommitPayload::default(),
                profile_id: None,
                label: "manual".into(),
            })
            .unwrap_err();
        assert!(err.is_busy());
    }

    #[test]
    fn test_direct_commit_reports_and_frees_slot() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new();
        let mut engine = engine(dir.path(), &transport);
        let dest = engine.host_mut().create_destination("Bass");

        engine
            .start_commit(CommitRequest {
                destination: dest,
                start_qn: 0.0,
                end_qn: 16.0,
                payload: CommitPayload::default(),
                profile_id: None,
                label: "manual".into(),
            })
            .unwrap();
        assert_eq!(engine.busy(), Some(BusyKind::Commit));

        for _ in 0..16 {
            engine.tick();
            if engine.is_idle() {
                break;
            }
        }
        assert!(engine.is_idle());
        let events = engine.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::SessionFinished { kind: BusyKind::Commit, committed: 1, .. }
        )));
        assert_eq!(engine.host().undo_history().len(), 1);
    }

    #[test]
    fn test_enhance_runs_beside_but_not_twice() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new();
        transport.push(Endpoint::Enhance, ScriptedReply::Silent);
        let mut engine = engine(dir.path(), &transport);
        let inputs = EnhanceInputs {
            user_prompt: "sad strings".into(),
            destinations: Vec::new(),
            window: None,
            key: "auto".into(),
            model: settings().model,
        };

        engine.start_enhance(inputs.clone()).unwrap();
        assert!(engine.busy().is_none());
        assert!(!engine.is_idle());
        let err = engine.start_enhance(inputs).unwrap_err();
        assert!(matches!(err, EngineError::Busy(BusyKind::Enhance)));
    }

    #[test]
    fn test_enhance_surfaces_prompt() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new();
        transport.push_json(
            Endpoint::Enhance,
            serde_json::json!({"enhanced_prompt": "  slow, aching legato strings  "}),
        );
        let mut engine = engine(dir.path(), &transport);
        let piano = engine.host_mut().create_destination("Piano");
        engine
            .start_enhance(EnhanceInputs {
                user_prompt: "sad strings".into(),
                destinations: vec![piano],
                window: Some(TimeWindow::new(0.0, 8.0)),
                key: "auto".into(),
                model: settings().model,
            })
            .unwrap();
        engine.tick();
        assert!(engine.is_idle());
        assert_eq!(
            engine.drain_events(),
            vec![EngineEvent::PromptEnhanced {
                prompt: "slow, aching legato strings".into()
            }]
        );

        let sent = transport.requests_for(Endpoint::Enhance);
        assert_eq!(sent[0]["length_bars"], 4);
        assert_eq!(sent[0]["key"], "unknown");
        assert_eq!(sent[0]["instruments"][0]["track_name"], "Piano");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = EngineEvent::SessionStarted {
            kind: BusyKind::Compose,
            destinations: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session_started");
        assert_eq!(json["kind"], "compose");
        assert!(!event.is_terminal());
    }

    #[tokio::test]
    async fn test_run_until_idle_on_failed_generation() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new();
        transport.push_json(Endpoint::Generate, serde_json::json!({"detail": "model offline"}));
        let mut engine = engine(dir.path(), &transport).with_tick_interval(Duration::from_millis(1));
        let dest = engine.host_mut().create_destination("Piano");
        engine.start_single(single_inputs(dest)).unwrap();

        let mut seen = Vec::new();
        engine.run_until_idle(|e| seen.push(e.clone())).await;
        assert!(engine.is_idle());
        assert!(seen.iter().any(|e| matches!(
            e,
            EngineEvent::Failed { kind: BusyKind::Single, error } if error.contains("model offline")
        )));
        assert!(engine.host().undo_history().is_empty());
    }
}
