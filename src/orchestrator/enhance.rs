//! Prompt enhancement: one `/enhance` call, nothing committed.

use tracing::{info, warn};

use super::request::{AUTO, UNKNOWN_KEY};
use super::{FlowContext, FlowStatus};
use crate::engine::EngineEvent;
use crate::errors::{BusyKind, EngineError};
use crate::host::DestinationId;
use crate::model::{EnhanceInstrument, EnhanceRequest, EnhanceResponse, ModelInfo};
use crate::music::{QnWindow, TimeWindow};
use crate::profiles::resolve_profile;
use crate::task::{Endpoint, TaskHandle, TaskPoll};

#[derive(Debug, Clone)]
pub struct EnhanceInputs {
    pub user_prompt: String,
    /// Tracks the prompt is written for; may be empty
    pub destinations: Vec<DestinationId>,
    pub window: Option<TimeWindow>,
    pub key: String,
    pub model: ModelInfo,
}

#[derive(Debug)]
pub struct EnhanceFlow {
    original: String,
    task: Option<TaskHandle>,
    enhanced: Option<String>,
}

impl EnhanceFlow {
    pub fn start(ctx: &mut FlowContext<'_>, inputs: EnhanceInputs) -> Result<Self, EngineError> {
        if inputs.user_prompt.trim().is_empty() {
            return Err(EngineError::Structural("nothing to enhance: prompt is empty".into()));
        }
        let request = build_enhance_request(ctx, &inputs)?;
        let task = ctx.runner.start(Endpoint::Enhance, &request)?;
        info!(
            instruments = request.instruments.len(),
            key = %request.key,
            "Prompt enhancement started"
        );
        Ok(Self {
            original: inputs.user_prompt,
            task: Some(task),
            enhanced: None,
        })
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    /// The rewritten prompt, once the call succeeded.
    pub fn enhanced(&self) -> Option<&str> {
        self.enhanced.as_deref()
    }

    pub fn tick(&mut self, ctx: &mut FlowContext<'_>) -> FlowStatus {
        let Some(task) = self.task.as_mut() else {
            return FlowStatus::Finished;
        };
        match task.poll::<EnhanceResponse>() {
            TaskPoll::Pending => return FlowStatus::Running,
            TaskPoll::Ready(response) => {
                let prompt = response.enhanced_prompt.trim().to_string();
                if prompt.is_empty() {
                    warn!("Service returned an empty prompt");
                    ctx.emit(EngineEvent::Failed {
                        kind: BusyKind::Enhance,
                        error: "service returned an empty prompt".into(),
                    });
                } else {
                    info!(chars = prompt.len(), "Prompt enhanced");
                    ctx.emit(EngineEvent::PromptEnhanced {
                        prompt: prompt.clone(),
                    });
                    self.enhanced = Some(prompt);
                }
            }
            TaskPoll::Failed(e) => {
                warn!(error = %e, "Prompt enhancement failed");
                ctx.emit(EngineEvent::Failed {
                    kind: BusyKind::Enhance,
                    error: e.to_string(),
                });
            }
        }
        self.task = None;
        FlowStatus::Finished
    }
}

fn build_enhance_request(
    ctx: &FlowContext<'_>,
    inputs: &EnhanceInputs,
) -> Result<EnhanceRequest, EngineError> {
    let host = &*ctx.host;
    let registry = ctx.collaborators.profiles.as_ref();
    let instruments = inputs
        .destinations
        .iter()
        .filter(|d| host.is_alive(**d))
        .map(|d| {
            let profile = resolve_profile(registry, host, *d);
            EnhanceInstrument {
                track_name: host.destination_name(*d).unwrap_or_default(),
                profile_name: profile.name,
                family: profile.family,
                role: super::plan::UNKNOWN_ROLE.to_string(),
            }
        })
        .collect();

    let window = match inputs.window {
        Some(time) if !time.is_valid() => {
            return Err(EngineError::InvalidWindow {
                start_sec: time.start_sec,
                end_sec: time.end_sec,
            });
        }
        Some(time) => Some((
            time,
            QnWindow {
                start_qn: host.time_to_qn(time.start_sec),
                end_qn: host.time_to_qn(time.end_sec),
            },
        )),
        None => None,
    };
    let (bpm, time_sig) = host.tempo_at(window.map(|(t, _)| t.start_sec).unwrap_or(0.0));

    let key = if inputs.key.eq_ignore_ascii_case(AUTO) || inputs.key.trim().is_empty() {
        window
            .and_then(|(_, qn)| ctx.collaborators.key.estimate(host, qn))
            .unwrap_or_else(|| UNKNOWN_KEY.to_string())
    } else {
        inputs.key.clone()
    };

    Ok(EnhanceRequest {
        user_prompt: inputs.user_prompt.clone(),
        instruments,
        key,
        bpm,
        time_sig: time_sig.to_string(),
        length_bars: window.map(|(_, qn)| qn.bars(time_sig)),
        length_q: window.map(|(_, qn)| qn.length_q()),
        context_notes: None,
        model: inputs.model.clone(),
    })
}
