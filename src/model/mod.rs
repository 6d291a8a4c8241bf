//! Wire types exchanged with the inference service.
//!
//! Requests are built fresh for every call and never mutated after they are
//! handed to a task. Responses are untrusted: every numeric field is kept as
//! received and validated only when a commit payload is prepared.

pub mod request;
pub mod response;

pub use request::{
    ContextNote, ContextTrack, EnhanceInstrument, EnhanceRequest, EnsembleInfo,
    EnsembleInstrument, GeneratedPart, GenerationRequest, HorizontalContext, ModelInfo,
    MusicInfo, MusicalContext, PitchRange, PlanRequest, SketchInfo, TargetInfo, TimeInfo,
};
pub use response::{
    CcEvent, EnhanceResponse, GenerationResponse, HealthResponse, KeyswitchEvent, NoteEvent,
    ProgramChangeEvent, TempoMarkerEvent,
};
