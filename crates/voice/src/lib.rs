//! Voice entry point for the Ensemble core: semantic endpointing over a
//! speech-to-text event stream, feeding assembled utterances into the
//! orchestrator.

pub mod driver;
pub mod endpointing;

pub use driver::VoiceDriver;
pub use endpointing::{
    assess, decide, Completeness, Decision, Endpointer, SpeechEvent, SpeechEventKind,
};
