//! The Ensemble dispatch core: a Mixture-of-Experts orchestrator.
//!
//! Given a query, the [`Orchestrator`](orchestrator::Orchestrator) checks
//! the response cache, asks the [`Selector`](selector::Selector) which
//! experts apply, fans out through the [`Executor`](executor::Executor)
//! with bounded parallelism and deadlines, and synthesizes the results in
//! the [`Mixer`](mixer::Mixer), emitting an ordered trace stream the
//! whole way for live visualization and logs.

pub mod cache;
pub mod chitchat;
pub mod executor;
pub mod mixer;
pub mod orchestrator;
pub mod registry;
pub mod selector;
pub mod tracebus;

pub use cache::{fingerprint, ResponseCache};
pub use chitchat::ChitchatClassifier;
pub use executor::Executor;
pub use mixer::{GeocodingFallback, MapIntentDetector, MapMarker, Mixer, Summarizer};
pub use orchestrator::{Collaborators, Orchestrator};
pub use registry::{ExpertRegistry, RegisteredExpert};
pub use selector::{QueryEmbedder, SelectionOutcome, Selector};
pub use tracebus::{LogSink, TraceBus, TraceHandle, TraceSink};
