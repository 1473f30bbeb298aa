//! Shared types for the Ensemble orchestration core: queries, expert
//! descriptors and results, structured payloads, trace records, the
//! configuration tree, and the workspace-wide error type.

pub mod config;
pub mod error;
pub mod expert;
pub mod query;
pub mod response;
pub mod trace;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use expert::{
    CostClass, Expert, ExpertDescriptor, ExpertResult, ExpertStatus, PayloadKind,
    StructuredPayload,
};
pub use query::Query;
pub use response::FinalResponse;
pub use trace::{ExpertSummary, MoETrace, SelectionMode, TraceEvent, TraceEventKind, Window};
