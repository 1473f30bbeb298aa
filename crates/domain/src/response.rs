use serde::Serialize;

use crate::expert::StructuredPayload;
use crate::trace::MoETrace;

/// What the orchestrator hands back to the caller: the synthesized text,
/// any verbatim-preserved payloads, and the sealed trace.
#[derive(Debug, Clone, Serialize)]
pub struct FinalResponse {
    pub text: String,
    pub structured_payloads: Vec<StructuredPayload>,
    pub trace: MoETrace,
}
