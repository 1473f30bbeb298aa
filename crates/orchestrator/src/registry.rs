//! Expert registry.
//!
//! Holds every registered expert (descriptor + invocation handle) and
//! exposes consistent snapshot reads. Writers mutate under a lock by
//! replacing the shared list wholesale; readers clone an `Arc` and never
//! observe a half-written registry. Registrations after a `snapshot` call
//! are not visible to that snapshot.

use std::sync::Arc;

use parking_lot::RwLock;

use ens_domain::error::{Error, Result};
use ens_domain::expert::{Expert, ExpertDescriptor};

/// One registry entry: immutable descriptor plus the runtime handle.
#[derive(Clone)]
pub struct RegisteredExpert {
    pub descriptor: Arc<ExpertDescriptor>,
    pub handle: Arc<dyn Expert>,
}

/// The set of experts the orchestrator can fan out to.
pub struct ExpertRegistry {
    experts: RwLock<Arc<Vec<RegisteredExpert>>>,
}

impl Default for ExpertRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpertRegistry {
    pub fn new() -> Self {
        Self {
            experts: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Register an expert. Fails on an empty id, a zero timeout, or an id
    /// that is already registered; the registry never silently drops an
    /// expert.
    pub fn register(&self, descriptor: ExpertDescriptor, handle: Arc<dyn Expert>) -> Result<()> {
        if descriptor.id.trim().is_empty() {
            return Err(Error::InvalidDescriptor("empty expert id".into()));
        }
        if descriptor.timeout_ms == 0 {
            return Err(Error::InvalidDescriptor(format!(
                "expert {} has a zero timeout",
                descriptor.id
            )));
        }

        let mut experts = self.experts.write();
        if experts.iter().any(|e| e.descriptor.id == descriptor.id) {
            return Err(Error::DuplicateId(descriptor.id));
        }

        tracing::info!(
            expert_id = %descriptor.id,
            cost_class = ?descriptor.cost_class,
            tags = ?descriptor.capability_tags,
            "registered expert"
        );

        let mut next: Vec<RegisteredExpert> = experts.as_ref().clone();
        next.push(RegisteredExpert {
            descriptor: Arc::new(descriptor),
            handle,
        });
        *experts = Arc::new(next);
        Ok(())
    }

    /// Remove an expert by id. Returns true if it was present. Snapshots
    /// taken before the call keep the expert they saw.
    pub fn deregister(&self, id: &str) -> bool {
        let mut experts = self.experts.write();
        if !experts.iter().any(|e| e.descriptor.id == id) {
            return false;
        }
        let next: Vec<RegisteredExpert> = experts
            .iter()
            .filter(|e| e.descriptor.id != id)
            .cloned()
            .collect();
        *experts = Arc::new(next);
        tracing::info!(expert_id = %id, "deregistered expert");
        true
    }

    /// A consistent point-in-time view of the registry. O(1): readers
    /// share the underlying list.
    pub fn snapshot(&self) -> Arc<Vec<RegisteredExpert>> {
        self.experts.read().clone()
    }

    pub fn lookup(&self, id: &str) -> Option<RegisteredExpert> {
        self.experts
            .read()
            .iter()
            .find(|e| e.descriptor.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.experts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.read().is_empty()
    }
}
