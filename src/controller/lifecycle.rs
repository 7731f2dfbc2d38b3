//! Per-object reconciliation phase
//!
//! ```text
//! Unknown --planned--> Pending --succeeded--> Applied
//!                         ^                     |
//!                         +-------planned-------+
//! ```
//!
//! A failed operation leaves the object in `Pending`; it is planned again on
//! the next cycle. Objects whose delete succeeded are forgotten.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use super::diff::OperationPlan;
use crate::model::{Action, ObjectKey};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ObjectPhase {
    #[default]
    Unknown,
    Pending,
    Applied,
}

impl fmt::Display for ObjectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectPhase::Unknown => write!(f, "Unknown"),
            ObjectPhase::Pending => write!(f, "Pending"),
            ObjectPhase::Applied => write!(f, "Applied"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LifecycleTracker {
    phases: BTreeMap<ObjectKey, ObjectPhase>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, key: &ObjectKey) -> ObjectPhase {
        self.phases.get(key).copied().unwrap_or_default()
    }

    /// Everything in the plan has a desired body that differs from what is
    /// applied, or is about to be deleted
    pub fn mark_planned(&mut self, plan: &OperationPlan) {
        for operation in plan.operations() {
            self.phases.insert(operation.key().clone(), ObjectPhase::Pending);
        }
    }

    pub fn mark_succeeded(&mut self, key: &ObjectKey, action: Action) {
        match action {
            Action::Delete => {
                self.phases.remove(key);
            }
            Action::Create | Action::Update => {
                self.phases.insert(key.clone(), ObjectPhase::Applied);
            }
        }
    }

    /// Reset to the objects found on the device after a rebuild
    pub fn reset_live<'a>(&mut self, keys: impl IntoIterator<Item = &'a ObjectKey>) {
        self.phases = keys
            .into_iter()
            .map(|k| (k.clone(), ObjectPhase::Applied))
            .collect();
    }

    pub fn count(&self, phase: ObjectPhase) -> usize {
        self.phases.values().filter(|p| **p == phase).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, ObjectPhase)> {
        self.phases.iter().map(|(k, p)| (k, *p))
    }
}
