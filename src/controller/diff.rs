//! Desired state vs applied record
//!
//! Produces a phased [`OperationPlan`]. Creates and updates run first, one
//! phase per dependency rank from monitors up to virtual servers; deletes
//! follow in reverse rank order. Phases are separated by barriers, operations
//! within a phase are independent.

use std::collections::BTreeMap;
use std::fmt;

use crate::model::{DesiredConfig, ObjectKind, Operation};
use crate::store::AppliedState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Creates and updates of one rank
    Apply(u8),
    /// Deletes of one rank
    Remove(u8),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Apply(rank) => write!(f, "apply[{rank}]"),
            Stage::Remove(rank) => write!(f, "remove[{rank}]"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phase {
    pub stage: Stage,
    pub operations: Vec<Operation>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperationPlan {
    phases: Vec<Phase>,
}

impl OperationPlan {
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.phases.iter().flat_map(|p| p.operations.iter())
    }

    pub fn len(&self) -> usize {
        self.phases.iter().map(|p| p.operations.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

/// Compare desired objects against the applied record.
///
/// Bodies are compared structurally; device-assigned fields are never part
/// of a body so they cannot cause spurious updates.
pub fn compute_plan(desired: &DesiredConfig, applied: &AppliedState) -> OperationPlan {
    let mut upserts: BTreeMap<u8, Vec<Operation>> = BTreeMap::new();
    let mut deletes: BTreeMap<u8, Vec<Operation>> = BTreeMap::new();

    for (key, body) in desired {
        let operation = match applied.get(key) {
            None => Operation::Create {
                key: key.clone(),
                body: body.clone(),
            },
            Some(record) if record.body != *body => Operation::Update {
                key: key.clone(),
                body: body.clone(),
            },
            Some(_) => continue,
        };
        upserts.entry(key.kind.rank()).or_default().push(operation);
    }

    for key in applied.keys().filter(|k| !desired.contains_key(*k)) {
        deletes
            .entry(key.kind.rank())
            .or_default()
            .push(Operation::Delete { key: key.clone() });
    }

    let mut phases = Vec::new();
    for (rank, mut operations) in upserts {
        operations.sort_by(|a, b| a.key().cmp(b.key()));
        phases.push(Phase {
            stage: Stage::Apply(rank),
            operations,
        });
    }
    for (rank, mut operations) in deletes.into_iter().rev() {
        operations.sort_by(|a, b| a.key().cmp(b.key()));
        phases.push(Phase {
            stage: Stage::Remove(rank),
            operations,
        });
    }

    OperationPlan { phases }
}

/// Number of planned operations per kind, for logging
pub fn summarize(plan: &OperationPlan) -> BTreeMap<ObjectKind, usize> {
    let mut counts = BTreeMap::new();
    for operation in plan.operations() {
        *counts.entry(operation.key().kind).or_insert(0) += 1;
    }
    counts
}
