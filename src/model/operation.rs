use std::fmt;

use serde::{Deserialize, Serialize};

use super::objects::{ObjectBody, ObjectKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change to a declarative object on the traffic manager
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Operation {
    Create { key: ObjectKey, body: ObjectBody },
    Update { key: ObjectKey, body: ObjectBody },
    Delete { key: ObjectKey },
}

impl Operation {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Operation::Create { key, .. }
            | Operation::Update { key, .. }
            | Operation::Delete { key } => key,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Operation::Create { .. } => Action::Create,
            Operation::Update { .. } => Action::Update,
            Operation::Delete { .. } => Action::Delete,
        }
    }

    /// Desired body; `None` for deletes
    pub fn body(&self) -> Option<&ObjectBody> {
        match self {
            Operation::Create { body, .. } | Operation::Update { body, .. } => Some(body),
            Operation::Delete { .. } => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action(), self.key())
    }
}
