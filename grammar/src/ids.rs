use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NTermId(usize);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RuleId(usize);

/// index into a tree's flat arrays, only valid within one tree value
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(usize);

impl NTermId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn id(self) -> usize {
        self.0
    }
}

impl RuleId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn id(self) -> usize {
        self.0
    }
}

impl NodeId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn id(self) -> usize {
        self.0
    }
}

impl fmt::Display for NTermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
