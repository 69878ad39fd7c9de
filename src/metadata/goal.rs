//! Goal registry (spec §10 supplement 4): maps a named replication/erasure
//! policy id to its concrete chunk layout, consulted by
//! [`crate::metadata::graph::MetadataGraph::write_chunk`] when a chunk needs
//! fresh part targets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::chunk::part::{MAX_XOR_LEVEL, MIN_XOR_LEVEL};
use crate::metadata::inode::GoalId;

/// The concrete layout a goal resolves to (spec GLOSSARY "Goal").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalDefinition {
    /// `n` whole-chunk replicas, `n >= 1`.
    Replica(u8),
    /// An XOR set at the given level (spec §4.1: `2 <= level <= 9`), storing
    /// `level` data pieces plus one parity piece.
    Xor(u8),
}

impl GoalDefinition {
    /// Number of chunkserver-held parts a chunk under this goal occupies.
    pub fn part_count(self) -> u8 {
        match self {
            GoalDefinition::Replica(n) => n,
            GoalDefinition::Xor(level) => level + 1,
        }
    }

    fn is_valid(self) -> bool {
        match self {
            GoalDefinition::Replica(n) => n >= 1,
            GoalDefinition::Xor(level) => (MIN_XOR_LEVEL..=MAX_XOR_LEVEL).contains(&level),
        }
    }
}

/// `GoalId -> GoalDefinition`. Goal `1` (standard single replica) always
/// resolves even if never explicitly registered, matching the inode
/// default in [`crate::metadata::inode::InodeHeader::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalTable {
    goals: HashMap<GoalId, GoalDefinition>,
}

impl Default for GoalTable {
    fn default() -> Self {
        let mut goals = HashMap::new();
        goals.insert(1, GoalDefinition::Replica(1));
        goals.insert(2, GoalDefinition::Replica(2));
        goals.insert(3, GoalDefinition::Replica(3));
        GoalTable { goals }
    }
}

impl GoalTable {
    pub fn define(&mut self, id: GoalId, definition: GoalDefinition) -> bool {
        if !definition.is_valid() {
            return false;
        }
        self.goals.insert(id, definition);
        true
    }

    pub fn resolve(&self, id: GoalId) -> GoalDefinition {
        self.goals.get(&id).copied().unwrap_or(GoalDefinition::Replica(1))
    }
}
