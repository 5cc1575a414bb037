//! Agent state and the agent table. Each agent sits behind its own mutex;
//! the table itself only guards membership.

use crate::geometry::{Direction, Position};
use crate::SimulatorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// An action requested for the current tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Action {
    /// No action queued yet.
    #[default]
    None,
    /// Walk `steps` cells in a facing-relative direction.
    Move { direction: Direction, steps: u32 },
    /// Rotate the facing by a relative direction.
    Turn { direction: Direction },
    /// Explicitly give up the tick.
    NoOp,
}

impl Action {
    /// Whether an action is queued.
    #[must_use]
    pub const fn is_queued(&self) -> bool {
        !matches!(self, Action::None)
    }
}

/// Full mutable state of one agent.
///
/// While `requested_action` is queued it cannot be replaced until the tick it
/// was issued for completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    pub id: u64,
    pub position: Position,
    pub direction: Direction,
    /// Scent sampled at the agent's cell, length `scent_dimension`.
    pub scent: Vec<f32>,
    /// Agent-frame vision buffer, length `(2V+1)^2 * color_dimension`.
    pub vision: Vec<f32>,
    /// Items collected so far, indexed by item type.
    pub collected_items: Vec<u32>,
    pub requested_action: Action,
    /// Inactive agents are excluded from the tick quorum.
    pub active: bool,
}

impl AgentState {
    /// A freshly placed agent facing up with empty senses.
    #[must_use]
    pub fn new(
        id: u64,
        position: Position,
        scent_dimension: usize,
        vision_len: usize,
        item_type_count: usize,
    ) -> Self {
        Self {
            id,
            position,
            direction: Direction::Up,
            scent: vec![0.0; scent_dimension],
            vision: vec![0.0; vision_len],
            collected_items: vec![0; item_type_count],
            requested_action: Action::None,
            active: true,
        }
    }
}

/// Owner of all agents, keyed by their sequentially assigned ids.
#[derive(Default)]
pub struct AgentTable {
    agents: RwLock<BTreeMap<u64, Arc<Mutex<AgentState>>>>,
}

impl AgentTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    /// All agent ids, ascending.
    #[must_use]
    pub fn ids(&self) -> Vec<u64> {
        self.read_map().keys().copied().collect()
    }

    /// Insert an agent under its own id.
    pub fn insert(&self, state: AgentState) {
        self.write_map()
            .insert(state.id, Arc::new(Mutex::new(state)));
    }

    /// Remove an agent, returning its final state.
    pub fn remove(&self, id: u64) -> Result<AgentState, SimulatorError> {
        let arc = self
            .write_map()
            .remove(&id)
            .ok_or(SimulatorError::InvalidAgentId(id))?;
        let state = lock_agent(&arc).clone();
        Ok(state)
    }

    /// Clone the handle for one agent.
    #[must_use]
    pub fn handle(&self, id: u64) -> Option<Arc<Mutex<AgentState>>> {
        self.read_map().get(&id).map(Arc::clone)
    }

    /// Clone handles for every agent, ascending by id.
    #[must_use]
    pub fn all_handles(&self) -> Vec<Arc<Mutex<AgentState>>> {
        self.read_map().values().map(Arc::clone).collect()
    }

    /// Run `f` against one agent's locked state.
    pub fn with_agent<R>(
        &self,
        id: u64,
        f: impl FnOnce(&mut AgentState) -> R,
    ) -> Result<R, SimulatorError> {
        let arc = self
            .handle(id)
            .ok_or(SimulatorError::InvalidAgentId(id))?;
        let mut guard = lock_agent(&arc);
        Ok(f(&mut guard))
    }

    /// Clone every agent's state, ascending by id.
    #[must_use]
    pub fn snapshots(&self) -> Vec<AgentState> {
        self.all_handles()
            .iter()
            .map(|arc| lock_agent(arc).clone())
            .collect()
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<u64, Arc<Mutex<AgentState>>>> {
        self.agents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<u64, Arc<Mutex<AgentState>>>> {
        self.agents.write().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) fn lock_agent(arc: &Arc<Mutex<AgentState>>) -> MutexGuard<'_, AgentState> {
    arc.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agent(id: u64) -> AgentState {
        AgentState::new(id, Position::new(0, 0), 2, 9 * 2, 1)
    }

    #[test]
    fn insert_and_remove_round_trip() {
        let table = AgentTable::new();
        table.insert(sample_agent(1));
        table.insert(sample_agent(2));
        assert_eq!(table.ids(), vec![1, 2]);

        let removed = table.remove(1).expect("removed");
        assert_eq!(removed.id, 1);
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.remove(1),
            Err(SimulatorError::InvalidAgentId(1))
        );
    }

    #[test]
    fn with_agent_surfaces_unknown_ids() {
        let table = AgentTable::new();
        table.insert(sample_agent(4));
        let direction = table
            .with_agent(4, |agent| {
                agent.direction = Direction::Left;
                agent.direction
            })
            .expect("agent");
        assert_eq!(direction, Direction::Left);
        assert_eq!(
            table.with_agent(9, |_| ()),
            Err(SimulatorError::InvalidAgentId(9))
        );
    }

    #[test]
    fn queued_actions_are_flagged() {
        assert!(!Action::None.is_queued());
        assert!(Action::NoOp.is_queued());
        assert!(Action::Turn {
            direction: Direction::Left
        }
        .is_queued());
    }
}
