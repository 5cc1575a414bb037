//! The simulator facade: action admission, the per-tick stepper, and
//! snapshot assembly.
//!
//! Lock order, outermost first: the clock mutex (tick + RNG), the patch-store
//! map lock, per-patch locks in ascending coordinate order, then per-agent
//! locks. The stepper clones agent state under brief locks, works on the
//! copies, and writes the results back, so agent locks are never held across
//! patch operations.

use crate::agent::{Action, AgentState, AgentTable};
use crate::coordinator::{Coordinator, Responder};
use crate::field::{GenerationEnv, LogCache, SamplerCache};
use crate::geometry::{Direction, Position};
use crate::patch::{ItemInstance, PatchState, PatchStore};
use crate::perception::{self, PerceptionContext};
use crate::scent;
use crate::{CollisionPolicy, SimulatorConfig, SimulatorError};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Outermost distance (in patch rings) searched for a free spawn cell.
const MAX_SPAWN_RADIUS: i64 = 64;

/// Birth proposals per regenerating item type per fixed patch per tick.
fn regeneration_proposals(config: &SimulatorConfig) -> u32 {
    config.patch_size
}

/// Payload handed to the step listener after every completed tick.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub tick: u64,
    /// Every agent's state as of the tick boundary, ascending by id.
    pub agents: Vec<AgentState>,
}

/// Per-tick event sink. Callbacks run outside the simulator's locks but must
/// not block for long; mutating the simulator synchronously from `on_step`
/// queues work for the next tick rather than recursing into the current one.
pub trait StepListener: Send {
    fn on_step(&mut self, outcome: &StepOutcome);

    /// A step aborted with no side effects; the tick did not advance.
    fn on_step_failed(&mut self, error: &SimulatorError) {
        let _ = error;
    }
}

/// One patch of a map query.
#[derive(Debug, Clone)]
pub struct MapPatch {
    pub position: Position,
    pub fixed: bool,
    pub items: Vec<ItemInstance>,
    /// Stored scent grid, when requested.
    pub scent: Option<Vec<f32>>,
    /// Composited item and agent colors per cell, when requested.
    pub colors: Option<Vec<f32>>,
}

/// Owned copy of the entire simulator state, the unit the snapshot codec
/// serializes.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldSnapshot {
    pub config: SimulatorConfig,
    pub tick: u64,
    pub rng_seed: [u8; 32],
    pub rng_word_pos: u128,
    pub next_agent_id: u64,
    pub next_semaphore_id: u64,
    pub patches: Vec<PatchState>,
    pub agents: Vec<AgentState>,
    pub semaphores: Vec<(u64, bool)>,
    pub reported: Vec<Responder>,
}

/// Tick counter, RNG, and id allocation, guarded together so every draw from
/// the RNG is totally ordered.
struct Clock {
    tick: u64,
    rng: ChaCha8Rng,
    log_cache: LogCache,
    next_agent_id: u64,
    next_semaphore_id: u64,
}

/// The world-generation and stepping core.
pub struct Simulator {
    config: SimulatorConfig,
    cache: SamplerCache,
    clock: Mutex<Clock>,
    patches: PatchStore,
    agents: AgentTable,
    semaphores: Mutex<BTreeMap<u64, bool>>,
    coordinator: Coordinator,
    listener: Mutex<Option<Box<dyn StepListener>>>,
}

impl Simulator {
    /// Build a simulator from a validated configuration.
    pub fn new(config: SimulatorConfig) -> Result<Self, SimulatorError> {
        config.validate()?;
        let cache = SamplerCache::new(&config);
        let rng = ChaCha8Rng::seed_from_u64(config.random_seed);
        let patches = PatchStore::new(config.patch_size, config.scent_dimension);
        Ok(Self {
            config,
            cache,
            clock: Mutex::new(Clock {
                tick: 0,
                rng,
                log_cache: LogCache::new(),
                next_agent_id: 1,
                next_semaphore_id: 1,
            }),
            patches,
            agents: AgentTable::new(),
            semaphores: Mutex::new(BTreeMap::new()),
            coordinator: Coordinator::new(),
            listener: Mutex::new(None),
        })
    }

    /// Register the per-tick event sink.
    pub fn set_listener(&self, listener: Box<dyn StepListener>) {
        *self.lock_listener() = Some(listener);
    }

    #[must_use]
    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.lock_clock().tick
    }

    /// Block until the next step completes.
    pub fn wait_for_step(&self) {
        self.coordinator.wait_for_step();
    }

    // ------------------------------------------------------------------
    // Agent membership

    /// Add an agent on the first free cell around the origin, returning its
    /// initial state (perception included).
    pub fn add_agent(&self) -> Result<AgentState, SimulatorError> {
        let occupied: HashSet<Position> = self
            .agents
            .snapshots()
            .into_iter()
            .map(|agent| agent.position)
            .collect();
        let position = self.find_spawn_cell(&occupied)?;
        self.add_agent_at(position)
    }

    /// Add an agent at an explicit position, generating and fixing the
    /// surrounding patches. Intended for embedding hosts and tests; the RPC
    /// surface always spawns through [`Simulator::add_agent`].
    pub fn add_agent_at(&self, position: Position) -> Result<AgentState, SimulatorError> {
        let id = {
            let mut clock = self.lock_clock();
            let clock = &mut *clock;
            let id = clock.next_agent_id;
            clock.next_agent_id += 1;

            let mut inserted = Vec::new();
            let tick = clock.tick;
            let mut env = GenerationEnv {
                config: &self.config,
                cache: &self.cache,
                log_cache: &mut clock.log_cache,
                rng: &mut clock.rng,
                tick,
                inserted: &mut inserted,
            };
            let (patch_pos, _) = position.to_patch(self.config.patch_size);
            self.patches.ensure_fixed_neighborhood(patch_pos, &mut env)?;

            let mut region = BTreeSet::new();
            for dy in -1..=1 {
                for dx in -1..=1 {
                    region.insert(patch_pos + Position::new(dx, dy));
                }
            }
            scent::catch_up_region(&self.patches, &region, tick, &self.config);
            id
        };

        let mut state = AgentState::new(
            id,
            position,
            self.config.scent_dimension,
            self.config.vision_len(),
            self.config.item_type_count(),
        );
        let mut agent_positions: Vec<Position> = self
            .agents
            .snapshots()
            .into_iter()
            .map(|agent| agent.position)
            .collect();
        agent_positions.push(position);
        let ctx = PerceptionContext {
            config: &self.config,
            store: &self.patches,
            agent_positions: &agent_positions,
        };
        let (scent, vision) = perception::perceive(&ctx, position, state.direction);
        state.scent = scent;
        state.vision = vision;

        self.agents.insert(state.clone());
        self.coordinator.add(Responder::Agent(id));
        debug!(agent_id = id, %position, "agent added");
        Ok(state)
    }

    /// Remove an agent. Dropping its tick obligation can complete the tick.
    pub fn remove_agent(&self, id: u64) -> Result<(), SimulatorError> {
        self.agents.remove(id)?;
        self.coordinator.remove(Responder::Agent(id));
        debug!(agent_id = id, "agent removed");
        self.drive_steps();
        Ok(())
    }

    /// Toggle an agent's participation in the tick quorum.
    pub fn set_active(&self, id: u64, active: bool) -> Result<(), SimulatorError> {
        self.agents.with_agent(id, |agent| agent.active = active)?;
        if active {
            self.coordinator.add(Responder::Agent(id));
        } else {
            self.coordinator.exclude(Responder::Agent(id));
            self.drive_steps();
        }
        Ok(())
    }

    pub fn is_active(&self, id: u64) -> Result<bool, SimulatorError> {
        self.agents.with_agent(id, |agent| agent.active)
    }

    /// All agent ids, ascending.
    #[must_use]
    pub fn agent_ids(&self) -> Vec<u64> {
        self.agents.ids()
    }

    /// Current state of one agent.
    pub fn agent_state(&self, id: u64) -> Result<AgentState, SimulatorError> {
        self.agents.with_agent(id, |agent| agent.clone())
    }

    /// States for a list of ids; unknown ids yield `None`.
    #[must_use]
    pub fn agent_states(&self, ids: &[u64]) -> Vec<Option<AgentState>> {
        ids.iter()
            .map(|&id| self.agents.with_agent(id, |agent| agent.clone()).ok())
            .collect()
    }

    // ------------------------------------------------------------------
    // Actions

    /// Queue a facing-relative move for this tick.
    pub fn move_agent(
        &self,
        id: u64,
        direction: Direction,
        steps: u32,
    ) -> Result<(), SimulatorError> {
        if steps == 0 || steps > self.config.max_steps_per_movement {
            return Err(SimulatorError::OutOfRange(
                "step count exceeds max_steps_per_movement",
            ));
        }
        if !self.config.allowed_movement_directions[direction.index()] {
            return Err(SimulatorError::OutOfRange(
                "movement direction is not allowed",
            ));
        }
        self.queue_action(id, Action::Move { direction, steps })
    }

    /// Queue a facing-relative turn for this tick.
    pub fn turn_agent(&self, id: u64, direction: Direction) -> Result<(), SimulatorError> {
        if !self.config.allowed_turn_directions[direction.index()] {
            return Err(SimulatorError::OutOfRange("turn direction is not allowed"));
        }
        self.queue_action(id, Action::Turn { direction })
    }

    /// Queue an explicit no-op for this tick.
    pub fn no_op(&self, id: u64) -> Result<(), SimulatorError> {
        if !self.config.no_op_allowed {
            return Err(SimulatorError::OutOfRange("no-op is not allowed"));
        }
        self.queue_action(id, Action::NoOp)
    }

    /// Release an agent's tick obligation on behalf of a disconnected
    /// client: counts as a no-op regardless of policy, and is idempotent.
    pub fn relinquish(&self, id: u64) -> Result<(), SimulatorError> {
        let queued = self.agents.with_agent(id, |agent| {
            if agent.requested_action.is_queued() {
                true
            } else {
                agent.requested_action = Action::NoOp;
                false
            }
        })?;
        if !queued {
            self.coordinator.report(Responder::Agent(id));
            self.drive_steps();
        }
        Ok(())
    }

    fn queue_action(&self, id: u64, action: Action) -> Result<(), SimulatorError> {
        self.agents.with_agent(id, |agent| {
            if agent.requested_action.is_queued() {
                Err(SimulatorError::ActionAlreadyQueued(id))
            } else {
                agent.requested_action = action;
                Ok(())
            }
        })??;
        self.coordinator.report(Responder::Agent(id));
        self.drive_steps();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Semaphores

    /// Create a semaphore; the tick now waits for it as well.
    #[must_use]
    pub fn add_semaphore(&self) -> u64 {
        let id = {
            let mut clock = self.lock_clock();
            let id = clock.next_semaphore_id;
            clock.next_semaphore_id += 1;
            id
        };
        self.lock_semaphores().insert(id, false);
        self.coordinator.add(Responder::Semaphore(id));
        id
    }

    pub fn remove_semaphore(&self, id: u64) -> Result<(), SimulatorError> {
        if self.lock_semaphores().remove(&id).is_none() {
            return Err(SimulatorError::InvalidSemaphoreId(id));
        }
        self.coordinator.remove(Responder::Semaphore(id));
        self.drive_steps();
        Ok(())
    }

    /// Raise a semaphore's signal. The flag persists across tick boundaries
    /// until explicitly lowered; signaling an already-signaled semaphore is
    /// permitted and re-evaluates quorum.
    pub fn signal_semaphore(&self, id: u64) -> Result<(), SimulatorError> {
        match self.lock_semaphores().get_mut(&id) {
            Some(signaled) => *signaled = true,
            None => return Err(SimulatorError::InvalidSemaphoreId(id)),
        }
        self.coordinator.report(Responder::Semaphore(id));
        self.drive_steps();
        Ok(())
    }

    /// Lower a semaphore's signal; future ticks wait for it again.
    pub fn unsignal_semaphore(&self, id: u64) -> Result<(), SimulatorError> {
        match self.lock_semaphores().get_mut(&id) {
            Some(signaled) => *signaled = false,
            None => return Err(SimulatorError::InvalidSemaphoreId(id)),
        }
        self.coordinator.retract(Responder::Semaphore(id));
        Ok(())
    }

    /// Every semaphore with its signaled flag, ascending by id.
    #[must_use]
    pub fn get_semaphores(&self) -> Vec<(u64, bool)> {
        self.lock_semaphores()
            .iter()
            .map(|(&id, &signaled)| (id, signaled))
            .collect()
    }

    // ------------------------------------------------------------------
    // Map queries

    /// Patch states for the rectangle of patches overlapping
    /// `[bottom_left, top_right]` in world cells. Missing patches are
    /// materialized (but not fixed) first.
    pub fn get_map(
        &self,
        bottom_left: Position,
        top_right: Position,
        want_scent: bool,
        want_vision: bool,
    ) -> Result<Vec<MapPatch>, SimulatorError> {
        if bottom_left.x > top_right.x || bottom_left.y > top_right.y {
            return Err(SimulatorError::OutOfRange(
                "map rectangle corners are reversed",
            ));
        }
        let (min_patch, _) = bottom_left.to_patch(self.config.patch_size);
        let (max_patch, _) = top_right.to_patch(self.config.patch_size);

        {
            let mut clock = self.lock_clock();
            let clock = &mut *clock;
            let mut inserted = Vec::new();
            let tick = clock.tick;
            let mut env = GenerationEnv {
                config: &self.config,
                cache: &self.cache,
                log_cache: &mut clock.log_cache,
                rng: &mut clock.rng,
                tick,
                inserted: &mut inserted,
            };
            for py in min_patch.y..=max_patch.y {
                for px in min_patch.x..=max_patch.x {
                    self.patches
                        .get_or_generate(Position::new(px, py), false, &mut env)?;
                }
            }
        }

        let agent_positions: Vec<Position> = self
            .agents
            .snapshots()
            .into_iter()
            .map(|agent| agent.position)
            .collect();

        let mut out = Vec::new();
        for py in min_patch.y..=max_patch.y {
            for px in min_patch.x..=max_patch.x {
                let pos = Position::new(px, py);
                let Some(state) = self.patches.with_patch(pos, |patch| patch.state()) else {
                    continue;
                };
                let colors = want_vision.then(|| self.compose_colors(&state, &agent_positions));
                out.push(MapPatch {
                    position: state.position,
                    fixed: state.fixed,
                    items: state.items,
                    scent: want_scent.then_some(state.scent),
                    colors,
                });
            }
        }
        Ok(out)
    }

    /// Per-cell color composition for a map patch: item colors plus the
    /// agent color for every agent standing in the patch.
    fn compose_colors(&self, state: &PatchState, agent_positions: &[Position]) -> Vec<f32> {
        let n = self.config.patch_size;
        let dim = self.config.color_dimension;
        let mut colors = vec![0.0f32; (n as usize).pow(2) * dim];
        let origin = state.position.patch_origin(n);
        let mut paint = |location: Position, values: &[f32]| {
            let offset = location - origin;
            let base = ((offset.y as usize) * n as usize + offset.x as usize) * dim;
            for (slot, value) in colors[base..base + dim].iter_mut().zip(values) {
                *slot += value;
            }
        };
        for item in state.items.iter().filter(|item| item.is_alive()) {
            paint(
                item.location,
                &self.config.item_types[item.item_type as usize].color,
            );
        }
        for agent_pos in agent_positions {
            let (patch_pos, _) = agent_pos.to_patch(n);
            if patch_pos == state.position {
                paint(*agent_pos, &self.config.agent_color);
            }
        }
        colors
    }

    // ------------------------------------------------------------------
    // Stepping

    /// Run as many steps as completed quorums allow. At most one thread
    /// executes a step at a time; everyone else returns immediately.
    fn drive_steps(&self) {
        while self.coordinator.try_begin_step() {
            match self.run_step() {
                Ok(outcome) => {
                    if let Some(listener) = self.lock_listener().as_mut() {
                        listener.on_step(&outcome);
                    }
                }
                Err(error) => {
                    warn!(%error, "step aborted with no side effects");
                    if let Some(listener) = self.lock_listener().as_mut() {
                        listener.on_step_failed(&error);
                    }
                }
            }
            let retained: Vec<Responder> = self
                .lock_semaphores()
                .iter()
                .filter(|(_, &signaled)| signaled)
                .map(|(&id, _)| Responder::Semaphore(id))
                .collect();
            self.coordinator.finish_step(retained);
        }
    }

    /// Execute one tick. On error every patch insertion is rolled back, the
    /// RNG is rewound, and the tick does not advance.
    fn run_step(&self) -> Result<StepOutcome, SimulatorError> {
        let mut clock = self.lock_clock();
        let clock = &mut *clock;
        let next_tick = clock.tick + 1;
        let rng_checkpoint = clock.rng.clone();
        let mut inserted: Vec<Position> = Vec::new();

        match self.step_stages(clock, next_tick, &mut inserted) {
            Ok(outcome) => {
                clock.tick = next_tick;
                Ok(outcome)
            }
            Err(error) => {
                self.patches.remove_all(&inserted);
                clock.rng = rng_checkpoint;
                Err(error)
            }
        }
    }

    fn step_stages(
        &self,
        clock: &mut Clock,
        next_tick: u64,
        inserted: &mut Vec<Position>,
    ) -> Result<StepOutcome, SimulatorError> {
        let config = &self.config;
        let handles = self.agents.all_handles();
        let mut working: Vec<AgentState> = handles
            .iter()
            .map(|arc| crate::agent::lock_agent(arc).clone())
            .collect();
        let claimed_actions: Vec<Action> = working
            .iter()
            .map(|agent| agent.requested_action)
            .collect();

        // Resolve queued moves into target cells, truncating at blocking
        // items along the path.
        let mut movers: Vec<(usize, Position)> = Vec::new();
        for (index, agent) in working.iter().enumerate() {
            if let Action::Move { direction, steps } = agent.requested_action {
                let world_direction = direction.relative_to(agent.direction);
                let target = self.walk(agent.position, world_direction, steps);
                if target != agent.position {
                    movers.push((index, target));
                }
            }
        }

        // Movement conflict resolution.
        let resolved = self.resolve_conflicts(&working, movers, &mut clock.rng);

        // Apply turns and resolved moves to the working copies.
        let mut moved: Vec<usize> = Vec::new();
        for (index, target) in &resolved {
            working[*index].position = *target;
            moved.push(*index);
        }
        for agent in working.iter_mut() {
            if let Action::Turn { direction } = agent.requested_action {
                agent.direction = direction.relative_to(agent.direction);
            }
        }

        // Materialize and fix the neighborhood of every agent position.
        {
            let mut env = GenerationEnv {
                config,
                cache: &self.cache,
                log_cache: &mut clock.log_cache,
                rng: &mut clock.rng,
                tick: next_tick,
                inserted: &mut *inserted,
            };
            for agent in &working {
                let (patch_pos, _) = agent.position.to_patch(config.patch_size);
                self.patches.ensure_fixed_neighborhood(patch_pos, &mut env)?;
            }
        }

        // Item pickup for agents that changed cells.
        for &index in &moved {
            self.try_pickup(&mut working[index], next_tick);
        }

        // Expire items whose lifetime ran out.
        self.expire_items(next_tick);

        // Item regeneration over fixed patches.
        self.regenerate_items(clock, next_tick, inserted)?;

        // Scent catch-up for every patch near an agent.
        let mut region: BTreeSet<Position> = BTreeSet::new();
        for agent in &working {
            let (patch_pos, _) = agent.position.to_patch(config.patch_size);
            for dy in -1..=1 {
                for dx in -1..=1 {
                    region.insert(patch_pos + Position::new(dx, dy));
                }
            }
        }
        scent::catch_up_region(&self.patches, &region, next_tick, config);

        // Ghosts that no longer contribute scent can go now.
        for (_, arc) in self.patches.all_handles() {
            let mut patch = crate::patch::lock_patch(&arc);
            patch.prune_ghosts(next_tick, config.removed_item_lifetime);
        }

        // Perception for every agent, fanned out read-only.
        let agent_positions: Vec<Position> =
            working.iter().map(|agent| agent.position).collect();
        let ctx = PerceptionContext {
            config,
            store: &self.patches,
            agent_positions: &agent_positions,
        };
        let senses: Vec<(Vec<f32>, Vec<f32>)> = working
            .par_iter()
            .map(|agent| perception::perceive(&ctx, agent.position, agent.direction))
            .collect();
        for (agent, (scent, vision)) in working.iter_mut().zip(senses) {
            agent.scent = scent;
            agent.vision = vision;
            agent.requested_action = Action::None;
        }

        // Publish the results back into the agent table. An action queued
        // for the next tick while this step ran is preserved.
        for ((arc, state), claimed) in handles.iter().zip(&working).zip(&claimed_actions) {
            let mut guard = crate::agent::lock_agent(arc);
            let pending = guard.requested_action;
            *guard = state.clone();
            if pending.is_queued() && pending != *claimed {
                guard.requested_action = pending;
            }
        }

        debug!(tick = next_tick, agents = working.len(), "step complete");
        Ok(StepOutcome {
            tick: next_tick,
            agents: working,
        })
    }

    /// Walk up to `steps` cells, stopping before the first blocking item.
    fn walk(&self, from: Position, direction: Direction, steps: u32) -> Position {
        let offset = direction.offset();
        let mut current = from;
        for _ in 0..steps {
            let candidate = current + offset;
            if self.is_blocked(candidate) {
                break;
            }
            current = candidate;
        }
        current
    }

    /// Whether a cell holds an alive blocking item. Cells in patches that
    /// have not materialized yet are free.
    fn is_blocked(&self, cell: Position) -> bool {
        let (patch_pos, _) = cell.to_patch(self.config.patch_size);
        self.patches
            .with_patch(patch_pos, |patch| {
                patch.alive_item_at(cell).is_some_and(|item| {
                    self.config.item_types[item.item_type as usize].blocks_movement
                })
            })
            .unwrap_or(false)
    }

    /// Apply the collision policy to the proposed moves. Losers keep their
    /// original position and their tick is still consumed.
    fn resolve_conflicts(
        &self,
        working: &[AgentState],
        mut movers: Vec<(usize, Position)>,
        rng: &mut ChaCha8Rng,
    ) -> Vec<(usize, Position)> {
        match self.config.collision_policy {
            CollisionPolicy::NoCollisions => movers,
            policy => {
                if policy == CollisionPolicy::Random {
                    movers.shuffle(rng);
                }
                // FirstComeFirstServe keeps ascending-id order, which is how
                // the movers were gathered.
                let moving: HashSet<usize> = movers.iter().map(|(index, _)| *index).collect();
                let mut occupied: HashSet<Position> = working
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| !moving.contains(index))
                    .map(|(_, agent)| agent.position)
                    .collect();
                let mut resolved = Vec::with_capacity(movers.len());
                for (index, target) in movers {
                    if occupied.contains(&target) {
                        occupied.insert(working[index].position);
                    } else {
                        occupied.insert(target);
                        resolved.push((index, target));
                    }
                }
                resolved
            }
        }
    }

    /// Auto-collect the item under a freshly moved agent when its inventory
    /// satisfies the type's requirements.
    fn try_pickup(&self, agent: &mut AgentState, next_tick: u64) {
        let (patch_pos, _) = agent.position.to_patch(self.config.patch_size);
        let config = &self.config;
        let position = agent.position;
        let collected = &mut agent.collected_items;
        self.patches.with_patch_mut(patch_pos, |patch| {
            let Some(slot) = patch
                .items_mut()
                .iter_mut()
                .find(|item| item.is_alive() && item.location == position)
            else {
                return;
            };
            let item_type = slot.item_type as usize;
            let props = &config.item_types[item_type];
            let affordable = collected
                .iter()
                .zip(&props.required_item_counts)
                .all(|(have, need)| have >= need)
                && collected
                    .iter()
                    .zip(&props.required_item_costs)
                    .all(|(have, cost)| have >= cost);
            if !affordable {
                return;
            }
            slot.deletion_tick = next_tick;
            for (have, cost) in collected.iter_mut().zip(&props.required_item_costs) {
                *have -= cost;
            }
            collected[item_type] += 1;
        });
    }

    /// Turn items whose configured lifetime has elapsed into ghosts.
    fn expire_items(&self, next_tick: u64) {
        if self
            .config
            .item_types
            .iter()
            .all(|item_type| item_type.lifetime == 0)
        {
            return;
        }
        for (_, arc) in self.patches.all_handles() {
            let mut patch = crate::patch::lock_patch(&arc);
            for item in patch.items_mut() {
                if !item.is_alive() {
                    continue;
                }
                let lifetime = self.config.item_types[item.item_type as usize].lifetime;
                if lifetime > 0 && next_tick.saturating_sub(item.creation_tick) >= lifetime {
                    item.deletion_tick = next_tick;
                }
            }
        }
    }

    /// Short birth-only sampler passes over fixed patches for every item
    /// type with a non-zero regeneration function.
    fn regenerate_items(
        &self,
        clock: &mut Clock,
        next_tick: u64,
        inserted: &mut Vec<Position>,
    ) -> Result<(), SimulatorError> {
        let regenerating: Vec<usize> = self
            .config
            .item_types
            .iter()
            .enumerate()
            .filter(|(_, item_type)| !item_type.regeneration.is_zero())
            .map(|(index, _)| index)
            .collect();
        if regenerating.is_empty() {
            return Ok(());
        }

        let proposals = regeneration_proposals(&self.config);
        let fixed: Vec<Position> = self
            .patches
            .all_handles()
            .into_iter()
            .filter(|(_, arc)| crate::patch::lock_patch(arc).is_fixed())
            .map(|(pos, _)| pos)
            .collect();

        for patch_pos in fixed {
            let origin = patch_pos.patch_origin(self.config.patch_size);
            let mut coords = Vec::new();
            for dy in -1..=1 {
                for dx in -1..=1 {
                    coords.push(patch_pos + Position::new(dx, dy));
                }
            }
            let handles = self.patches.handles_for(coords);
            let Ok(target) = handles.binary_search_by_key(&patch_pos, |(pos, _)| *pos) else {
                continue;
            };
            let neighbors: Vec<usize> = (0..handles.len()).collect();
            let mut guards: Vec<MutexGuard<'_, crate::patch::Patch>> = handles
                .iter()
                .map(|(_, arc)| crate::patch::lock_patch(arc))
                .collect();

            for &item_type in &regenerating {
                let rate = self.config.item_types[item_type]
                    .regeneration
                    .evaluate(origin, next_tick);
                if rate <= 0.0 {
                    continue;
                }
                let mut env = GenerationEnv {
                    config: &self.config,
                    cache: &self.cache,
                    log_cache: &mut clock.log_cache,
                    rng: &mut clock.rng,
                    tick: next_tick,
                    inserted: &mut *inserted,
                };
                crate::field::regeneration_pass(
                    &mut guards,
                    target,
                    &neighbors,
                    item_type,
                    rate,
                    self.config.patch_size,
                    proposals,
                    &mut env,
                );
            }
        }
        Ok(())
    }

    /// Deterministic spiral search for the first unoccupied, item-free cell
    /// around the origin.
    fn find_spawn_cell(&self, occupied: &HashSet<Position>) -> Result<Position, SimulatorError> {
        let n = i64::from(self.config.patch_size);
        for radius in 0..=MAX_SPAWN_RADIUS {
            let mut patch_coords: Vec<Position> = Vec::new();
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    if dx.abs().max(dy.abs()) == radius {
                        patch_coords.push(Position::new(dx, dy));
                    }
                }
            }
            patch_coords.sort();
            for patch_pos in patch_coords {
                {
                    let mut clock = self.lock_clock();
                    let clock = &mut *clock;
                    let mut inserted = Vec::new();
                    let tick = clock.tick;
                    let mut env = GenerationEnv {
                        config: &self.config,
                        cache: &self.cache,
                        log_cache: &mut clock.log_cache,
                        rng: &mut clock.rng,
                        tick,
                        inserted: &mut inserted,
                    };
                    self.patches.get_or_generate(patch_pos, false, &mut env)?;
                }
                let origin = patch_pos.patch_origin(self.config.patch_size);
                let found = self.patches.with_patch(patch_pos, |patch| {
                    for y in 0..n {
                        for x in 0..n {
                            let cell = origin + Position::new(x, y);
                            if occupied.contains(&cell) {
                                continue;
                            }
                            if patch.alive_item_at(cell).is_none() {
                                return Some(cell);
                            }
                        }
                    }
                    None
                });
                if let Some(Some(cell)) = found {
                    return Ok(cell);
                }
            }
        }
        Err(SimulatorError::OutOfRange(
            "no free spawn cell within the search radius",
        ))
    }

    // ------------------------------------------------------------------
    // Snapshots

    /// Assemble an owned copy of the entire world state.
    #[must_use]
    pub fn snapshot(&self) -> WorldSnapshot {
        let clock = self.lock_clock();
        let patches = self
            .patches
            .all_handles()
            .into_iter()
            .map(|(_, arc)| crate::patch::lock_patch(&arc).state())
            .collect();
        WorldSnapshot {
            config: self.config.clone(),
            tick: clock.tick,
            rng_seed: clock.rng.get_seed(),
            rng_word_pos: clock.rng.get_word_pos(),
            next_agent_id: clock.next_agent_id,
            next_semaphore_id: clock.next_semaphore_id,
            patches,
            agents: self.agents.snapshots(),
            semaphores: self.get_semaphores(),
            reported: self.coordinator.reported_set(),
        }
    }

    /// Rebuild a simulator from a snapshot.
    pub fn from_snapshot(snapshot: WorldSnapshot) -> Result<Self, SimulatorError> {
        snapshot.config.validate()?;
        let cache = SamplerCache::new(&snapshot.config);
        let mut rng = ChaCha8Rng::from_seed(snapshot.rng_seed);
        rng.set_word_pos(snapshot.rng_word_pos);
        let patches = PatchStore::new(
            snapshot.config.patch_size,
            snapshot.config.scent_dimension,
        );
        for state in snapshot.patches {
            patches.insert_restored(state)?;
        }

        let agents = AgentTable::new();
        let coordinator = Coordinator::new();
        let mut expected = Vec::new();
        for agent in snapshot.agents {
            if agent.active {
                expected.push(Responder::Agent(agent.id));
            }
            agents.insert(agent);
        }
        let mut semaphores = BTreeMap::new();
        for (id, signaled) in snapshot.semaphores {
            expected.push(Responder::Semaphore(id));
            semaphores.insert(id, signaled);
        }
        coordinator.restore(expected, snapshot.reported);

        Ok(Self {
            config: snapshot.config,
            cache,
            clock: Mutex::new(Clock {
                tick: snapshot.tick,
                rng,
                log_cache: LogCache::new(),
                next_agent_id: snapshot.next_agent_id,
                next_semaphore_id: snapshot.next_semaphore_id,
            }),
            patches,
            agents,
            semaphores: Mutex::new(semaphores),
            coordinator,
            listener: Mutex::new(None),
        })
    }

    fn lock_clock(&self) -> MutexGuard<'_, Clock> {
        self.clock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_semaphores(&self) -> MutexGuard<'_, BTreeMap<u64, bool>> {
        self.semaphores.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<Box<dyn StepListener>>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner())
    }
}
