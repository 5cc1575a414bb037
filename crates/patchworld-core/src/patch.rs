//! Patches and the patch store: lazy, idempotent materialization of the
//! infinite grid in `n x n` blocks, with per-patch locking.

use crate::field::{self, GenerationEnv};
use crate::geometry::Position;
use crate::SimulatorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// A single placed item, alive or ghost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemInstance {
    /// Index into the configured item catalog.
    pub item_type: u32,
    /// World position of the item's cell.
    pub location: Position,
    pub creation_tick: u64,
    /// 0 while the item is alive; otherwise the tick it was removed. Removed
    /// items are retained as ghosts so their scent can decay out.
    pub deletion_tick: u64,
}

impl ItemInstance {
    /// Whether the item still occupies its cell.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        self.deletion_tick == 0
    }
}

/// One `n x n` subgrid of the world: the unit of generation and scent
/// bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Patch {
    position: Position,
    /// Once fixed, the field sampler may no longer resample this patch; items
    /// change only through the stepper.
    fixed: bool,
    items: Vec<ItemInstance>,
    /// Flattened `n * n * scent_dimension` grid, cell-major.
    scent: Vec<f32>,
    last_scent_update: u64,
}

impl Patch {
    /// Create an empty, unfixed patch with a zeroed scent grid.
    #[must_use]
    pub fn empty(position: Position, patch_size: u32, scent_dimension: usize, tick: u64) -> Self {
        let cells = (patch_size as usize) * (patch_size as usize);
        Self {
            position,
            fixed: false,
            items: Vec::new(),
            scent: vec![0.0; cells * scent_dimension],
            last_scent_update: tick,
        }
    }

    /// Patch coordinate (in patch units).
    #[must_use]
    pub const fn position(&self) -> Position {
        self.position
    }

    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn set_fixed(&mut self) {
        self.fixed = true;
    }

    /// All stored instances, ghosts included.
    #[must_use]
    pub fn items(&self) -> &[ItemInstance] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut Vec<ItemInstance> {
        &mut self.items
    }

    /// Iterate over instances that still occupy their cell.
    pub fn alive_items(&self) -> impl Iterator<Item = &ItemInstance> {
        self.items.iter().filter(|item| item.is_alive())
    }

    /// Number of alive instances.
    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.alive_items().count()
    }

    /// The alive instance at a world position, if any. At most one item can
    /// occupy a cell.
    #[must_use]
    pub fn alive_item_at(&self, location: Position) -> Option<&ItemInstance> {
        self.alive_items().find(|item| item.location == location)
    }

    /// Flat offset of a cell's scent vector.
    #[must_use]
    pub fn scent_offset(&self, cell: (u32, u32), patch_size: u32, scent_dimension: usize) -> usize {
        ((cell.1 as usize) * (patch_size as usize) + cell.0 as usize) * scent_dimension
    }

    /// Scent vector of one cell.
    #[must_use]
    pub fn scent_at(
        &self,
        cell: (u32, u32),
        patch_size: u32,
        scent_dimension: usize,
    ) -> &[f32] {
        let offset = self.scent_offset(cell, patch_size, scent_dimension);
        &self.scent[offset..offset + scent_dimension]
    }

    /// The whole flattened scent grid.
    #[must_use]
    pub fn scent(&self) -> &[f32] {
        &self.scent
    }

    pub fn scent_mut(&mut self) -> &mut [f32] {
        &mut self.scent
    }

    /// Replace the scent grid wholesale (diffusion writes a fresh buffer).
    pub fn set_scent(&mut self, scent: Vec<f32>) {
        debug_assert_eq!(scent.len(), self.scent.len());
        self.scent = scent;
    }

    #[must_use]
    pub const fn last_scent_update(&self) -> u64 {
        self.last_scent_update
    }

    pub fn set_last_scent_update(&mut self, tick: u64) {
        self.last_scent_update = tick;
    }

    /// Drop ghosts whose scent contribution has fully expired.
    pub fn prune_ghosts(&mut self, current_tick: u64, removed_item_lifetime: u64) {
        self.items.retain(|item| {
            item.is_alive() || current_tick.saturating_sub(item.deletion_tick) < removed_item_lifetime
        });
    }

    /// Owned snapshot used by map queries and the snapshot codec.
    #[must_use]
    pub fn state(&self) -> PatchState {
        PatchState {
            position: self.position,
            fixed: self.fixed,
            items: self.items.clone(),
            scent: self.scent.clone(),
            last_scent_update: self.last_scent_update,
        }
    }

    /// Rebuild a patch from a decoded snapshot.
    #[must_use]
    pub fn from_state(state: PatchState) -> Self {
        Self {
            position: state.position,
            fixed: state.fixed,
            items: state.items,
            scent: state.scent,
            last_scent_update: state.last_scent_update,
        }
    }
}

/// Owned copy of a patch's contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchState {
    pub position: Position,
    pub fixed: bool,
    pub items: Vec<ItemInstance>,
    pub scent: Vec<f32>,
    pub last_scent_update: u64,
}

/// Owner of every materialized patch, keyed by patch coordinate.
///
/// Reads clone `Arc` handles under a shared lock; insertion (generation)
/// holds the exclusive lock for the whole batch so a concurrent caller that
/// loses the race observes the winner's finished patches. When several patch
/// locks are needed at once they are always taken in ascending
/// `(x, y)` order.
pub struct PatchStore {
    patch_size: u32,
    scent_dimension: usize,
    patches: RwLock<BTreeMap<Position, Arc<Mutex<Patch>>>>,
}

impl PatchStore {
    #[must_use]
    pub fn new(patch_size: u32, scent_dimension: usize) -> Self {
        Self {
            patch_size,
            scent_dimension,
            patches: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub const fn patch_size(&self) -> u32 {
        self.patch_size
    }

    /// Whether a patch has been materialized.
    #[must_use]
    pub fn contains(&self, position: Position) -> bool {
        self.read_map().contains_key(&position)
    }

    /// Coordinates of every materialized patch, ascending.
    #[must_use]
    pub fn positions(&self) -> Vec<Position> {
        self.read_map().keys().copied().collect()
    }

    /// Number of materialized patches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    /// Clone handles for the requested coordinates, sorted ascending and
    /// restricted to patches that exist.
    #[must_use]
    pub fn handles_for(
        &self,
        coords: impl IntoIterator<Item = Position>,
    ) -> Vec<(Position, Arc<Mutex<Patch>>)> {
        let map = self.read_map();
        let mut out: Vec<(Position, Arc<Mutex<Patch>>)> = coords
            .into_iter()
            .filter_map(|pos| map.get(&pos).map(|arc| (pos, Arc::clone(arc))))
            .collect();
        out.sort_by_key(|(pos, _)| *pos);
        out.dedup_by_key(|(pos, _)| *pos);
        out
    }

    /// Clone handles for every materialized patch, ascending.
    #[must_use]
    pub fn all_handles(&self) -> Vec<(Position, Arc<Mutex<Patch>>)> {
        self.read_map()
            .iter()
            .map(|(pos, arc)| (*pos, Arc::clone(arc)))
            .collect()
    }

    /// Run `f` against a patch if it exists.
    pub fn with_patch<R>(&self, position: Position, f: impl FnOnce(&Patch) -> R) -> Option<R> {
        let handle = {
            let map = self.read_map();
            map.get(&position).map(Arc::clone)
        };
        handle.map(|arc| f(&lock_patch(&arc)))
    }

    /// Run `f` against a mutable patch if it exists.
    pub fn with_patch_mut<R>(
        &self,
        position: Position,
        f: impl FnOnce(&mut Patch) -> R,
    ) -> Option<R> {
        let handle = {
            let map = self.read_map();
            map.get(&position).map(Arc::clone)
        };
        handle.map(|arc| f(&mut lock_patch(&arc)))
    }

    /// Freeze a patch's item layout.
    pub fn mark_fixed(&self, position: Position) {
        self.with_patch_mut(position, Patch::set_fixed);
    }

    /// Remove patches inserted by a failed step, restoring the pre-step map.
    pub fn remove_all(&self, positions: &[Position]) {
        if positions.is_empty() {
            return;
        }
        let mut map = self.write_map();
        for pos in positions {
            map.remove(pos);
        }
    }

    /// Insert a patch decoded from a snapshot. Returns an error if the slot
    /// is already occupied.
    pub fn insert_restored(&self, state: PatchState) -> Result<(), SimulatorError> {
        let mut map = self.write_map();
        let position = state.position;
        if map
            .insert(position, Arc::new(Mutex::new(Patch::from_state(state))))
            .is_some()
        {
            return Err(SimulatorError::InvalidConfig(
                "snapshot contains a duplicate patch coordinate",
            ));
        }
        Ok(())
    }

    /// Return the patch at `position`, generating it first if absent.
    ///
    /// Generation materializes every absent patch in the 4x4 block around
    /// `position` in one batch and runs the configured number of sampler
    /// sweeps over the new patches, reading boundary interactions from
    /// already-existing neighbors. Newly inserted coordinates are appended to
    /// `env.inserted` so a failed step can roll them back. When `fix` is set
    /// the requested patch is frozen afterwards.
    pub fn get_or_generate(
        &self,
        position: Position,
        fix: bool,
        env: &mut GenerationEnv<'_>,
    ) -> Result<(), SimulatorError> {
        {
            let mut map = self.write_map();
            if !map.contains_key(&position) {
                self.generate_block(&mut map, position, env)?;
            }
        }
        if fix {
            self.mark_fixed(position);
        }
        Ok(())
    }

    /// Ensure the 3x3 patch neighborhood around `center` exists, fixing every
    /// member. Used whenever an agent enters or observes a region.
    pub fn ensure_fixed_neighborhood(
        &self,
        center: Position,
        env: &mut GenerationEnv<'_>,
    ) -> Result<(), SimulatorError> {
        for dy in -1..=1 {
            for dx in -1..=1 {
                self.get_or_generate(center + Position::new(dx, dy), true, env)?;
            }
        }
        Ok(())
    }

    /// Materialize and sample every absent patch in the 4x4 block around
    /// `center`. Caller holds the exclusive map lock.
    fn generate_block(
        &self,
        map: &mut BTreeMap<Position, Arc<Mutex<Patch>>>,
        center: Position,
        env: &mut GenerationEnv<'_>,
    ) -> Result<(), SimulatorError> {
        let mut fresh: Vec<Position> = Vec::new();
        for dy in -1..=2 {
            for dx in -1..=2 {
                let pos = center + Position::new(dx, dy);
                if !map.contains_key(&pos) {
                    fresh.push(pos);
                }
            }
        }
        fresh.sort();
        for pos in &fresh {
            let patch = Patch::empty(*pos, self.patch_size, self.scent_dimension, env.tick);
            map.insert(*pos, Arc::new(Mutex::new(patch)));
            env.inserted.push(*pos);
        }

        // Everything the sampler needs to see: the fresh patches plus any
        // existing patch adjacent to one of them.
        let mut involved: Vec<Position> = Vec::new();
        for pos in &fresh {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let neighbor = *pos + Position::new(dx, dy);
                    if map.contains_key(&neighbor) {
                        involved.push(neighbor);
                    }
                }
            }
        }
        involved.sort();
        involved.dedup();

        let handles: Vec<Arc<Mutex<Patch>>> = involved
            .iter()
            .map(|pos| Arc::clone(&map[pos]))
            .collect();
        let mut guards: Vec<MutexGuard<'_, Patch>> =
            handles.iter().map(|arc| lock_patch(arc)).collect();

        let index_of = |pos: Position| involved.binary_search(&pos).ok();
        let sample: Vec<usize> = fresh
            .iter()
            .filter_map(|pos| index_of(*pos))
            .collect();
        let neighborhoods: Vec<field::QuadrantNeighborhoods> = fresh
            .iter()
            .map(|pos| field::QuadrantNeighborhoods::build(*pos, index_of))
            .collect();

        field::sample_batch(&mut guards, &sample, &neighborhoods, self.patch_size, env);
        Ok(())
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Position, Arc<Mutex<Patch>>>> {
        self.patches.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<Position, Arc<Mutex<Patch>>>> {
        self.patches.write().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) fn lock_patch(arc: &Arc<Mutex<Patch>>) -> MutexGuard<'_, Patch> {
    arc.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{LogCache, SamplerCache};
    use crate::{IntensityFn, InteractionFn, ItemType, RegenerationFn, SimulatorConfig};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn test_config() -> SimulatorConfig {
        SimulatorConfig {
            patch_size: 4,
            mcmc_iterations: 40,
            scent_dimension: 1,
            color_dimension: 1,
            agent_color: vec![0.0],
            item_types: vec![ItemType {
                name: "pellet".to_string(),
                scent: vec![1.0],
                color: vec![1.0],
                required_item_counts: vec![0],
                required_item_costs: vec![0],
                blocks_movement: false,
                visual_occlusion: 0.0,
                lifetime: 0,
                intensity: IntensityFn::Constant(-2.0),
                interactions: vec![InteractionFn::Zero],
                regeneration: RegenerationFn::Zero,
            }],
            ..SimulatorConfig::default()
        }
    }

    fn generate_origin(config: &SimulatorConfig, seed: u64) -> (PatchStore, Vec<Position>) {
        let store = PatchStore::new(config.patch_size, config.scent_dimension);
        let cache = SamplerCache::new(config);
        let mut log_cache = LogCache::new();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut inserted = Vec::new();
        let mut env = GenerationEnv {
            config,
            cache: &cache,
            log_cache: &mut log_cache,
            rng: &mut rng,
            tick: 0,
            inserted: &mut inserted,
        };
        store
            .get_or_generate(Position::new(0, 0), false, &mut env)
            .expect("generation");
        (store, inserted)
    }

    #[test]
    fn generation_materializes_the_full_block() {
        let config = test_config();
        let (store, inserted) = generate_origin(&config, 7);
        assert_eq!(inserted.len(), 16);
        for dy in -1..=2 {
            for dx in -1..=2 {
                assert!(store.contains(Position::new(dx, dy)), "({dx}, {dy})");
            }
        }
    }

    #[test]
    fn generation_is_deterministic_for_a_seed() {
        let config = test_config();
        let (store_a, _) = generate_origin(&config, 99);
        let (store_b, _) = generate_origin(&config, 99);
        let items_a =
            store_a.with_patch(Position::new(0, 0), |patch| patch.items().to_vec());
        let items_b =
            store_b.with_patch(Position::new(0, 0), |patch| patch.items().to_vec());
        assert_eq!(items_a, items_b);
    }

    #[test]
    fn regeneration_request_is_idempotent() {
        let config = test_config();
        let (store, _) = generate_origin(&config, 3);
        let before = store
            .with_patch(Position::new(0, 0), |patch| patch.items().to_vec())
            .expect("patch");

        let cache = SamplerCache::new(&config);
        let mut log_cache = LogCache::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1234);
        let mut inserted = Vec::new();
        let mut env = GenerationEnv {
            config: &config,
            cache: &cache,
            log_cache: &mut log_cache,
            rng: &mut rng,
            tick: 5,
            inserted: &mut inserted,
        };
        store
            .get_or_generate(Position::new(0, 0), true, &mut env)
            .expect("second request");
        assert!(inserted.is_empty(), "no patches re-inserted");
        let after = store
            .with_patch(Position::new(0, 0), |patch| patch.items().to_vec())
            .expect("patch");
        assert_eq!(before, after);
        assert_eq!(
            store.with_patch(Position::new(0, 0), |patch| patch.is_fixed()),
            Some(true)
        );
    }

    #[test]
    fn rollback_removes_inserted_patches() {
        let config = test_config();
        let (store, inserted) = generate_origin(&config, 11);
        assert!(!store.is_empty());
        store.remove_all(&inserted);
        assert!(store.is_empty());
    }

    #[test]
    fn ghost_pruning_respects_lifetime() {
        let mut patch = Patch::empty(Position::new(0, 0), 4, 1, 0);
        patch.items_mut().push(ItemInstance {
            item_type: 0,
            location: Position::new(1, 1),
            creation_tick: 0,
            deletion_tick: 10,
        });
        patch.prune_ghosts(12, 5);
        assert!(patch.items().is_empty());

        let mut patch = Patch::empty(Position::new(0, 0), 4, 1, 0);
        patch.items_mut().push(ItemInstance {
            item_type: 0,
            location: Position::new(1, 1),
            creation_tick: 0,
            deletion_tick: 10,
        });
        patch.prune_ghosts(12, 5_000);
        assert_eq!(patch.items().len(), 1);
    }
}
