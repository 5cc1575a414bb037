//! Discrete-time scent decay and diffusion with lazy per-patch catch-up.
//!
//! Each patch records the tick its scent grid was last advanced to. The
//! stepper catches up only the patches near agents; a patch outside every
//! agent's scent radius is never touched. Catch-up advances a whole region in
//! lockstep, one tick at a time, reading neighbor grids from the previous
//! tick's buffers so the update order inside a region cannot matter.

use crate::geometry::Position;
use crate::patch::{lock_patch, Patch, PatchStore};
use crate::SimulatorConfig;
use std::collections::BTreeSet;
use std::sync::MutexGuard;

/// Advance every patch in `region` to `target_tick`.
///
/// Patches adjacent to the region are locked read-only so edge cells can
/// fetch their neighbors; patch locks are taken in ascending coordinate
/// order. Patches already at or beyond `target_tick` are left untouched.
pub fn catch_up_region(
    store: &PatchStore,
    region: &BTreeSet<Position>,
    target_tick: u64,
    config: &SimulatorConfig,
) {
    if region.is_empty() {
        return;
    }
    let mut coords: BTreeSet<Position> = region.clone();
    for pos in region {
        for dy in -1..=1 {
            for dx in -1..=1 {
                coords.insert(*pos + Position::new(dx, dy));
            }
        }
    }
    let handles = store.handles_for(coords);
    let mut guards: Vec<MutexGuard<'_, Patch>> =
        handles.iter().map(|(_, arc)| lock_patch(arc)).collect();

    let update_indices: Vec<usize> = handles
        .iter()
        .enumerate()
        .filter(|(_, (pos, _))| region.contains(pos))
        .map(|(index, _)| index)
        .collect();
    let Some(start) = update_indices
        .iter()
        .map(|&index| guards[index].last_scent_update())
        .min()
    else {
        return;
    };
    if start >= target_tick {
        return;
    }

    let index_of = |pos: Position| {
        handles
            .binary_search_by_key(&pos, |(p, _)| *p)
            .ok()
    };
    let mut prev: Vec<Vec<f32>> = vec![Vec::new(); guards.len()];
    let mut behind: Vec<bool> = vec![false; guards.len()];

    for tick in (start + 1)..=target_tick {
        for flag in &mut behind {
            *flag = false;
        }
        for &index in &update_indices {
            if guards[index].last_scent_update() < tick {
                behind[index] = true;
                prev[index].clear();
                prev[index].extend_from_slice(guards[index].scent());
            }
        }
        for &index in &update_indices {
            if !behind[index] {
                continue;
            }
            let grid = diffuse_patch(&guards, &prev, &behind, index, tick, &index_of, config);
            guards[index].set_scent(grid);
            guards[index].set_last_scent_update(tick);
        }
    }
}

/// Compute one patch's scent grid at `tick` from the previous tick's state.
fn diffuse_patch(
    guards: &[MutexGuard<'_, Patch>],
    prev: &[Vec<f32>],
    behind: &[bool],
    index: usize,
    tick: u64,
    index_of: &impl Fn(Position) -> Option<usize>,
    config: &SimulatorConfig,
) -> Vec<f32> {
    let n = config.patch_size as i64;
    let dim = config.scent_dimension;
    let decay = config.scent_decay;
    let diffusion = config.scent_diffusion;
    let patch_pos = guards[index].position();
    let own_prev: &[f32] = &prev[index];

    // Previous-tick scent of the cell at patch-local coordinates, which may
    // fall inside an adjacent patch. None when the patch does not exist.
    let cell_scent = |x: i64, y: i64| -> Option<&[f32]> {
        let (patch_offset, cell) = (
            Position::new(x.div_euclid(n), y.div_euclid(n)),
            (x.rem_euclid(n) as usize, y.rem_euclid(n) as usize),
        );
        let offset = (cell.1 * n as usize + cell.0) * dim;
        if patch_offset == Position::new(0, 0) {
            return Some(&own_prev[offset..offset + dim]);
        }
        let neighbor = index_of(patch_pos + patch_offset)?;
        let grid: &[f32] = if behind[neighbor] {
            &prev[neighbor]
        } else {
            guards[neighbor].scent()
        };
        Some(&grid[offset..offset + dim])
    };

    let mut next = vec![0.0f32; own_prev.len()];
    for y in 0..n {
        for x in 0..n {
            let offset = ((y * n + x) as usize) * dim;
            let mut neighbor_count = 0u32;
            let mut neighbor_sum = vec![0.0f32; dim];
            for (dx, dy) in [(0i64, 1i64), (0, -1), (-1, 0), (1, 0)] {
                if let Some(scent) = cell_scent(x + dx, y + dy) {
                    neighbor_count += 1;
                    for (sum, value) in neighbor_sum.iter_mut().zip(scent) {
                        *sum += value;
                    }
                }
            }
            let retain = (1.0 - diffusion * neighbor_count as f32) * decay;
            for d in 0..dim {
                next[offset + d] =
                    retain * own_prev[offset + d] + decay * diffusion * neighbor_sum[d];
            }
        }
    }

    // Item contributions: alive items emit their type's scent; ghosts echo an
    // exponentially decayed copy until removed_item_lifetime expires.
    for item in guards[index].items() {
        if tick < item.creation_tick {
            continue;
        }
        let item_type = &config.item_types[item.item_type as usize];
        let (_, cell) = item.location.to_patch(config.patch_size);
        let offset = ((cell.1 as usize) * n as usize + cell.0 as usize) * dim;
        if item.is_alive() {
            for (slot, value) in next[offset..offset + dim].iter_mut().zip(&item_type.scent) {
                *slot += value;
            }
        } else if tick >= item.deletion_tick {
            let age = tick - item.deletion_tick;
            if age < config.removed_item_lifetime {
                let echo = decay.powf(age as f32);
                for (slot, value) in next[offset..offset + dim].iter_mut().zip(&item_type.scent) {
                    *slot += echo * value;
                }
            }
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{ItemInstance, PatchState};
    use crate::SimulatorConfig;

    fn scent_config() -> SimulatorConfig {
        SimulatorConfig {
            patch_size: 4,
            scent_dimension: 1,
            color_dimension: 1,
            agent_color: vec![0.0],
            scent_decay: 0.5,
            scent_diffusion: 0.1,
            removed_item_lifetime: 4,
            ..SimulatorConfig::default()
        }
    }

    fn empty_state(pos: Position, config: &SimulatorConfig) -> PatchState {
        let cells = (config.patch_size as usize).pow(2);
        PatchState {
            position: pos,
            fixed: true,
            items: Vec::new(),
            scent: vec![0.0; cells * config.scent_dimension],
            last_scent_update: 0,
        }
    }

    fn store_with_region(config: &SimulatorConfig) -> PatchStore {
        let store = PatchStore::new(config.patch_size, config.scent_dimension);
        for dy in -1..=1 {
            for dx in -1..=1 {
                store
                    .insert_restored(empty_state(Position::new(dx, dy), config))
                    .expect("insert");
            }
        }
        store
    }

    fn center_region() -> BTreeSet<Position> {
        let mut region = BTreeSet::new();
        region.insert(Position::new(0, 0));
        region
    }

    #[test]
    fn interior_cell_decays_and_diffuses() {
        let config = scent_config();
        let store = store_with_region(&config);
        // Seed cell (1, 1) of the origin patch.
        store.with_patch_mut(Position::new(0, 0), |patch| {
            let offset = patch.scent_offset((1, 1), config.patch_size, config.scent_dimension);
            patch.scent_mut()[offset] = 1.0;
        });

        catch_up_region(&store, &center_region(), 1, &config);

        let (center, right) = store
            .with_patch(Position::new(0, 0), |patch| {
                let c = patch.scent_at((1, 1), config.patch_size, config.scent_dimension)[0];
                let r = patch.scent_at((2, 1), config.patch_size, config.scent_dimension)[0];
                (c, r)
            })
            .expect("patch");
        // (1 - 4 * 0.1) * 0.5 * 1.0 and 0.5 * 0.1 * 1.0.
        assert!((center - 0.3).abs() < 1e-6);
        assert!((right - 0.05).abs() < 1e-6);
    }

    #[test]
    fn alive_item_feeds_scent_each_tick() {
        let config = scent_config();
        let store = store_with_region(&config);
        store.with_patch_mut(Position::new(0, 0), |patch| {
            patch.items_mut().push(ItemInstance {
                item_type: 0,
                location: Position::new(2, 2),
                creation_tick: 0,
                deletion_tick: 0,
            });
        });
        let config = SimulatorConfig {
            item_types: vec![crate::ItemType {
                name: "musk".to_string(),
                scent: vec![1.0],
                color: vec![1.0],
                required_item_counts: vec![0],
                required_item_costs: vec![0],
                blocks_movement: false,
                visual_occlusion: 0.0,
                lifetime: 0,
                intensity: crate::IntensityFn::Zero,
                interactions: vec![crate::InteractionFn::Zero],
                regeneration: crate::RegenerationFn::Zero,
            }],
            ..config
        };

        catch_up_region(&store, &center_region(), 3, &config);

        let value = store
            .with_patch(Position::new(0, 0), |patch| {
                patch.scent_at((2, 2), config.patch_size, config.scent_dimension)[0]
            })
            .expect("patch");
        // Tick 1: 1.0; afterwards decayed plus fresh emission, so above 1.
        assert!(value > 1.0, "value={value}");
    }

    #[test]
    fn ghost_echo_expires_after_lifetime() {
        let base = scent_config();
        let config = SimulatorConfig {
            item_types: vec![crate::ItemType {
                name: "musk".to_string(),
                scent: vec![1.0],
                color: vec![1.0],
                required_item_counts: vec![0],
                required_item_costs: vec![0],
                blocks_movement: false,
                visual_occlusion: 0.0,
                lifetime: 0,
                intensity: crate::IntensityFn::Zero,
                interactions: vec![crate::InteractionFn::Zero],
                regeneration: crate::RegenerationFn::Zero,
            }],
            ..base
        };
        let store = store_with_region(&config);
        store.with_patch_mut(Position::new(0, 0), |patch| {
            patch.items_mut().push(ItemInstance {
                item_type: 0,
                location: Position::new(1, 2),
                creation_tick: 0,
                deletion_tick: 2,
            });
        });

        // removed_item_lifetime = 4: echoes at ticks 2..=5, nothing at 6+.
        catch_up_region(&store, &center_region(), 20, &config);
        let late = store
            .with_patch(Position::new(0, 0), |patch| {
                patch.scent_at((1, 2), config.patch_size, config.scent_dimension)[0]
            })
            .expect("patch");
        // Every direct contribution stopped at tick 5; 15 further decay
        // ticks leave essentially nothing.
        assert!(late < 1e-3, "late={late}");

        let fresh_store = store_with_region(&config);
        fresh_store.with_patch_mut(Position::new(0, 0), |patch| {
            patch.items_mut().push(ItemInstance {
                item_type: 0,
                location: Position::new(1, 2),
                creation_tick: 0,
                deletion_tick: 2,
            });
        });
        catch_up_region(&fresh_store, &center_region(), 3, &config);
        let echo = fresh_store
            .with_patch(Position::new(0, 0), |patch| {
                patch.scent_at((1, 2), config.patch_size, config.scent_dimension)[0]
            })
            .expect("patch");
        assert!(echo > 0.0, "echo={echo}");
    }

    #[test]
    fn scent_never_goes_negative() {
        let base = scent_config();
        let config = SimulatorConfig {
            scent_diffusion: 0.2,
            item_types: vec![crate::ItemType {
                name: "musk".to_string(),
                scent: vec![0.7],
                color: vec![1.0],
                required_item_counts: vec![0],
                required_item_costs: vec![0],
                blocks_movement: false,
                visual_occlusion: 0.0,
                lifetime: 0,
                intensity: crate::IntensityFn::Zero,
                interactions: vec![crate::InteractionFn::Zero],
                regeneration: crate::RegenerationFn::Zero,
            }],
            ..base
        };
        let store = store_with_region(&config);
        store.with_patch_mut(Position::new(0, 0), |patch| {
            patch.items_mut().push(ItemInstance {
                item_type: 0,
                location: Position::new(0, 0),
                creation_tick: 0,
                deletion_tick: 0,
            });
        });
        let mut region = BTreeSet::new();
        for dy in -1..=1 {
            for dx in -1..=1 {
                region.insert(Position::new(dx, dy));
            }
        }
        catch_up_region(&store, &region, 50, &config);
        for pos in &region {
            store.with_patch(*pos, |patch| {
                assert!(patch.scent().iter().all(|&v| v >= 0.0));
            });
        }
    }

    #[test]
    fn catch_up_skips_patches_already_current() {
        let config = scent_config();
        let store = store_with_region(&config);
        store.with_patch_mut(Position::new(0, 0), |patch| {
            patch.set_last_scent_update(10);
            let offset = patch.scent_offset((0, 0), config.patch_size, config.scent_dimension);
            patch.scent_mut()[offset] = 0.25;
        });
        catch_up_region(&store, &center_region(), 10, &config);
        let value = store
            .with_patch(Position::new(0, 0), |patch| {
                patch.scent_at((0, 0), config.patch_size, config.scent_dimension)[0]
            })
            .expect("patch");
        assert!((value - 0.25).abs() < f32::EPSILON);
    }
}
