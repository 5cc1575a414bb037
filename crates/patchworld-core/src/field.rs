//! Gibbs-field sampling of item placements over patch batches, with a cache
//! of stationary energy-function lookups.

use crate::geometry::Position;
use crate::patch::{ItemInstance, Patch};
use crate::{SamplingMode, SimulatorConfig};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::sync::MutexGuard;

/// Shared cache of `ln k` for small integer `k`, grown on demand.
#[derive(Debug, Default)]
pub struct LogCache {
    values: Vec<f32>,
}

impl LogCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: vec![f32::NEG_INFINITY, 0.0],
        }
    }

    /// `ln k`; `k` must be at least 1.
    pub fn ln(&mut self, k: usize) -> f32 {
        while self.values.len() <= k {
            let next = self.values.len() as f32;
            self.values.push(next.ln());
        }
        self.values[k]
    }
}

/// Precomputed lookups for stationary energy functions.
///
/// Stationary, non-constant interactions are tabulated over the 4n x 4n
/// displacement window keyed by `diff + (2n, 2n)`; that table is the hottest
/// read in patch generation. Stationary intensities collapse to scalars.
pub struct SamplerCache {
    item_types: Vec<crate::ItemType>,
    type_count: usize,
    intensities: Vec<Option<f32>>,
    interactions: Vec<Option<Vec<f32>>>,
    two_n: i64,
    four_n: i64,
    ln_type_count: f32,
    two_ln_n: f32,
}

impl SamplerCache {
    #[must_use]
    pub fn new(config: &SimulatorConfig) -> Self {
        let n = i64::from(config.patch_size);
        let two_n = 2 * n;
        let four_n = 4 * n;
        let item_types = config.item_types.clone();
        let type_count = item_types.len();

        let intensities: Vec<Option<f32>> = item_types
            .iter()
            .map(|item| {
                item.intensity
                    .is_stationary()
                    .then(|| item.intensity.evaluate(Position::new(0, 0)))
            })
            .collect();

        let mut interactions: Vec<Option<Vec<f32>>> = Vec::with_capacity(type_count * type_count);
        for first in &item_types {
            for second_index in 0..type_count {
                let f = &first.interactions[second_index];
                if f.is_constant() || !f.is_stationary() {
                    interactions.push(None);
                    continue;
                }
                let center = Position::new(two_n, two_n);
                let mut table = vec![0.0f32; (four_n * four_n) as usize];
                for x in 0..four_n {
                    for y in 0..four_n {
                        if x == two_n && y == two_n {
                            continue;
                        }
                        table[(x * four_n + y) as usize] = f.evaluate(center, Position::new(x, y));
                    }
                }
                interactions.push(Some(table));
            }
        }

        Self {
            item_types,
            type_count,
            intensities,
            interactions,
            two_n,
            four_n,
            ln_type_count: (type_count.max(1) as f32).ln(),
            two_ln_n: 2.0 * (config.patch_size as f32).ln(),
        }
    }

    /// Intensity of placing an item of `item_type` at `pos`.
    #[must_use]
    pub fn intensity(&self, pos: Position, item_type: usize) -> f32 {
        match self.intensities[item_type] {
            Some(value) => value,
            None => self.item_types[item_type].intensity.evaluate(pos),
        }
    }

    /// Ordered pairwise interaction between items of `first_type` at
    /// `first_pos` and `second_type` at `second_pos`. Coincident positions
    /// contribute nothing (a cell holds at most one item).
    #[must_use]
    pub fn interaction(
        &self,
        first_pos: Position,
        second_pos: Position,
        first_type: usize,
        second_type: usize,
    ) -> f32 {
        match &self.interactions[first_type * self.type_count + second_type] {
            None => {
                if first_pos == second_pos {
                    0.0
                } else {
                    self.item_types[first_type].interactions[second_type]
                        .evaluate(first_pos, second_pos)
                }
            }
            Some(table) => {
                let diff = first_pos - second_pos + Position::new(self.two_n, self.two_n);
                if diff.x < 0 || diff.x >= self.four_n || diff.y < 0 || diff.y >= self.four_n {
                    return 0.0;
                }
                table[(diff.x * self.four_n + diff.y) as usize]
            }
        }
    }

    #[must_use]
    pub fn item_types(&self) -> &[crate::ItemType] {
        &self.item_types
    }
}

/// Mutable state threaded through patch generation.
pub struct GenerationEnv<'a> {
    pub config: &'a SimulatorConfig,
    pub cache: &'a SamplerCache,
    pub log_cache: &'a mut LogCache,
    pub rng: &'a mut ChaCha8Rng,
    pub tick: u64,
    /// Coordinates inserted during the current step, for rollback.
    pub inserted: &'a mut Vec<Position>,
}

/// Quadrant index: bottom-left, top-left, bottom-right, top-right.
const QUAD_BL: usize = 0;
const QUAD_TL: usize = 1;
const QUAD_BR: usize = 2;
const QUAD_TR: usize = 3;

/// For each quadrant of a sampled patch, the guard indices of the patches
/// whose items can interact with cells in that quadrant. Index 0 is always
/// the sampled patch itself; absent neighbors are simply not listed.
pub struct QuadrantNeighborhoods {
    pub quadrants: [Vec<usize>; 4],
}

impl QuadrantNeighborhoods {
    /// Build neighborhoods for the patch at `pos`, resolving coordinates to
    /// guard indices through `index_of`.
    pub fn build(pos: Position, index_of: impl Fn(Position) -> Option<usize>) -> Self {
        let build_quadrant = |dx: i64, dy: i64| -> Vec<usize> {
            [
                Position::new(0, 0),
                Position::new(dx, 0),
                Position::new(0, dy),
                Position::new(dx, dy),
            ]
            .into_iter()
            .filter_map(|offset| index_of(pos + offset))
            .collect()
        };
        Self {
            quadrants: [
                build_quadrant(-1, -1),
                build_quadrant(-1, 1),
                build_quadrant(1, -1),
                build_quadrant(1, 1),
            ],
        }
    }
}

/// Which quadrant a cell offset falls into.
fn quadrant_of(cell: (u32, u32), patch_size: u32) -> usize {
    let half = patch_size / 2;
    if cell.0 < half {
        if cell.1 < half { QUAD_BL } else { QUAD_TL }
    } else if cell.1 < half {
        QUAD_BR
    } else {
        QUAD_TR
    }
}

/// Run the configured number of sampler sweeps over the `sample`d patches.
///
/// `guards` holds every patch the sampler may read, locked in ascending
/// coordinate order; `sample` and `neighborhoods` are parallel slices naming
/// the patches whose items may change.
pub fn sample_batch(
    guards: &mut [MutexGuard<'_, Patch>],
    sample: &[usize],
    neighborhoods: &[QuadrantNeighborhoods],
    patch_size: u32,
    env: &mut GenerationEnv<'_>,
) {
    if env.config.item_type_count() == 0 || sample.is_empty() {
        return;
    }
    match env.config.sampling_mode {
        SamplingMode::MetropolisHastings => {
            for _ in 0..env.config.mcmc_iterations {
                for (k, &patch_index) in sample.iter().enumerate() {
                    mh_proposal(guards, patch_index, &neighborhoods[k], patch_size, env);
                }
            }
        }
        SamplingMode::Gibbs => {
            gibbs_sweeps(guards, sample, neighborhoods, patch_size, env);
        }
    }
}

/// One Metropolis-Hastings birth/death proposal on a patch.
fn mh_proposal(
    guards: &mut [MutexGuard<'_, Patch>],
    patch_index: usize,
    neighborhood: &QuadrantNeighborhoods,
    patch_size: u32,
    env: &mut GenerationEnv<'_>,
) {
    let type_count = env.cache.type_count;
    let offset = guards[patch_index].position().patch_origin(patch_size);

    if env.rng.random_range(0..2u32) == 0 {
        // Propose creating a new item.
        let item_type = env.rng.random_range(0..type_count);
        let cell = (
            env.rng.random_range(0..patch_size),
            env.rng.random_range(0..patch_size),
        );
        let new_position = offset + Position::new(i64::from(cell.0), i64::from(cell.1));
        let neighbors = &neighborhood.quadrants[quadrant_of(cell, patch_size)];

        let mut log_acceptance = 0.0f32;
        let mut occupied = false;
        'scan: for &j in neighbors {
            for item in guards[j].alive_items() {
                if item.location == new_position {
                    occupied = true;
                    break 'scan;
                }
                log_acceptance +=
                    env.cache
                        .interaction(new_position, item.location, item_type, item.item_type as usize);
                log_acceptance +=
                    env.cache
                        .interaction(item.location, new_position, item.item_type as usize, item_type);
            }
        }
        if occupied {
            return;
        }
        log_acceptance += env.cache.intensity(new_position, item_type);

        let alive = guards[patch_index].alive_count();
        // Inverse proposal picks this item among alive + 1; the forward
        // proposal picked a type and a cell uniformly.
        log_acceptance += -env.log_cache.ln(alive + 1);
        log_acceptance -= -env.cache.ln_type_count - env.cache.two_ln_n;

        let random: f32 = env.rng.random();
        if random.ln() < log_acceptance {
            guards[patch_index].items_mut().push(ItemInstance {
                item_type: item_type as u32,
                location: new_position,
                creation_tick: env.tick,
                deletion_tick: 0,
            });
        }
    } else {
        // Propose deleting an existing item.
        let alive_indices: Vec<usize> = guards[patch_index]
            .items()
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_alive())
            .map(|(index, _)| index)
            .collect();
        if alive_indices.is_empty() {
            return;
        }
        let item_index = alive_indices[env.rng.random_range(0..alive_indices.len())];
        let candidate = guards[patch_index].items()[item_index];
        let old_type = candidate.item_type as usize;
        let old_position = candidate.location;
        let cell_offset = old_position - offset;
        let cell = (cell_offset.x as u32, cell_offset.y as u32);
        let neighbors = &neighborhood.quadrants[quadrant_of(cell, patch_size)];

        let mut log_acceptance = 0.0f32;
        for &j in neighbors {
            for item in guards[j].alive_items() {
                log_acceptance -=
                    env.cache
                        .interaction(old_position, item.location, old_type, item.item_type as usize);
                log_acceptance -=
                    env.cache
                        .interaction(item.location, old_position, item.item_type as usize, old_type);
            }
        }
        log_acceptance -= env.cache.intensity(old_position, old_type);

        log_acceptance += -env.cache.ln_type_count - env.cache.two_ln_n;
        log_acceptance -= -env.log_cache.ln(alive_indices.len());

        let random: f32 = env.rng.random();
        if random.ln() < log_acceptance {
            // Rejected proposals never existed; remove outright, not as a
            // ghost.
            guards[patch_index].items_mut().remove(item_index);
        }
    }
}

/// Systematic-scan Gibbs: the four interleaved quadrants of every sampled
/// patch are visited in shuffled cell order, resampling each cell's occupant
/// from its conditional distribution.
fn gibbs_sweeps(
    guards: &mut [MutexGuard<'_, Patch>],
    sample: &[usize],
    neighborhoods: &[QuadrantNeighborhoods],
    patch_size: u32,
    env: &mut GenerationEnv<'_>,
) {
    let half = patch_size / 2;
    let quadrant_cells = |x_range: std::ops::Range<u32>, y_range: std::ops::Range<u32>| {
        let mut cells = Vec::with_capacity((half * half) as usize);
        for x in x_range {
            for y in y_range.clone() {
                cells.push((x, y));
            }
        }
        cells
    };
    let mut cells: [Vec<(u32, u32)>; 4] = [
        quadrant_cells(0..half, 0..half),
        quadrant_cells(0..half, half..patch_size),
        quadrant_cells(half..patch_size, 0..half),
        quadrant_cells(half..patch_size, half..patch_size),
    ];

    for _ in 0..env.config.mcmc_iterations {
        for (k, &patch_index) in sample.iter().enumerate() {
            let offset = guards[patch_index].position().patch_origin(patch_size);
            for quadrant in &mut cells {
                quadrant.shuffle(env.rng);
            }
            // Opposite quadrants first so no two consecutive passes touch
            // adjacent cells.
            for quadrant in [QUAD_BL, QUAD_TR, QUAD_TL, QUAD_BR] {
                for cell_index in 0..cells[quadrant].len() {
                    let cell = cells[quadrant][cell_index];
                    let world = offset + Position::new(i64::from(cell.0), i64::from(cell.1));
                    gibbs_cell(
                        guards,
                        patch_index,
                        &neighborhoods[k].quadrants[quadrant],
                        world,
                        env,
                    );
                }
            }
        }
    }
}

/// Resample the occupant of one cell from its conditional distribution over
/// item types plus "empty".
fn gibbs_cell(
    guards: &mut [MutexGuard<'_, Patch>],
    patch_index: usize,
    neighbors: &[usize],
    world: Position,
    env: &mut GenerationEnv<'_>,
) {
    let type_count = env.cache.type_count;
    let mut log_probs: Vec<f32> = (0..type_count)
        .map(|t| env.cache.intensity(world, t))
        .collect();
    for &j in neighbors {
        for item in guards[j].alive_items() {
            for (t, log_prob) in log_probs.iter_mut().enumerate() {
                *log_prob +=
                    env.cache
                        .interaction(world, item.location, t, item.item_type as usize);
                *log_prob +=
                    env.cache
                        .interaction(item.location, world, item.item_type as usize, t);
            }
        }
    }
    log_probs.push(0.0);
    let probs = normalize_exp(&log_probs);
    let random: f32 = env.rng.random();
    let sampled = select_categorical(&probs, random);

    let old_index = guards[patch_index]
        .items()
        .iter()
        .position(|item| item.is_alive() && item.location == world);
    let old_type = old_index
        .map(|index| guards[patch_index].items()[index].item_type as usize)
        .unwrap_or(type_count);

    if sampled == old_type {
        return;
    }
    if let Some(index) = old_index {
        guards[patch_index].items_mut().remove(index);
    }
    if sampled < type_count {
        guards[patch_index].items_mut().push(ItemInstance {
            item_type: sampled as u32,
            location: world,
            creation_tick: env.tick,
            deletion_tick: 0,
        });
    }
}

/// A short birth-only pass used by item regeneration on fixed patches: the
/// regenerating type's intensity is shifted by `ln(1 + rate)` and only the
/// target patch may gain items.
pub fn regeneration_pass(
    guards: &mut [MutexGuard<'_, Patch>],
    patch_index: usize,
    neighbors: &[usize],
    item_type: usize,
    rate: f32,
    patch_size: u32,
    proposals: u32,
    env: &mut GenerationEnv<'_>,
) {
    let boost = (1.0 + rate).ln();
    let offset = guards[patch_index].position().patch_origin(patch_size);
    for _ in 0..proposals {
        let cell = (
            env.rng.random_range(0..patch_size),
            env.rng.random_range(0..patch_size),
        );
        let new_position = offset + Position::new(i64::from(cell.0), i64::from(cell.1));

        let mut log_acceptance = 0.0f32;
        let mut occupied = false;
        'scan: for &j in neighbors {
            for item in guards[j].alive_items() {
                if item.location == new_position {
                    occupied = true;
                    break 'scan;
                }
                log_acceptance +=
                    env.cache
                        .interaction(new_position, item.location, item_type, item.item_type as usize);
                log_acceptance +=
                    env.cache
                        .interaction(item.location, new_position, item.item_type as usize, item_type);
            }
        }
        if occupied {
            continue;
        }
        log_acceptance += env.cache.intensity(new_position, item_type) + boost;

        let alive = guards[patch_index].alive_count();
        log_acceptance += -env.log_cache.ln(alive + 1);
        log_acceptance -= -env.cache.two_ln_n;

        let random: f32 = env.rng.random();
        if random.ln() < log_acceptance {
            guards[patch_index].items_mut().push(ItemInstance {
                item_type: item_type as u32,
                location: new_position,
                creation_tick: env.tick,
                deletion_tick: 0,
            });
        }
    }
}

/// Exponentiate shifted log-weights into a normalized distribution.
fn normalize_exp(log_probs: &[f32]) -> Vec<f32> {
    let max = log_probs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = log_probs.iter().map(|lp| (lp - max).exp()).collect();
    let total: f32 = probs.iter().sum();
    if total > 0.0 {
        for p in &mut probs {
            *p /= total;
        }
    }
    probs
}

/// Draw an index from a normalized distribution given a uniform sample.
fn select_categorical(probs: &[f32], random: f32) -> usize {
    let mut cumulative = 0.0f32;
    for (index, p) in probs.iter().enumerate() {
        cumulative += p;
        if random < cumulative {
            return index;
        }
    }
    probs.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IntensityFn, InteractionFn, ItemType, RegenerationFn};

    fn cache_config(interaction: InteractionFn) -> SimulatorConfig {
        SimulatorConfig {
            patch_size: 4,
            scent_dimension: 1,
            color_dimension: 1,
            agent_color: vec![0.0],
            item_types: vec![ItemType {
                name: "stone".to_string(),
                scent: vec![0.0],
                color: vec![1.0],
                required_item_counts: vec![0],
                required_item_costs: vec![0],
                blocks_movement: false,
                visual_occlusion: 0.0,
                lifetime: 0,
                intensity: IntensityFn::Constant(-1.5),
                interactions: vec![interaction],
                regeneration: RegenerationFn::Zero,
            }],
            ..SimulatorConfig::default()
        }
    }

    #[test]
    fn stationary_interactions_match_direct_evaluation() {
        let interaction = InteractionFn::PiecewiseBox {
            first_cutoff: 3.0,
            second_cutoff: 9.0,
            first_value: 2.0,
            second_value: -0.5,
        };
        let config = cache_config(interaction.clone());
        let cache = SamplerCache::new(&config);

        for (a, b) in [
            (Position::new(0, 0), Position::new(1, 0)),
            (Position::new(5, 5), Position::new(3, 4)),
            (Position::new(-2, 7), Position::new(-4, 6)),
        ] {
            assert_eq!(cache.interaction(a, b, 0, 0), interaction.evaluate(a, b));
        }
    }

    #[test]
    fn coincident_positions_do_not_interact() {
        let config = cache_config(InteractionFn::Moore);
        let cache = SamplerCache::new(&config);
        let pos = Position::new(3, 3);
        assert_eq!(cache.interaction(pos, pos, 0, 0), 0.0);
    }

    #[test]
    fn far_displacements_fall_off_the_table() {
        let config = cache_config(InteractionFn::Moore);
        let cache = SamplerCache::new(&config);
        // 4n = 16; anything further is defined to be zero.
        assert_eq!(
            cache.interaction(Position::new(0, 0), Position::new(40, 0), 0, 0),
            0.0
        );
    }

    #[test]
    fn stationary_intensity_collapses_to_a_scalar() {
        let config = cache_config(InteractionFn::Zero);
        let cache = SamplerCache::new(&config);
        assert_eq!(cache.intensity(Position::new(123, -456), 0), -1.5);
    }

    #[test]
    fn log_cache_extends_on_demand() {
        let mut cache = LogCache::new();
        assert_eq!(cache.ln(1), 0.0);
        assert!((cache.ln(8) - 8f32.ln()).abs() < 1e-6);
        assert!((cache.ln(3) - 3f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn normalize_exp_is_shift_invariant() {
        let a = normalize_exp(&[0.0, 1.0, 2.0]);
        let b = normalize_exp(&[100.0, 101.0, 102.0]);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
        let total: f32 = a.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn select_categorical_respects_mass() {
        let probs = [0.0, 0.75, 0.25];
        assert_eq!(select_categorical(&probs, 0.1), 1);
        assert_eq!(select_categorical(&probs, 0.74), 1);
        assert_eq!(select_categorical(&probs, 0.8), 2);
    }

    #[test]
    fn quadrants_partition_the_patch() {
        let n = 8;
        let mut counts = [0usize; 4];
        for x in 0..n {
            for y in 0..n {
                counts[quadrant_of((x, y), n)] += 1;
            }
        }
        assert_eq!(counts, [16, 16, 16, 16]);
    }
}
