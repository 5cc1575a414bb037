//! Agent perception: scent sampled at the agent's cell and a rotated,
//! ray-occluded vision window.

use crate::geometry::{Direction, Position};
use crate::patch::{lock_patch, Patch, PatchStore};
use crate::SimulatorConfig;
use std::collections::HashMap;
use std::sync::MutexGuard;

/// Read-only inputs shared by every agent's perception pass.
pub struct PerceptionContext<'a> {
    pub config: &'a SimulatorConfig,
    pub store: &'a PatchStore,
    /// Positions of every agent, for painting agents into vision.
    pub agent_positions: &'a [Position],
}

/// Compute the scent and vision buffers for an agent at `position` facing
/// `direction`.
///
/// Vision is returned in the agent-relative frame: the facing direction maps
/// to +y, and the buffer is row-major over `(y, x)` with `color_dimension`
/// channels per cell. Cells outside the field-of-view cone are zero.
#[must_use]
pub fn perceive(
    ctx: &PerceptionContext<'_>,
    position: Position,
    direction: Direction,
) -> (Vec<f32>, Vec<f32>) {
    (read_scent(ctx, position), compute_vision(ctx, position, direction))
}

/// Scent at the agent's own cell, after any catch-up has run.
#[must_use]
pub fn read_scent(ctx: &PerceptionContext<'_>, position: Position) -> Vec<f32> {
    let config = ctx.config;
    let (patch_pos, cell) = position.to_patch(config.patch_size);
    ctx.store
        .with_patch(patch_pos, |patch| {
            patch
                .scent_at(cell, config.patch_size, config.scent_dimension)
                .to_vec()
        })
        .unwrap_or_else(|| vec![0.0; config.scent_dimension])
}

/// Compose the vision window for one agent.
#[must_use]
pub fn compute_vision(
    ctx: &PerceptionContext<'_>,
    position: Position,
    direction: Direction,
) -> Vec<f32> {
    let config = ctx.config;
    let range = i64::from(config.vision_range);
    let side = config.vision_side();
    let dim = config.color_dimension;
    let mut vision = vec![0.0f32; config.vision_len()];

    // Everything the window can reach, gathered under ascending patch locks.
    let (min_patch, _) =
        (position - Position::new(range, range)).to_patch(config.patch_size);
    let (max_patch, _) =
        (position + Position::new(range, range)).to_patch(config.patch_size);
    let mut coords = Vec::new();
    for py in min_patch.y..=max_patch.y {
        for px in min_patch.x..=max_patch.x {
            coords.push(Position::new(px, py));
        }
    }
    let handles = ctx.store.handles_for(coords);
    let guards: Vec<MutexGuard<'_, Patch>> =
        handles.iter().map(|(_, arc)| lock_patch(arc)).collect();

    let mut items: HashMap<Position, u32> = HashMap::new();
    for guard in &guards {
        for item in guard.alive_items() {
            if item.location.chebyshev_distance(position) <= range as u64 {
                items.insert(item.location, item.item_type);
            }
        }
    }
    let mut agents_here: HashMap<Position, u32> = HashMap::new();
    for agent_pos in ctx.agent_positions {
        if agent_pos.chebyshev_distance(position) <= range as u64 {
            *agents_here.entry(*agent_pos).or_insert(0) += 1;
        }
    }
    drop(guards);

    let forward = direction.offset();
    let right = direction.rotated_right().offset();
    let half_fov = config.agent_field_of_view / 2.0;

    for frame_y in -range..=range {
        for frame_x in -range..=range {
            if (frame_x, frame_y) != (0, 0) {
                let bearing = (frame_x as f32).atan2(frame_y as f32).abs();
                if bearing > half_fov + 1e-6 {
                    continue;
                }
            }
            let offset = right.scaled(frame_x) + forward.scaled(frame_y);
            let target = position + offset;

            let item_color = items
                .get(&target)
                .map(|&t| ctx.config.item_types[t as usize].color.as_slice());
            let agent_count = agents_here.get(&target).copied().unwrap_or(0);
            if item_color.is_none() && agent_count == 0 {
                continue;
            }

            let transmittance = ray_transmittance(ctx, &items, position, target);
            if transmittance <= 0.0 {
                continue;
            }

            let base =
                ((frame_y + range) as usize * side + (frame_x + range) as usize) * dim;
            if let Some(color) = item_color {
                for (slot, value) in vision[base..base + dim].iter_mut().zip(color) {
                    *slot += transmittance * value;
                }
            }
            for _ in 0..agent_count {
                for (slot, value) in vision[base..base + dim]
                    .iter_mut()
                    .zip(&ctx.config.agent_color)
                {
                    *slot += transmittance * value;
                }
            }
        }
    }
    vision
}

/// Accumulated transmittance along the sight line, multiplying in
/// `1 - visual_occlusion` for every occupied cell strictly between the agent
/// and the target.
fn ray_transmittance(
    ctx: &PerceptionContext<'_>,
    items: &HashMap<Position, u32>,
    from: Position,
    to: Position,
) -> f32 {
    let delta = to - from;
    let steps = delta.x.abs().max(delta.y.abs());
    if steps <= 1 {
        return 1.0;
    }
    let mut transmittance = 1.0f32;
    for k in 1..steps {
        let t = k as f64 / steps as f64;
        let cell = Position::new(
            from.x + (delta.x as f64 * t).round() as i64,
            from.y + (delta.y as f64 * t).round() as i64,
        );
        if cell == from || cell == to {
            continue;
        }
        if let Some(&item_type) = items.get(&cell) {
            transmittance *= 1.0 - ctx.config.item_types[item_type as usize].visual_occlusion;
            if transmittance <= 0.0 {
                return 0.0;
            }
        }
    }
    transmittance
}
