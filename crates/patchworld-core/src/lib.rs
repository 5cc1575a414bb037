//! World-generation and stepping core for the patchworld simulation
//! environment: an infinite two-dimensional grid materialized lazily as
//! patches of items sampled from a user-defined Gibbs field, stepped in
//! lock-step for a fleet of embodied agents that perceive scent and vision.

pub mod agent;
pub mod coordinator;
pub mod energy;
pub mod field;
pub mod geometry;
pub mod patch;
pub mod perception;
pub mod scent;
pub mod sim;

pub use agent::{Action, AgentState};
pub use coordinator::Responder;
pub use energy::{EnergyError, IntensityFn, InteractionFn, RegenerationFn};
pub use geometry::{Direction, Position};
pub use patch::{ItemInstance, Patch, PatchState};
pub use sim::{MapPatch, Simulator, StepListener, StepOutcome, WorldSnapshot};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by simulator operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimulatorError {
    /// Indicates an invalid configuration value, fatal at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// An energy function tag or argument array failed validation.
    #[error(transparent)]
    Energy(#[from] EnergyError),
    /// The referenced agent does not exist.
    #[error("no agent with id {0}")]
    InvalidAgentId(u64),
    /// The referenced semaphore does not exist.
    #[error("no semaphore with id {0}")]
    InvalidSemaphoreId(u64),
    /// The agent already has an action queued for this tick.
    #[error("agent {0} already has an action queued for this tick")]
    ActionAlreadyQueued(u64),
    /// A request argument fell outside the configured bounds.
    #[error("out of range: {0}")]
    OutOfRange(&'static str),
}

/// How simultaneous moves into the same cell are resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// All movers reach their targets; agents may share a cell.
    NoCollisions,
    /// Deterministic resolution by ascending agent id.
    FirstComeFirstServe,
    /// Movers are shuffled with the simulator RNG before resolution.
    Random,
}

/// Which sampler the field generator runs over new patches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SamplingMode {
    /// Metropolis-Hastings birth/death proposals, one per patch per sweep.
    MetropolisHastings,
    /// Systematic-scan Gibbs over interleaved quadrants.
    Gibbs,
}

/// Immutable description of one item type in the world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemType {
    pub name: String,
    /// Scent signature, length `scent_dimension`.
    pub scent: Vec<f32>,
    /// Color signature, length `color_dimension`.
    pub color: Vec<f32>,
    /// Per-type inventory an agent must already hold to auto-collect this
    /// type, length `item_type_count`.
    pub required_item_counts: Vec<u32>,
    /// Per-type inventory deducted when this type is collected, length
    /// `item_type_count`.
    pub required_item_costs: Vec<u32>,
    /// Whether agents are unable to walk through this item.
    pub blocks_movement: bool,
    /// Fraction of light blocked by this item along a vision ray, in [0, 1].
    pub visual_occlusion: f32,
    /// Ticks until an item of this type expires, 0 for eternal items.
    pub lifetime: u64,
    pub intensity: IntensityFn,
    /// Pairwise interaction with every item type, length `item_type_count`.
    pub interactions: Vec<InteractionFn>,
    pub regeneration: RegenerationFn,
}

/// Immutable simulator configuration. Validated once at construction; the
/// item catalog cannot change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulatorConfig {
    /// Seed for the simulator RNG; identical seeds and action sequences
    /// reproduce identical worlds.
    pub random_seed: u64,
    /// Side length `n` of a patch in cells; a power of two is recommended.
    pub patch_size: u32,
    /// Metropolis-Hastings sweeps run over each newly generated patch batch.
    pub mcmc_iterations: u32,
    pub scent_dimension: usize,
    pub color_dimension: usize,
    /// Vision radius `V`; perception covers the (2V+1)^2 square.
    pub vision_range: u32,
    pub max_steps_per_movement: u32,
    /// Permitted relative movement directions, indexed by [`Direction::index`].
    pub allowed_movement_directions: [bool; 4],
    /// Permitted relative turn directions, indexed by [`Direction::index`].
    pub allowed_turn_directions: [bool; 4],
    pub no_op_allowed: bool,
    pub item_types: Vec<ItemType>,
    /// Color painted for agents in vision output, length `color_dimension`.
    pub agent_color: Vec<f32>,
    pub collision_policy: CollisionPolicy,
    /// Scent retained per tick, in (0, 1).
    pub scent_decay: f32,
    /// Scent shared with each 4-neighbor per tick, in [0, 1).
    pub scent_diffusion: f32,
    /// Ticks a removed item keeps contributing decayed scent.
    pub removed_item_lifetime: u64,
    /// Angular width of the vision cone in radians; 2*pi sees everywhere.
    pub agent_field_of_view: f32,
    pub sampling_mode: SamplingMode,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            random_seed: 0,
            patch_size: 32,
            mcmc_iterations: 4_000,
            scent_dimension: 3,
            color_dimension: 3,
            vision_range: 5,
            max_steps_per_movement: 1,
            allowed_movement_directions: [true; 4],
            allowed_turn_directions: [true; 4],
            no_op_allowed: true,
            item_types: Vec::new(),
            agent_color: vec![0.0; 3],
            collision_policy: CollisionPolicy::FirstComeFirstServe,
            scent_decay: 0.4,
            scent_diffusion: 0.14,
            removed_item_lifetime: 2_000,
            agent_field_of_view: std::f32::consts::TAU,
            sampling_mode: SamplingMode::MetropolisHastings,
        }
    }
}

impl SimulatorConfig {
    /// Validate the configuration, including the shape of every item type
    /// against the catalog dimensions.
    pub fn validate(&self) -> Result<(), SimulatorError> {
        if self.patch_size < 2 {
            return Err(SimulatorError::InvalidConfig(
                "patch_size must be at least 2",
            ));
        }
        if self.scent_dimension == 0 || self.color_dimension == 0 {
            return Err(SimulatorError::InvalidConfig(
                "scent and color dimensions must be non-zero",
            ));
        }
        if self.max_steps_per_movement == 0 {
            return Err(SimulatorError::InvalidConfig(
                "max_steps_per_movement must be at least 1",
            ));
        }
        if !(self.scent_decay > 0.0 && self.scent_decay < 1.0) {
            return Err(SimulatorError::InvalidConfig(
                "scent_decay must lie in (0, 1)",
            ));
        }
        if !(0.0..1.0).contains(&self.scent_diffusion) {
            return Err(SimulatorError::InvalidConfig(
                "scent_diffusion must lie in [0, 1)",
            ));
        }
        if !(self.agent_field_of_view > 0.0
            && self.agent_field_of_view <= std::f32::consts::TAU + f32::EPSILON)
        {
            return Err(SimulatorError::InvalidConfig(
                "agent_field_of_view must lie in (0, 2*pi]",
            ));
        }
        if self.agent_color.len() != self.color_dimension {
            return Err(SimulatorError::InvalidConfig(
                "agent_color length must equal color_dimension",
            ));
        }
        let type_count = self.item_types.len();
        for item in &self.item_types {
            if item.scent.len() != self.scent_dimension {
                return Err(SimulatorError::InvalidConfig(
                    "item scent length must equal scent_dimension",
                ));
            }
            if item.color.len() != self.color_dimension {
                return Err(SimulatorError::InvalidConfig(
                    "item color length must equal color_dimension",
                ));
            }
            if item.required_item_counts.len() != type_count
                || item.required_item_costs.len() != type_count
            {
                return Err(SimulatorError::InvalidConfig(
                    "required item counts and costs must cover every item type",
                ));
            }
            if item.interactions.len() != type_count {
                return Err(SimulatorError::InvalidConfig(
                    "interaction list must cover every item type",
                ));
            }
            if !(0.0..=1.0).contains(&item.visual_occlusion) {
                return Err(SimulatorError::InvalidConfig(
                    "visual_occlusion must lie in [0, 1]",
                ));
            }
        }
        Ok(())
    }

    /// Number of item types in the catalog.
    #[must_use]
    pub fn item_type_count(&self) -> usize {
        self.item_types.len()
    }

    /// Side length of the vision square, `2 * vision_range + 1`.
    #[must_use]
    pub const fn vision_side(&self) -> usize {
        2 * self.vision_range as usize + 1
    }

    /// Length of a flattened vision buffer.
    #[must_use]
    pub const fn vision_len(&self) -> usize {
        self.vision_side() * self.vision_side() * self.color_dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_item_config() -> SimulatorConfig {
        SimulatorConfig {
            scent_dimension: 1,
            color_dimension: 1,
            agent_color: vec![0.5],
            item_types: vec![ItemType {
                name: "berry".to_string(),
                scent: vec![1.0],
                color: vec![1.0],
                required_item_counts: vec![0],
                required_item_costs: vec![0],
                blocks_movement: false,
                visual_occlusion: 0.0,
                lifetime: 0,
                intensity: IntensityFn::Constant(-3.0),
                interactions: vec![InteractionFn::Zero],
                regeneration: RegenerationFn::Zero,
            }],
            ..SimulatorConfig::default()
        }
    }

    #[test]
    fn default_config_with_items_validates() {
        one_item_config().validate().expect("valid config");
    }

    #[test]
    fn validation_rejects_shape_mismatches() {
        let mut config = one_item_config();
        config.item_types[0].scent = vec![1.0, 2.0];
        assert!(config.validate().is_err());

        let mut config = one_item_config();
        config.item_types[0].interactions = Vec::new();
        assert!(config.validate().is_err());

        let mut config = one_item_config();
        config.agent_color = vec![0.1, 0.2];
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_bad_scalars() {
        let mut config = one_item_config();
        config.scent_decay = 1.0;
        assert!(config.validate().is_err());

        let mut config = one_item_config();
        config.scent_diffusion = 1.0;
        assert!(config.validate().is_err());

        let mut config = one_item_config();
        config.patch_size = 1;
        assert!(config.validate().is_err());

        let mut config = one_item_config();
        config.item_types[0].visual_occlusion = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn vision_buffer_dimensions() {
        let config = SimulatorConfig {
            vision_range: 2,
            color_dimension: 3,
            ..SimulatorConfig::default()
        };
        assert_eq!(config.vision_side(), 5);
        assert_eq!(config.vision_len(), 75);
    }
}
