//! Tagged energy functions for the Gibbs field: per-type intensity, pairwise
//! interaction, and regeneration.
//!
//! Functions are identified by a small integer tag plus a float argument
//! array. The tag is the serialization form; constructing a function from a
//! tag validates the argument count up front so evaluation never has to.

use crate::geometry::Position;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when resolving a tagged energy function.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnergyError {
    #[error("unknown {kind} function tag {tag}")]
    UnknownTag { kind: &'static str, tag: u64 },
    #[error("{kind} function tag {tag} expects {expected} argument(s), got {actual}")]
    BadArgCount {
        kind: &'static str,
        tag: u64,
        expected: &'static str,
        actual: usize,
    },
}

/// Final mixing step of 32-bit MurmurHash3.
#[inline]
const fn murmur32_mix(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x45d9_f3b);
    x ^= x >> 16;
    x = x.wrapping_mul(0x45d9_f3b);
    x ^= x >> 16;
    x
}

/// Hash of `(x + shift) / scale` mapped into [0, 1).
#[inline]
fn hash_noise(x: u32, shift: u32, scale: u32) -> f32 {
    murmur32_mix(x.wrapping_add(shift) / scale.max(1)) as f32 / u32::MAX as f32
}

/// Linear interpolation of [`hash_noise`] at the two nearest multiples of
/// `scale`, evaluated at `s`.
#[inline]
fn hash_noise_lerp(s: u32, shift: u32, scale: u32) -> f32 {
    let scale = scale.max(1);
    let x = hash_noise(s, shift, scale);
    let x_next = hash_noise(s.wrapping_add(scale), shift, scale);
    let t = (s % scale) as f32 / scale as f32;
    x * (1.0 - t) + x_next * t
}

/// Per-type placement intensity `f(pos) -> log-weight`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IntensityFn {
    /// `f(pos) = 0`.
    Zero,
    /// `f(pos) = c`.
    Constant(f32),
    /// Pseudorandom radial noise: `bias - amplitude * M'(||pos|| + shift)`
    /// where `M'` is hash noise interpolated at multiples of `scale`.
    RadialHash {
        shift: f32,
        scale: f32,
        bias: f32,
        amplitude: f32,
    },
}

impl IntensityFn {
    pub const ZERO_TAG: u64 = 0;
    pub const CONSTANT_TAG: u64 = 1;
    pub const RADIAL_HASH_TAG: u64 = 2;

    /// Resolve a tag and argument array into a callable.
    pub fn from_tag_args(tag: u64, args: &[f32]) -> Result<Self, EnergyError> {
        match tag {
            Self::ZERO_TAG => match args {
                [] => Ok(IntensityFn::Zero),
                _ => Err(bad_args("intensity", tag, "0", args.len())),
            },
            Self::CONSTANT_TAG => match args {
                [c, ..] => Ok(IntensityFn::Constant(*c)),
                [] => Err(bad_args("intensity", tag, "at least 1", 0)),
            },
            Self::RADIAL_HASH_TAG => match args {
                [shift, scale, bias, amplitude] => Ok(IntensityFn::RadialHash {
                    shift: *shift,
                    scale: *scale,
                    bias: *bias,
                    amplitude: *amplitude,
                }),
                _ => Err(bad_args("intensity", tag, "4", args.len())),
            },
            _ => Err(EnergyError::UnknownTag {
                kind: "intensity",
                tag,
            }),
        }
    }

    /// Serialization tag.
    #[must_use]
    pub const fn tag(&self) -> u64 {
        match self {
            IntensityFn::Zero => Self::ZERO_TAG,
            IntensityFn::Constant(_) => Self::CONSTANT_TAG,
            IntensityFn::RadialHash { .. } => Self::RADIAL_HASH_TAG,
        }
    }

    /// Argument array in tag order.
    #[must_use]
    pub fn args(&self) -> Vec<f32> {
        match self {
            IntensityFn::Zero => Vec::new(),
            IntensityFn::Constant(c) => vec![*c],
            IntensityFn::RadialHash {
                shift,
                scale,
                bias,
                amplitude,
            } => vec![*shift, *scale, *bias, *amplitude],
        }
    }

    /// True when the value depends only on displacement, never on the
    /// absolute position. Stationary intensities are also constant.
    #[must_use]
    pub const fn is_stationary(&self) -> bool {
        matches!(self, IntensityFn::Zero | IntensityFn::Constant(_))
    }

    /// Evaluate at a world position.
    #[must_use]
    pub fn evaluate(&self, pos: Position) -> f32 {
        match self {
            IntensityFn::Zero => 0.0,
            IntensityFn::Constant(c) => *c,
            IntensityFn::RadialHash {
                shift,
                scale,
                bias,
                amplitude,
            } => {
                let shift_u = *shift as u32;
                let scale_u = (*scale as u32).max(1);
                let s = ((pos.squared_length() as f64).sqrt() as u32).wrapping_add(shift_u);
                bias - hash_noise_lerp(s, shift_u, scale_u) * amplitude
            }
        }
    }
}

/// Pairwise interaction `f(pos1, pos2) -> log-weight` between an item of the
/// owning type at `pos1` and an item of another type at `pos2`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum InteractionFn {
    /// `f = 0`.
    Zero,
    /// Two nested boxes over the squared distance.
    PiecewiseBox {
        first_cutoff: f32,
        second_cutoff: f32,
        first_value: f32,
        second_value: f32,
    },
    /// Cross shape over the Chebyshev distance, with separate on-axis and
    /// off-axis values in two bands.
    Cross {
        inner_radius: f32,
        outer_radius: f32,
        inner_axis: f32,
        outer_axis: f32,
        inner_diagonal: f32,
        outer_diagonal: f32,
    },
    /// [`InteractionFn::Cross`] with the band radii perturbed by hash noise
    /// of the first position's x coordinate.
    CrossHash {
        scale: f32,
        base: f32,
        slope: f32,
        band_width: f32,
        inner_axis: f32,
        outer_axis: f32,
        inner_diagonal: f32,
        outer_diagonal: f32,
    },
    /// +1 within the Moore neighborhood, strongly repulsive outside.
    Moore,
    /// +1 within the von Neumann neighborhood, strongly repulsive outside.
    Four,
    /// `amplitude * exp(-||pos1 - pos2||^2 / (2 sigma^2))`.
    Gaussian { sigma: f32, amplitude: f32 },
}

impl InteractionFn {
    pub const ZERO_TAG: u64 = 0;
    pub const PIECEWISE_BOX_TAG: u64 = 1;
    pub const CROSS_TAG: u64 = 2;
    pub const CROSS_HASH_TAG: u64 = 3;
    pub const MOORE_TAG: u64 = 4;
    pub const GAUSSIAN_TAG: u64 = 5;
    pub const FOUR_TAG: u64 = 6;

    /// Resolve a tag and argument array into a callable.
    pub fn from_tag_args(tag: u64, args: &[f32]) -> Result<Self, EnergyError> {
        match tag {
            Self::ZERO_TAG => match args {
                [] => Ok(InteractionFn::Zero),
                _ => Err(bad_args("interaction", tag, "0", args.len())),
            },
            Self::PIECEWISE_BOX_TAG => match args {
                [l1, l2, v1, v2] => Ok(InteractionFn::PiecewiseBox {
                    first_cutoff: *l1,
                    second_cutoff: *l2,
                    first_value: *v1,
                    second_value: *v2,
                }),
                _ => Err(bad_args("interaction", tag, "4", args.len())),
            },
            Self::CROSS_TAG => match args {
                [d1, d2, a1, a2, b1, b2] => Ok(InteractionFn::Cross {
                    inner_radius: *d1,
                    outer_radius: *d2,
                    inner_axis: *a1,
                    outer_axis: *a2,
                    inner_diagonal: *b1,
                    outer_diagonal: *b2,
                }),
                _ => Err(bad_args("interaction", tag, "6", args.len())),
            },
            Self::CROSS_HASH_TAG => match args {
                [s, c, k, w, a1, a2, b1, b2] => Ok(InteractionFn::CrossHash {
                    scale: *s,
                    base: *c,
                    slope: *k,
                    band_width: *w,
                    inner_axis: *a1,
                    outer_axis: *a2,
                    inner_diagonal: *b1,
                    outer_diagonal: *b2,
                }),
                _ => Err(bad_args("interaction", tag, "8", args.len())),
            },
            Self::MOORE_TAG => match args {
                [] => Ok(InteractionFn::Moore),
                _ => Err(bad_args("interaction", tag, "0", args.len())),
            },
            Self::GAUSSIAN_TAG => match args {
                [sigma, amplitude] => Ok(InteractionFn::Gaussian {
                    sigma: *sigma,
                    amplitude: *amplitude,
                }),
                _ => Err(bad_args("interaction", tag, "2", args.len())),
            },
            Self::FOUR_TAG => match args {
                [] => Ok(InteractionFn::Four),
                _ => Err(bad_args("interaction", tag, "0", args.len())),
            },
            _ => Err(EnergyError::UnknownTag {
                kind: "interaction",
                tag,
            }),
        }
    }

    /// Serialization tag.
    #[must_use]
    pub const fn tag(&self) -> u64 {
        match self {
            InteractionFn::Zero => Self::ZERO_TAG,
            InteractionFn::PiecewiseBox { .. } => Self::PIECEWISE_BOX_TAG,
            InteractionFn::Cross { .. } => Self::CROSS_TAG,
            InteractionFn::CrossHash { .. } => Self::CROSS_HASH_TAG,
            InteractionFn::Moore => Self::MOORE_TAG,
            InteractionFn::Gaussian { .. } => Self::GAUSSIAN_TAG,
            InteractionFn::Four => Self::FOUR_TAG,
        }
    }

    /// Argument array in tag order.
    #[must_use]
    pub fn args(&self) -> Vec<f32> {
        match self {
            InteractionFn::Zero | InteractionFn::Moore | InteractionFn::Four => Vec::new(),
            InteractionFn::PiecewiseBox {
                first_cutoff,
                second_cutoff,
                first_value,
                second_value,
            } => vec![*first_cutoff, *second_cutoff, *first_value, *second_value],
            InteractionFn::Cross {
                inner_radius,
                outer_radius,
                inner_axis,
                outer_axis,
                inner_diagonal,
                outer_diagonal,
            } => vec![
                *inner_radius,
                *outer_radius,
                *inner_axis,
                *outer_axis,
                *inner_diagonal,
                *outer_diagonal,
            ],
            InteractionFn::CrossHash {
                scale,
                base,
                slope,
                band_width,
                inner_axis,
                outer_axis,
                inner_diagonal,
                outer_diagonal,
            } => vec![
                *scale,
                *base,
                *slope,
                *band_width,
                *inner_axis,
                *outer_axis,
                *inner_diagonal,
                *outer_diagonal,
            ],
            InteractionFn::Gaussian { sigma, amplitude } => vec![*sigma, *amplitude],
        }
    }

    /// True when the value never differs from zero.
    #[must_use]
    pub const fn is_constant(&self) -> bool {
        matches!(self, InteractionFn::Zero)
    }

    /// True when the value depends only on the displacement `pos1 - pos2`.
    /// Stationary, non-constant interactions are precomputed into
    /// displacement tables by the sampler cache.
    #[must_use]
    pub const fn is_stationary(&self) -> bool {
        !matches!(self, InteractionFn::CrossHash { .. })
    }

    /// Evaluate for an ordered pair of world positions.
    #[must_use]
    pub fn evaluate(&self, pos1: Position, pos2: Position) -> f32 {
        let diff = pos1 - pos2;
        match self {
            InteractionFn::Zero => 0.0,
            InteractionFn::PiecewiseBox {
                first_cutoff,
                second_cutoff,
                first_value,
                second_value,
            } => {
                let squared = diff.squared_length() as f32;
                if squared < *first_cutoff {
                    *first_value
                } else if squared < *second_cutoff {
                    *second_value
                } else {
                    0.0
                }
            }
            InteractionFn::Cross {
                inner_radius,
                outer_radius,
                inner_axis,
                outer_axis,
                inner_diagonal,
                outer_diagonal,
            } => cross_value(
                diff,
                *inner_radius,
                *outer_radius,
                *inner_axis,
                *outer_axis,
                *inner_diagonal,
                *outer_diagonal,
            ),
            InteractionFn::CrossHash {
                scale,
                base,
                slope,
                band_width,
                inner_axis,
                outer_axis,
                inner_diagonal,
                outer_diagonal,
            } => {
                let scale_u = (*scale as u32).max(1);
                let inner = slope * hash_noise_lerp(pos1.x as u32, 0, scale_u) + base;
                let outer = inner + band_width;
                cross_value(
                    diff,
                    inner,
                    outer,
                    *inner_axis,
                    *outer_axis,
                    *inner_diagonal,
                    *outer_diagonal,
                )
            }
            InteractionFn::Moore => {
                if diff.x.abs() < 2 && diff.y.abs() < 2 {
                    1.0
                } else {
                    -200.0
                }
            }
            InteractionFn::Four => {
                if (diff.x.abs() < 1 && diff.y.abs() < 2)
                    || (diff.y.abs() < 1 && diff.x.abs() < 2)
                {
                    1.0
                } else {
                    -200.0
                }
            }
            InteractionFn::Gaussian { sigma, amplitude } => {
                let two_sigma_sq = 2.0 * sigma * sigma;
                let dx = diff.x as f32;
                let dy = diff.y as f32;
                amplitude * (-dx * dx / two_sigma_sq - dy * dy / two_sigma_sq).exp()
            }
        }
    }
}

fn cross_value(
    diff: Position,
    inner_radius: f32,
    outer_radius: f32,
    inner_axis: f32,
    outer_axis: f32,
    inner_diagonal: f32,
    outer_diagonal: f32,
) -> f32 {
    let dist = diff.x.abs().max(diff.y.abs()) as f32;
    let on_axis = diff.x == 0 || diff.y == 0;
    if dist <= inner_radius {
        if on_axis { inner_axis } else { inner_diagonal }
    } else if dist <= outer_radius {
        if on_axis { outer_axis } else { outer_diagonal }
    } else {
        0.0
    }
}

/// Per-type regeneration rate `f(pos, tick) -> rate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RegenerationFn {
    /// `f = 0` (the type never regenerates).
    Zero,
    /// `f = c`.
    Constant(f32),
    /// The argument array indexed by tick; ticks beyond the array yield 0.
    Custom(Vec<f32>),
}

impl RegenerationFn {
    pub const ZERO_TAG: u64 = 0;
    pub const CONSTANT_TAG: u64 = 1;
    pub const CUSTOM_TAG: u64 = 2;

    /// Resolve a tag and argument array into a callable.
    pub fn from_tag_args(tag: u64, args: &[f32]) -> Result<Self, EnergyError> {
        match tag {
            Self::ZERO_TAG => match args {
                [] => Ok(RegenerationFn::Zero),
                _ => Err(bad_args("regeneration", tag, "0", args.len())),
            },
            Self::CONSTANT_TAG => match args {
                [c, ..] => Ok(RegenerationFn::Constant(*c)),
                [] => Err(bad_args("regeneration", tag, "at least 1", 0)),
            },
            Self::CUSTOM_TAG => {
                if args.is_empty() {
                    Err(bad_args("regeneration", tag, "at least 1", 0))
                } else {
                    Ok(RegenerationFn::Custom(args.to_vec()))
                }
            }
            _ => Err(EnergyError::UnknownTag {
                kind: "regeneration",
                tag,
            }),
        }
    }

    /// Serialization tag.
    #[must_use]
    pub const fn tag(&self) -> u64 {
        match self {
            RegenerationFn::Zero => Self::ZERO_TAG,
            RegenerationFn::Constant(_) => Self::CONSTANT_TAG,
            RegenerationFn::Custom(_) => Self::CUSTOM_TAG,
        }
    }

    /// Argument array in tag order.
    #[must_use]
    pub fn args(&self) -> Vec<f32> {
        match self {
            RegenerationFn::Zero => Vec::new(),
            RegenerationFn::Constant(c) => vec![*c],
            RegenerationFn::Custom(values) => values.clone(),
        }
    }

    /// True when the value depends on neither position nor tick.
    #[must_use]
    pub const fn is_time_independent(&self) -> bool {
        matches!(self, RegenerationFn::Zero | RegenerationFn::Constant(_))
    }

    /// True when the type never regenerates.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        matches!(self, RegenerationFn::Zero)
    }

    /// Evaluate at a world position and tick.
    #[must_use]
    pub fn evaluate(&self, _pos: Position, tick: u64) -> f32 {
        match self {
            RegenerationFn::Zero => 0.0,
            RegenerationFn::Constant(c) => *c,
            RegenerationFn::Custom(values) => usize::try_from(tick)
                .ok()
                .and_then(|index| values.get(index).copied())
                .unwrap_or(0.0),
        }
    }
}

const fn bad_args(kind: &'static str, tag: u64, expected: &'static str, actual: usize) -> EnergyError {
    EnergyError::BadArgCount {
        kind,
        tag,
        expected,
        actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_through_args() {
        let intensity = IntensityFn::RadialHash {
            shift: 3.0,
            scale: 10.0,
            bias: -2.0,
            amplitude: 4.0,
        };
        let rebuilt = IntensityFn::from_tag_args(intensity.tag(), &intensity.args()).unwrap();
        assert_eq!(rebuilt, intensity);

        let interaction = InteractionFn::Cross {
            inner_radius: 2.0,
            outer_radius: 4.0,
            inner_axis: 10.0,
            outer_axis: -5.0,
            inner_diagonal: 1.0,
            outer_diagonal: -1.0,
        };
        let rebuilt = InteractionFn::from_tag_args(interaction.tag(), &interaction.args()).unwrap();
        assert_eq!(rebuilt, interaction);

        let regeneration = RegenerationFn::Custom(vec![0.5, 0.25, 0.0]);
        let rebuilt =
            RegenerationFn::from_tag_args(regeneration.tag(), &regeneration.args()).unwrap();
        assert_eq!(rebuilt, regeneration);
    }

    #[test]
    fn arg_count_validation() {
        assert!(matches!(
            IntensityFn::from_tag_args(IntensityFn::CONSTANT_TAG, &[]),
            Err(EnergyError::BadArgCount { .. })
        ));
        assert!(matches!(
            InteractionFn::from_tag_args(InteractionFn::PIECEWISE_BOX_TAG, &[1.0]),
            Err(EnergyError::BadArgCount { .. })
        ));
        assert!(matches!(
            InteractionFn::from_tag_args(99, &[]),
            Err(EnergyError::UnknownTag { .. })
        ));
        assert!(matches!(
            RegenerationFn::from_tag_args(RegenerationFn::CUSTOM_TAG, &[]),
            Err(EnergyError::BadArgCount { .. })
        ));
    }

    #[test]
    fn piecewise_box_uses_squared_distance_bands() {
        let f = InteractionFn::PiecewiseBox {
            first_cutoff: 2.0,
            second_cutoff: 10.0,
            first_value: 5.0,
            second_value: -1.0,
        };
        let origin = Position::new(0, 0);
        assert_eq!(f.evaluate(origin, Position::new(1, 0)), 5.0);
        assert_eq!(f.evaluate(origin, Position::new(2, 1)), -1.0);
        assert_eq!(f.evaluate(origin, Position::new(4, 0)), 0.0);
    }

    #[test]
    fn cross_distinguishes_axis_and_diagonal() {
        let f = InteractionFn::Cross {
            inner_radius: 1.0,
            outer_radius: 3.0,
            inner_axis: 10.0,
            outer_axis: 2.0,
            inner_diagonal: -10.0,
            outer_diagonal: -2.0,
        };
        let origin = Position::new(0, 0);
        assert_eq!(f.evaluate(origin, Position::new(0, 1)), 10.0);
        assert_eq!(f.evaluate(origin, Position::new(1, 1)), -10.0);
        assert_eq!(f.evaluate(origin, Position::new(3, 0)), 2.0);
        assert_eq!(f.evaluate(origin, Position::new(2, 2)), -2.0);
        assert_eq!(f.evaluate(origin, Position::new(4, 0)), 0.0);
    }

    #[test]
    fn neighborhood_interactions_penalize_distance() {
        let moore = InteractionFn::Moore;
        let four = InteractionFn::Four;
        let origin = Position::new(0, 0);
        assert_eq!(moore.evaluate(origin, Position::new(1, 1)), 1.0);
        assert_eq!(moore.evaluate(origin, Position::new(2, 0)), -200.0);
        assert_eq!(four.evaluate(origin, Position::new(0, 1)), 1.0);
        assert_eq!(four.evaluate(origin, Position::new(1, 1)), -200.0);
    }

    #[test]
    fn custom_regeneration_is_bounds_checked() {
        let f = RegenerationFn::Custom(vec![0.1, 0.2]);
        let pos = Position::new(0, 0);
        assert_eq!(f.evaluate(pos, 0), 0.1);
        assert_eq!(f.evaluate(pos, 1), 0.2);
        assert_eq!(f.evaluate(pos, 2), 0.0);
        assert_eq!(f.evaluate(pos, u64::MAX), 0.0);
    }

    #[test]
    fn gaussian_peaks_at_zero_displacement_neighbors() {
        let f = InteractionFn::Gaussian {
            sigma: 1.0,
            amplitude: 2.0,
        };
        let origin = Position::new(0, 0);
        let near = f.evaluate(origin, Position::new(1, 0));
        let far = f.evaluate(origin, Position::new(3, 0));
        assert!(near > far);
        assert!((near - 2.0 * (-0.5f32).exp()).abs() < 1e-6);
    }
}
