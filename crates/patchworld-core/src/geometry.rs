//! Integer grid geometry: positions, directions, and patch decomposition.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Signed cell coordinate on the infinite grid.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean length.
    #[must_use]
    pub const fn squared_length(self) -> u64 {
        (self.x * self.x + self.y * self.y) as u64
    }

    /// Chebyshev (L-infinity) distance to `other`.
    #[must_use]
    pub const fn chebyshev_distance(self, other: Self) -> u64 {
        let dx = (self.x - other.x).unsigned_abs();
        let dy = (self.y - other.y).unsigned_abs();
        if dx > dy { dx } else { dy }
    }

    /// Decompose a world position into a patch coordinate and the cell offset
    /// within that patch, using floor division so negative coordinates map
    /// into the patch to their lower-left.
    #[must_use]
    pub fn to_patch(self, patch_size: u32) -> (Position, (u32, u32)) {
        let n = i64::from(patch_size);
        let patch = Position::new(self.x.div_euclid(n), self.y.div_euclid(n));
        let cell = (self.x.rem_euclid(n) as u32, self.y.rem_euclid(n) as u32);
        (patch, cell)
    }

    /// The world position of a patch's bottom-left cell.
    #[must_use]
    pub fn patch_origin(self, patch_size: u32) -> Position {
        let n = i64::from(patch_size);
        Position::new(self.x * n, self.y * n)
    }

    /// Scale both coordinates by `factor`.
    #[must_use]
    pub const fn scaled(self, factor: i64) -> Position {
        Position::new(self.x * factor, self.y * factor)
    }
}

impl Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        Position::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Position {
    type Output = Position;

    fn sub(self, rhs: Position) -> Position {
        Position::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// One of the four grid directions. Serves double duty as an agent's facing
/// (in world frame) and as a relative action direction (UP = forward,
/// DOWN = backward, LEFT/RIGHT = quarter turns).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// All four directions, in tag order.
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    /// Stable index used for policy tables and serialization.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Direction::Up => 0,
            Direction::Down => 1,
            Direction::Left => 2,
            Direction::Right => 3,
        }
    }

    /// Inverse of [`Direction::index`].
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Direction> {
        match index {
            0 => Some(Direction::Up),
            1 => Some(Direction::Down),
            2 => Some(Direction::Left),
            3 => Some(Direction::Right),
            _ => None,
        }
    }

    /// Unit offset of this direction in the world frame.
    #[must_use]
    pub const fn offset(self) -> Position {
        match self {
            Direction::Up => Position::new(0, 1),
            Direction::Down => Position::new(0, -1),
            Direction::Left => Position::new(-1, 0),
            Direction::Right => Position::new(1, 0),
        }
    }

    /// The opposite direction.
    #[must_use]
    pub const fn opposite(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    /// Quarter turn counterclockwise.
    #[must_use]
    pub const fn rotated_left(self) -> Direction {
        match self {
            Direction::Up => Direction::Left,
            Direction::Left => Direction::Down,
            Direction::Down => Direction::Right,
            Direction::Right => Direction::Up,
        }
    }

    /// Quarter turn clockwise.
    #[must_use]
    pub const fn rotated_right(self) -> Direction {
        match self {
            Direction::Up => Direction::Right,
            Direction::Right => Direction::Down,
            Direction::Down => Direction::Left,
            Direction::Left => Direction::Up,
        }
    }

    /// Resolve a relative action direction against a facing, yielding the
    /// world-frame direction of travel (or the new facing for a turn).
    #[must_use]
    pub const fn relative_to(self, facing: Direction) -> Direction {
        match self {
            Direction::Up => facing,
            Direction::Down => facing.opposite(),
            Direction::Left => facing.rotated_left(),
            Direction::Right => facing.rotated_right(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_decomposition_handles_negative_coordinates() {
        let n = 8;
        let (patch, cell) = Position::new(-1, -1).to_patch(n);
        assert_eq!(patch, Position::new(-1, -1));
        assert_eq!(cell, (7, 7));

        let (patch, cell) = Position::new(0, 0).to_patch(n);
        assert_eq!(patch, Position::new(0, 0));
        assert_eq!(cell, (0, 0));

        let (patch, cell) = Position::new(17, -9).to_patch(n);
        assert_eq!(patch, Position::new(2, -2));
        assert_eq!(cell, (1, 7));
    }

    #[test]
    fn patch_origin_round_trips() {
        let n = 4;
        for world in [
            Position::new(-5, 3),
            Position::new(0, 0),
            Position::new(13, -13),
        ] {
            let (patch, cell) = world.to_patch(n);
            let origin = patch.patch_origin(n);
            assert_eq!(
                origin + Position::new(i64::from(cell.0), i64::from(cell.1)),
                world
            );
        }
    }

    #[test]
    fn relative_directions_compose_with_facing() {
        assert_eq!(
            Direction::Up.relative_to(Direction::Right),
            Direction::Right
        );
        assert_eq!(
            Direction::Down.relative_to(Direction::Right),
            Direction::Left
        );
        assert_eq!(Direction::Left.relative_to(Direction::Up), Direction::Left);
        assert_eq!(
            Direction::Right.relative_to(Direction::Down),
            Direction::Left
        );
    }

    #[test]
    fn rotations_are_inverses() {
        for dir in Direction::ALL {
            assert_eq!(dir.rotated_left().rotated_right(), dir);
            assert_eq!(dir.opposite().opposite(), dir);
            assert_eq!(Direction::from_index(dir.index()), Some(dir));
        }
    }
}
