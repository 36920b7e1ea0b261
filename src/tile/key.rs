//! Tile identity.

use std::fmt;

/// Position of a tile in the grid of mip level `z` (0 = full resolution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl TileKey {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The tile one level up whose area contains this one, or `None` at the
    /// top of the representable range.
    pub fn parent(&self) -> Option<Self> {
        Some(Self {
            x: self.x.div_euclid(2),
            y: self.y.div_euclid(2),
            z: self.z.checked_add(1)?,
        })
    }

    /// Which quadrant of [`parent`](Self::parent) this tile covers.
    pub fn quadrant_in_parent(&self) -> Quadrant {
        Quadrant::from_offsets(self.x.rem_euclid(2) as usize, self.y.rem_euclid(2) as usize)
    }

    /// The level `z - 1` tile covering quadrant `(i, j)` of this one.
    ///
    /// `None` when the child's coordinates do not fit in `i32`; such a tile
    /// can never have been stored.
    pub fn child(&self, i: usize, j: usize) -> Option<Self> {
        Some(Self {
            x: self.x.checked_mul(2)?.checked_add((i & 1) as i32)?,
            y: self.y.checked_mul(2)?.checked_add((j & 1) as i32)?,
            z: self.z.checked_sub(1)?,
        })
    }

    /// Pixel coordinates of the tile's top-left corner, clamped to `i32`.
    pub fn pixel_origin(&self, tile_width: u32, tile_height: u32) -> (i32, i32) {
        let clamp = |v: i64| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        (
            clamp(self.x as i64 * tile_width as i64),
            clamp(self.y as i64 * tile_height as i64),
        )
    }

    /// Morton code interleaving the low 21 bits of x, y and z.
    ///
    /// Used to write the on-disk index in spatial order.
    pub fn z_order(&self) -> u64 {
        let mut value = 0u64;
        for bit in (0..21).rev() {
            value <<= 1;
            value |= ((self.x >> bit) & 1) as u64;
            value <<= 1;
            value |= ((self.y >> bit) & 1) as u64;
            value <<= 1;
            value |= ((self.z >> bit) & 1) as u64;
        }
        value
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// One quarter of a tile, in the order top-left, top-right, bottom-left,
/// bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quadrant {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::TopLeft,
        Quadrant::TopRight,
        Quadrant::BottomLeft,
        Quadrant::BottomRight,
    ];

    /// `i` is the horizontal half, `j` the vertical half.
    pub fn from_offsets(i: usize, j: usize) -> Self {
        match (i & 1, j & 1) {
            (0, 0) => Quadrant::TopLeft,
            (1, 0) => Quadrant::TopRight,
            (0, _) => Quadrant::BottomLeft,
            _ => Quadrant::BottomRight,
        }
    }

    pub fn offsets(self) -> (usize, usize) {
        match self {
            Quadrant::TopLeft => (0, 0),
            Quadrant::TopRight => (1, 0),
            Quadrant::BottomLeft => (0, 1),
            Quadrant::BottomRight => (1, 1),
        }
    }

    pub fn bit(self) -> u8 {
        match self {
            Quadrant::TopLeft => 0b0001,
            Quadrant::TopRight => 0b0010,
            Quadrant::BottomLeft => 0b0100,
            Quadrant::BottomRight => 0b1000,
        }
    }
}
