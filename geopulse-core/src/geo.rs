//! Geometry primitives for the flat world rectangle.
//!
//! Coordinates are longitude/latitude pairs on a flat world spanning
//! `[-180, 180] x [-90, 90]`. There is no wrap-around: a rect never crosses
//! the anti-meridian. Constructors clamp into the world; deserialization
//! does not, so that command validation can reject out-of-range input
//! instead of silently correcting it.

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use smallvec::SmallVec;

/// The rectangle covering the whole world.
pub const WORLD: Rect = Rect {
    x1: -180.0,
    y1: -90.0,
    x2: 180.0,
    y2: 90.0,
};

fn clamp_x(x: f64) -> f64 {
    x.clamp(-180.0, 180.0)
}

fn clamp_y(y: f64) -> f64 {
    y.clamp(-90.0, 90.0)
}

/// A point `(x, y)`, i.e. lon/lat.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    /// Creates a point, clamping the coordinates into the world rectangle.
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x: clamp_x(x),
            y: clamp_y(y),
        }
    }

    /// Whether the point lies inside the world rectangle.
    pub fn is_valid(&self) -> bool {
        (-180.0..=180.0).contains(&self.x) && (-90.0..=90.0).contains(&self.y)
    }
}

// Wire form is the JSON array `[x, y]`.
impl Serialize for Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.x, self.y].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Point {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let [x, y] = <[f64; 2]>::deserialize(deserializer)?;
        Ok(Self { x, y })
    }
}

/// An axis-aligned rectangle `(x1, y1, x2, y2)` with `x1 < x2`, `y1 < y2`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Rect {
    /// Creates a rect, clamping all coordinates into the world rectangle.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            x1: clamp_x(x1),
            y1: clamp_y(y1),
            x2: clamp_x(x2),
            y2: clamp_y(y2),
        }
    }

    /// Whether the rect lies inside the world rectangle and has positive
    /// width and height.
    pub fn is_valid(&self) -> bool {
        (-180.0..=180.0).contains(&self.x1)
            && (-180.0..=180.0).contains(&self.x2)
            && (-90.0..=90.0).contains(&self.y1)
            && (-90.0..=90.0).contains(&self.y2)
            && self.x1 < self.x2
            && self.y1 < self.y2
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// Returns `(width, height)`.
    pub fn size(&self) -> (f64, f64) {
        (self.width(), self.height())
    }

    pub fn center(&self) -> Point {
        Point {
            x: (self.x1 + self.x2) / 2.0,
            y: (self.y1 + self.y2) / 2.0,
        }
    }

    /// Whether the point lies inside the rect, edges included.
    pub fn contains(&self, p: &Point) -> bool {
        self.x1 <= p.x && self.y1 <= p.y && self.x2 >= p.x && self.y2 >= p.y
    }

    /// Whether `other` lies entirely inside the rect, edges included.
    pub fn contains_rect(&self, other: &Self) -> bool {
        self.x1 <= other.x1 && self.y1 <= other.y1 && self.x2 >= other.x2 && self.y2 >= other.y2
    }

    /// Whether the rects are not disjoint on any axis. Touching edges count
    /// as intersecting.
    pub fn intersects(&self, other: &Self) -> bool {
        !(other.x2 < self.x1 || other.x1 > self.x2 || other.y2 < self.y1 || other.y1 > self.y2)
    }

    /// Splits into four equal quadrants sharing the midpoint, in the fixed
    /// order top-left, top-right, bottom-right, bottom-left. The order must
    /// stay consistent with the point dispatch in the spatial index.
    pub fn split4(&self) -> [Self; 4] {
        let mid_x = (self.x1 + self.x2) / 2.0;
        let mid_y = (self.y1 + self.y2) / 2.0;
        [
            Self::new(self.x1, mid_y, mid_x, self.y2),
            Self::new(mid_x, mid_y, self.x2, self.y2),
            Self::new(mid_x, self.y1, self.x2, mid_y),
            Self::new(self.x1, self.y1, mid_x, mid_y),
        ]
    }

    /// Cuts the rect by a vertical and/or horizontal line through `c`,
    /// yielding 2 or 4 sub-rects in a fixed order. Returns an empty vec when
    /// `c` is not strictly inside the rect; callers treat that as an
    /// internal error.
    pub fn split_around(&self, c: Point) -> SmallVec<[Self; 4]> {
        let mut parts = SmallVec::new();
        let horiz = self.x1 < c.x && self.x2 > c.x;
        let vert = self.y1 < c.y && self.y2 > c.y;
        if horiz && !vert {
            parts.push(Self::new(self.x1, self.y1, c.x, self.y2));
            parts.push(Self::new(c.x, self.y1, self.x2, self.y2));
        } else if vert && !horiz {
            parts.push(Self::new(self.x1, self.y1, self.x2, c.y));
            parts.push(Self::new(self.x1, c.y, self.x2, self.y2));
        } else if horiz && vert {
            parts.push(Self::new(self.x1, self.y1, c.x, c.y));
            parts.push(Self::new(c.x, c.y, self.x2, self.y2));
            parts.push(Self::new(self.x1, c.y, c.x, self.y2));
            parts.push(Self::new(c.x, self.y1, self.x2, c.y));
        }
        parts
    }
}

// Wire form is the JSON array `[x1, y1, x2, y2]`.
impl Serialize for Rect {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.x1, self.y1, self.x2, self.y2].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Rect {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let [x1, y1, x2, y2] = <[f64; 4]>::deserialize(deserializer)?;
        Ok(Self { x1, y1, x2, y2 })
    }
}
