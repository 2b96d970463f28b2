use std::fmt;
use std::ops::{Add, Sub};

/// Type-level marker for the buffer coordinate space
///
/// Source crops of a layer are expressed in this space.
#[derive(Debug)]
pub struct Buffer;

/// Type-level marker for the physical coordinate space of a display mixer
#[derive(Debug)]
pub struct Physical;

/// Trait for types serving as a coordinate for other geometry utils
pub trait Coordinate:
    Sized + Add<Self, Output = Self> + Sub<Self, Output = Self> + PartialOrd + Default + Copy + fmt::Debug
{
    /// A Coordinate that is 0
    const ZERO: Self;
    /// Convert the coordinate to a f64
    fn to_f64(self) -> f64;
    /// Compare and return the smaller one
    fn min(self, other: Self) -> Self {
        if self < other {
            self
        } else {
            other
        }
    }
    /// Compare and return the larger one
    fn max(self, other: Self) -> Self {
        if self > other {
            self
        } else {
            other
        }
    }
    /// Saturating addition, clamping at the numeric bounds
    fn saturating_add(self, other: Self) -> Self;
    /// Saturating subtraction, clamping at the numeric bounds
    fn saturating_sub(self, other: Self) -> Self;
}

macro_rules! integer_coordinate_impl {
    ($($ty:ty),*) => {
        $(
            impl Coordinate for $ty {
                const ZERO: $ty = 0;

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn saturating_add(self, other: Self) -> Self {
                    <$ty>::saturating_add(self, other)
                }

                #[inline]
                fn saturating_sub(self, other: Self) -> Self {
                    <$ty>::saturating_sub(self, other)
                }
            }
        )*
    };
}

integer_coordinate_impl!(i32, u32);

impl Coordinate for f64 {
    const ZERO: f64 = 0.0;

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn saturating_add(self, other: Self) -> Self {
        self + other
    }

    #[inline]
    fn saturating_sub(self, other: Self) -> Self {
        self - other
    }
}

/// A point as defined by its x and y coordinates
#[repr(C)]
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: std::marker::PhantomData<Kind>,
}

impl<N: Coordinate, Kind> Point<N, Kind> {
    /// Convert the underlying numerical type to f64 for floating point manipulations
    #[inline]
    pub fn to_f64(self) -> Point<f64, Kind> {
        Point::from((self.x.to_f64(), self.y.to_f64()))
    }
}

impl<N, Kind> From<(N, N)> for Point<N, Kind> {
    #[inline]
    fn from((x, y): (N, N)) -> Point<N, Kind> {
        Point {
            x,
            y,
            _kind: std::marker::PhantomData,
        }
    }
}

impl<N: fmt::Debug, S> fmt::Debug for Point<N, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point")
            .field("x", &self.x)
            .field("y", &self.y)
            .finish()
    }
}

impl<N: Clone, Kind> Clone for Point<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Point::from((self.x.clone(), self.y.clone()))
    }
}

impl<N: Copy, Kind> Copy for Point<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Point<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl<N: Eq, Kind> Eq for Point<N, Kind> {}

impl<N: Default, Kind> Default for Point<N, Kind> {
    fn default() -> Self {
        Point::from((N::default(), N::default()))
    }
}

/// A size as defined by its width and height
///
/// Constructors of this type ensure that the values are always positive via
/// `debug_assert!()`, however manually changing the values of the fields
/// can break this invariant.
#[repr(C)]
pub struct Size<N, Kind> {
    /// horizontal coordinate
    pub w: N,
    /// vertical coordinate
    pub h: N,
    _kind: std::marker::PhantomData<Kind>,
}

impl<N: Coordinate, Kind> Size<N, Kind> {
    /// Convert the underlying numerical type to f64 for floating point manipulations
    #[inline]
    pub fn to_f64(self) -> Size<f64, Kind> {
        Size::from((self.w.to_f64(), self.h.to_f64()))
    }

    /// Check if this [`Size`] is empty
    ///
    /// Returns true if either the width or the height is zero
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w <= N::ZERO || self.h <= N::ZERO
    }
}

impl<N: Coordinate, Kind> From<(N, N)> for Size<N, Kind> {
    #[inline]
    fn from((w, h): (N, N)) -> Size<N, Kind> {
        debug_assert!(
            w >= N::ZERO && h >= N::ZERO,
            "Attempting to create a `Size` of negative size: {:?}",
            (w, h)
        );
        Size {
            w,
            h,
            _kind: std::marker::PhantomData,
        }
    }
}

impl<N: fmt::Debug, S> fmt::Debug for Size<N, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size")
            .field("w", &self.w)
            .field("h", &self.h)
            .finish()
    }
}

impl<N: Clone, Kind> Clone for Size<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Size {
            w: self.w.clone(),
            h: self.h.clone(),
            _kind: std::marker::PhantomData,
        }
    }
}

impl<N: Copy, Kind> Copy for Size<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Size<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w && self.h == other.h
    }
}

impl<N: Eq, Kind> Eq for Size<N, Kind> {}

impl<N: Default, Kind> Default for Size<N, Kind> {
    fn default() -> Self {
        Size {
            w: N::default(),
            h: N::default(),
            _kind: std::marker::PhantomData,
        }
    }
}

/// A rectangle defined by its top-left corner and dimensions
///
/// Operations on rectangles are saturating.
#[repr(C)]
pub struct Rectangle<N, Kind> {
    /// Location of the top-left corner of the rectangle
    pub loc: Point<N, Kind>,
    /// Size of the rectangle, as (width, height)
    pub size: Size<N, Kind>,
}

impl<N: Coordinate, Kind> Rectangle<N, Kind> {
    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    #[inline]
    pub fn new(loc: Point<N, Kind>, size: Size<N, Kind>) -> Self {
        Rectangle { loc, size }
    }

    /// Create a new [`Rectangle`] from its dimensions, with location zero
    #[inline]
    pub fn from_size(size: Size<N, Kind>) -> Self {
        Rectangle {
            loc: (N::ZERO, N::ZERO).into(),
            size,
        }
    }

    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its bottom-right corner
    ///
    /// Inverted extremities produce an empty rectangle.
    #[inline]
    pub fn from_extremities(
        topleft: impl Into<Point<N, Kind>>,
        bottomright: impl Into<Point<N, Kind>>,
    ) -> Self {
        let topleft = topleft.into();
        let bottomright = bottomright.into();
        Rectangle {
            loc: topleft,
            size: (
                bottomright.x.saturating_sub(topleft.x).max(N::ZERO),
                bottomright.y.saturating_sub(topleft.y).max(N::ZERO),
            )
                .into(),
        }
    }

    /// Convert the underlying numerical type to f64
    #[inline]
    pub fn to_f64(self) -> Rectangle<f64, Kind> {
        Rectangle {
            loc: self.loc.to_f64(),
            size: self.size.to_f64(),
        }
    }

    /// Check if this [`Rectangle`] is empty
    ///
    /// Returns true if either the width or the height
    /// of the [`Size`] is zero
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    /// Right edge (exclusive)
    #[inline]
    pub fn right(&self) -> N {
        self.loc.x.saturating_add(self.size.w)
    }

    /// Bottom edge (exclusive)
    #[inline]
    pub fn bottom(&self) -> N {
        self.loc.y.saturating_add(self.size.h)
    }

    /// Checks whether a given [`Rectangle`] overlaps with this one
    ///
    /// Touching rectangles do not overlap.
    #[inline]
    pub fn overlaps(self, other: impl Into<Rectangle<N, Kind>>) -> bool {
        let other = other.into();
        self.loc.x < other.right()
            && other.loc.x < self.right()
            && self.loc.y < other.bottom()
            && other.loc.y < self.bottom()
    }

    /// Clamp rectangle to min and max corners resulting in the overlapping area of two rectangles
    ///
    /// Returns `None` if the two rectangles don't overlap
    #[inline]
    pub fn intersection(self, other: impl Into<Rectangle<N, Kind>>) -> Option<Self> {
        let other = other.into();
        if !self.overlaps(other) {
            return None;
        }
        Some(Rectangle::from_extremities(
            (self.loc.x.max(other.loc.x), self.loc.y.max(other.loc.y)),
            (self.right().min(other.right()), self.bottom().min(other.bottom())),
        ))
    }

    /// Smallest rectangle that contains both rectangles
    ///
    /// An empty operand does not contribute to the result.
    #[inline]
    pub fn union(self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        Rectangle::from_extremities(
            (self.loc.x.min(other.loc.x), self.loc.y.min(other.loc.y)),
            (self.right().max(other.right()), self.bottom().max(other.bottom())),
        )
    }

    /// Remove `other` from this rectangle when the result is again a single rectangle
    ///
    /// The cut only happens when `other` spans the full width (or full height) of
    /// this rectangle and shares its top or bottom (left or right) edge. In every
    /// other case the rectangle is returned unchanged.
    pub fn subtract(self, other: Self) -> Self {
        let (left, top, right, bottom) = (self.loc.x, self.loc.y, self.right(), self.bottom());
        let (o_left, o_top, o_right, o_bottom) = (other.loc.x, other.loc.y, other.right(), other.bottom());

        let (mut new_top, mut new_bottom, mut new_left, mut new_right) = (top, bottom, left, right);
        if left == o_left && right == o_right {
            if top == o_top && o_bottom <= bottom {
                new_top = o_bottom;
            } else if bottom == o_bottom && o_top >= top {
                new_bottom = o_top;
            }
        } else if top == o_top && bottom == o_bottom {
            if left == o_left && o_right <= right {
                new_left = o_right;
            } else if right == o_right && o_left >= left {
                new_right = o_left;
            }
        }

        Rectangle::from_extremities((new_left, new_top), (new_right, new_bottom))
    }

    /// Split the rectangle at the vertical line `x`
    ///
    /// Returns the parts left and right of the line, either may be `None`.
    pub fn split_at_x(self, x: N) -> (Option<Self>, Option<Self>) {
        let left = Rectangle::from_extremities(self.loc, (x.min(self.right()), self.bottom()));
        let right = Rectangle::from_extremities((x.max(self.loc.x), self.loc.y), (self.right(), self.bottom()));
        (
            (!left.is_empty()).then_some(left),
            (!right.is_empty()).then_some(right),
        )
    }
}

impl<Kind> Rectangle<f64, Kind> {
    /// Shrink the rectangle so that its edges land on multiples of the given alignment
    ///
    /// Used for chroma-subsampled crops which must start and end on even pixels.
    pub fn align_inward(self, align_x: u32, align_y: u32) -> Self {
        let ax = f64::from(Ord::max(align_x, 1));
        let ay = f64::from(Ord::max(align_y, 1));
        Rectangle::from_extremities(
            ((self.loc.x / ax).ceil() * ax, (self.loc.y / ay).ceil() * ay),
            ((self.right() / ax).floor() * ax, (self.bottom() / ay).floor() * ay),
        )
    }
}

impl<N: fmt::Debug, S> fmt::Debug for Rectangle<N, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}

impl<N: Clone, Kind> Clone for Rectangle<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Rectangle {
            loc: self.loc.clone(),
            size: self.size.clone(),
        }
    }
}

impl<N: Copy, Kind> Copy for Rectangle<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Rectangle<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<N: Eq, Kind> Eq for Rectangle<N, Kind> {}

impl<N: Default, Kind> Default for Rectangle<N, Kind> {
    fn default() -> Self {
        Rectangle {
            loc: Default::default(),
            size: Default::default(),
        }
    }
}

/// Possible transformations of a layer buffer on its way to the mixer
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub enum Transform {
    /// Identity transformation (plane is unaltered when applied)
    #[default]
    Normal,
    /// Plane is rotated by 90 degrees
    _90,
    /// Plane is rotated by 180 degrees
    _180,
    /// Plane is rotated by 270 degrees
    _270,
    /// Plane is flipped vertically
    Flipped,
    /// Plane is flipped vertically and rotated by 90 degrees
    Flipped90,
    /// Plane is flipped vertically and rotated by 180 degrees
    Flipped180,
    /// Plane is flipped vertically and rotated by 270 degrees
    Flipped270,
}

impl Transform {
    /// Returns true if the transformation would flip contents
    pub fn flipped(&self) -> bool {
        !matches!(
            self,
            Transform::Normal | Transform::_90 | Transform::_180 | Transform::_270
        )
    }

    /// Returns the angle (in degrees) of the transformation
    #[inline]
    pub fn degrees(&self) -> u32 {
        match self {
            Transform::Normal | Transform::Flipped => 0,
            Transform::_90 | Transform::Flipped90 => 90,
            Transform::_180 | Transform::Flipped180 => 180,
            Transform::_270 | Transform::Flipped270 => 270,
        }
    }

    /// Whether width and height swap under this transformation
    ///
    /// Pipes can only flip, so a transposing transform needs a rotator pre-pass.
    #[inline]
    pub fn transposes(&self) -> bool {
        self.degrees() % 180 == 90
    }

    /// Horizontal and vertical flips that express this transform, when it does not transpose
    ///
    /// Returns `None` for the 90/270 degree family.
    pub fn as_flips(&self) -> Option<(bool, bool)> {
        match self {
            Transform::Normal => Some((false, false)),
            Transform::_180 => Some((true, true)),
            Transform::Flipped => Some((true, false)),
            Transform::Flipped180 => Some((false, true)),
            _ => None,
        }
    }

    /// Transformed size after applying this transformation.
    pub fn transform_size<N: Coordinate, Kind>(&self, size: Size<N, Kind>) -> Size<N, Kind> {
        if self.transposes() {
            (size.h, size.w).into()
        } else {
            size
        }
    }
}
