//! Partitioning of layers across split panels

use smallvec::SmallVec;

use crate::utils::{Buffer, Physical, Rectangle};

/// How the panel width is divided between layer mixers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitConfig {
    /// A single mixer drives the whole panel
    #[default]
    None,
    /// Two DSI links drive the left and right part of the panel
    DualDsi {
        /// Width of the left part
        left_width: u32,
        /// Both links have to be updated with the same region
        needs_roi_merge: bool,
    },
    /// Two mixers drive the halves of the panel, layers may span both
    SourceSplit,
}

impl SplitConfig {
    /// Width of every mixer of a panel `width` pixels wide
    pub fn mixer_widths(&self, width: u32) -> SmallVec<[u32; 2]> {
        match *self {
            SplitConfig::None => SmallVec::from_slice(&[width]),
            SplitConfig::DualDsi { left_width, .. } => {
                SmallVec::from_slice(&[left_width, width.saturating_sub(left_width)])
            }
            SplitConfig::SourceSplit => SmallVec::from_slice(&[width - width / 2, width / 2]),
        }
    }

    /// Position of the boundary between the mixers of a panel `width` pixels wide
    ///
    /// Layers crossing it are fetched by one pipe per mixer.
    pub fn boundary(&self, width: u32) -> Option<i32> {
        match *self {
            SplitConfig::None => None,
            SplitConfig::DualDsi { left_width, .. } => i32::try_from(left_width).ok(),
            SplitConfig::SourceSplit => i32::try_from(width - width / 2).ok(),
        }
    }

    /// Whether layers wider than a pipe may be fetched by two pipes
    pub fn is_source_split(&self) -> bool {
        matches!(self, SplitConfig::SourceSplit)
    }
}

/// Map `part` of the destination `dst` back onto the source `src`
///
/// `flips` are the horizontal and vertical flips the pipe applies while fetching.
pub fn crop_for(
    src: Rectangle<f64, Buffer>,
    dst: Rectangle<i32, Physical>,
    part: Rectangle<i32, Physical>,
    flips: (bool, bool),
) -> Rectangle<f64, Buffer> {
    let dst = dst.to_f64();
    let part = part.to_f64();
    let fraction = |start: f64, end: f64, origin: f64, len: f64, flip: bool| {
        let (a, b) = ((start - origin) / len, (end - origin) / len);
        if flip {
            (1.0 - b, 1.0 - a)
        } else {
            (a, b)
        }
    };

    let (x0, x1) = fraction(part.loc.x, part.right(), dst.loc.x, dst.size.w, flips.0);
    let (y0, y1) = fraction(part.loc.y, part.bottom(), dst.loc.y, dst.size.h, flips.1);
    Rectangle::new(
        (src.loc.x + x0 * src.size.w, src.loc.y + y0 * src.size.h).into(),
        ((x1 - x0) * src.size.w, (y1 - y0) * src.size.h).into(),
    )
}

/// Split `dst` at the vertical line `x` and map both halves onto `src`
///
/// Returns a single part if the line does not cross `dst`.
pub fn partition(
    src: Rectangle<f64, Buffer>,
    dst: Rectangle<i32, Physical>,
    x: i32,
    flips: (bool, bool),
) -> SmallVec<[(Rectangle<f64, Buffer>, Rectangle<i32, Physical>); 2]> {
    let (left, right) = dst.split_at_x(x);
    [left, right]
        .into_iter()
        .flatten()
        .map(|part| (crop_for(src, dst, part, flips), part))
        .collect()
}
