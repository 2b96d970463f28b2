//! Scaling parameters for pipes
//!
//! A pipe whose source and destination sizes differ needs its scaler
//! programmed with per-plane phase steps and with the pixels its filter reads
//! beyond the crop edges. Those pixels are either *overfetched* from the buffer,
//! when the buffer has content there, or *repeated* from the edge pixel.
//!
//! The actual computation is delegated to a [`ScaleLibrary`]. When no library
//! is available, or the library rejects a configuration,
//! [`ScalarConfigurator::configure`] reports [`ScaleOutcome::Unavailable`] and
//! the allocator has to pick a configuration without scaling instead of failing
//! the frame.

use std::{fmt, sync::Arc};

use tracing::{trace, warn};

use crate::{
    format::{self, Fourcc},
    utils::{Buffer, Physical, Rectangle, Size, Transform},
};

/// Maximum number of planes a scaler is programmed for
pub const MAX_PLANES: usize = 4;

/// Fractional bits of phase values
pub const PHASE_STEP_SHIFT: u32 = 21;

const PHASE_ONE: f64 = (1u64 << PHASE_STEP_SHIFT) as f64;

// Filter taps needed beyond the crop on the leading and trailing edge
const FILTER_TAPS_LEADING: i32 = 1;
const FILTER_TAPS_TRAILING: i32 = 2;

bitflags::bitflags! {
    /// Input description handed to the scaler
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ScalarInputFlags: u32 {
        /// Source was rotated by 90 degrees upstream
        const ROTATE_90 = 1;
        /// Fetch the source mirrored horizontally
        const FLIP_H = 1 << 1;
        /// Fetch the source mirrored vertically
        const FLIP_V = 1 << 2;
        /// Source is YUV
        const YUV = 1 << 3;
        /// Source is interlaced
        const DEINTERLACE = 1 << 4;
        /// Source is stored compressed
        const COMPRESSED = 1 << 5;
    }
}

/// Scaler programming of one plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneScaleData {
    /// Initial horizontal phase, fixed point
    pub init_phase_x: i32,
    /// Horizontal phase step, fixed point
    pub phase_step_x: u32,
    /// Initial vertical phase, fixed point
    pub init_phase_y: i32,
    /// Vertical phase step, fixed point
    pub phase_step_y: u32,
    /// Pixels fetched left of the crop
    pub left_ftch: i32,
    /// Pixels fetched right of the crop
    pub right_ftch: i32,
    /// Lines fetched above the crop
    pub top_ftch: i32,
    /// Lines fetched below the crop
    pub btm_ftch: i32,
    /// Edge pixels repeated on the left
    pub left_rpt: i32,
    /// Edge pixels repeated on the right
    pub right_rpt: i32,
    /// Edge lines repeated on top
    pub top_rpt: i32,
    /// Edge lines repeated at the bottom
    pub btm_rpt: i32,
    /// Width of the plane region read by the scaler
    pub roi_width: u32,
    /// Height of the plane region read by the scaler
    pub roi_height: u32,
}

impl PlaneScaleData {
    /// Total extension on the left
    pub fn num_ext_pxls_left(&self) -> i32 {
        self.left_ftch + self.left_rpt
    }

    /// Total extension on the right
    pub fn num_ext_pxls_right(&self) -> i32 {
        self.right_ftch + self.right_rpt
    }

    /// Total extension on top
    pub fn num_ext_pxls_top(&self) -> i32 {
        self.top_ftch + self.top_rpt
    }

    /// Total extension at the bottom
    pub fn num_ext_pxls_btm(&self) -> i32 {
        self.btm_ftch + self.btm_rpt
    }
}

/// Complete scaler programming of a pipe
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleData {
    /// Whether the scaler is active
    pub enabled: bool,
    /// Input description
    pub input_flags: ScalarInputFlags,
    /// Source rectangle after alignment adjustments
    pub src_rect: Rectangle<f64, Buffer>,
    /// Format the scaler reads
    pub src_format: Fourcc,
    /// Number of valid entries in `planes`
    pub plane_count: usize,
    /// Per plane programming
    pub planes: [PlaneScaleData; MAX_PLANES],
}

/// What the scaler is asked to do
#[derive(Debug, Clone, Copy)]
pub struct ScaleInput {
    /// Region of the source buffer the pipe fetches
    pub src: Rectangle<f64, Buffer>,
    /// Allocated size of the source buffer
    pub src_size: Size<u32, Buffer>,
    /// Source format
    pub format: Fourcc,
    /// Destination size on the mixer
    pub dst: Size<i32, Physical>,
    /// Transform still to be applied by the pipe
    pub transform: Transform,
    /// Whether a rotator pass already turned the source by 90 degrees
    pub rotated: bool,
    /// Decimation applied before the scaler
    pub decimation: (u32, u32),
    /// Whether the source is interlaced
    pub interlaced: bool,
    /// Whether the source is stored compressed
    pub compressed: bool,
}

impl ScaleInput {
    /// Scale ratios `src / dst` after decimation
    pub fn ratio(&self) -> (f64, f64) {
        let src = self.transform.transform_size(self.src.size);
        (
            src.w / f64::from(self.decimation.0.max(1)) / f64::from(self.dst.w.max(1)),
            src.h / f64::from(self.decimation.1.max(1)) / f64::from(self.dst.h.max(1)),
        )
    }

    /// Whether source and destination differ in size
    pub fn needs_scaling(&self) -> bool {
        let (x, y) = self.ratio();
        (x - 1.0).abs() > f64::EPSILON || (y - 1.0).abs() > f64::EPSILON
    }

    /// Scaler input flags for this request
    ///
    /// A 90 degree rotation, pending or performed by the rotator, is reported
    /// as [`ScalarInputFlags::ROTATE_90`] and no flips are requested from the pipe.
    pub fn input_flags(&self) -> ScalarInputFlags {
        let mut flags = ScalarInputFlags::empty();
        match self.transform.as_flips().filter(|_| !self.rotated) {
            None => flags |= ScalarInputFlags::ROTATE_90,
            Some((flip_h, flip_v)) => {
                flags.set(ScalarInputFlags::FLIP_H, flip_h);
                flags.set(ScalarInputFlags::FLIP_V, flip_v);
            }
        }
        flags.set(ScalarInputFlags::YUV, format::is_yuv(self.format));
        flags.set(ScalarInputFlags::DEINTERLACE, self.interlaced);
        flags.set(ScalarInputFlags::COMPRESSED, self.compressed);
        flags
    }
}

/// Backend computing scaler programming
pub trait ScaleLibrary: fmt::Debug + Send + Sync {
    /// Compute the programming for `input`, `None` if unsupported
    fn compute(&self, input: &ScaleInput) -> Option<ScaleData>;
}

/// Scale library computing center-aligned phases and filter edge extension
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultScaleLibrary;

impl DefaultScaleLibrary {
    fn plane(input: &ScaleInput, src: Rectangle<f64, Buffer>, sub: (u32, u32)) -> PlaneScaleData {
        let (sub_x, sub_y) = (f64::from(sub.0), f64::from(sub.1));
        let (dec_x, dec_y) = (
            f64::from(input.decimation.0.max(1)),
            f64::from(input.decimation.1.max(1)),
        );

        let plane_w = src.size.w / sub_x / dec_x;
        let plane_h = src.size.h / sub_y / dec_y;
        let dst_w = f64::from(input.dst.w.max(1)) / sub_x;
        let dst_h = f64::from(input.dst.h.max(1)) / sub_y;

        let step_x = plane_w / dst_w;
        let step_y = plane_h / dst_h;
        let scale_x = (step_x - 1.0).abs() > f64::EPSILON;
        let scale_y = (step_y - 1.0).abs() > f64::EPSILON;

        // pixels of real content around the crop, in plane units
        let avail_left = (src.loc.x / sub_x / dec_x).floor() as i32;
        let avail_top = (src.loc.y / sub_y / dec_y).floor() as i32;
        let avail_right =
            ((f64::from(input.src_size.w) - src.right()) / sub_x / dec_x).floor().max(0.0) as i32;
        let avail_btm =
            ((f64::from(input.src_size.h) - src.bottom()) / sub_y / dec_y).floor().max(0.0) as i32;

        let split = |needed: i32, available: i32| {
            let fetch = needed.min(available.max(0));
            (fetch, needed - fetch)
        };
        let (lead_x, trail_x) = if scale_x {
            (FILTER_TAPS_LEADING, FILTER_TAPS_TRAILING)
        } else {
            (0, 0)
        };
        let (lead_y, trail_y) = if scale_y {
            (FILTER_TAPS_LEADING, FILTER_TAPS_TRAILING)
        } else {
            (0, 0)
        };
        let (left_ftch, left_rpt) = split(lead_x, avail_left);
        let (right_ftch, right_rpt) = split(trail_x, avail_right);
        let (top_ftch, top_rpt) = split(lead_y, avail_top);
        let (btm_ftch, btm_rpt) = split(trail_y, avail_btm);

        PlaneScaleData {
            init_phase_x: ((step_x - 1.0) / 2.0 * PHASE_ONE).round() as i32,
            phase_step_x: (step_x * PHASE_ONE).round() as u32,
            init_phase_y: ((step_y - 1.0) / 2.0 * PHASE_ONE).round() as i32,
            phase_step_y: (step_y * PHASE_ONE).round() as u32,
            left_ftch,
            right_ftch,
            top_ftch,
            btm_ftch,
            left_rpt,
            right_rpt,
            top_rpt,
            btm_rpt,
            roi_width: (plane_w.ceil() as i32 + lead_x + trail_x).max(0) as u32,
            roi_height: (plane_h.ceil() as i32 + lead_y + trail_y).max(0) as u32,
        }
    }
}

impl ScaleLibrary for DefaultScaleLibrary {
    fn compute(&self, input: &ScaleInput) -> Option<ScaleData> {
        if input.dst.is_empty() || input.src.is_empty() {
            return None;
        }

        let (sub_x, sub_y) = format::chroma_subsampling(input.format);
        let src_rect = if format::is_yuv(input.format) {
            input.src.align_inward(sub_x, sub_y)
        } else {
            input.src
        };
        if src_rect.is_empty() {
            return None;
        }

        let mut planes = [PlaneScaleData::default(); MAX_PLANES];
        // color planes of the buffer, then alpha
        let color_planes = format::plane_count(input.format).unwrap_or(1).min(MAX_PLANES - 1);
        planes[0] = Self::plane(input, src_rect, (1, 1));
        if color_planes > 1 {
            let chroma = Self::plane(input, src_rect, (sub_x, sub_y));
            planes[1..color_planes].fill(chroma);
        }
        let mut plane_count = color_planes;
        if format::has_alpha(input.format) {
            planes[plane_count] = planes[0];
            plane_count += 1;
        }

        Some(ScaleData {
            enabled: input.needs_scaling(),
            input_flags: input.input_flags(),
            src_rect,
            src_format: input.format,
            plane_count,
            planes,
        })
    }
}

/// Result of configuring a pipe's scaler
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleOutcome {
    /// Source and destination match, the scaler is bypassed
    Unscaled(ScaleData),
    /// The scaler is programmed
    Scaled(ScaleData),
    /// No programming could be computed
    Unavailable,
}

/// Computes scaler programming for pipes
#[derive(Debug, Clone)]
pub struct ScalarConfigurator {
    library: Option<Arc<dyn ScaleLibrary>>,
}

impl Default for ScalarConfigurator {
    fn default() -> Self {
        ScalarConfigurator::new(Some(Arc::new(DefaultScaleLibrary)))
    }
}

impl ScalarConfigurator {
    /// Create a configurator, `None` if no scale library is present
    pub fn new(library: Option<Arc<dyn ScaleLibrary>>) -> Self {
        ScalarConfigurator { library }
    }

    /// Whether a scale library is present
    pub fn is_available(&self) -> bool {
        self.library.is_some()
    }

    /// Compute the scaler programming for `input`
    #[profiling::function]
    pub fn configure(&self, input: &ScaleInput) -> ScaleOutcome {
        if !input.needs_scaling() {
            return ScaleOutcome::Unscaled(ScaleData {
                enabled: false,
                input_flags: input.input_flags(),
                src_rect: input.src,
                src_format: input.format,
                plane_count: 0,
                planes: Default::default(),
            });
        }

        let Some(library) = self.library.as_ref() else {
            warn!("no scale library available, scaling disabled");
            return ScaleOutcome::Unavailable;
        };

        match library.compute(input) {
            Some(data) => {
                trace!(ratio = ?input.ratio(), flags = ?data.input_flags, "computed scale data");
                ScaleOutcome::Scaled(data)
            }
            None => {
                warn!(?input, "scale library rejected configuration");
                ScaleOutcome::Unavailable
            }
        }
    }
}

/// Smallest power of two decimation bringing `src / dst` within `max_scale_down`
///
/// Returns `1` when no decimation is needed and `None` when even
/// `max_decimation` is not enough.
pub fn decimation_factor(src: f64, dst: f64, max_scale_down: u32, max_decimation: u32) -> Option<u32> {
    if dst <= 0.0 {
        return None;
    }
    let limit = f64::from(max_scale_down.max(1));
    let mut factor = 1u32;
    while src / f64::from(factor) / dst > limit {
        factor = factor.checked_mul(2)?;
        if factor > max_decimation {
            return None;
        }
    }
    Some(factor)
}
