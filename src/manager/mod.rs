//! Binding of candidate assignments to hardware resources
//!
//! The [`ResourceManager`] of a display takes one [`HardwareAssignment`] at a
//! time and tries to back every layer in it with pipes, rotator sessions and
//! scaler programming, validating each step against the
//! [`ResourceDescriptor`]. The first limit a layer would breach aborts the
//! candidate: everything claimed for it so far is handed back to the pools and
//! the breached limit is reported as an [`AllocError`]. Such an error is never
//! fatal, the strategy simply offers its next candidate.
//!
//! Claims made by a successful allocation stay pending until the frame is
//! committed with [`ResourceManager::commit`] or dropped with
//! [`ResourceManager::discard`].

use std::sync::{Arc, Mutex};

use smallvec::SmallVec;
use tracing::{debug, instrument, trace};

use crate::{
    display::DisplayConfig,
    format,
    hw::{HwFeatures, PipeClass, ResourceDescriptor},
    layer::{BufferFlags, Layer, LayerFlags, LayerStack},
    pool::{DisplayId, PipeId, PipePool, RotatorConfig, RotatorData, RotatorId, RotatorPool},
    scalar::{decimation_factor, ScalarConfigurator, ScaleData, ScaleInput, ScaleOutcome},
    strategy::{GpuTarget, HardwareAssignment, StrategyConstraints},
    utils::{lock, Buffer, Physical, Rectangle, Size, Transform},
};

mod bandwidth;
mod split;

pub use self::bandwidth::{pipe_bandwidth, FetchInfo};
pub use self::split::{crop_for, partition, SplitConfig};

/// Limits that can reject a candidate assignment
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AllocError {
    /// No pipe of a suitable class is left, naming the preferred class
    #[error("No {0} pipe left")]
    PipesExhausted(PipeClass),
    /// Every rotator session is claimed
    #[error("No rotator session left")]
    RotatorsExhausted,
    /// The bandwidth budget of the active power mode is exceeded
    #[error("Bandwidth of {required} KB/s exceeds the budget of {available} KB/s")]
    Bandwidth {
        /// Bandwidth needed including the rejected layer
        required: u64,
        /// Budget of the active power mode
        available: u64,
    },
    /// The mixer has not enough blend stages
    #[error("{required} blend stages needed, {available} available")]
    BlendStages {
        /// Stages needed by the candidate
        required: usize,
        /// Stages of the mixer
        available: usize,
    },
    /// A layer is downscaled further than the hardware can
    #[error("Layer {layer} needs downscaling by {ratio:.2}")]
    DownscaleLimit {
        /// Index of the layer
        layer: usize,
        /// Requested downscale ratio
        ratio: f64,
    },
    /// A layer is upscaled further than the hardware can
    #[error("Layer {layer} needs upscaling by {ratio:.2}")]
    UpscaleLimit {
        /// Index of the layer
        layer: usize,
        /// Requested upscale ratio
        ratio: f64,
    },
    /// A layer mixer of the panel is wider than the hardware supports
    #[error("Mixer width {0} exceeds the hardware limit")]
    MixerWidth(u32),
    /// A layer fetches more columns than a pipe and cannot be split
    #[error("Layer {0} is wider than a pipe")]
    PipeWidth(usize),
    /// A layer needs scaling but no scaler programming could be computed
    #[error("No scaler configuration for layer {0}")]
    ScalarUnavailable(usize),
    /// A layer has no visible or valid geometry, or must be GPU composed
    #[error("Layer {0} cannot be scanned out")]
    InvalidLayer(usize),
    /// A layer's memory layout is not supported by the pipes
    #[error("Buffer layout of layer {0} is not supported")]
    UnsupportedBuffer(usize),
}

/// Rotator pre-pass of a hardware layer
#[derive(Debug, Clone, PartialEq)]
pub struct RotatorStage {
    /// Claimed session
    pub session: RotatorId,
    /// Geometry programmed into the session
    pub config: RotatorConfig,
    /// Input buffer of the pass
    pub data: RotatorData,
}

/// Programming of one pipe
#[derive(Debug, Clone, PartialEq)]
pub struct PipeConfig {
    /// Claimed pipe
    pub pipe: PipeId,
    /// Class of the pipe
    pub class: PipeClass,
    /// Region fetched, in the layer buffer or the rotator output
    pub src: Rectangle<f64, Buffer>,
    /// Region of the mixer written
    pub dst: Rectangle<i32, Physical>,
    /// Horizontal and vertical decimation
    pub decimation: (u32, u32),
    /// Horizontal and vertical flips applied while fetching
    pub flips: (bool, bool),
    /// Scaler programming
    pub scale: ScaleData,
    /// Estimated bandwidth in KB/s
    pub bandwidth: u64,
}

/// Hardware resources backing one layer
#[derive(Debug, Clone, PartialEq)]
pub struct HwLayerConfig {
    /// Index of the layer in the stack
    pub layer: usize,
    /// Rotator pre-pass, if any
    pub rotator: Option<RotatorStage>,
    /// One pipe, or two if the layer is split
    pub pipes: SmallVec<[PipeConfig; 2]>,
}

/// The bound configuration of a frame
#[derive(Debug, Clone, PartialEq)]
pub struct HwLayers {
    /// The accepted candidate
    pub assignment: HardwareAssignment,
    /// Resources per hardware layer, in the order of `assignment.layers`
    pub layers: Vec<HwLayerConfig>,
    /// Estimated bandwidth of all pipes in KB/s
    pub bandwidth: u64,
    /// Region updated on every layer mixer
    pub roi: SmallVec<[Rectangle<i32, Physical>; 2]>,
}

impl HwLayers {
    /// Number of pipes used
    pub fn pipe_count(&self) -> usize {
        self.layers.iter().map(|layer| layer.pipes.len()).sum()
    }

    /// Number of rotator sessions used
    pub fn rotator_count(&self) -> usize {
        self.layers.iter().filter(|layer| layer.rotator.is_some()).count()
    }

    /// Whether every layer is composed by the GPU
    pub fn is_gpu_only(&self) -> bool {
        self.layers.is_empty()
    }

    /// Resources of the layer at stack index `index`
    pub fn layer(&self, index: usize) -> Option<&HwLayerConfig> {
        self.layers.iter().find(|layer| layer.layer == index)
    }

    /// Iterate over all pipes
    pub fn pipes(&self) -> impl Iterator<Item = &PipeConfig> {
        self.layers.iter().flat_map(|layer| layer.pipes.iter())
    }
}

/// Outcome of committing a frame to the pools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    /// Pipes released because the frame no longer uses them
    pub pipes_freed: usize,
    /// Rotator sessions released because the frame no longer uses them
    pub rotators_freed: usize,
    /// Rotator sessions that had to run a rotation pass
    pub rotations: usize,
}

// Claims made by the running attempt, for rollback
#[derive(Debug, Default)]
struct Attempt {
    pipes: SmallVec<[PipeId; 8]>,
    rotators: usize,
    bandwidth: u64,
    // claimed by the other displays sharing the pools
    others: u64,
}

/// Allocator of one display
#[derive(Debug)]
pub struct ResourceManager {
    owner: DisplayId,
    descriptor: Arc<ResourceDescriptor>,
    pipes: Arc<Mutex<PipePool>>,
    rotators: Arc<Mutex<RotatorPool>>,
    scalar: ScalarConfigurator,
}

impl ResourceManager {
    /// Create the allocator of display `owner` on top of the shared pools
    pub fn new(
        owner: DisplayId,
        descriptor: Arc<ResourceDescriptor>,
        pipes: Arc<Mutex<PipePool>>,
        rotators: Arc<Mutex<RotatorPool>>,
        scalar: ScalarConfigurator,
    ) -> Self {
        ResourceManager {
            owner,
            descriptor,
            pipes,
            rotators,
            scalar,
        }
    }

    /// Display this allocator claims resources for
    pub fn owner(&self) -> DisplayId {
        self.owner
    }

    /// Hardware limits the allocator validates against
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    /// Try to back `assignment` with hardware resources
    ///
    /// On failure every claim of this attempt is released again. A candidate
    /// failing on a downscale limit the rotator could handle tightens
    /// `constraints` with [`StrategyConstraints::rotator_downscale`].
    #[instrument(level = "trace", skip_all, fields(owner = %self.owner, layers = ?assignment.layers))]
    #[profiling::function]
    pub fn allocate(
        &self,
        stack: &LayerStack,
        assignment: &HardwareAssignment,
        config: &DisplayConfig,
        constraints: &mut StrategyConstraints,
    ) -> Result<HwLayers, AllocError> {
        let available = self.descriptor.num_blending_stages as usize;
        let required = assignment.blend_stages();
        if required > available {
            return Err(AllocError::BlendStages { required, available });
        }

        if assignment.is_gpu_only() {
            return Ok(HwLayers {
                assignment: assignment.clone(),
                layers: Vec::new(),
                bandwidth: 0,
                roi: update_roi(config, assignment, &[]),
            });
        }

        if let Some(width) = config
            .split
            .mixer_widths(panel_width(config))
            .into_iter()
            .find(|width| *width > self.descriptor.max_mixer_width)
        {
            return Err(AllocError::MixerWidth(width));
        }

        let mut pipes = lock(&self.pipes);
        let mut rotators = lock(&self.rotators);
        let mut attempt = Attempt {
            others: pipes.bandwidth_of_others(self.owner),
            ..Attempt::default()
        };

        let result = assignment
            .layers
            .iter()
            .map(|index| {
                self.bind_layer(
                    &mut pipes,
                    &mut rotators,
                    &mut attempt,
                    stack,
                    *index,
                    assignment,
                    config,
                )
            })
            .collect::<Result<Vec<_>, _>>();

        match result {
            Ok(layers) => {
                let roi = update_roi(config, assignment, &layers);
                debug!(
                    pipes = attempt.pipes.len(),
                    rotators = attempt.rotators,
                    bandwidth = attempt.bandwidth,
                    "candidate bound"
                );
                Ok(HwLayers {
                    assignment: assignment.clone(),
                    layers,
                    bandwidth: attempt.bandwidth,
                    roi,
                })
            }
            Err(err) => {
                for pipe in attempt.pipes {
                    pipes.release(pipe);
                }
                rotators.mark_unused_top(self.owner, attempt.rotators);

                if matches!(err, AllocError::DownscaleLimit { .. })
                    && !assignment.rotator_downscale
                    && self.descriptor.features.contains(HwFeatures::ROTATOR_DOWNSCALE)
                    && !rotators.is_empty()
                {
                    constraints.rotator_downscale = true;
                }
                debug!(%err, "candidate rejected");
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn bind_layer(
        &self,
        pipes: &mut PipePool,
        rotators: &mut RotatorPool,
        attempt: &mut Attempt,
        stack: &LayerStack,
        index: usize,
        assignment: &HardwareAssignment,
        config: &DisplayConfig,
    ) -> Result<HwLayerConfig, AllocError> {
        let layer = stack.get(index).ok_or(AllocError::InvalidLayer(index))?;
        if !layer.is_valid() || layer.flags.contains(LayerFlags::SKIP) {
            return Err(AllocError::InvalidLayer(index));
        }
        self.check_buffer(index, layer)?;

        let visible = layer
            .dst
            .intersection(Rectangle::from_size(config.size))
            .ok_or(AllocError::InvalidLayer(index))?;

        // a rotator pass hands the pipe an upright image
        let rotate = layer.needs_rotation() || (assignment.rotator_downscale && self.exceeds_downscale(layer));
        let (rotator, src, src_size, transform, flags) = if rotate {
            let stage = self.rotate(rotators, attempt, index, layer, assignment)?;
            let size = stage.config.output_size();
            (
                Some(stage),
                Rectangle::from_size(size.to_f64()),
                size,
                Transform::Normal,
                BufferFlags::empty(),
            )
        } else {
            (
                None,
                layer.src_crop,
                layer.buffer.size(),
                layer.transform,
                layer.buffer.flags,
            )
        };
        let flips = transform.as_flips().unwrap_or((false, false));
        let src = crop_for(src, layer.dst, visible, flips);

        let ratio = (
            src.size.w / f64::from(visible.size.w),
            src.size.h / f64::from(visible.size.h),
        );
        let max_up = f64::from(self.descriptor.max_scale_up);
        let min_ratio = ratio.0.min(ratio.1);
        if min_ratio * max_up < 1.0 {
            return Err(AllocError::UpscaleLimit {
                layer: index,
                ratio: 1.0 / min_ratio,
            });
        }
        let decimation = (self.decimation(index, ratio.0)?, self.decimation(index, ratio.1)?);
        let scaled = (ratio.0 / f64::from(decimation.0) - 1.0).abs() > f64::EPSILON
            || (ratio.1 / f64::from(decimation.1) - 1.0).abs() > f64::EPSILON;

        let classes = self.pipe_classes(stack, index, layer, scaled);
        let parts = self.split(config, index, src, visible, flips, decimation)?;

        let mut pipe_configs = SmallVec::new();
        for (part_src, part_dst) in parts {
            let (pipe, class) = classes
                .iter()
                .find_map(|class| pipes.acquire(*class, self.owner).map(|pipe| (pipe, *class)))
                .ok_or(AllocError::PipesExhausted(classes[0]))?;
            attempt.pipes.push(pipe);

            let input = ScaleInput {
                src: part_src,
                src_size,
                format: layer.buffer.format,
                dst: part_dst.size,
                transform,
                rotated: rotator.is_some() && layer.transform.transposes(),
                decimation,
                interlaced: layer.buffer.flags.contains(BufferFlags::INTERLACED),
                compressed: flags.intersects(BufferFlags::UBWC | BufferFlags::BWC),
            };
            let scale = match self.scalar.configure(&input) {
                ScaleOutcome::Unscaled(data) | ScaleOutcome::Scaled(data) => data,
                ScaleOutcome::Unavailable => return Err(AllocError::ScalarUnavailable(index)),
            };

            let fetch = FetchInfo {
                src: Size::from((
                    part_src.size.w / f64::from(decimation.0),
                    part_src.size.h / f64::from(decimation.1),
                )),
                dst: part_dst.size,
                format: layer.buffer.format,
                flags,
            };
            let bandwidth = pipe_bandwidth(&fetch, config.refresh, &self.descriptor);
            let available = self.descriptor.max_bandwidth(config.bandwidth_mode);
            let required = attempt.others + attempt.bandwidth + bandwidth;
            if required > available {
                return Err(AllocError::Bandwidth { required, available });
            }
            attempt.bandwidth += bandwidth;
            pipes.set_bandwidth(pipe, bandwidth);

            trace!(layer = index, pipe = pipe.index(), %class, bandwidth, "bound pipe");
            pipe_configs.push(PipeConfig {
                pipe,
                class,
                src: part_src,
                dst: part_dst,
                decimation,
                flips,
                scale,
                bandwidth,
            });
        }

        Ok(HwLayerConfig {
            layer: index,
            rotator,
            pipes: pipe_configs,
        })
    }

    fn check_buffer(&self, index: usize, layer: &Layer) -> Result<(), AllocError> {
        let features = self.descriptor.features;
        let flags = layer.buffer.flags;
        let unsupported = (flags.contains(BufferFlags::UBWC) && !features.contains(HwFeatures::UBWC))
            || (flags.contains(BufferFlags::BWC) && !features.contains(HwFeatures::BWC))
            || (flags.contains(BufferFlags::MACROTILE) && !features.contains(HwFeatures::MACROTILE));
        if unsupported || format::plane_count(layer.buffer.format).is_none() {
            return Err(AllocError::UnsupportedBuffer(index));
        }
        Ok(())
    }

    fn exceeds_downscale(&self, layer: &Layer) -> bool {
        let src = layer.transform.transform_size(layer.src_crop.size);
        let dst = layer.dst.size.to_f64();
        let limit = f64::from(self.descriptor.max_scale_down);
        src.w / dst.w > limit || src.h / dst.h > limit
    }

    fn rotate(
        &self,
        rotators: &mut RotatorPool,
        attempt: &mut Attempt,
        index: usize,
        layer: &Layer,
        assignment: &HardwareAssignment,
    ) -> Result<RotatorStage, AllocError> {
        let mut downscale = (1, 1);
        if assignment.rotator_downscale && self.descriptor.features.contains(HwFeatures::ROTATOR_DOWNSCALE) {
            let src = layer.transform.transform_size(layer.src_crop.size);
            let dst = layer.dst.size.to_f64();
            let factor = |src: f64, dst: f64| {
                decimation_factor(
                    src,
                    dst,
                    self.descriptor.max_scale_down,
                    self.descriptor.max_rotator_downscale,
                )
                .ok_or(AllocError::DownscaleLimit {
                    layer: index,
                    ratio: src / dst,
                })
            };
            downscale = (factor(src.w, dst.w)?, factor(src.h, dst.h)?);
        }

        let config = RotatorConfig {
            src_size: layer.buffer.size(),
            crop: layer.src_crop,
            format: layer.buffer.format,
            transform: layer.transform,
            downscale,
            secure: layer.flags.contains(LayerFlags::SECURE) || layer.buffer.flags.contains(BufferFlags::SECURE),
        };
        let session = rotators
            .acquire(self.owner, &config)
            .ok_or(AllocError::RotatorsExhausted)?;
        attempt.rotators += 1;
        trace!(layer = index, session = session.index(), ?downscale, "bound rotator");

        Ok(RotatorStage {
            session,
            config,
            data: RotatorData {
                fd: layer.buffer.fd,
                offset: layer.buffer.offset,
            },
        })
    }

    fn decimation(&self, index: usize, ratio: f64) -> Result<u32, AllocError> {
        let max_down = self.descriptor.max_scale_down;
        if ratio <= f64::from(max_down) {
            return Ok(1);
        }
        if self.descriptor.features.contains(HwFeatures::DECIMATION) {
            if let Some(factor) = decimation_factor(ratio, 1.0, max_down, self.descriptor.max_decimation) {
                return Ok(factor);
            }
        }
        Err(AllocError::DownscaleLimit { layer: index, ratio })
    }

    // Pipe classes able to fetch the layer, preferred first
    fn pipe_classes(
        &self,
        stack: &LayerStack,
        index: usize,
        layer: &Layer,
        scaled: bool,
    ) -> SmallVec<[PipeClass; 4]> {
        let mut classes = SmallVec::new();
        if layer.is_video() {
            classes.push(PipeClass::Vig);
            return classes;
        }

        let max_cursor = i32::try_from(self.descriptor.max_cursor_size).unwrap_or(i32::MAX);
        let cursor = layer.flags.contains(LayerFlags::CURSOR)
            && index + 1 == stack.len()
            && !scaled
            && layer.dst.size.w <= max_cursor
            && layer.dst.size.h <= max_cursor;
        if cursor {
            classes.push(PipeClass::Cursor);
        }

        if !scaled {
            classes.extend([PipeClass::Dma, PipeClass::Rgb, PipeClass::Vig]);
        } else if self.descriptor.features.contains(HwFeatures::NON_SCALAR_RGB) {
            classes.push(PipeClass::Vig);
        } else {
            classes.extend([PipeClass::Rgb, PipeClass::Vig]);
        }
        classes
    }

    // Source and destination of every pipe the layer needs
    fn split(
        &self,
        config: &DisplayConfig,
        index: usize,
        src: Rectangle<f64, Buffer>,
        dst: Rectangle<i32, Physical>,
        flips: (bool, bool),
        decimation: (u32, u32),
    ) -> Result<SmallVec<[(Rectangle<f64, Buffer>, Rectangle<i32, Physical>); 2]>, AllocError> {
        let max_width = f64::from(self.descriptor.max_pipe_width);
        let fetched = |src: &Rectangle<f64, Buffer>| src.size.w / f64::from(decimation.0);

        let mut parts = match config.split.boundary(panel_width(config)) {
            Some(x) => partition(src, dst, x, flips),
            None => SmallVec::from_slice(&[(src, dst)]),
        };

        if parts.len() == 1 && fetched(&src) > max_width {
            let can_split = config.split.is_source_split()
                || self.descriptor.features.contains(HwFeatures::SOURCE_SPLIT);
            if !can_split {
                return Err(AllocError::PipeWidth(index));
            }
            parts = partition(src, dst, dst.loc.x + dst.size.w / 2, flips);
        }

        if parts.iter().any(|(src, _)| fetched(src) > max_width) {
            return Err(AllocError::PipeWidth(index));
        }
        Ok(parts)
    }

    /// Apply the commit of `frame` to the shared pools
    ///
    /// Claims of the frame become committed, resources the previous frame of
    /// this display used and `frame` does not are released.
    #[profiling::function]
    pub fn commit(&self, frame: &HwLayers) -> CommitStats {
        let mut pipes = lock(&self.pipes);
        let mut rotators = lock(&self.rotators);

        let mut rotations = 0;
        for stage in frame.layers.iter().filter_map(|layer| layer.rotator.as_ref()) {
            if rotators.commit_session(stage.session, stage.config, stage.data) {
                rotations += 1;
            }
        }

        let stats = CommitStats {
            pipes_freed: pipes.commit(self.owner),
            rotators_freed: rotators.commit(self.owner),
            rotations,
        };
        trace!(owner = %self.owner, ?stats, "committed frame resources");
        stats
    }

    /// Drop the pending claims of an uncommitted frame
    pub fn discard(&self) {
        let mut pipes = lock(&self.pipes);
        let mut rotators = lock(&self.rotators);
        pipes.discard_pending(self.owner);
        rotators.discard_pending(self.owner);
    }

    /// Release every resource of this display
    pub fn release_all(&self) {
        let mut pipes = lock(&self.pipes);
        let mut rotators = lock(&self.rotators);
        pipes.release_display(self.owner);
        rotators.release_display(self.owner);
    }
}

fn panel_width(config: &DisplayConfig) -> u32 {
    u32::try_from(config.size.w).unwrap_or(0)
}

// Region of every mixer touched by the frame. A GPU target covers its full mixer.
fn update_roi(
    config: &DisplayConfig,
    assignment: &HardwareAssignment,
    layers: &[HwLayerConfig],
) -> SmallVec<[Rectangle<i32, Physical>; 2]> {
    let mut x = 0;
    let mixers: SmallVec<[Rectangle<i32, Physical>; 2]> = config
        .split
        .mixer_widths(panel_width(config))
        .into_iter()
        .map(|width| {
            let width = i32::try_from(width).unwrap_or(i32::MAX);
            let mixer = Rectangle::new((x, 0).into(), (width, config.size.h).into());
            x += width;
            mixer
        })
        .collect();

    let mut roi: SmallVec<[Rectangle<i32, Physical>; 2]> = mixers
        .iter()
        .map(|mixer| {
            if assignment.gpu_target != GpuTarget::None {
                return *mixer;
            }
            layers
                .iter()
                .flat_map(|layer| layer.pipes.iter())
                .filter_map(|pipe| pipe.dst.intersection(*mixer))
                .fold(Rectangle::default(), Rectangle::union)
        })
        .collect();

    if let SplitConfig::DualDsi {
        needs_roi_merge: true,
        ..
    } = config.split
    {
        // both links transfer the same lines
        let merged = roi.iter().copied().fold(Rectangle::default(), Rectangle::union);
        for (rect, mixer) in roi.iter_mut().zip(&mixers) {
            *rect = merged.intersection(*mixer).unwrap_or_default();
        }
    }
    roi
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use crate::{
        layer::LayerBuffer,
        scalar::ScalarInputFlags,
        test_utils::{
            assignment, descriptor, graphics_layer, manager, manager_with_scalar, managers_sharing_pools, video_layer,
        },
    };

    fn config() -> DisplayConfig {
        DisplayConfig::default()
    }

    fn allocate(manager: &ResourceManager, stack: &LayerStack, layers: &[usize]) -> Result<HwLayers, AllocError> {
        let gpu_target = if layers.len() == stack.len() {
            GpuTarget::None
        } else {
            GpuTarget::Bottom
        };
        manager.allocate(
            stack,
            &assignment(layers, gpu_target),
            &config(),
            &mut StrategyConstraints::default(),
        )
    }

    // 200x100 buffer shown upright in a 100x200 region
    fn rotated_layer(x: i32) -> Layer {
        let mut layer = graphics_layer(x, 0, 100, 200);
        layer.buffer = LayerBuffer::new(200, 100, format::Fourcc::Argb8888, 5);
        layer.src_crop = Rectangle::from_size((200.0, 100.0).into());
        layer.transform = Transform::_90;
        layer
    }

    fn uhd_video_at_sixteenth() -> LayerStack {
        LayerStack::new(vec![Layer::new(
            LayerBuffer::new(3840, 2160, format::Fourcc::Nv12, 4),
            Rectangle::from_size((240, 135).into()),
        )])
    }

    #[test]
    fn unscaled_layers_get_one_pipe_each() {
        let stack = LayerStack::new((0..4).map(|i| graphics_layer(i * 100, 0, 100, 100)).collect());
        let manager = manager(descriptor(2, 2));
        let hw = allocate(&manager, &stack, &[0, 1, 2, 3]).unwrap();

        assert_eq!(hw.pipe_count(), 4);
        assert_eq!(hw.rotator_count(), 0);
        assert!(hw.bandwidth <= manager.descriptor().max_bandwidth_low);
        assert_eq!(lock(&manager.rotators).in_use(), 0);
        assert_eq!(lock(&manager.pipes).in_use(), 4);
    }

    #[test]
    fn generated_stacks_fit_pipe_inventory() {
        let mut rng = StdRng::seed_from_u64(0x5de);
        for _ in 0..200 {
            let mut descriptor = descriptor(rng.gen_range(1..=3), rng.gen_range(0..=2));
            descriptor.num_dma_pipe = rng.gen_range(0..=2);
            let vig = descriptor.num_vig_pipe as usize;
            let total = vig + (descriptor.num_rgb_pipe + descriptor.num_dma_pipe) as usize;
            let manager = manager(descriptor);

            let count = rng.gen_range(1..=total);
            let mut videos = 0;
            let layers = (0..count as i32)
                .map(|i| {
                    if videos < vig && rng.gen_bool(0.4) {
                        videos += 1;
                        video_layer(i * 100, 0, 100, 100)
                    } else {
                        graphics_layer(i * 100, 0, 100, 100)
                    }
                })
                .collect::<Vec<_>>();
            let stack = LayerStack::new(layers);
            let indices = (0..count).collect::<Vec<_>>();
            let hw = allocate(&manager, &stack, &indices).unwrap();

            assert_eq!(hw.pipe_count(), count);
            assert_eq!(hw.rotator_count(), 0);
            assert!(hw.bandwidth <= manager.descriptor().max_bandwidth_low);
            for layer in &hw.layers {
                let class = layer.pipes[0].class;
                if stack.get(layer.layer).unwrap().is_video() {
                    assert_eq!(class, PipeClass::Vig);
                } else {
                    assert_ne!(class, PipeClass::Cursor);
                }
            }
            let mut pipes = hw.pipes().map(|pipe| pipe.pipe).collect::<Vec<_>>();
            pipes.sort();
            pipes.dedup();
            assert_eq!(pipes.len(), count);
        }
    }

    #[test]
    fn video_takes_vig_graphics_take_rgb() {
        let stack = LayerStack::new(vec![video_layer(0, 0, 1920, 1080), graphics_layer(0, 0, 200, 100)]);
        let manager = manager(descriptor(2, 2));
        let hw = allocate(&manager, &stack, &[0, 1]).unwrap();

        assert_eq!(hw.layer(0).unwrap().pipes[0].class, PipeClass::Vig);
        assert_eq!(hw.layer(1).unwrap().pipes[0].class, PipeClass::Rgb);
    }

    #[test]
    fn video_without_vig_pipe_fails() {
        let stack = LayerStack::new(vec![video_layer(0, 0, 1920, 1080)]);
        let manager = manager(descriptor(0, 2));
        assert_eq!(
            allocate(&manager, &stack, &[0]),
            Err(AllocError::PipesExhausted(PipeClass::Vig))
        );
    }

    #[test]
    fn rotator_exhaustion_rolls_back() {
        let mut descriptor = descriptor(2, 2);
        descriptor.num_rotator_sessions = 1;
        let manager = manager(descriptor);
        let stack = LayerStack::new(vec![rotated_layer(0), rotated_layer(200)]);

        assert_eq!(allocate(&manager, &stack, &[0, 1]), Err(AllocError::RotatorsExhausted));
        assert_eq!(lock(&manager.pipes).in_use(), 0);
        assert_eq!(lock(&manager.rotators).in_use(), 0);

        let hw = allocate(&manager, &stack, &[1]).unwrap();
        assert_eq!(hw.rotator_count(), 1);
        // the pipe fetches the upright rotator output
        assert_eq!(hw.layer(1).unwrap().pipes[0].src.size, Size::from((100.0, 200.0)));
    }

    #[test]
    fn rotated_layer_reports_rotation_to_scaler() {
        let manager = manager(descriptor(2, 2));
        let mut scaled = rotated_layer(200);
        scaled.dst = Rectangle::new((200, 0).into(), (50, 100).into());
        let stack = LayerStack::new(vec![rotated_layer(0), scaled]);
        let hw = allocate(&manager, &stack, &[0, 1]).unwrap();

        for index in [0, 1] {
            let pipe = &hw.layer(index).unwrap().pipes[0];
            assert_eq!(pipe.flips, (false, false));
            assert_eq!(pipe.scale.input_flags, ScalarInputFlags::ROTATE_90);
        }
        assert!(!hw.layer(0).unwrap().pipes[0].scale.enabled);
        assert!(hw.layer(1).unwrap().pipes[0].scale.enabled);
    }

    #[test]
    fn downscale_beyond_limit_is_rejected() {
        let manager = manager(descriptor(2, 2));
        let mut constraints = StrategyConstraints::default();
        let result = manager.allocate(
            &uhd_video_at_sixteenth(),
            &assignment(&[0], GpuTarget::None),
            &config(),
            &mut constraints,
        );
        assert!(matches!(result, Err(AllocError::DownscaleLimit { layer: 0, .. })));
        assert!(!constraints.rotator_downscale);
    }

    #[test]
    fn downscale_falls_back_to_rotator() {
        let mut descriptor = descriptor(2, 2);
        descriptor.features |= HwFeatures::ROTATOR_DOWNSCALE;
        let manager = manager(descriptor);
        let stack = uhd_video_at_sixteenth();
        let mut constraints = StrategyConstraints::default();

        let mut candidate = assignment(&[0], GpuTarget::None);
        assert!(manager
            .allocate(&stack, &candidate, &config(), &mut constraints)
            .is_err());
        assert!(constraints.rotator_downscale);

        candidate.rotator_downscale = true;
        let hw = manager
            .allocate(&stack, &candidate, &config(), &mut constraints)
            .unwrap();
        let layer = hw.layer(0).unwrap();
        assert_eq!(layer.rotator.as_ref().map(|stage| stage.config.downscale), Some((4, 4)));
        assert_eq!(layer.pipes[0].decimation, (1, 1));
        assert!(layer.pipes[0].scale.enabled);
    }

    #[test]
    fn downscale_uses_decimation() {
        let mut descriptor = descriptor(2, 2);
        descriptor.features |= HwFeatures::DECIMATION;
        let manager = manager(descriptor);
        let hw = allocate(&manager, &uhd_video_at_sixteenth(), &[0]).unwrap();
        assert_eq!(hw.rotator_count(), 0);
        assert_eq!(hw.layer(0).unwrap().pipes[0].decimation, (4, 4));
    }

    #[test]
    fn upscale_beyond_limit_is_rejected() {
        let stack = LayerStack::new(vec![Layer::new(
            LayerBuffer::new(10, 10, format::Fourcc::Argb8888, 3),
            Rectangle::from_size((1000, 1000).into()),
        )]);
        let manager = manager(descriptor(2, 2));
        assert!(matches!(
            allocate(&manager, &stack, &[0]),
            Err(AllocError::UpscaleLimit { layer: 0, .. })
        ));
    }

    #[test]
    fn missing_scaler_rejects_scaled_layers_only() {
        let manager = manager_with_scalar(descriptor(2, 2), ScalarConfigurator::new(None));
        let mut scaled = graphics_layer(0, 0, 200, 100);
        scaled.buffer = LayerBuffer::new(400, 200, format::Fourcc::Argb8888, 3);
        scaled.src_crop = Rectangle::from_size((400.0, 200.0).into());
        let stack = LayerStack::new(vec![graphics_layer(0, 0, 200, 100), scaled]);

        assert_eq!(allocate(&manager, &stack, &[0, 1]), Err(AllocError::ScalarUnavailable(1)));
        assert_eq!(lock(&manager.pipes).in_use(), 0);
        assert!(allocate(&manager, &stack, &[0]).is_ok());
    }

    #[test]
    fn blend_stages_include_gpu_target() {
        let mut descriptor = descriptor(2, 2);
        descriptor.num_blending_stages = 2;
        let manager = manager(descriptor);
        let stack = LayerStack::new((0..3).map(|i| graphics_layer(i * 10, 0, 10, 10)).collect());
        assert_eq!(
            allocate(&manager, &stack, &[1, 2]),
            Err(AllocError::BlendStages {
                required: 3,
                available: 2
            })
        );
    }

    #[test]
    fn bandwidth_budget_is_enforced() {
        let mut descriptor = descriptor(2, 2);
        descriptor.max_bandwidth_low = 1000;
        let manager = manager(descriptor);
        let stack = LayerStack::new(vec![graphics_layer(0, 0, 100, 100)]);
        assert_eq!(
            allocate(&manager, &stack, &[0]),
            Err(AllocError::Bandwidth {
                required: 2400,
                available: 1000
            })
        );
    }

    #[test]
    fn bandwidth_budget_covers_all_displays() {
        let mut descriptor = descriptor(2, 2);
        descriptor.max_bandwidth_low = 200_000;
        let [first, second] = managers_sharing_pools(descriptor);
        let stack = LayerStack::new(vec![video_layer(0, 0, 1920, 1080)]);

        let frame = allocate(&first, &stack, &[0]).unwrap();
        assert_eq!(frame.bandwidth, 186_624);
        assert_eq!(
            allocate(&second, &stack, &[0]),
            Err(AllocError::Bandwidth {
                required: 2 * 186_624,
                available: 200_000
            })
        );

        // the committed frame keeps its share until it is replaced
        first.commit(&frame);
        assert!(allocate(&second, &stack, &[0]).is_err());
        first.commit(&allocate(&first, &stack, &[]).unwrap());
        assert!(allocate(&second, &stack, &[0]).is_ok());
    }

    #[test]
    fn dual_dsi_splits_crossing_layers() {
        let manager = manager(descriptor(2, 2));
        let config = DisplayConfig {
            size: Size::from((2880, 1080)),
            split: SplitConfig::DualDsi {
                left_width: 1440,
                needs_roi_merge: true,
            },
            ..DisplayConfig::default()
        };
        let stack = LayerStack::new(vec![graphics_layer(1000, 0, 880, 100), graphics_layer(2000, 500, 100, 100)]);
        let hw = manager
            .allocate(
                &stack,
                &assignment(&[0, 1], GpuTarget::None),
                &config,
                &mut StrategyConstraints::default(),
            )
            .unwrap();

        assert_eq!(hw.layer(0).unwrap().pipes.len(), 2);
        assert_eq!(hw.pipe_count(), 3);
        // merged regions cover the same lines on both links
        assert_eq!(hw.roi[0], Rectangle::new((1000, 0).into(), (440, 600).into()));
        assert_eq!(hw.roi[1], Rectangle::new((1440, 0).into(), (660, 600).into()));
    }

    #[test]
    fn source_split_partitions_crossing_layers() {
        let manager = manager(descriptor(2, 2));
        let config = DisplayConfig {
            size: Size::from((3840, 1080)),
            split: SplitConfig::SourceSplit,
            ..DisplayConfig::default()
        };
        let stack = LayerStack::new(vec![graphics_layer(1500, 0, 1000, 100)]);
        let hw = manager
            .allocate(
                &stack,
                &assignment(&[0], GpuTarget::None),
                &config,
                &mut StrategyConstraints::default(),
            )
            .unwrap();

        let pipes = &hw.layer(0).unwrap().pipes;
        assert_eq!(pipes.len(), 2);
        assert_eq!(pipes[0].dst, Rectangle::new((1500, 0).into(), (420, 100).into()));
        assert_eq!(pipes[1].dst, Rectangle::new((1920, 0).into(), (580, 100).into()));
        assert_eq!(pipes[1].src, Rectangle::new((420.0, 0.0).into(), (580.0, 100.0).into()));
    }

    #[test]
    fn wide_layers_need_source_split() {
        let manager = manager(descriptor(2, 2));
        let split = DisplayConfig {
            size: Size::from((3840, 1080)),
            split: SplitConfig::SourceSplit,
            ..DisplayConfig::default()
        };
        let stack = LayerStack::new(vec![graphics_layer(0, 0, 3840, 1080)]);
        let hw = manager
            .allocate(
                &stack,
                &assignment(&[0], GpuTarget::None),
                &split,
                &mut StrategyConstraints::default(),
            )
            .unwrap();
        assert_eq!(hw.pipe_count(), 2);

        let single = DisplayConfig {
            size: Size::from((2048, 1080)),
            ..DisplayConfig::default()
        };
        let mut wide = graphics_layer(0, 0, 2000, 1000);
        wide.buffer = LayerBuffer::new(3000, 1000, format::Fourcc::Argb8888, 3);
        wide.src_crop = Rectangle::from_size((3000.0, 1000.0).into());
        assert_eq!(
            manager.allocate(
                &LayerStack::new(vec![wide]),
                &assignment(&[0], GpuTarget::None),
                &single,
                &mut StrategyConstraints::default(),
            ),
            Err(AllocError::PipeWidth(0))
        );
    }

    #[test]
    fn offscreen_part_is_clipped() {
        let manager = manager(descriptor(2, 2));
        let stack = LayerStack::new(vec![graphics_layer(-50, 0, 100, 100)]);
        let hw = allocate(&manager, &stack, &[0]).unwrap();
        let pipe = &hw.layer(0).unwrap().pipes[0];
        assert_eq!(pipe.dst, Rectangle::from_size((50, 100).into()));
        assert_eq!(pipe.src, Rectangle::new((50.0, 0.0).into(), (50.0, 100.0).into()));
    }

    #[test]
    fn cursor_layer_takes_cursor_pipe() {
        let mut descriptor = descriptor(2, 2);
        descriptor.num_cursor_pipe = 1;
        let manager = manager(descriptor);
        let mut cursor = graphics_layer(500, 500, 64, 64);
        cursor.flags |= LayerFlags::CURSOR;
        let stack = LayerStack::new(vec![graphics_layer(0, 0, 1920, 1080), cursor]);
        let hw = allocate(&manager, &stack, &[0, 1]).unwrap();
        assert_eq!(hw.layer(1).unwrap().pipes[0].class, PipeClass::Cursor);
    }

    #[test]
    fn compressed_buffer_needs_support() {
        let manager = manager(descriptor(2, 2));
        let mut layer = graphics_layer(0, 0, 100, 100);
        layer.buffer.flags |= BufferFlags::UBWC;
        let stack = LayerStack::new(vec![layer]);
        assert_eq!(allocate(&manager, &stack, &[0]), Err(AllocError::UnsupportedBuffer(0)));
    }

    #[test]
    fn repeated_rotation_skips_reprogram() {
        let manager = manager(descriptor(2, 2));
        let stack = LayerStack::new(vec![rotated_layer(0)]);

        let first = allocate(&manager, &stack, &[0]).unwrap();
        assert_eq!(manager.commit(&first).rotations, 1);

        let second = allocate(&manager, &stack, &[0]).unwrap();
        let stage = second.layer(0).unwrap().rotator.clone().unwrap();
        assert_eq!(Some(stage.session), first.layer(0).unwrap().rotator.as_ref().map(|s| s.session));
        {
            let rotators = lock(&manager.rotators);
            let session = rotators.session(stage.session).unwrap();
            assert!(!session.rot_conf_changed(&stage.config));
            assert!(!session.rot_data_changed(&stage.data));
        }
        assert_eq!(manager.commit(&second).rotations, 0);

        // a frame without the layer releases its resources
        let gpu = allocate(&manager, &stack, &[]).unwrap();
        let stats = manager.commit(&gpu);
        assert_eq!((stats.pipes_freed, stats.rotators_freed), (1, 1));
    }
}
