//! Displays and the process-wide display core
//!
//! A [`DisplayCore`] is created once from the probed hardware description. It
//! owns the pipe and rotator pools shared by all displays and the
//! [`DumpRegistry`] used for diagnostics.
//!
//! Every [`Display`] created from it runs its own composition loop, guarded by
//! a per-display lock:
//!
//! ```no_run
//! use display_core::{
//!     display::{DisplayConfig, DisplayCore},
//!     hw::{ResourceDescriptor, StaticProbe},
//!     layer::LayerStack,
//!     strategy::DefaultStrategy,
//!     sync::NativeSync,
//! };
//!
//! # fn main() -> Result<(), display_core::display::DisplayError> {
//! let core = DisplayCore::new(&StaticProbe(ResourceDescriptor::default()))?;
//! let display = core.create_display(DisplayConfig::default(), Box::new(DefaultStrategy::new()))?;
//!
//! // once per vsync
//! # let stack = LayerStack::default();
//! let frame = display.prepare(&stack)?;
//! for layer in &frame.hw_layers.layers {
//!     // program layer.pipes and layer.rotator
//! }
//! display.commit(&NativeSync)?;
//! # Ok(())
//! # }
//! ```
//!
//! Preparing selects candidates from the display's strategy until the resource
//! manager can back one of them. If none fits, every layer is composed by the
//! GPU for that frame. A prepared frame has to be committed or discarded before
//! the next frame can be prepared.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tracing::{debug, info, instrument, trace_span, warn};

use crate::{
    dump::{try_dump, DumpRegistry, Dumpable},
    hw::{probe_descriptor, BandwidthMode, DescriptorError, ResourceDescriptor, ResourceProbe},
    layer::LayerStack,
    manager::{CommitStats, HwLayers, ResourceManager},
    pool::{DisplayId, PipePool, RotatorPool},
    scalar::{DefaultScaleLibrary, ScalarConfigurator, ScaleLibrary},
    strategy::{
        GpuTarget, HardwareAssignment, Strategy, StrategyConstraints, StrategyEngine, StrategyError,
        MAX_SDE_LAYERS,
    },
    sync::{BufferSync, FenceError, SyncPoint, DEFAULT_FENCE_TIMEOUT},
    utils::{lock, Physical, Size},
};

pub use crate::manager::SplitConfig;

/// Kind of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DisplayKind {
    /// Built-in panel
    #[default]
    Primary,
    /// Hot-pluggable external display
    External,
    /// Memory backed display without a panel
    Virtual,
}

/// Static configuration of a display
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConfig {
    /// Kind of the display
    pub kind: DisplayKind,
    /// Panel size in pixels
    pub size: Size<i32, Physical>,
    /// Refresh rate in Hz
    pub refresh: u32,
    /// Division of the panel between mixers
    pub split: SplitConfig,
    /// Maximum number of layers on hardware per frame
    pub max_layers: usize,
    /// Bandwidth budget to use
    pub bandwidth_mode: BandwidthMode,
    /// Bound for waiting on acquire fences at commit
    pub fence_timeout: Duration,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig {
            kind: DisplayKind::Primary,
            size: Size::from((1920, 1080)),
            refresh: 60,
            split: SplitConfig::None,
            max_layers: MAX_SDE_LAYERS,
            bandwidth_mode: BandwidthMode::Low,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
        }
    }
}

/// Errors crossing the display boundary
#[derive(thiserror::Error, Debug)]
pub enum DisplayError {
    /// The hardware description cannot drive a display
    #[error("Invalid hardware description")]
    Descriptor(#[from] DescriptorError),
    /// The strategy was driven out of protocol or is incompatible
    #[error("Strategy failure")]
    Strategy(#[from] StrategyError),
    /// A prepared frame has not been committed or discarded yet
    #[error("The previous frame is still pending")]
    PendingCommit,
    /// Commit was called without a prepared frame
    #[error("No frame was prepared")]
    NothingPrepared,
    /// Committing the frame to hardware failed, the frame was dropped
    #[error("Failed to commit frame")]
    Commit(#[source] FenceError),
}

/// Configuration selected for one frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameConfig {
    /// Sequence number of the frame on its display
    pub sequence: u64,
    /// The bound hardware configuration
    pub hw_layers: HwLayers,
    /// Candidates tried before one fitted
    pub attempts: usize,
    /// Constraints after the last attempt
    pub constraints: StrategyConstraints,
}

impl FrameConfig {
    /// Whether no layer is scanned out directly
    pub fn is_gpu_only(&self) -> bool {
        self.hw_layers.is_gpu_only()
    }
}

#[derive(Debug)]
struct PendingFrame {
    frame: FrameConfig,
    acquire_fences: Vec<SyncPoint>,
}

#[derive(Debug)]
struct DisplayState {
    config: DisplayConfig,
    engine: StrategyEngine,
    manager: ResourceManager,
    secure: bool,
    sequence: u64,
    pending: Option<PendingFrame>,
    committed: Option<FrameConfig>,
}

#[derive(Debug)]
struct DisplayInner {
    id: DisplayId,
    state: Mutex<DisplayState>,
}

/// Process-wide context shared by all displays
#[derive(Debug)]
pub struct DisplayCore {
    descriptor: Arc<ResourceDescriptor>,
    pipes: Arc<Mutex<PipePool>>,
    rotators: Arc<Mutex<RotatorPool>>,
    scale_library: Option<Arc<dyn ScaleLibrary>>,
    registry: DumpRegistry,
    next_id: AtomicU32,
}

impl DisplayCore {
    /// Probe the hardware and set up the shared pools
    pub fn new(probe: &dyn ResourceProbe) -> Result<Self, DisplayError> {
        Self::with_scale_library(probe, Some(Arc::new(DefaultScaleLibrary)))
    }

    /// Like [`DisplayCore::new`] with a custom scale library, `None` if scaling is unavailable
    pub fn with_scale_library(
        probe: &dyn ResourceProbe,
        scale_library: Option<Arc<dyn ScaleLibrary>>,
    ) -> Result<Self, DisplayError> {
        let descriptor = probe_descriptor(probe)?;

        let sessions = if descriptor.num_rotator > 0 {
            descriptor.num_rotator_sessions as usize
        } else {
            0
        };
        let pipes = Arc::new(Mutex::new(PipePool::new(&descriptor)));
        let rotators = Arc::new(Mutex::new(RotatorPool::new(sessions)));

        let registry = DumpRegistry::new();
        registry.register("pipes", &pipes);
        registry.register("rotators", &rotators);

        Ok(DisplayCore {
            descriptor: Arc::new(descriptor),
            pipes,
            rotators,
            scale_library,
            registry,
            next_id: AtomicU32::new(0),
        })
    }

    /// The probed hardware description
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    /// The registry listing dumpable state
    pub fn registry(&self) -> &DumpRegistry {
        &self.registry
    }

    /// Number of pipes and rotator sessions claimed by any display
    pub fn resources_in_use(&self) -> (usize, usize) {
        let pipes = lock(&self.pipes).in_use();
        let rotators = lock(&self.rotators).in_use();
        (pipes, rotators)
    }

    /// Bring up a display driven by `strategy`
    pub fn create_display(
        &self,
        config: DisplayConfig,
        strategy: Box<dyn Strategy>,
    ) -> Result<Display, DisplayError> {
        let engine = StrategyEngine::new(strategy)?;
        let id = DisplayId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let manager = ResourceManager::new(
            id,
            self.descriptor.clone(),
            self.pipes.clone(),
            self.rotators.clone(),
            ScalarConfigurator::new(self.scale_library.clone()),
        );

        info!(
            %id,
            kind = ?config.kind,
            size = ?config.size,
            refresh = config.refresh,
            split = ?config.split,
            "display created"
        );

        let inner = Arc::new(DisplayInner {
            id,
            state: Mutex::new(DisplayState {
                config,
                engine,
                manager,
                secure: false,
                sequence: 0,
                pending: None,
                committed: None,
            }),
        });
        self.registry.register(id.to_string(), &inner);

        Ok(Display { inner })
    }

    /// Append a snapshot of pipe and rotator occupancy and of every display to `out`
    ///
    /// Never blocks, state locked by a running frame is reported as busy.
    pub fn dump(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "display core: hw {:#x}, {} pipes, {} rotator sessions",
            self.descriptor.hw_version,
            self.descriptor.total_pipes(),
            self.descriptor.num_rotator_sessions,
        )?;
        self.registry.dump(out)
    }
}

/// One display pipeline
#[derive(Debug)]
pub struct Display {
    inner: Arc<DisplayInner>,
}

impl Display {
    /// Identifier of the display in the shared pools
    pub fn id(&self) -> DisplayId {
        self.inner.id
    }

    /// Current configuration
    pub fn config(&self) -> DisplayConfig {
        lock(&self.inner.state).config.clone()
    }

    /// Select and bind the hardware configuration of the next frame
    ///
    /// Fails with [`DisplayError::PendingCommit`] while a prepared frame was
    /// neither committed nor discarded. Running out of candidates is not an
    /// error, the frame is then composed entirely by the GPU.
    #[instrument(level = "trace", skip_all, fields(display = %self.inner.id, layers = stack.len()))]
    #[profiling::function]
    pub fn prepare(&self, stack: &LayerStack) -> Result<FrameConfig, DisplayError> {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;
        if state.pending.is_some() {
            return Err(DisplayError::PendingCommit);
        }

        let mut constraints = StrategyConstraints {
            safe_mode: state.secure,
            max_layers: state.config.max_layers.min(MAX_SDE_LAYERS),
            rotator_downscale: false,
        };

        let selection = select(state, stack, &mut constraints);
        let (hw_layers, attempts) = end_cycle(selection, state.engine.stop())?;

        let hw_layers = match hw_layers {
            Some(hw_layers) => hw_layers,
            None => {
                warn!(display = %self.inner.id, attempts, "no candidate fits, composing on the GPU");
                gpu_fallback(state, stack, &mut constraints)
            }
        };

        state.sequence += 1;
        let frame = FrameConfig {
            sequence: state.sequence,
            hw_layers,
            attempts,
            constraints,
        };
        let acquire_fences = frame
            .hw_layers
            .layers
            .iter()
            .filter_map(|layer| stack.get(layer.layer))
            .map(|layer| layer.buffer.acquire_fence.clone())
            .collect();
        debug!(
            sequence = frame.sequence,
            hw_layers = frame.hw_layers.layers.len(),
            pipes = frame.hw_layers.pipe_count(),
            rotators = frame.hw_layers.rotator_count(),
            "frame prepared"
        );

        state.pending = Some(PendingFrame {
            frame: frame.clone(),
            acquire_fences,
        });
        Ok(frame)
    }

    /// Commit the prepared frame
    ///
    /// Waits for the acquire fences of all hardware layers, bounded by the
    /// configured fence timeout. A fence that does not signal fails the
    /// commit and drops the frame, keeping the previously committed one.
    #[instrument(level = "trace", skip_all, fields(display = %self.inner.id))]
    #[profiling::function]
    pub fn commit(&self, sync: &dyn BufferSync) -> Result<CommitStats, DisplayError> {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;
        let pending = state.pending.take().ok_or(DisplayError::NothingPrepared)?;

        let acquire = pending
            .acquire_fences
            .iter()
            .fold(SyncPoint::signaled(), |merged, fence| sync.merge(&merged, fence));
        if let Err(err) = sync.wait(&acquire, state.config.fence_timeout) {
            warn!(display = %self.inner.id, sequence = pending.frame.sequence, %err, "dropping frame");
            state.manager.discard();
            return Err(DisplayError::Commit(err));
        }

        let stats = state.manager.commit(&pending.frame.hw_layers);
        debug!(sequence = pending.frame.sequence, ?stats, "frame committed");
        state.committed = Some(pending.frame);
        Ok(stats)
    }

    /// Drop the prepared frame, keeping the previously committed one
    pub fn discard_pending(&self) {
        let mut state = lock(&self.inner.state);
        if state.pending.take().is_some() {
            state.manager.discard();
        }
    }

    /// Whether a prepared frame waits for its commit
    pub fn has_pending(&self) -> bool {
        lock(&self.inner.state).pending.is_some()
    }

    /// The last committed frame
    pub fn committed(&self) -> Option<FrameConfig> {
        lock(&self.inner.state).committed.clone()
    }

    /// Enter or leave a secure session
    ///
    /// During a secure session every frame is selected in safe mode.
    pub fn set_secure_session(&self, secure: bool) {
        let mut state = lock(&self.inner.state);
        if state.secure != secure {
            info!(display = %self.inner.id, secure, "secure session changed");
            state.secure = secure;
        }
    }

    /// Switch the bandwidth budget used for the following frames
    pub fn set_bandwidth_mode(&self, mode: BandwidthMode) {
        let mut state = lock(&self.inner.state);
        if state.config.bandwidth_mode != mode {
            info!(display = %self.inner.id, ?mode, "bandwidth mode changed");
            state.config.bandwidth_mode = mode;
        }
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        let state = lock(&self.inner.state);
        state.manager.release_all();
        info!(display = %self.inner.id, "display destroyed");
    }
}

// Offer candidates until one can be bound. `None` if the strategy ran out.
fn select(
    state: &mut DisplayState,
    stack: &LayerStack,
    constraints: &mut StrategyConstraints,
) -> Result<(Option<HwLayers>, usize), StrategyError> {
    let max_attempts = state.engine.start(stack, constraints)?;
    for attempt in 1..=max_attempts {
        let _span = trace_span!("attempt", attempt).entered();
        let Some(candidate) = state.engine.next_strategy(constraints)? else {
            return Ok((None, attempt));
        };
        match state
            .manager
            .allocate(stack, &candidate, &state.config, constraints)
        {
            Ok(hw_layers) => return Ok((Some(hw_layers), attempt)),
            Err(err) => debug!(layers = ?candidate.layers, %err, "candidate does not fit"),
        }
    }
    Ok((None, max_attempts))
}

// A failed selection is reported before a failure to stop the cycle
fn end_cycle<T>(
    selection: Result<T, StrategyError>,
    stopped: Result<(), StrategyError>,
) -> Result<T, StrategyError> {
    let selected = selection?;
    stopped?;
    Ok(selected)
}

fn gpu_fallback(
    state: &DisplayState,
    stack: &LayerStack,
    constraints: &mut StrategyConstraints,
) -> HwLayers {
    let assignment = if stack.is_empty() {
        HardwareAssignment::default()
    } else {
        HardwareAssignment::gpu_only()
    };
    match state
        .manager
        .allocate(stack, &assignment, &state.config, constraints)
    {
        Ok(hw_layers) => hw_layers,
        // a GPU target needs a single blend stage, which a valid descriptor always has
        Err(_) => HwLayers {
            assignment: HardwareAssignment {
                gpu_target: GpuTarget::Bottom,
                ..assignment
            },
            layers: Vec::new(),
            bandwidth: 0,
            roi: Default::default(),
        },
    }
}

impl Dumpable for DisplayInner {
    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        try_dump(&self.state, out, |state, out| {
            let config = &state.config;
            writeln!(
                out,
                "  {:?} {}x{}@{} split {:?} bandwidth {:?}{}",
                config.kind,
                config.size.w,
                config.size.h,
                config.refresh,
                config.split,
                config.bandwidth_mode,
                if state.secure { " secure" } else { "" },
            )?;
            writeln!(
                out,
                "  frame {} {}",
                state.sequence,
                if state.pending.is_some() { "pending" } else { "idle" }
            )?;
            if let Some(frame) = state.committed.as_ref() {
                writeln!(
                    out,
                    "  committed #{}: gpu target {:?}, {} KB/s",
                    frame.sequence, frame.hw_layers.assignment.gpu_target, frame.hw_layers.bandwidth
                )?;
                for layer in &frame.hw_layers.layers {
                    write!(out, "    layer {}:", layer.layer)?;
                    for pipe in &layer.pipes {
                        write!(out, " {}#{}", pipe.class, pipe.pipe.index())?;
                    }
                    if let Some(stage) = layer.rotator.as_ref() {
                        write!(out, " rotator#{}", stage.session.index())?;
                    }
                    writeln!(out)?;
                }
            }
            Ok(())
        })
    }
}
