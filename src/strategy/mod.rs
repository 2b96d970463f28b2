//! Selection of the layers offloaded to hardware pipes
//!
//! Every frame the display runs one *selection cycle* against a [`Strategy`]:
//!
//! ```text
//!   start(stack, constraints) -> max attempts
//!   next_strategy(constraints) -> candidate     (repeated until one fits)
//!   stop()
//! ```
//!
//! Candidates are offered from the most to the least aggressive offload. The
//! resource manager tries to bind each one and may tighten the
//! [`StrategyConstraints`] between attempts. The last candidate of a cycle is
//! normally the pure GPU composition which always fits.
//!
//! [`StrategyEngine`] wraps a strategy implementation and enforces the call
//! protocol. Calls out of order are reported as [`StrategyError`]s instead of
//! being ignored.
//!
//! Strategies are versioned. A strategy may serve a core built against an
//! older minor version of the interface, never a newer one, see
//! [`StrategyVersion::serves`].

use std::fmt;

use smallvec::SmallVec;
use tracing::{debug, instrument, trace};

use crate::layer::LayerStack;

mod default;

pub use self::default::DefaultStrategy;

/// Upper bound of layers a single assignment can put onto hardware
pub const MAX_SDE_LAYERS: usize = 16;

/// Interface version of a [`Strategy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrategyVersion {
    /// Incompatible interface revision
    pub major: u16,
    /// Backwards compatible interface revision
    pub minor: u16,
}

impl StrategyVersion {
    /// Interface version this crate drives strategies with
    pub const CURRENT: StrategyVersion = StrategyVersion { major: 1, minor: 0 };

    /// Create a version
    pub const fn new(major: u16, minor: u16) -> Self {
        StrategyVersion { major, minor }
    }

    /// Whether a strategy of this version can serve a caller requiring `required`
    pub fn serves(&self, required: StrategyVersion) -> bool {
        self.major == required.major && self.minor >= required.minor
    }
}

impl fmt::Display for StrategyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Limits a selection cycle has to respect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyConstraints {
    /// Only offer assignments using the fewest pipes possible
    pub safe_mode: bool,
    /// Maximum number of layers an assignment may contain
    pub max_layers: usize,
    /// Downscaling beyond the pipe limits has to be done by the rotator
    pub rotator_downscale: bool,
}

impl Default for StrategyConstraints {
    fn default() -> Self {
        StrategyConstraints {
            safe_mode: false,
            max_layers: MAX_SDE_LAYERS,
            rotator_downscale: false,
        }
    }
}

/// Position of the GPU composed target relative to the hardware layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GpuTarget {
    /// Every layer is scanned out directly
    #[default]
    None,
    /// The GPU target is blended below the hardware layers
    Bottom,
    /// The GPU target is blended above the hardware layers
    Top,
}

/// A candidate mapping of layers onto hardware
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HardwareAssignment {
    /// Indices into the [`LayerStack`] scanned out by pipes, ascending
    pub layers: SmallVec<[usize; MAX_SDE_LAYERS]>,
    /// Where the remaining layers end up
    pub gpu_target: GpuTarget,
    /// Whether downscaling beyond the pipe limits may use the rotator
    pub rotator_downscale: bool,
}

impl HardwareAssignment {
    /// Assignment composing every layer on the GPU
    pub fn gpu_only() -> Self {
        HardwareAssignment {
            layers: SmallVec::new(),
            gpu_target: GpuTarget::Bottom,
            rotator_downscale: false,
        }
    }

    /// Number of layers on hardware
    pub fn count(&self) -> usize {
        self.layers.len()
    }

    /// Whether no layer is scanned out directly
    pub fn is_gpu_only(&self) -> bool {
        self.layers.is_empty()
    }

    /// Whether the layer at `index` is scanned out directly
    pub fn contains(&self, index: usize) -> bool {
        self.layers.contains(&index)
    }

    /// Number of mixer blend stages the assignment occupies
    pub fn blend_stages(&self) -> usize {
        self.layers.len() + usize::from(self.gpu_target != GpuTarget::None)
    }
}

/// A composition strategy
///
/// Implementations only produce candidates. Protocol checks are done by
/// [`StrategyEngine`], so an implementation may assume it is called in order.
pub trait Strategy: fmt::Debug + Send {
    /// Interface version the strategy implements
    fn version(&self) -> StrategyVersion;

    /// Begin a selection cycle for `stack`
    ///
    /// Returns the maximum number of candidates the strategy will offer.
    fn start(&mut self, stack: &LayerStack, constraints: &StrategyConstraints) -> usize;

    /// Produce the next candidate, `None` once there is nothing left to offer
    fn next_strategy(&mut self, constraints: &StrategyConstraints) -> Option<HardwareAssignment>;

    /// End the selection cycle
    fn stop(&mut self);
}

/// Errors caused by driving a strategy out of protocol
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    /// `start` was called during a running cycle
    #[error("Strategy cycle already started")]
    AlreadyStarted,
    /// `next_strategy` or `stop` was called without a running cycle
    #[error("Strategy cycle not started")]
    NotStarted,
    /// More candidates were requested than announced by `start`
    #[error("Strategy offered all of its {0} attempts")]
    AttemptsExhausted(usize),
    /// The strategy cannot serve the interface version of this crate
    #[error("Strategy version {library} cannot serve required version {required}")]
    IncompatibleVersion {
        /// Version implemented by the strategy
        library: StrategyVersion,
        /// Version required by the caller
        required: StrategyVersion,
    },
}

/// Protocol state of a [`StrategyEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyState {
    /// No cycle ran yet
    Idle,
    /// `start` succeeded, no candidate requested yet
    Started,
    /// At least one candidate was requested
    Iterating,
    /// The last cycle was stopped
    Stopped,
}

/// Drives a [`Strategy`] through its selection protocol
#[derive(Debug)]
pub struct StrategyEngine {
    strategy: Box<dyn Strategy>,
    state: StrategyState,
    max_attempts: usize,
    attempts: usize,
}

impl StrategyEngine {
    /// Wrap `strategy`, negotiating [`StrategyVersion::CURRENT`]
    pub fn new(strategy: Box<dyn Strategy>) -> Result<Self, StrategyError> {
        Self::with_required_version(strategy, StrategyVersion::CURRENT)
    }

    /// Wrap `strategy`, requiring it to serve `required`
    pub fn with_required_version(
        strategy: Box<dyn Strategy>,
        required: StrategyVersion,
    ) -> Result<Self, StrategyError> {
        let library = strategy.version();
        if !library.serves(required) {
            return Err(StrategyError::IncompatibleVersion { library, required });
        }
        debug!(%library, %required, "negotiated strategy version");

        Ok(StrategyEngine {
            strategy,
            state: StrategyState::Idle,
            max_attempts: 0,
            attempts: 0,
        })
    }

    /// Current protocol state
    pub fn state(&self) -> StrategyState {
        self.state
    }

    /// Candidates requested in the running cycle
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Begin a selection cycle, returning the maximum number of attempts
    #[instrument(level = "trace", skip_all, fields(layers = stack.len()))]
    pub fn start(
        &mut self,
        stack: &LayerStack,
        constraints: &StrategyConstraints,
    ) -> Result<usize, StrategyError> {
        if matches!(self.state, StrategyState::Started | StrategyState::Iterating) {
            return Err(StrategyError::AlreadyStarted);
        }

        self.max_attempts = self.strategy.start(stack, constraints);
        self.attempts = 0;
        self.state = StrategyState::Started;
        trace!(max_attempts = self.max_attempts, ?constraints, "strategy cycle started");
        Ok(self.max_attempts)
    }

    /// Request the next candidate of the running cycle
    ///
    /// `Ok(None)` signals that the strategy has nothing left to offer.
    #[profiling::function]
    pub fn next_strategy(
        &mut self,
        constraints: &StrategyConstraints,
    ) -> Result<Option<HardwareAssignment>, StrategyError> {
        if !matches!(self.state, StrategyState::Started | StrategyState::Iterating) {
            return Err(StrategyError::NotStarted);
        }
        if self.attempts >= self.max_attempts {
            return Err(StrategyError::AttemptsExhausted(self.max_attempts));
        }

        self.state = StrategyState::Iterating;
        self.attempts += 1;
        let candidate = self.strategy.next_strategy(constraints);
        if candidate.is_none() {
            // nothing left, further requests are out of protocol
            self.max_attempts = self.attempts;
        }
        trace!(attempt = self.attempts, ?candidate, "strategy candidate");
        Ok(candidate)
    }

    /// End the running cycle
    pub fn stop(&mut self) -> Result<(), StrategyError> {
        if !matches!(self.state, StrategyState::Started | StrategyState::Iterating) {
            return Err(StrategyError::NotStarted);
        }
        self.strategy.stop();
        self.state = StrategyState::Stopped;
        Ok(())
    }
}
