use smallvec::SmallVec;
use tracing::trace;

use super::{
    GpuTarget, HardwareAssignment, Strategy, StrategyConstraints, StrategyVersion, MAX_SDE_LAYERS,
};
use crate::layer::{LayerFlags, LayerStack};

/// The built-in composition strategy
///
/// Candidates are offered in this order:
///
/// 1. every layer on hardware, if the stack fits and no layer must be GPU composed
/// 2. a single bottom-most video layer on hardware with the GPU target above it
/// 3. the top `k` layers on hardware above the GPU target, for decreasing `k`,
///    never reaching below the top-most layer flagged [`LayerFlags::SKIP`]
/// 4. everything on the GPU
///
/// In safe mode only the single video layer and the GPU composition are offered.
///
/// Once the constraints ask for rotator assisted downscaling, the last rejected
/// candidate is offered once more with the rotator stage requested before the
/// strategy degrades further.
#[derive(Debug, Default)]
pub struct DefaultStrategy {
    candidates: Vec<HardwareAssignment>,
    next: usize,
    last_offered: Option<HardwareAssignment>,
    rotator_retried: bool,
}

impl DefaultStrategy {
    /// Create the strategy
    pub fn new() -> Self {
        DefaultStrategy::default()
    }

    fn push(&mut self, candidate: HardwareAssignment) {
        if !self.candidates.contains(&candidate) {
            self.candidates.push(candidate);
        }
    }

    fn single(index: usize, gpu_target: GpuTarget) -> HardwareAssignment {
        HardwareAssignment {
            layers: SmallVec::from_slice(&[index]),
            gpu_target,
            rotator_downscale: false,
        }
    }

    // A lone video layer can bypass the GPU when it is at either end of the stack.
    fn video_bypass(stack: &LayerStack) -> Option<HardwareAssignment> {
        let mut videos = stack.video_layers();
        let video = videos.next()?;
        if videos.next().is_some() || stack.layers[video].flags.contains(LayerFlags::SKIP) {
            return None;
        }

        let top = stack.len() - 1;
        match video {
            _ if top == 0 => Some(Self::single(video, GpuTarget::None)),
            0 => Some(Self::single(video, GpuTarget::Top)),
            index if index == top => Some(Self::single(video, GpuTarget::Bottom)),
            _ => None,
        }
    }

    fn allowed(candidate: &HardwareAssignment, constraints: &StrategyConstraints) -> bool {
        let limit = constraints.max_layers.min(MAX_SDE_LAYERS);
        candidate.count() <= limit && (!constraints.safe_mode || candidate.count() <= 1)
    }
}

impl Strategy for DefaultStrategy {
    fn version(&self) -> StrategyVersion {
        StrategyVersion::CURRENT
    }

    fn start(&mut self, stack: &LayerStack, constraints: &StrategyConstraints) -> usize {
        self.candidates.clear();
        self.next = 0;
        self.last_offered = None;
        self.rotator_retried = false;

        let count = stack.len();
        if count == 0 {
            self.push(HardwareAssignment::default());
            return self.candidates.len() + 1;
        }

        let limit = constraints.max_layers.min(MAX_SDE_LAYERS);
        if constraints.safe_mode {
            if let Some(video) = Self::video_bypass(stack) {
                self.push(video);
            }
            self.push(HardwareAssignment::gpu_only());
            // one extra attempt for the rotator downscale retry
            return self.candidates.len() + 1;
        }

        let skip_top = stack
            .layers
            .iter()
            .rposition(|layer| layer.flags.contains(LayerFlags::SKIP));

        if skip_top.is_none() && count <= limit {
            self.push(HardwareAssignment {
                layers: (0..count).collect(),
                gpu_target: GpuTarget::None,
                rotator_downscale: false,
            });
        }

        if let Some(video) = Self::video_bypass(stack) {
            self.push(video);
        }

        // the GPU target needs at least one layer, so the window never covers the full stack
        let first = skip_top.map(|index| index + 1).unwrap_or(1);
        let window = count.saturating_sub(first).min(limit);
        for k in (1..=window).rev() {
            self.push(HardwareAssignment {
                layers: (count - k..count).collect(),
                gpu_target: GpuTarget::Bottom,
                rotator_downscale: false,
            });
        }

        self.push(HardwareAssignment::gpu_only());
        trace!(candidates = self.candidates.len(), ?skip_top, "classified layer stack");
        self.candidates.len() + 1
    }

    fn next_strategy(&mut self, constraints: &StrategyConstraints) -> Option<HardwareAssignment> {
        if constraints.rotator_downscale && !self.rotator_retried {
            if let Some(last) = self.last_offered.as_ref().filter(|last| !last.is_gpu_only()) {
                self.rotator_retried = true;
                let mut retry = last.clone();
                retry.rotator_downscale = true;
                trace!(layers = ?retry.layers, "retrying with rotator downscale");
                return Some(retry);
            }
        }

        while let Some(candidate) = self.candidates.get(self.next) {
            self.next += 1;
            if Self::allowed(candidate, constraints) {
                let candidate = candidate.clone();
                self.last_offered = Some(candidate.clone());
                return Some(candidate);
            }
        }
        None
    }

    fn stop(&mut self) {
        self.candidates.clear();
        self.last_offered = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{graphics_layer, video_layer};

    fn drain(strategy: &mut DefaultStrategy, constraints: &StrategyConstraints) -> Vec<HardwareAssignment> {
        std::iter::from_fn(|| strategy.next_strategy(constraints)).collect()
    }

    fn layers(candidate: &HardwareAssignment) -> Vec<usize> {
        candidate.layers.to_vec()
    }

    #[test]
    fn candidates_degrade_towards_gpu() {
        let stack = LayerStack::new(vec![
            video_layer(0, 0, 1920, 1080),
            graphics_layer(0, 0, 1920, 100),
            graphics_layer(100, 100, 200, 100),
        ]);
        let constraints = StrategyConstraints::default();
        let mut strategy = DefaultStrategy::new();
        let max = strategy.start(&stack, &constraints);
        let candidates = drain(&mut strategy, &constraints);
        assert!(candidates.len() < max);

        let sets: Vec<_> = candidates.iter().map(layers).collect();
        assert_eq!(sets, vec![vec![0, 1, 2], vec![0], vec![1, 2], vec![2], vec![]]);
        assert_eq!(candidates[0].gpu_target, GpuTarget::None);
        assert_eq!(candidates[1].gpu_target, GpuTarget::Top);
        assert_eq!(candidates[2].gpu_target, GpuTarget::Bottom);
    }

    #[test]
    fn skip_layer_bounds_window() {
        let mut stack = LayerStack::new(vec![
            graphics_layer(0, 0, 100, 100),
            graphics_layer(0, 0, 100, 100),
            graphics_layer(0, 0, 100, 100),
        ]);
        stack.layers[1].flags |= LayerFlags::SKIP;
        let constraints = StrategyConstraints::default();
        let mut strategy = DefaultStrategy::new();
        strategy.start(&stack, &constraints);

        let sets: Vec<_> = drain(&mut strategy, &constraints).iter().map(layers).collect();
        assert_eq!(sets, vec![vec![2], vec![]]);
    }

    #[test]
    fn max_layers_limits_candidates() {
        let stack = LayerStack::new((0..4).map(|i| graphics_layer(i * 10, 0, 10, 10)).collect());
        let mut constraints = StrategyConstraints {
            max_layers: 2,
            ..Default::default()
        };
        let mut strategy = DefaultStrategy::new();
        strategy.start(&stack, &constraints);
        assert_eq!(strategy.next_strategy(&constraints).map(|c| layers(&c)), Some(vec![2, 3]));

        // tightened between attempts
        constraints.max_layers = 0;
        assert_eq!(strategy.next_strategy(&constraints), Some(HardwareAssignment::gpu_only()));
    }

    #[test]
    fn safe_mode_is_minimal_and_stable() {
        let stack = LayerStack::new(vec![video_layer(0, 0, 1920, 1080), graphics_layer(0, 0, 200, 100)]);
        let constraints = StrategyConstraints {
            safe_mode: true,
            ..Default::default()
        };

        let mut strategy = DefaultStrategy::new();
        strategy.start(&stack, &constraints);
        let first = drain(&mut strategy, &constraints);
        strategy.stop();
        strategy.start(&stack, &constraints);
        let second = drain(&mut strategy, &constraints);

        assert_eq!(first, second);
        assert_eq!(layers(&first[0]), vec![0]);
        assert!(first[1].is_gpu_only());
    }

    #[test]
    fn safe_mode_without_video_goes_to_gpu() {
        let stack = LayerStack::new(vec![graphics_layer(0, 0, 200, 100)]);
        let constraints = StrategyConstraints {
            safe_mode: true,
            ..Default::default()
        };
        let mut strategy = DefaultStrategy::new();
        strategy.start(&stack, &constraints);
        assert_eq!(drain(&mut strategy, &constraints), vec![HardwareAssignment::gpu_only()]);
    }

    #[test]
    fn rotator_downscale_retries_once() {
        let stack = LayerStack::new(vec![video_layer(0, 0, 240, 135)]);
        let mut constraints = StrategyConstraints::default();
        let mut strategy = DefaultStrategy::new();
        strategy.start(&stack, &constraints);

        let first = strategy.next_strategy(&constraints).unwrap();
        assert!(!first.rotator_downscale);

        constraints.rotator_downscale = true;
        let retry = strategy.next_strategy(&constraints).unwrap();
        assert_eq!(retry.layers, first.layers);
        assert!(retry.rotator_downscale);

        assert!(strategy.next_strategy(&constraints).unwrap().is_gpu_only());
        assert_eq!(strategy.next_strategy(&constraints), None);
    }

    #[test]
    fn empty_stack_offers_nothing_to_compose() {
        let mut strategy = DefaultStrategy::new();
        let constraints = StrategyConstraints::default();
        strategy.start(&LayerStack::default(), &constraints);
        let candidate = strategy.next_strategy(&constraints).unwrap();
        assert_eq!(candidate.blend_stages(), 0);
    }
}
