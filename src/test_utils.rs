//! Fixtures shared by the unit tests

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    format::Fourcc,
    hw::{HwFeatures, ResourceDescriptor},
    layer::{Layer, LayerBuffer},
    manager::ResourceManager,
    pool::{DisplayId, PipePool, RotatorPool},
    scalar::ScalarConfigurator,
    strategy::{GpuTarget, HardwareAssignment},
    sync::{Fence, FenceError},
    utils::Rectangle,
};

/// Hardware with `vig` video pipes and `rgb` graphics pipes only
pub fn descriptor(vig: u32, rgb: u32) -> ResourceDescriptor {
    ResourceDescriptor {
        num_vig_pipe: vig,
        num_rgb_pipe: rgb,
        num_dma_pipe: 0,
        num_cursor_pipe: 0,
        features: HwFeatures::empty(),
        ..ResourceDescriptor::default()
    }
}

fn layer(x: i32, y: i32, w: i32, h: i32, format: Fourcc) -> Layer {
    Layer::new(
        LayerBuffer::new(w as u32, h as u32, format, 3),
        Rectangle::new((x, y).into(), (w, h).into()),
    )
}

/// Unscaled NV12 layer covering the given region
pub fn video_layer(x: i32, y: i32, w: i32, h: i32) -> Layer {
    layer(x, y, w, h, Fourcc::Nv12)
}

/// Unscaled ARGB layer covering the given region
pub fn graphics_layer(x: i32, y: i32, w: i32, h: i32) -> Layer {
    layer(x, y, w, h, Fourcc::Argb8888)
}

pub fn assignment(layers: &[usize], gpu_target: GpuTarget) -> HardwareAssignment {
    HardwareAssignment {
        layers: layers.iter().copied().collect(),
        gpu_target,
        rotator_downscale: false,
    }
}

pub fn manager(descriptor: ResourceDescriptor) -> ResourceManager {
    manager_with_scalar(descriptor, ScalarConfigurator::default())
}

/// Manager of display 0 over fresh pools
pub fn manager_with_scalar(descriptor: ResourceDescriptor, scalar: ScalarConfigurator) -> ResourceManager {
    let pipes = Arc::new(Mutex::new(PipePool::new(&descriptor)));
    let rotators = Arc::new(Mutex::new(RotatorPool::new(descriptor.num_rotator_sessions as usize)));
    ResourceManager::new(DisplayId(0), Arc::new(descriptor), pipes, rotators, scalar)
}

/// Managers of displays 0 and 1 over the same fresh pools
pub fn managers_sharing_pools(descriptor: ResourceDescriptor) -> [ResourceManager; 2] {
    let pipes = Arc::new(Mutex::new(PipePool::new(&descriptor)));
    let rotators = Arc::new(Mutex::new(RotatorPool::new(descriptor.num_rotator_sessions as usize)));
    let descriptor = Arc::new(descriptor);
    [0, 1].map(|id| {
        ResourceManager::new(
            DisplayId(id),
            descriptor.clone(),
            pipes.clone(),
            rotators.clone(),
            ScalarConfigurator::default(),
        )
    })
}

/// Fence signaled from the test body
#[derive(Debug)]
pub struct ManualFence(Arc<AtomicBool>);

/// Handle signaling a [`ManualFence`] after it was moved into a sync point
#[derive(Debug, Clone)]
pub struct ManualFenceHandle(Arc<AtomicBool>);

impl ManualFence {
    pub fn new(signaled: bool) -> Self {
        ManualFence(Arc::new(AtomicBool::new(signaled)))
    }

    pub fn handle(&self) -> ManualFenceHandle {
        ManualFenceHandle(self.0.clone())
    }
}

impl ManualFenceHandle {
    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Fence for ManualFence {
    fn is_signaled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn wait(&self, timeout: Duration) -> Result<(), FenceError> {
        if self.is_signaled() {
            Ok(())
        } else {
            Err(FenceError::Timeout(timeout))
        }
    }
}
