//! Layers handed to the display core for one composition cycle
//!
//! A [`LayerStack`] is owned by the caller and only read by the core. Layers
//! are stored back-to-front: index `0` is the bottom-most layer and the last
//! index is the top-most one. The index of a layer is its z-order.

use std::os::unix::io::RawFd;

use crate::{
    format::{self, Fourcc},
    sync::SyncPoint,
    utils::{Buffer, Physical, Rectangle, Size, Transform},
};

bitflags::bitflags! {
    /// Composition hints attached to a [`Layer`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LayerFlags: u32 {
        /// The layer must be composed by the GPU
        const SKIP = 1;
        /// The layer is a cursor and may use a cursor pipe
        const CURSOR = 2;
        /// The layer is a solid color fill without a backing buffer fetch
        const SOLID_FILL = 4;
        /// The layer content is protected
        const SECURE = 8;
    }
}

bitflags::bitflags! {
    /// Properties of the memory backing a [`LayerBuffer`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// Buffer uses universal bandwidth compression
        const UBWC = 1;
        /// Buffer uses legacy bandwidth compression
        const BWC = 2;
        /// Buffer is allocated from secure memory
        const SECURE = 4;
        /// Buffer content is interlaced
        const INTERLACED = 8;
        /// Buffer uses a macro-tiled layout
        const MACROTILE = 16;
    }
}

/// Blending of a layer with the layers below it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    /// Layer replaces everything below it
    Opaque,
    /// Color channels are premultiplied by alpha
    #[default]
    Premultiplied,
    /// Color channels are not premultiplied
    Coverage,
}

/// Buffer attached to a [`Layer`]
#[derive(Debug, Clone)]
pub struct LayerBuffer {
    /// Allocated width in pixels
    pub width: u32,
    /// Allocated height in pixels
    pub height: u32,
    /// Pixel format
    pub format: Fourcc,
    /// File descriptor of the backing memory
    pub fd: RawFd,
    /// Offset of the image data inside `fd`
    pub offset: u64,
    /// Memory properties
    pub flags: BufferFlags,
    /// Signaled once the producer has finished writing the buffer
    pub acquire_fence: SyncPoint,
}

impl LayerBuffer {
    /// Create a buffer description without a pending acquire fence
    pub fn new(width: u32, height: u32, format: Fourcc, fd: RawFd) -> Self {
        LayerBuffer {
            width,
            height,
            format,
            fd,
            offset: 0,
            flags: BufferFlags::empty(),
            acquire_fence: SyncPoint::signaled(),
        }
    }

    /// Allocated size of the buffer
    pub fn size(&self) -> Size<u32, Buffer> {
        Size::from((self.width, self.height))
    }

    /// Whether this buffer holds video content
    pub fn is_video(&self) -> bool {
        format::is_yuv(self.format)
    }

    /// Whether this buffer is stored compressed
    pub fn is_compressed(&self) -> bool {
        self.flags.intersects(BufferFlags::UBWC | BufferFlags::BWC)
    }
}

/// One compositable surface
#[derive(Debug, Clone)]
pub struct Layer {
    /// Backing buffer
    pub buffer: LayerBuffer,
    /// Region of the buffer to fetch
    pub src_crop: Rectangle<f64, Buffer>,
    /// Region of the display the crop is mapped to
    pub dst: Rectangle<i32, Physical>,
    /// Blending with the layers below
    pub blend: BlendMode,
    /// Plane alpha, `0xff` is fully opaque
    pub plane_alpha: u8,
    /// Rotation and flips applied when mapping `src_crop` onto `dst`
    pub transform: Transform,
    /// Composition hints
    pub flags: LayerFlags,
}

impl Layer {
    /// Create a layer that maps the full buffer onto `dst` without transformation
    pub fn new(buffer: LayerBuffer, dst: Rectangle<i32, Physical>) -> Self {
        let src_crop = Rectangle::from_size(buffer.size().to_f64());
        Layer {
            buffer,
            src_crop,
            dst,
            blend: BlendMode::default(),
            plane_alpha: 0xff,
            transform: Transform::Normal,
            flags: LayerFlags::empty(),
        }
    }

    /// Whether this layer holds video content
    pub fn is_video(&self) -> bool {
        self.buffer.is_video()
    }

    /// Whether scan-out requires a transposing rotation
    pub fn needs_rotation(&self) -> bool {
        self.transform.transposes()
    }

    /// Whether crop and destination differ in size, taking rotation into account
    pub fn needs_scaling(&self) -> bool {
        let src = self.transform.transform_size(self.src_crop.size);
        let dst = self.dst.size.to_f64();
        (src.w - dst.w).abs() > f64::EPSILON || (src.h - dst.h).abs() > f64::EPSILON
    }

    /// Whether the layer has geometry that can be scanned out at all
    pub fn is_valid(&self) -> bool {
        !self.src_crop.is_empty()
            && !self.dst.is_empty()
            && self.src_crop.loc.x >= 0.0
            && self.src_crop.loc.y >= 0.0
            && self.src_crop.right() <= f64::from(self.buffer.width)
            && self.src_crop.bottom() <= f64::from(self.buffer.height)
    }
}

/// Ordered layers of one frame, back-to-front
#[derive(Debug, Clone, Default)]
pub struct LayerStack {
    /// The layers, index `0` being the bottom-most one
    pub layers: Vec<Layer>,
}

impl LayerStack {
    /// Create a stack from back-to-front ordered layers
    pub fn new(layers: Vec<Layer>) -> Self {
        LayerStack { layers }
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the stack has no layers
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer at z-order `index`
    pub fn get(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    /// Indices of all video layers, bottom-most first
    pub fn video_layers(&self) -> impl Iterator<Item = usize> + '_ {
        self.layers
            .iter()
            .enumerate()
            .filter(|(_, layer)| layer.is_video())
            .map(|(index, _)| index)
    }
}
