//! Memory bandwidth estimation of pipes

use crate::{
    format::{self, Fourcc},
    hw::{HwFeatures, ResourceDescriptor},
    layer::BufferFlags,
    utils::{Buffer, Physical, Size},
};

/// What a pipe fetches every refresh cycle
#[derive(Debug, Clone, Copy)]
pub struct FetchInfo {
    /// Source size read after decimation
    pub src: Size<f64, Buffer>,
    /// Destination size on the mixer
    pub dst: Size<i32, Physical>,
    /// Format read
    pub format: Fourcc,
    /// Memory properties of the source
    pub flags: BufferFlags,
}

/// Bandwidth a pipe needs in KB/s at `refresh_hz`
///
/// Vertical downscaling fetches more lines per output line and raises the
/// rate by the downscale ratio. Compressed buffers are assumed to halve the
/// traffic when the hardware decodes their compression.
pub fn pipe_bandwidth(fetch: &FetchInfo, refresh_hz: u32, descriptor: &ResourceDescriptor) -> u64 {
    let mut bytes = fetch.src.w * fetch.src.h * format::bytes_per_pixel(fetch.format) * f64::from(refresh_hz);

    let dst_h = f64::from(fetch.dst.h.max(1));
    if fetch.src.h > dst_h {
        bytes *= fetch.src.h / dst_h;
    }

    let ubwc = fetch.flags.contains(BufferFlags::UBWC) && descriptor.features.contains(HwFeatures::UBWC);
    let bwc = fetch.flags.contains(BufferFlags::BWC) && descriptor.features.contains(HwFeatures::BWC);
    if ubwc || bwc {
        bytes /= 2.0;
    }

    (bytes / 1000.0).ceil() as u64
}
