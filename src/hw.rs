//! Hardware capability snapshot
//!
//! The [`ResourceDescriptor`] is probed once at startup through a
//! [`ResourceProbe`] and never changes afterwards. Every allocation attempt
//! reads it, nothing mutates it. A descriptor that cannot drive a display at
//! all (no pipes, no blend stages, ...) is rejected by
//! [`ResourceDescriptor::validate`] before any display is brought up.

use std::fmt;

use tracing::info;

bitflags::bitflags! {
    /// Optional hardware features of a display controller generation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HwFeatures: u32 {
        /// Legacy bandwidth compression
        const BWC = 1;
        /// Universal bandwidth compression
        const UBWC = 1 << 1;
        /// Pipes can decimate the source before scaling
        const DECIMATION = 1 << 2;
        /// Pipes can fetch macro-tiled buffers
        const MACROTILE = 1 << 3;
        /// The rotator can downscale while rotating
        const ROTATOR_DOWNSCALE = 1 << 4;
        /// RGB pipes have no scaler
        const NON_SCALAR_RGB = 1 << 5;
        /// Two pipes can feed one layer mixer, splitting a layer horizontally
        const SOURCE_SPLIT = 1 << 6;
    }
}

/// Classes of hardware pipes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipeClass {
    /// Video capable pipe with a full scaler and YUV support
    Vig,
    /// RGB pipe, optionally with a scaler
    Rgb,
    /// Plain DMA pipe without scaling
    Dma,
    /// Small cursor pipe
    Cursor,
}

impl PipeClass {
    /// All classes, in pool order
    pub const ALL: [PipeClass; 4] = [PipeClass::Vig, PipeClass::Rgb, PipeClass::Dma, PipeClass::Cursor];
}

impl fmt::Display for PipeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipeClass::Vig => "vig",
            PipeClass::Rgb => "rgb",
            PipeClass::Dma => "dma",
            PipeClass::Cursor => "cursor",
        })
    }
}

/// Hardware-wide compositing limits
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    /// Hardware generation identifier, informational
    pub hw_version: u32,
    /// Number of VIG pipes
    pub num_vig_pipe: u32,
    /// Number of RGB pipes
    pub num_rgb_pipe: u32,
    /// Number of DMA pipes
    pub num_dma_pipe: u32,
    /// Number of cursor pipes
    pub num_cursor_pipe: u32,
    /// Blend stages per layer mixer
    pub num_blending_stages: u32,
    /// Number of rotator blocks
    pub num_rotator: u32,
    /// Rotator sessions that can be in flight at once
    pub num_rotator_sessions: u32,
    /// Number of shared memory pool blocks
    pub num_smp: u32,
    /// Size of one shared memory pool block in bytes
    pub smp_size: u32,
    /// Maximum upscale factor of a pipe scaler
    pub max_scale_up: u32,
    /// Maximum downscale factor of a pipe scaler
    pub max_scale_down: u32,
    /// Maximum decimation factor, a power of two
    pub max_decimation: u32,
    /// Maximum downscale factor of the rotator
    pub max_rotator_downscale: u32,
    /// Bandwidth limit in low power mode, KB/s
    pub max_bandwidth_low: u64,
    /// Bandwidth limit in high power mode, KB/s
    pub max_bandwidth_high: u64,
    /// Maximum width of a layer mixer
    pub max_mixer_width: u32,
    /// Maximum source width a single pipe can fetch
    pub max_pipe_width: u32,
    /// Maximum edge length of a cursor layer
    pub max_cursor_size: u32,
    /// Optional features
    pub features: HwFeatures,
}

impl Default for ResourceDescriptor {
    fn default() -> Self {
        ResourceDescriptor {
            hw_version: 0,
            num_vig_pipe: 2,
            num_rgb_pipe: 2,
            num_dma_pipe: 2,
            num_cursor_pipe: 0,
            num_blending_stages: 7,
            num_rotator: 1,
            num_rotator_sessions: 4,
            num_smp: 22,
            smp_size: 8192,
            max_scale_up: 20,
            max_scale_down: 4,
            max_decimation: 16,
            max_rotator_downscale: 4,
            max_bandwidth_low: 3_100_000,
            max_bandwidth_high: 5_400_000,
            max_mixer_width: 2048,
            max_pipe_width: 2560,
            max_cursor_size: 128,
            features: HwFeatures::empty(),
        }
    }
}

/// Reasons a probed descriptor cannot drive a display
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// The hardware reports no pipes at all
    #[error("Hardware reports zero pipes")]
    NoPipes,
    /// The hardware reports no blend stages
    #[error("Hardware reports zero blending stages")]
    NoBlendStages,
    /// A scaling limit is below 1
    #[error("Invalid scaling limit `{name}` = {value}")]
    InvalidScaleLimit {
        /// Name of the limit
        name: &'static str,
        /// Reported value
        value: u32,
    },
    /// Mixer or pipe width is zero
    #[error("Hardware reports zero mixer or pipe width")]
    NoMixerWidth,
    /// No bandwidth is available in low power mode
    #[error("Hardware reports no bandwidth budget")]
    NoBandwidth,
    /// Decimation is advertised with a factor that is not a power of two
    #[error("Decimation factor {0} is not a power of two")]
    InvalidDecimation(u32),
}

impl ResourceDescriptor {
    /// Number of pipes of the given class
    pub fn pipe_count(&self, class: PipeClass) -> u32 {
        match class {
            PipeClass::Vig => self.num_vig_pipe,
            PipeClass::Rgb => self.num_rgb_pipe,
            PipeClass::Dma => self.num_dma_pipe,
            PipeClass::Cursor => self.num_cursor_pipe,
        }
    }

    /// Number of pipes over all classes
    pub fn total_pipes(&self) -> u32 {
        PipeClass::ALL.iter().map(|class| self.pipe_count(*class)).sum()
    }

    /// Bandwidth budget for the given power mode, KB/s
    pub fn max_bandwidth(&self, mode: BandwidthMode) -> u64 {
        match mode {
            BandwidthMode::Low => self.max_bandwidth_low,
            BandwidthMode::High => self.max_bandwidth_high,
        }
    }

    /// Check the descriptor can drive a display at all
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.total_pipes() == 0 {
            return Err(DescriptorError::NoPipes);
        }
        if self.num_blending_stages == 0 {
            return Err(DescriptorError::NoBlendStages);
        }
        for (name, value) in [
            ("max_scale_up", self.max_scale_up),
            ("max_scale_down", self.max_scale_down),
        ] {
            if value == 0 {
                return Err(DescriptorError::InvalidScaleLimit { name, value });
            }
        }
        if self.features.contains(HwFeatures::ROTATOR_DOWNSCALE) && self.max_rotator_downscale == 0 {
            return Err(DescriptorError::InvalidScaleLimit {
                name: "max_rotator_downscale",
                value: 0,
            });
        }
        if self.features.contains(HwFeatures::DECIMATION) && !self.max_decimation.is_power_of_two() {
            return Err(DescriptorError::InvalidDecimation(self.max_decimation));
        }
        if self.max_mixer_width == 0 || self.max_pipe_width == 0 {
            return Err(DescriptorError::NoMixerWidth);
        }
        if self.max_bandwidth_low == 0 {
            return Err(DescriptorError::NoBandwidth);
        }
        Ok(())
    }
}

/// Selects which bandwidth budget of the descriptor applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BandwidthMode {
    /// Low power mode
    #[default]
    Low,
    /// High performance mode
    High,
}

/// Read-only source of the [`ResourceDescriptor`]
pub trait ResourceProbe {
    /// Query the hardware capabilities
    fn probe(&self) -> Result<ResourceDescriptor, DescriptorError>;
}

/// A [`ResourceProbe`] returning a fixed descriptor
#[derive(Debug, Clone)]
pub struct StaticProbe(pub ResourceDescriptor);

impl ResourceProbe for StaticProbe {
    fn probe(&self) -> Result<ResourceDescriptor, DescriptorError> {
        Ok(self.0.clone())
    }
}

/// Probe and validate a descriptor
pub fn probe_descriptor(probe: &dyn ResourceProbe) -> Result<ResourceDescriptor, DescriptorError> {
    let descriptor = probe.probe()?;
    descriptor.validate()?;
    info!(
        hw_version = descriptor.hw_version,
        vig = descriptor.num_vig_pipe,
        rgb = descriptor.num_rgb_pipe,
        dma = descriptor.num_dma_pipe,
        cursor = descriptor.num_cursor_pipe,
        rotator_sessions = descriptor.num_rotator_sessions,
        features = ?descriptor.features,
        "probed display hardware"
    );
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_pipes_is_fatal() {
        let descriptor = ResourceDescriptor {
            num_vig_pipe: 0,
            num_rgb_pipe: 0,
            num_dma_pipe: 0,
            num_cursor_pipe: 0,
            ..Default::default()
        };
        assert_eq!(
            probe_descriptor(&StaticProbe(descriptor)),
            Err(DescriptorError::NoPipes)
        );
    }

    #[test]
    fn decimation_must_be_power_of_two() {
        let descriptor = ResourceDescriptor {
            features: HwFeatures::DECIMATION,
            max_decimation: 6,
            ..Default::default()
        };
        assert_eq!(descriptor.validate(), Err(DescriptorError::InvalidDecimation(6)));
    }

    #[test]
    fn default_descriptor_is_valid() {
        let descriptor = ResourceDescriptor::default();
        assert_eq!(descriptor.validate(), Ok(()));
        assert_eq!(descriptor.total_pipes(), 6);
        assert_eq!(descriptor.max_bandwidth(BandwidthMode::High), 5_400_000);
    }
}
