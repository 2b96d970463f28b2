//! Format info tables for layer buffer formats.
//!
//! Pipe selection and bandwidth estimation only need a handful of facts about a
//! buffer format, provided by the following lookup functions:
//!
//! [`is_yuv`] returns true for video formats, which can only be fetched by VIG pipes.
//!
//! ```
//! # use display_core::format::{is_yuv, Fourcc};
//! assert!(is_yuv(Fourcc::Nv12));
//! assert!(!is_yuv(Fourcc::Argb8888));
//! ```
//!
//! [`get_bpp`] returns the effective number of bits per pixel, averaged over
//! all planes for subsampled formats.
//!
//! ```
//! # use display_core::format::{get_bpp, Fourcc};
//! assert_eq!(get_bpp(Fourcc::Argb8888), Some(32));
//! assert_eq!(get_bpp(Fourcc::Nv12), Some(12));
//! ```
//!
//! [`plane_count`] and [`chroma_subsampling`] describe the memory layout the
//! scalar has to account for.

pub use drm_fourcc::DrmFourcc as Fourcc;

macro_rules! format_tables {
    (
        $($fourcc: ident {
            alpha: $alpha: expr,
            yuv: $yuv: expr,
            planes: $planes: expr,
            bpp: $bpp: expr,
            subsampling: ($sub_x: expr, $sub_y: expr) $(,)?
        }),* $(,)?
    ) => {
        /// Returns true if the format has an alpha channel.
        ///
        /// Unknown formats will always return `false`.
        pub const fn has_alpha(fourcc: Fourcc) -> bool {
            match fourcc {
                $(Fourcc::$fourcc => $alpha,)*
                _ => false,
            }
        }

        /// Returns true if the format is a YUV (video) format.
        ///
        /// Unknown formats will always return `false`.
        pub const fn is_yuv(fourcc: Fourcc) -> bool {
            match fourcc {
                $(Fourcc::$fourcc => $yuv,)*
                _ => false,
            }
        }

        /// Returns the number of memory planes of the format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn plane_count(fourcc: Fourcc) -> Option<usize> {
            match fourcc {
                $(Fourcc::$fourcc => Some($planes),)*
                _ => None,
            }
        }

        /// Returns the effective bits per pixel of the format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_bpp(fourcc: Fourcc) -> Option<u32> {
            match fourcc {
                $(Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        /// Returns the horizontal and vertical chroma subsampling factors.
        ///
        /// RGB and unknown formats report `(1, 1)`.
        pub const fn chroma_subsampling(fourcc: Fourcc) -> (u32, u32) {
            match fourcc {
                $(Fourcc::$fourcc => ($sub_x, $sub_y),)*
                _ => (1, 1),
            }
        }
    };
}

format_tables! {
    Argb8888 { alpha: true, yuv: false, planes: 1, bpp: 32, subsampling: (1, 1) },
    Xrgb8888 { alpha: false, yuv: false, planes: 1, bpp: 32, subsampling: (1, 1) },
    Abgr8888 { alpha: true, yuv: false, planes: 1, bpp: 32, subsampling: (1, 1) },
    Xbgr8888 { alpha: false, yuv: false, planes: 1, bpp: 32, subsampling: (1, 1) },
    Rgba8888 { alpha: true, yuv: false, planes: 1, bpp: 32, subsampling: (1, 1) },
    Rgbx8888 { alpha: false, yuv: false, planes: 1, bpp: 32, subsampling: (1, 1) },
    Bgra8888 { alpha: true, yuv: false, planes: 1, bpp: 32, subsampling: (1, 1) },
    Bgrx8888 { alpha: false, yuv: false, planes: 1, bpp: 32, subsampling: (1, 1) },
    Argb2101010 { alpha: true, yuv: false, planes: 1, bpp: 32, subsampling: (1, 1) },
    Xrgb2101010 { alpha: false, yuv: false, planes: 1, bpp: 32, subsampling: (1, 1) },
    Rgb888 { alpha: false, yuv: false, planes: 1, bpp: 24, subsampling: (1, 1) },
    Bgr888 { alpha: false, yuv: false, planes: 1, bpp: 24, subsampling: (1, 1) },
    Rgb565 { alpha: false, yuv: false, planes: 1, bpp: 16, subsampling: (1, 1) },
    Bgr565 { alpha: false, yuv: false, planes: 1, bpp: 16, subsampling: (1, 1) },

    // semi-planar
    Nv12 { alpha: false, yuv: true, planes: 2, bpp: 12, subsampling: (2, 2) },
    Nv21 { alpha: false, yuv: true, planes: 2, bpp: 12, subsampling: (2, 2) },
    Nv16 { alpha: false, yuv: true, planes: 2, bpp: 16, subsampling: (2, 1) },
    Nv61 { alpha: false, yuv: true, planes: 2, bpp: 16, subsampling: (2, 1) },

    // planar
    Yuv420 { alpha: false, yuv: true, planes: 3, bpp: 12, subsampling: (2, 2) },
    Yvu420 { alpha: false, yuv: true, planes: 3, bpp: 12, subsampling: (2, 2) },

    // packed
    Yuyv { alpha: false, yuv: true, planes: 1, bpp: 16, subsampling: (2, 1) },
    Yvyu { alpha: false, yuv: true, planes: 1, bpp: 16, subsampling: (2, 1) },
    Uyvy { alpha: false, yuv: true, planes: 1, bpp: 16, subsampling: (2, 1) },
    Vyuy { alpha: false, yuv: true, planes: 1, bpp: 16, subsampling: (2, 1) },
}

/// Average bytes fetched per pixel, with unknown formats treated as 32 bpp.
pub fn bytes_per_pixel(fourcc: Fourcc) -> f64 {
    f64::from(get_bpp(fourcc).unwrap_or(32)) / 8.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv_formats_are_subsampled() {
        for fourcc in [Fourcc::Nv12, Fourcc::Nv21, Fourcc::Yuv420] {
            assert!(is_yuv(fourcc));
            assert_eq!(chroma_subsampling(fourcc), (2, 2));
        }
        assert_eq!(plane_count(Fourcc::Yuv420), Some(3));
        assert_eq!(plane_count(Fourcc::Nv12), Some(2));
    }

    #[test]
    fn rgb_formats() {
        assert!(has_alpha(Fourcc::Argb8888));
        assert!(!has_alpha(Fourcc::Xrgb8888));
        assert_eq!(chroma_subsampling(Fourcc::Rgb565), (1, 1));
        assert_eq!(bytes_per_pixel(Fourcc::Rgb565), 2.0);
    }
}
