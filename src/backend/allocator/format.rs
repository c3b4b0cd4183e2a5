//! Format info tables for scanout buffers.
//!
//! The legacy framebuffer path describes pixel formats through a `(depth, bpp)` pair
//! instead of a fourcc. This module maps between the two for the formats the display
//! controllers handled by this crate can scan out.
//!
//! ```
//! # use armsoc::backend::allocator::format::{fourcc_for, depth_bpp};
//! # use drm_fourcc::DrmFourcc;
//! assert_eq!(fourcc_for(24, 32), Some(DrmFourcc::Xrgb8888));
//! assert_eq!(depth_bpp(DrmFourcc::Argb8888), Some((32, 32)));
//! ```
//!
//! Row strides of every buffer allocated here are aligned to [`PITCH_ALIGN`] bytes.
//!
//! ```
//! # use armsoc::backend::allocator::format::aligned_pitch;
//! assert_eq!(aligned_pitch(100, 32), Some(448));
//! assert_eq!(aligned_pitch(u32::MAX, 32), None);
//! ```

use drm_fourcc::DrmFourcc;

/// Alignment of the row stride of every buffer, in bytes
pub const PITCH_ALIGN: u32 = 64;

macro_rules! format_tables {
    (
        $($fourcc: ident {
            $(opaque: $opaque: ident,)?
            alpha: $alpha: expr,
            bpp: $bpp: expr,
            depth: $depth: expr $(,)?
        }),*
    ) => {
        /// Returns the format scanned out for a `(depth, bpp)` pair, if any.
        pub const fn fourcc_for(depth: u32, bpp: u32) -> Option<DrmFourcc> {
            $(
                if depth == $depth && bpp == $bpp {
                    return Some(DrmFourcc::$fourcc);
                }
            )*
            None
        }

        /// Returns the `(depth, bpp)` pair describing `format` to the legacy framebuffer path.
        pub const fn depth_bpp(format: DrmFourcc) -> Option<(u32, u32)> {
            match format {
                $(DrmFourcc::$fourcc => Some(($depth, $bpp)),)*
                _ => None,
            }
        }

        /// Returns true if the format has an alpha channel.
        pub const fn has_alpha(format: DrmFourcc) -> bool {
            match format {
                $(DrmFourcc::$fourcc => $alpha,)*
                _ => false,
            }
        }

        /// Returns the opaque alternative of the specified format.
        pub const fn get_opaque(format: DrmFourcc) -> Option<DrmFourcc> {
            match format {
                $($(DrmFourcc::$fourcc => Some(DrmFourcc::$opaque),)?)*
                _ => None,
            }
        }

        #[cfg(test)]
        fn _impl_formats() -> &'static [DrmFourcc] {
            &[$(DrmFourcc::$fourcc,)*]
        }
    };
}

format_tables! {
    C8 {
        alpha: false,
        bpp: 8,
        depth: 8,
    },
    Xrgb1555 {
        alpha: false,
        bpp: 16,
        depth: 15,
    },
    Rgb565 {
        alpha: false,
        bpp: 16,
        depth: 16,
    },
    Rgb888 {
        alpha: false,
        bpp: 24,
        depth: 24,
    },
    Xrgb8888 {
        alpha: false,
        bpp: 32,
        depth: 24,
    },
    Xrgb2101010 {
        alpha: false,
        bpp: 32,
        depth: 30,
    },
    Argb8888 {
        opaque: Xrgb8888,
        alpha: true,
        bpp: 32,
        depth: 32,
    }
}

/// Bytes needed to store one pixel of `bpp` bits
pub const fn bytes_per_pixel(bpp: u32) -> u32 {
    bpp / 8 + (bpp % 8 != 0) as u32
}

/// Row stride of a `width` pixels wide buffer, aligned to [`PITCH_ALIGN`]
///
/// Returns `None` if the stride does not fit a `u32`.
pub const fn aligned_pitch(width: u32, bpp: u32) -> Option<u32> {
    let align = PITCH_ALIGN as u64;
    let pitch = width as u64 * bytes_per_pixel(bpp) as u64;
    let aligned = (pitch + align - 1) & !(align - 1);
    if aligned > u32::MAX as u64 {
        None
    } else {
        Some(aligned as u32)
    }
}

/// Size in bytes of a `width`x`height` buffer with an aligned stride
///
/// Returns `None` if the stride does not fit a `u32`.
pub const fn buffer_size(width: u32, height: u32, bpp: u32) -> Option<u64> {
    match aligned_pitch(width, bpp) {
        Some(pitch) => Some(pitch as u64 * height as u64),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        _impl_formats, aligned_pitch, buffer_size, bytes_per_pixel, depth_bpp, fourcc_for, get_opaque,
        has_alpha,
    };

    /// Tests that every format converts cleanly to `(depth, bpp)` and back.
    #[test]
    fn depth_bpp_inverse() {
        for &format in _impl_formats() {
            let (depth, bpp) = depth_bpp(format).expect("format in table");
            assert_eq!(
                fourcc_for(depth, bpp),
                Some(format),
                "{} doesn't cleanly convert back from ({}, {})",
                format,
                depth,
                bpp
            );
        }
    }

    /// Tests that opaque alternatives drop the alpha channel but keep the bpp.
    #[test]
    fn opaque_alternatives() {
        for &format in _impl_formats() {
            if let Some(opaque) = get_opaque(format) {
                assert!(has_alpha(format));
                assert!(!has_alpha(opaque), "{}'s opaque alternative has alpha", format);
                assert_eq!(depth_bpp(format).unwrap().1, depth_bpp(opaque).unwrap().1);
                assert_eq!(get_opaque(opaque), None);
            }
        }
    }

    #[test]
    fn pitch_alignment() {
        assert_eq!(aligned_pitch(1, 32), Some(64));
        assert_eq!(aligned_pitch(16, 32), Some(64));
        assert_eq!(aligned_pitch(17, 32), Some(128));
        assert_eq!(aligned_pitch(1920, 16), Some(3840));
        assert_eq!(aligned_pitch(64, 24), Some(192));
        assert_eq!(aligned_pitch(0, 32), Some(0));
    }

    #[test]
    fn oversized_geometry_has_no_pitch() {
        assert_eq!(bytes_per_pixel(u32::MAX), 0x2000_0000);
        // 0x4000_0000 * 4 wraps to 0 in u32
        assert_eq!(aligned_pitch(0x4000_0000, 32), None);
        assert_eq!(aligned_pitch(0x4000_0001, 32), None);
        assert_eq!(aligned_pitch(u32::MAX, 8), None);
        assert_eq!(aligned_pitch(0x3fff_fff0, 32), Some(0xffff_ffc0));

        assert_eq!(buffer_size(0x4000_0001, 1, 32), None);
        assert_eq!(buffer_size(0x3fff_fff0, 4, 32), Some(0xffff_ffc0 * 4));
        assert_eq!(buffer_size(100, 10, 32), Some(4480));
    }
}
