//! Hardware cursor description and image conversion

/// How the display controller exposes its hardware cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorApi {
    /// A dedicated overlay plane positioned by the driver
    Plane,
    /// The legacy `SETCURSOR`/`MOVECURSOR` ioctls
    Standard,
    /// No hardware cursor, the server draws it in software
    None,
}

/// Pixel format the cursor image has to be handed over in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorFormat {
    /// 32 bit ARGB, passed through as is
    Argb8888,
    /// 2 bits per pixel, four pixels per byte, least significant bits first
    Lbbp,
}

/// Cursor capabilities of a SoC backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorInfo {
    /// Width of the cursor image in pixels
    pub width: u32,
    /// Height of the cursor image in pixels
    pub height: u32,
    /// Cursor interface
    pub api: CursorApi,
    /// Image format
    pub format: CursorFormat,
}

const LBBP_COLOR0: u8 = 0b00;
const LBBP_COLOR1: u8 = 0b01;
const LBBP_TRANSPARENT: u8 = 0b10;

fn lbbp_pixel(argb: u32) -> u8 {
    let alpha = argb >> 24;
    if alpha < 0x80 {
        return LBBP_TRANSPARENT;
    }
    let r = (argb >> 16) & 0xff;
    let g = (argb >> 8) & 0xff;
    let b = argb & 0xff;
    // ITU-R BT.601 luma
    let luma = (r * 299 + g * 587 + b * 114) / 1000;
    if luma >= 0x80 {
        LBBP_COLOR1
    } else {
        LBBP_COLOR0
    }
}

/// Convert a `width` x `height` ARGB8888 cursor image into `format`.
///
/// Returns `None` if `argb` does not hold exactly `width * height` pixels. For
/// [`CursorFormat::Argb8888`] the pixels are returned in native byte order.
pub fn convert_cursor(
    argb: &[u32],
    width: u32,
    height: u32,
    format: CursorFormat,
) -> Option<Vec<u8>> {
    let pixels = width as usize * height as usize;
    if argb.len() != pixels {
        return None;
    }

    match format {
        CursorFormat::Argb8888 => Some(argb.iter().flat_map(|p| p.to_ne_bytes()).collect()),
        CursorFormat::Lbbp => {
            let mut out = vec![0u8; (pixels + 3) / 4];
            for (i, &pixel) in argb.iter().enumerate() {
                out[i / 4] |= lbbp_pixel(pixel) << ((i % 4) * 2);
            }
            Some(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{convert_cursor, CursorFormat};

    const TRANSPARENT: u32 = 0x0000_0000;
    const WHITE: u32 = 0xffff_ffff;
    const BLACK: u32 = 0xff00_0000;

    #[test]
    fn lbbp_packs_lsb_first() {
        let image = [WHITE, BLACK, TRANSPARENT, WHITE];
        let out = convert_cursor(&image, 4, 1, CursorFormat::Lbbp).unwrap();
        assert_eq!(out, vec![0b01_10_00_01]);
    }

    #[test]
    fn lbbp_half_transparent_threshold() {
        let image = [0x7fff_ffff, 0x80ff_ffff, 0x8080_8080, 0x807f_7f7f];
        let out = convert_cursor(&image, 2, 2, CursorFormat::Lbbp).unwrap();
        assert_eq!(out, vec![0b00_01_01_10]);
    }

    #[test]
    fn lbbp_partial_byte() {
        let image = [WHITE; 5];
        let out = convert_cursor(&image, 5, 1, CursorFormat::Lbbp).unwrap();
        assert_eq!(out, vec![0b01_01_01_01, 0b01]);
    }

    #[test]
    fn argb_passthrough() {
        let out = convert_cursor(&[WHITE, BLACK], 2, 1, CursorFormat::Argb8888).unwrap();
        assert_eq!(out.len(), 8);
        assert_eq!(&out[4..], &BLACK.to_ne_bytes());
    }

    #[test]
    fn rejects_mismatched_size() {
        assert!(convert_cursor(&[WHITE; 3], 2, 2, CursorFormat::Lbbp).is_none());
    }
}
