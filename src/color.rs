//! YVYU to BMP pixel conversion.
//!
//! The camera streams packed 4:2:2 groups of four bytes, two pixels per group
//! sharing one chroma pair. Conversion uses the BT.601 matrix approximated with
//! 10-bit fixed-point coefficients so the inner loop stays in integer math.
//!
//! Within a group the bytes are `[y0, c1, y1, c3]`. `c1` drives the 352 and
//! 1815 terms and `c3` drives the 1436 and 731 terms. Each output pixel is
//! written as `[green, red, blue]` formula results; downstream viewers were
//! calibrated against that layout, so it must not be reordered.

use crate::{FRAME_BYTES, PIXEL_BYTES};

/// Bytes consumed per packed group (two pixels).
pub const GROUP_BYTES: usize = 4;

/// Bytes produced per packed group (two 24-bit pixels).
pub const GROUP_OUT_BYTES: usize = 6;

const RED_V: i32 = 1436;
const GREEN_U: i32 = 352;
const GREEN_V: i32 = 731;
const BLUE_U: i32 = 1815;
const FIXED_SHIFT: u32 = 10;

/// Clamp a pre-clamp channel value to `0..=255`.
#[inline]
pub fn clamp_channel(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Convert one luma sample against a centred chroma pair.
///
/// `u` and `v` are already shifted into `-128..=127`.
#[inline]
pub fn convert_pixel(y: u8, u: i32, v: i32) -> [u8; 3] {
    let y = y as i32;
    let red = y + ((RED_V * v) >> FIXED_SHIFT);
    let green = y - ((GREEN_U * u) >> FIXED_SHIFT) - ((GREEN_V * v) >> FIXED_SHIFT);
    let blue = y + ((BLUE_U * u) >> FIXED_SHIFT);
    [clamp_channel(green), clamp_channel(red), clamp_channel(blue)]
}

/// Convert one packed group into two output pixels.
#[inline]
pub fn convert_group(group: &[u8; GROUP_BYTES]) -> [u8; GROUP_OUT_BYTES] {
    let [y0, c1, y1, c3] = *group;
    let u = c1 as i32 - 128;
    let v = c3 as i32 - 128;
    let p0 = convert_pixel(y0, u, v);
    let p1 = convert_pixel(y1, u, v);
    [p0[0], p0[1], p0[2], p1[0], p1[1], p1[2]]
}

/// Convert one full camera frame.
pub fn convert_frame(raw: &[u8; FRAME_BYTES], out: &mut [u8; PIXEL_BYTES]) {
    for (src, dst) in raw
        .chunks_exact(GROUP_BYTES)
        .zip(out.chunks_exact_mut(GROUP_OUT_BYTES))
    {
        let group = [src[0], src[1], src[2], src[3]];
        dst.copy_from_slice(&convert_group(&group));
    }
}
