//! Pixel-layout conversion kernels.
//!
//! The host-side helpers reshape decoded data inside pinned staging memory.
//! The `*_to_layout` kernels run as device stream commands and write the
//! final pixels straight into a sample's output region.

use pf_common::{rgb_to_luma, OutputLayout};

/// Expand `pixels` gray samples at the front of `buf` to interleaved RGB.
///
/// `buf` must hold at least `pixels * 3` bytes.
pub fn expand_gray_in_place(buf: &mut [u8], pixels: usize) {
    // Back to front so no unread gray value is overwritten.
    for i in (0..pixels).rev() {
        let l = buf[i];
        buf[i * 3..i * 3 + 3].copy_from_slice(&[l, l, l]);
    }
}

/// Split interleaved pixels with `channels` (1 or 3) channels into three
/// planes. `dst.len()` is three planes of `pixels` bytes.
pub fn interleaved_to_planar(src: &[u8], channels: usize, dst: &mut [u8]) {
    let plane = dst.len() / 3;
    let (r, rest) = dst.split_at_mut(plane);
    let (g, b) = rest.split_at_mut(plane);
    for (i, px) in src.chunks_exact(channels).take(plane).enumerate() {
        if channels == 1 {
            r[i] = px[0];
            g[i] = px[0];
            b[i] = px[0];
        } else {
            r[i] = px[0];
            g[i] = px[1];
            b[i] = px[2];
        }
    }
}

fn check_sizes(src: &[u8], dst: &[u8], layout: OutputLayout) -> Result<usize, String> {
    if src.len() % 3 != 0 {
        return Err(format!("source length {} is not RGB", src.len()));
    }
    let pixels = src.len() / 3;
    if dst.len() != pixels * layout.channels() {
        return Err(format!(
            "output region is {} bytes, {pixels} {layout} pixels need {}",
            dst.len(),
            pixels * layout.channels()
        ));
    }
    Ok(pixels)
}

/// Interleaved RGB to `layout`.
pub fn interleaved_to_layout(src: &[u8], dst: &mut [u8], layout: OutputLayout) -> Result<(), String> {
    check_sizes(src, dst, layout)?;
    match layout {
        OutputLayout::Rgb => dst.copy_from_slice(src),
        OutputLayout::Bgr => {
            for (d, s) in dst.chunks_exact_mut(3).zip(src.chunks_exact(3)) {
                d.copy_from_slice(&[s[2], s[1], s[0]]);
            }
        }
        OutputLayout::Gray => {
            for (d, s) in dst.iter_mut().zip(src.chunks_exact(3)) {
                *d = rgb_to_luma(s[0], s[1], s[2]);
            }
        }
    }
    Ok(())
}

/// Planar RGB (three consecutive planes) to `layout`.
pub fn planar_to_layout(src: &[u8], dst: &mut [u8], layout: OutputLayout) -> Result<(), String> {
    let pixels = check_sizes(src, dst, layout)?;
    let (r, rest) = src.split_at(pixels);
    let (g, b) = rest.split_at(pixels);
    match layout {
        OutputLayout::Rgb | OutputLayout::Bgr => {
            let (first, last) = if layout == OutputLayout::Rgb { (r, b) } else { (b, r) };
            for (i, d) in dst.chunks_exact_mut(3).enumerate() {
                d.copy_from_slice(&[first[i], g[i], last[i]]);
            }
        }
        OutputLayout::Gray => {
            for (i, d) in dst.iter_mut().enumerate() {
                *d = rgb_to_luma(r[i], g[i], b[i]);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RGB: [u8; 6] = [10, 20, 30, 40, 50, 60];

    #[test]
    fn gray_expansion() {
        let mut buf = [1, 2, 3, 0, 0, 0, 0, 0, 0];
        expand_gray_in_place(&mut buf, 3);
        assert_eq!(buf, [1, 1, 1, 2, 2, 2, 3, 3, 3]);
    }

    #[test]
    fn planar_split() {
        let mut planar = [0u8; 6];
        interleaved_to_planar(&RGB, 3, &mut planar);
        assert_eq!(planar, [10, 40, 20, 50, 30, 60]);

        let mut from_gray = [0u8; 6];
        interleaved_to_planar(&[7, 9], 1, &mut from_gray);
        assert_eq!(from_gray, [7, 9, 7, 9, 7, 9]);
    }

    #[test]
    fn planar_and_interleaved_agree() {
        let mut planar = [0u8; 6];
        interleaved_to_planar(&RGB, 3, &mut planar);
        for layout in [OutputLayout::Rgb, OutputLayout::Bgr, OutputLayout::Gray] {
            let mut a = vec![0u8; 2 * layout.channels()];
            let mut b = vec![0u8; 2 * layout.channels()];
            interleaved_to_layout(&RGB, &mut a, layout).unwrap();
            planar_to_layout(&planar, &mut b, layout).unwrap();
            assert_eq!(a, b, "{layout}");
        }
    }

    #[test]
    fn bgr_order() {
        let mut out = [0u8; 6];
        interleaved_to_layout(&RGB, &mut out, OutputLayout::Bgr).unwrap();
        assert_eq!(out, [30, 20, 10, 60, 50, 40]);
    }

    #[test]
    fn neutral_gray_is_exact() {
        let mut out = [0u8; 2];
        interleaved_to_layout(&[90, 90, 90, 255, 255, 255], &mut out, OutputLayout::Gray).unwrap();
        assert_eq!(out, [90, 255]);
    }

    #[test]
    fn size_mismatch_rejected() {
        let mut out = [0u8; 5];
        assert!(interleaved_to_layout(&RGB, &mut out, OutputLayout::Rgb).is_err());
        assert!(planar_to_layout(&RGB[..5], &mut out, OutputLayout::Rgb).is_err());
    }
}
