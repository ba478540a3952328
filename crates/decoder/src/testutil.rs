//! In-memory image fixtures shared by unit tests.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

/// Smooth RGB test pattern; `seed` shifts every channel.
pub fn rgb_pattern(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.push((x * 4).wrapping_add(u32::from(seed) * 16) as u8);
            pixels.push((y * 4).wrapping_add(u32::from(seed) * 8) as u8);
            pixels.push(((x + y) * 2).wrapping_add(u32::from(seed) * 32) as u8);
        }
    }
    pixels
}

pub fn jpeg_rgb(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90)
        .write_image(&rgb_pattern(width, height, seed), width, height, ExtendedColorType::Rgb8)
        .unwrap();
    out
}

pub fn jpeg_gray(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let pixels: Vec<u8> = (0..width * height)
        .map(|i| (i % 251) as u8 ^ seed)
        .collect();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90)
        .write_image(&pixels, width, height, ExtendedColorType::L8)
        .unwrap();
    out
}

pub fn png_rgb(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(&rgb_pattern(width, height, seed), width, height, ExtendedColorType::Rgb8)
        .unwrap();
    out
}

/// A header-only JPEG: SOI, one SOF segment with the given sampling
/// factors, a minimal SOS and EOI. Decodes nowhere, parses fine.
pub fn synthetic_jpeg(sof: u8, precision: u8, width: u16, height: u16, factors: &[(u8, u8)]) -> Vec<u8> {
    let n = factors.len() as u8;
    let mut out = vec![0xFF, 0xD8];

    out.extend_from_slice(&[0xFF, sof]);
    out.extend_from_slice(&(8 + 3 * u16::from(n)).to_be_bytes());
    out.push(precision);
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(&width.to_be_bytes());
    out.push(n);
    for (i, (h, v)) in factors.iter().enumerate() {
        out.extend_from_slice(&[i as u8 + 1, (h << 4) | v, 0]);
    }

    out.extend_from_slice(&[0xFF, 0xDA]);
    out.extend_from_slice(&(6 + 2 * u16::from(n)).to_be_bytes());
    out.push(n);
    for i in 0..n {
        out.extend_from_slice(&[i + 1, 0x00]);
    }
    out.extend_from_slice(&[0, 63, 0]);
    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}

/// Insert an Adobe APP14 segment with `transform` right after SOI.
pub fn with_adobe_segment(jpeg: &[u8], transform: u8) -> Vec<u8> {
    let mut out = jpeg[..2].to_vec();
    out.extend_from_slice(&[0xFF, 0xEE, 0x00, 0x0E]);
    out.extend_from_slice(b"Adobe");
    out.extend_from_slice(&[0x00, 0x64, 0x00, 0x00, 0x00, 0x00, transform]);
    out.extend_from_slice(&jpeg[2..]);
    out
}
