//! Analysis layer visualization.
//!
//! Each layer is rendered to RGB with a colormap suited to its meaning:
//! hue wheels for the cyclic retinotopic maps, a diverging red/blue map
//! for the visual field sign, jet for response magnitude, grayscale for
//! the anatomical reference. Rendered layers are PNG-encoded and
//! base64'd for the `analysis_layer_ready` event; raw numeric arrays
//! never travel over the control or sync channels.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::{ImageEncoder, Rgb, RgbImage};
use ndarray::Array2;

use crate::error::{AppResult, IsiError};

/// Render a named analysis layer to RGB.
pub fn render_layer(name: &str, layer: &Array2<f32>) -> RgbImage {
    if name.starts_with("azimuth") || name.starts_with("elevation") || name.starts_with("phase") {
        render_hsv(layer)
    } else if name.starts_with("sign") {
        render_diverging(layer)
    } else if name.starts_with("magnitude") {
        render_jet(layer)
    } else if name.starts_with("area") {
        render_areas(layer)
    } else {
        // boundary_map and anything unrecognized: plain intensity.
        render_grayscale(layer)
    }
}

/// Grayscale rendering of a u8 image (anatomical reference).
pub fn render_anatomical(image: &Array2<u8>) -> RgbImage {
    let (height, width) = image.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let v = image[[y as usize, x as usize]];
        Rgb([v, v, v])
    })
}

/// PNG-encode and base64 an RGB image; returns `(base64, width, height)`.
pub fn png_base64(image: &RgbImage) -> AppResult<(String, u32, u32)> {
    let mut bytes = Vec::new();
    image::codecs::png::PngEncoder::new(&mut bytes)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| IsiError::Analysis(format!("PNG encode failed: {e}")))?;
    Ok((BASE64.encode(&bytes), image.width(), image.height()))
}

/// Write a rendered layer PNG next to the analysis HDF5.
pub fn save_png(image: &RgbImage, path: &std::path::Path) -> AppResult<()> {
    image
        .save(path)
        .map_err(|e| IsiError::Analysis(format!("cannot write {}: {e}", path.display())))
}

fn value_range(layer: &Array2<f32>) -> (f32, f32) {
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for &v in layer.iter() {
        if v.is_finite() {
            lo = lo.min(v);
            hi = hi.max(v);
        }
    }
    if !lo.is_finite() || !hi.is_finite() || hi <= lo {
        (0.0, 1.0)
    } else {
        (lo, hi)
    }
}

fn normalized(layer: &Array2<f32>, r: usize, c: usize, lo: f32, hi: f32) -> f32 {
    ((layer[[r, c]] - lo) / (hi - lo)).clamp(0.0, 1.0)
}

/// Hue-rotated HSV wheel (blue through red) for cyclic/positional maps.
fn render_hsv(layer: &Array2<f32>) -> RgbImage {
    let (lo, hi) = value_range(layer);
    let (height, width) = layer.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let t = normalized(layer, y as usize, x as usize, lo, hi);
        hsv_to_rgb(300.0 * t, 1.0, 1.0)
    })
}

/// Diverging blue (-) / white (0) / red (+), symmetric about zero.
fn render_diverging(layer: &Array2<f32>) -> RgbImage {
    let (lo, hi) = value_range(layer);
    let scale = lo.abs().max(hi.abs()).max(1e-6);
    let (height, width) = layer.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let v = (layer[[y as usize, x as usize]] / scale).clamp(-1.0, 1.0);
        if v >= 0.0 {
            let t = 1.0 - v;
            Rgb([255, (255.0 * t) as u8, (255.0 * t) as u8])
        } else {
            let t = 1.0 + v;
            Rgb([(255.0 * t) as u8, (255.0 * t) as u8, 255])
        }
    })
}

/// Classic jet ramp for magnitudes.
fn render_jet(layer: &Array2<f32>) -> RgbImage {
    let (lo, hi) = value_range(layer);
    let (height, width) = layer.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let t = normalized(layer, y as usize, x as usize, lo, hi);
        let r = (1.5 - (4.0 * t - 3.0).abs()).clamp(0.0, 1.0);
        let g = (1.5 - (4.0 * t - 2.0).abs()).clamp(0.0, 1.0);
        let b = (1.5 - (4.0 * t - 1.0).abs()).clamp(0.0, 1.0);
        Rgb([(255.0 * r) as u8, (255.0 * g) as u8, (255.0 * b) as u8])
    })
}

/// Distinct hues per labeled area, black background.
fn render_areas(layer: &Array2<f32>) -> RgbImage {
    let (height, width) = layer.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let label = layer[[y as usize, x as usize]] as u32;
        if label == 0 {
            Rgb([0, 0, 0])
        } else {
            // Golden-angle hue stepping keeps adjacent labels distinct.
            let hue = (label as f32 * 137.508) % 360.0;
            hsv_to_rgb(hue, 0.85, 1.0)
        }
    })
}

fn render_grayscale(layer: &Array2<f32>) -> RgbImage {
    let (lo, hi) = value_range(layer);
    let (height, width) = layer.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let t = normalized(layer, y as usize, x as usize, lo, hi);
        let v = (255.0 * t) as u8;
        Rgb([v, v, v])
    })
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
    let c = v * s;
    let hp = (h / 60.0).rem_euclid(6.0);
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = v - c;
    Rgb([
        (255.0 * (r + m)) as u8,
        (255.0 * (g + m)) as u8,
        (255.0 * (b + m)) as u8,
    ])
}
