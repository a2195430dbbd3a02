//! Per-pixel feature primitives shared by the hasher, the objectness filter
//! and the matcher cascade: central-difference surface normals and intensity
//! gradients, their quantizers, and HSV color handling.

use image::{GrayImage, Luma, Rgb, RgbImage};

use crate::GrayF32Image;

/// Surface normal quantization bins.
pub const SURFACE_NORMAL_BINS: u8 = 8;
/// Gradient orientation quantization bins.
pub const ORIENTATION_BINS: u8 = 5;

const FRAC: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Octahedron face unit normals, one per quantization bin. The order is
/// load-bearing: trained bin indices refer into this table.
const OCTAHEDRON_FACES: [[f32; 3]; 8] = [
    [FRAC, 0.0, FRAC],
    [0.0, FRAC, FRAC],
    [-FRAC, 0.0, FRAC],
    [0.0, -FRAC, FRAC],
    [FRAC, 0.0, -FRAC],
    [0.0, FRAC, -FRAC],
    [-FRAC, 0.0, -FRAC],
    [0.0, -FRAC, -FRAC],
];

/// Surface normal from central depth differences.
///
/// `(x, y)` must lie in the 1-pixel interior of the image; zero-depth
/// neighbors poison the result, so callers avoid holes.
pub fn surface_normal(depth: &GrayF32Image, x: u32, y: u32) -> [f32; 3] {
    let d = |x: u32, y: u32| depth.get_pixel(x, y)[0];
    let dzdx = (d(x + 1, y) - d(x - 1, y)) / 2.0;
    let dzdy = (d(x, y + 1) - d(x, y - 1)) / 2.0;
    normalize([-dzdy, -dzdx, 1.0])
}

/// Bin index of a surface normal: argmax dot product over the octahedron
/// faces. Equal dots resolve to the lowest index.
pub fn quantize_surface_normal(n: [f32; 3]) -> u8 {
    let mut best = 0usize;
    let mut best_dot = f32::NEG_INFINITY;
    for (i, face) in OCTAHEDRON_FACES.iter().enumerate() {
        let dot = n[0] * face[0] + n[1] * face[1] + n[2] * face[2];
        if dot > best_dot {
            best_dot = dot;
            best = i;
        }
    }
    best as u8
}

/// Intensity gradient direction in degrees `[0, 360)`, from central
/// differences on a normalized grayscale plane. Interior pixels only.
pub fn gradient_orientation(gray: &GrayF32Image, x: u32, y: u32) -> f32 {
    let g = |x: u32, y: u32| gray.get_pixel(x, y)[0];
    let dx = (g(x - 1, y) - g(x + 1, y)) / 2.0;
    let dy = (g(x, y - 1) - g(x, y + 1)) / 2.0;
    let deg = dy.atan2(dx).to_degrees();
    if deg < 0.0 { deg + 360.0 } else { deg }
}

/// Fold a direction into the `[0, 180)` semicircle and split it into five
/// 36-degree bins.
pub fn quantize_orientation(deg: f32) -> u8 {
    let folded = (deg as u32) % 180;
    (folded / 36) as u8
}

/// Clamp a sample coordinate into the 1-pixel interior required by the
/// central-difference kernels. The image must be at least 3x3.
pub fn clamp_interior(x: i64, y: i64, width: u32, height: u32) -> (u32, u32) {
    let cx = x.clamp(1, width as i64 - 2) as u32;
    let cy = y.clamp(1, height as i64 - 2) as u32;
    (cx, cy)
}

/// Render a normalized `[0, 1]` plane as u8 for the integer-only kernels.
pub fn gray_to_u8(src: &GrayF32Image) -> GrayImage {
    let mut out = GrayImage::new(src.width(), src.height());
    for (x, y, pixel) in src.enumerate_pixels() {
        let v = (pixel[0].clamp(0.0, 1.0) * 255.0).round() as u8;
        out.put_pixel(x, y, Luma([v]));
    }
    out
}

/// Convert one RGB pixel to HSV: hue in half-degrees `0..180`, saturation
/// and value `0..255`.
pub fn rgb_to_hsv(p: Rgb<u8>) -> [u8; 3] {
    let r = p[0] as f32;
    let g = p[1] as f32;
    let b = p[2] as f32;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let v = max;
    let s = if max > 0.0 { delta / max * 255.0 } else { 0.0 };
    let h = if delta > 0.0 {
        let deg = if max == r {
            60.0 * ((g - b) / delta)
        } else if max == g {
            60.0 * ((b - r) / delta) + 120.0
        } else {
            60.0 * ((r - g) / delta) + 240.0
        };
        let deg = if deg < 0.0 { deg + 360.0 } else { deg };
        deg / 2.0
    } else {
        0.0
    };

    [h.round().min(179.0) as u8, s.round() as u8, v.round() as u8]
}

/// HSV rendition of a whole color plane.
pub fn rgb_to_hsv_image(rgb: &RgbImage) -> RgbImage {
    let mut out = RgbImage::new(rgb.width(), rgb.height());
    for (x, y, pixel) in rgb.enumerate_pixels() {
        out.put_pixel(x, y, Rgb(rgb_to_hsv(*pixel)));
    }
    out
}

/// True when two HSV pixels agree within the given tolerances: circular hue
/// delta at most `hue_tol_deg` degrees, saturation and value each within
/// `sv_tol`.
pub fn hsv_close(a: [u8; 3], b: [u8; 3], hue_tol_deg: f32, sv_tol: u8) -> bool {
    let dh = (a[0] as i32 - b[0] as i32).abs();
    let dh = dh.min(180 - dh);
    (dh * 2) as f32 <= hue_tol_deg
        && (a[1] as i32 - b[1] as i32).unsigned_abs() <= sv_tol as u32
        && (a[2] as i32 - b[2] as i32).unsigned_abs() <= sv_tol as u32
}

fn normalize(v: [f32; 3]) -> [f32; 3] {
    let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    [v[0] / len, v[1] / len, v[2] / len]
}
