//! Objectness pre-filter: cheap edge-energy gating that cuts the sliding
//! window search space down before any template is consulted.

use image::{GrayImage, Luma, RgbImage, imageops};
use imageproc::edges::canny;
use imageproc::rect::Rect;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::GrayF32Image;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::Result;
use crate::features;
use crate::template::Template;
use crate::window::Window;

/// Minimum edgel count observed across the training set, one per channel
/// variant: the grayscale source, the color source reduced to luma, and the
/// depth source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinEdgels {
    pub gray: u32,
    pub color: u32,
    pub depth: u32,
}

/// Edge map of a u8 plane using the configured hysteresis band.
fn edge_map(plane: &GrayImage, config: &Config) -> GrayImage {
    canny(
        plane,
        config.objectness_min_threshold * 255.0,
        config.objectness_max_threshold * 255.0,
    )
}

/// u8 rendition of a depth plane, scaled by its own maximum. An all-zero
/// plane stays all zero and yields no edges.
fn depth_to_u8(depth: &GrayF32Image) -> GrayImage {
    let max = depth.pixels().map(|p| p[0]).fold(0.0f32, f32::max);
    let mut out = GrayImage::new(depth.width(), depth.height());
    if max <= 0.0 {
        return out;
    }
    for (x, y, pixel) in depth.enumerate_pixels() {
        let v = (pixel[0].max(0.0) / max * 255.0).round() as u8;
        out.put_pixel(x, y, Luma([v]));
    }
    out
}

fn count_edgels_in(map: &GrayImage, rect: &Rect) -> u32 {
    let mut count = 0;
    for y in rect.top()..rect.top() + rect.height() as i32 {
        for x in rect.left()..rect.left() + rect.width() as i32 {
            if map.get_pixel(x as u32, y as u32)[0] > 0 {
                count += 1;
            }
        }
    }
    count
}

/// Summed-area table of an edge map for O(1) window counts.
struct EdgeIntegral {
    sums: Vec<u32>,
    width: usize,
}

impl EdgeIntegral {
    fn new(map: &GrayImage) -> EdgeIntegral {
        let (w, h) = (map.width() as usize, map.height() as usize);
        // One-padded layout: sums[(y + 1) * (w + 1) + (x + 1)] covers [0, x] x [0, y].
        let mut sums = vec![0u32; (w + 1) * (h + 1)];
        for y in 0..h {
            let mut row = 0u32;
            for x in 0..w {
                if map.get_pixel(x as u32, y as u32)[0] > 0 {
                    row += 1;
                }
                sums[(y + 1) * (w + 1) + (x + 1)] = sums[y * (w + 1) + (x + 1)] + row;
            }
        }
        EdgeIntegral { sums, width: w }
    }

    fn count(&self, left: u32, top: u32, width: u32, height: u32) -> u32 {
        let stride = self.width + 1;
        let (l, t) = (left as usize, top as usize);
        let (r, b) = (l + width as usize, t + height as usize);
        self.sums[b * stride + r] + self.sums[t * stride + l]
            - self.sums[t * stride + r]
            - self.sums[b * stride + l]
    }
}

/// Per-variant minimum edgel counts within the object bounding boxes of the
/// trained templates.
pub(crate) fn extract_min_edgels(
    templates: &[Template],
    config: &Config,
    cancel: &CancelToken,
) -> Result<MinEdgels> {
    let counts: Vec<(u32, u32, u32)> = templates
        .par_iter()
        .map(|t| -> Result<(u32, u32, u32)> {
            cancel.check()?;
            let gray_edges = edge_map(&features::gray_to_u8(&t.src_gray), config);
            let color_edges = edge_map(&imageops::grayscale(&t.src_rgb), config);
            let depth_edges = edge_map(&depth_to_u8(&t.src_depth), config);
            Ok((
                count_edgels_in(&gray_edges, &t.object_bb),
                count_edgels_in(&color_edges, &t.object_bb),
                count_edgels_in(&depth_edges, &t.object_bb),
            ))
        })
        .collect::<Result<_>>()?;

    let mut min = MinEdgels { gray: u32::MAX, color: u32::MAX, depth: u32::MAX };
    for (g, c, d) in counts {
        min.gray = min.gray.min(g);
        min.color = min.color.min(c);
        min.depth = min.depth.min(d);
    }
    Ok(min)
}

/// Slide a `window_size` rectangle across the scene at the configured step
/// and keep the positions whose edge energy reaches the required fraction
/// of the training minimum in every channel variant.
pub(crate) fn detect_windows(
    scene_rgb: &RgbImage,
    scene_gray: &GrayF32Image,
    scene_depth: &GrayF32Image,
    min_edgels: &MinEdgels,
    window_size: (u32, u32),
    config: &Config,
) -> Vec<Window> {
    let (scene_w, scene_h) = scene_gray.dimensions();
    let (win_w, win_h) = window_size;
    if win_w == 0 || win_h == 0 || win_w > scene_w || win_h > scene_h {
        return Vec::new();
    }

    let gray = EdgeIntegral::new(&edge_map(&features::gray_to_u8(scene_gray), config));
    let color = EdgeIntegral::new(&edge_map(&imageops::grayscale(scene_rgb), config));
    let depth = EdgeIntegral::new(&edge_map(&depth_to_u8(scene_depth), config));

    let required = |min: u32| (config.objectness_match_threshold_factor * min as f32).ceil() as u32;
    let (need_gray, need_color, need_depth) =
        (required(min_edgels.gray), required(min_edgels.color), required(min_edgels.depth));

    let step = config.objectness_step as usize;
    let mut windows = Vec::new();
    for y in (0..=scene_h - win_h).step_by(step) {
        for x in (0..=scene_w - win_w).step_by(step) {
            if gray.count(x, y, win_w, win_h) >= need_gray
                && color.count(x, y, win_w, win_h) >= need_color
                && depth.count(x, y, win_w, win_h) >= need_depth
            {
                windows.push(Window::new(Rect::at(x as i32, y as i32).of_size(win_w, win_h)));
            }
        }
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageBuffer;

    fn checkered_gray(width: u32, height: u32) -> GrayImage {
        ImageBuffer::from_fn(width, height, |x, _| {
            if (x / 4) % 2 == 0 { Luma([30u8]) } else { Luma([220u8]) }
        })
    }

    // --- Integral counting ---

    #[test]
    fn test_integral_counts_match_direct_counts() {
        let edges = edge_map(&checkered_gray(40, 30), &Config::default());
        let integral = EdgeIntegral::new(&edges);

        for &(x, y, w, h) in &[(0u32, 0u32, 40u32, 30u32), (5, 5, 10, 10), (17, 3, 21, 20)] {
            let direct = count_edgels_in(&edges, &Rect::at(x as i32, y as i32).of_size(w, h));
            assert_eq!(integral.count(x, y, w, h), direct, "window ({x},{y},{w},{h})");
        }
    }

    // --- Depth rendering ---

    #[test]
    fn test_all_zero_depth_yields_no_edges() {
        let depth: GrayF32Image = ImageBuffer::new(32, 32);
        let rendered = depth_to_u8(&depth);
        assert!(rendered.pixels().all(|p| p[0] == 0));
        let edges = edge_map(&rendered, &Config::default());
        assert!(edges.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_depth_step_produces_edges() {
        let depth: GrayF32Image =
            ImageBuffer::from_fn(32, 32, |x, _| Luma([if x < 16 { 1.0 } else { 2.0 }]));
        let edges = edge_map(&depth_to_u8(&depth), &Config::default());
        assert!(edges.pixels().any(|p| p[0] > 0));
    }

    // --- Window gating ---

    #[test]
    fn test_windows_land_on_edge_energy() {
        let config = Config::default();
        // Scene with texture confined to the left half.
        let scene_gray: GrayF32Image = ImageBuffer::from_fn(60, 40, |x, _| {
            Luma([if x < 30 && (x / 3) % 2 == 0 { 0.1 } else { 0.8 }])
        });
        let scene_rgb: RgbImage = ImageBuffer::from_fn(60, 40, |x, y| {
            let v = (scene_gray.get_pixel(x, y)[0] * 255.0) as u8;
            image::Rgb([v, v, v])
        });
        let scene_depth: GrayF32Image = ImageBuffer::from_fn(60, 40, |x, _| {
            Luma([if x < 30 && (x / 3) % 2 == 0 { 1.0 } else { 2.0 }])
        });

        let min = MinEdgels { gray: 60, color: 60, depth: 60 };
        let windows =
            detect_windows(&scene_rgb, &scene_gray, &scene_depth, &min, (20, 20), &config);

        assert!(!windows.is_empty());
        // 30% of 60 edgels never fits in the untextured right half.
        assert!(
            windows.iter().all(|w| w.rect.left() < 30),
            "windows leaked into the flat region: {:?}",
            windows.iter().map(|w| w.top_left()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_oversized_window_yields_nothing() {
        let scene_gray: GrayF32Image = ImageBuffer::new(20, 20);
        let scene_rgb = RgbImage::new(20, 20);
        let scene_depth: GrayF32Image = ImageBuffer::new(20, 20);
        let min = MinEdgels { gray: 0, color: 0, depth: 0 };
        let windows = detect_windows(
            &scene_rgb,
            &scene_gray,
            &scene_depth,
            &min,
            (40, 40),
            &Config::default(),
        );
        assert!(windows.is_empty());
    }
}
