//! Template matcher: selects per-template feature points at training time
//! and runs the ordered verification cascade over each window's candidate
//! list at detection time. Each test can reject its candidate and
//! short-circuit the rest.

use image::RgbImage;
use imageproc::edges::canny;
use imageproc::gradients::sobel_gradients;
use imageproc::point::Point;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::GrayF32Image;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::features;
use crate::template::{Template, TemplateFeatures, TemplateStore};
use crate::window::{Match, Window};

/// Scene planes the cascade samples from.
pub(crate) struct CascadeInput<'a> {
    pub gray: &'a GrayF32Image,
    pub depth: &'a GrayF32Image,
    /// HSV rendition of the scene color plane (hue in half-degrees).
    pub hsv: &'a RgbImage,
}

/// Select feature points and extract features for every template.
///
/// Templates without enough usable pixels are dropped with a warning;
/// training fails only when none survives or when cancelled.
pub(crate) fn train_templates(
    templates: Vec<Template>,
    config: &Config,
    cancel: &CancelToken,
) -> Result<Vec<Template>> {
    let results: Vec<Result<Template>> = templates
        .into_par_iter()
        .map(|t| -> Result<Template> {
            cancel.check()?;
            train_one(t, config)
        })
        .collect();

    let mut survivors = Vec::new();
    let mut first_failure = None;
    for result in results {
        match result {
            Ok(t) => survivors.push(t),
            Err(e @ Error::InsufficientFeatures { .. }) => {
                tracing::warn!("skipping template: {e}");
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
    if survivors.is_empty() {
        return Err(first_failure.unwrap_or(Error::EmptyTrainingSet));
    }
    Ok(survivors)
}

/// Feature-point selection and feature extraction for a single template.
fn train_one(mut t: Template, config: &Config) -> Result<Template> {
    let n = config.feature_points_count;
    let bb = t.object_bb;

    let gray_u8 = features::gray_to_u8(&t.src_gray);
    let region = image::imageops::crop_imm(
        &gray_u8,
        bb.left() as u32,
        bb.top() as u32,
        bb.width(),
        bb.height(),
    )
    .to_image();

    // Edge pool from the detected edges, stable pool from bright low-gradient
    // pixels of the bounding-box region.
    let edges = canny(
        &region,
        config.objectness_min_threshold * 255.0,
        config.objectness_max_threshold * 255.0,
    );
    let sobel = sobel_gradients(&region);

    let mut edge_pool: Vec<Point<i32>> = Vec::new();
    let mut stable_pool: Vec<Point<i32>> = Vec::new();
    for y in 0..bb.height() {
        for x in 0..bb.width() {
            if edges.get_pixel(x, y)[0] > 0 {
                edge_pool.push(Point::new(x as i32, y as i32));
            }
            if region.get_pixel(x, y)[0] > config.grayscale_min_threshold
                && sobel.get_pixel(x, y)[0] <= config.sobel_max_threshold
            {
                stable_pool.push(Point::new(x as i32, y as i32));
            }
        }
    }

    if edge_pool.len() <= n {
        return Err(Error::InsufficientFeatures {
            id: t.id,
            kind: "edge",
            have: edge_pool.len(),
            need: n,
        });
    }
    if stable_pool.len() <= n {
        return Err(Error::InsufficientFeatures {
            id: t.id,
            kind: "stable",
            have: stable_pool.len(),
            need: n,
        });
    }

    // Sampling without replacement: shuffle an index array per pool and walk
    // it front to back. One RNG stream per template keeps the result
    // independent of worker count.
    let mut rng = StdRng::seed_from_u64(config.derive_seed(t.id as u64));

    let mut edge_order: Vec<usize> = (0..edge_pool.len()).collect();
    edge_order.shuffle(&mut rng);
    t.edge_points = edge_order[..n].iter().map(|&i| edge_pool[i]).collect();

    // Stable samples on depth holes are rejected and the walk continues.
    let mut stable_order: Vec<usize> = (0..stable_pool.len()).collect();
    stable_order.shuffle(&mut rng);
    let mut stable_points = Vec::with_capacity(n);
    for &i in &stable_order {
        let p = stable_pool[i];
        let depth = t
            .src_depth
            .get_pixel((bb.left() + p.x) as u32, (bb.top() + p.y) as u32)[0];
        if depth > 0.0 {
            stable_points.push(p);
            if stable_points.len() == n {
                break;
            }
        }
    }
    if stable_points.len() < n {
        return Err(Error::InsufficientFeatures {
            id: t.id,
            kind: "stable",
            have: stable_points.len(),
            need: n,
        });
    }
    t.stable_points = stable_points;

    // Feature extraction runs in source coordinates so points on the box
    // border still have valid central differences.
    let (src_w, src_h) = t.src_gray.dimensions();
    let mut features_out = TemplateFeatures {
        gradient_orientations: Vec::with_capacity(n),
        surface_normals: Vec::with_capacity(n),
        depths: Vec::with_capacity(n),
        colors: Vec::with_capacity(n),
        depth_median: 0,
    };
    for i in 0..n {
        let ep = t.edge_points[i];
        let (ex, ey) = features::clamp_interior(
            bb.left() as i64 + ep.x as i64,
            bb.top() as i64 + ep.y as i64,
            src_w,
            src_h,
        );
        features_out
            .gradient_orientations
            .push(features::quantize_orientation(features::gradient_orientation(
                &t.src_gray,
                ex,
                ey,
            )));

        let sp = t.stable_points[i];
        let (sx, sy) = features::clamp_interior(
            bb.left() as i64 + sp.x as i64,
            bb.top() as i64 + sp.y as i64,
            src_w,
            src_h,
        );
        features_out
            .surface_normals
            .push(features::quantize_surface_normal(features::surface_normal(
                &t.src_depth,
                sx,
                sy,
            )));
        features_out.depths.push(t.src_depth.get_pixel(sx, sy)[0]);
        let hsv = t.src_hsv.get_pixel(sx, sy);
        features_out.colors.push([hsv[0], hsv[1], hsv[2]]);
    }
    features_out.depth_median = median_f32(&features_out.depths) as i32;
    t.features = features_out;
    Ok(t)
}

/// Run the cascade over every window's candidates. Returns the surviving
/// matches (one best per window at most) and the number of candidates that
/// entered the cascade.
pub(crate) fn match_windows(
    input: &CascadeInput<'_>,
    windows: &[Window],
    store: &TemplateStore,
    config: &Config,
    cancel: &CancelToken,
) -> Result<(Vec<Match>, u64)> {
    let results: Vec<(Option<Match>, u64)> = windows
        .par_iter()
        .map(|w| -> Result<(Option<Match>, u64)> {
            cancel.check()?;
            Ok(match_window(input, w, store, config))
        })
        .collect::<Result<_>>()?;

    let evaluations = results.iter().map(|(_, e)| e).sum();
    let matches = results.into_iter().filter_map(|(m, _)| m).collect();
    Ok((matches, evaluations))
}

fn match_window(
    input: &CascadeInput<'_>,
    window: &Window,
    store: &TemplateStore,
    config: &Config,
) -> (Option<Match>, u64) {
    if !has_any_depth(input.depth, window) {
        tracing::debug!(
            "window at {:?} has no depth data, dropping",
            window.top_left()
        );
        return (None, 0);
    }

    let mut evaluated = 0u64;
    let mut best: Option<Match> = None;
    for candidate in &window.candidates {
        let Some(template) = store.get(candidate.template_id) else {
            continue;
        };
        evaluated += 1;
        let Some(score) = cascade(input, window, template, config) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some(b) => {
                score > b.score || (score == b.score && template.id < b.template_id)
            }
        };
        if better {
            best = Some(Match {
                window_rect: window.rect,
                template_id: template.id,
                score,
            });
        }
    }
    (best, evaluated)
}

/// The five tests in fixed order; any failure rejects the candidate and
/// skips the rest.
fn cascade(
    input: &CascadeInput<'_>,
    window: &Window,
    t: &Template,
    config: &Config,
) -> Option<u32> {
    let n = t.stable_points.len() as u32;
    let t_pass = config.cascade_pass_threshold();
    let radius = config.cascade_neighborhood as i64;
    let (w, h) = input.depth.dimensions();
    let (wx, wy) = (window.rect.left() as i64, window.rect.top() as i64);

    // Test I: object size. Without camera intrinsics the diameter/depth
    // scale check has nothing to compare against; it passes at full score.
    let score_i = n;

    // Test II: surface normal orientation at stable points. Holes carry no
    // usable normal and never match.
    let mut score_ii = 0u32;
    for (i, p) in t.stable_points.iter().enumerate() {
        let want = t.features.surface_normals[i];
        let hit = neighborhood_any(wx + p.x as i64, wy + p.y as i64, radius, w, h, |x, y| {
            input.depth.get_pixel(x, y)[0] > 0.0
                && features::quantize_surface_normal(features::surface_normal(input.depth, x, y))
                    == want
        });
        if hit {
            score_ii += 1;
        }
    }
    if score_ii < t_pass {
        return None;
    }

    // Test III: intensity gradient orientation at edge points.
    let mut score_iii = 0u32;
    for (i, p) in t.edge_points.iter().enumerate() {
        let want = t.features.gradient_orientations[i];
        let hit = neighborhood_any(wx + p.x as i64, wy + p.y as i64, radius, w, h, |x, y| {
            features::quantize_orientation(features::gradient_orientation(input.gray, x, y)) == want
        });
        if hit {
            score_iii += 1;
        }
    }
    if score_iii < t_pass {
        return None;
    }

    // Test IV: depth consistency of the stable points against their median.
    let depths: Vec<f32> = t
        .stable_points
        .iter()
        .map(|p| {
            let (x, y) =
                features::clamp_interior(wx + p.x as i64, wy + p.y as i64, w, h);
            input.depth.get_pixel(x, y)[0]
        })
        .collect();
    if depths.iter().all(|&d| d <= 0.0) {
        // Degenerate sample set; the window cannot be scored.
        return None;
    }
    let m = median_f32(&depths);
    let allowed = config.depth_consistency_factor * t.diameter;
    let score_iv = depths.iter().filter(|&&d| (d - m).abs() < allowed).count() as u32;
    if score_iv < t_pass {
        return None;
    }

    // Test V: HSV color at stable points.
    let mut score_v = 0u32;
    for (i, p) in t.stable_points.iter().enumerate() {
        let want = t.features.colors[i];
        let hit = neighborhood_any(wx + p.x as i64, wy + p.y as i64, radius, w, h, |x, y| {
            let px = input.hsv.get_pixel(x, y);
            features::hsv_close(
                [px[0], px[1], px[2]],
                want,
                config.hue_tolerance_deg,
                config.sat_val_tolerance,
            )
        });
        if hit {
            score_v += 1;
        }
    }
    if score_v < t_pass {
        return None;
    }

    Some(score_i + score_ii + score_iii + score_iv + score_v)
}

/// Probe the neighborhood of a projected feature point, clipped to the
/// image interior.
fn neighborhood_any(
    center_x: i64,
    center_y: i64,
    radius: i64,
    width: u32,
    height: u32,
    mut hit: impl FnMut(u32, u32) -> bool,
) -> bool {
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let (x, y) = features::clamp_interior(center_x + dx, center_y + dy, width, height);
            if hit(x, y) {
                return true;
            }
        }
    }
    false
}

fn has_any_depth(depth: &GrayF32Image, window: &Window) -> bool {
    let (w, h) = depth.dimensions();
    let (x0, y0) = window.top_left();
    let (x1, y1) = window.bottom_right();
    for y in y0.max(0)..y1.min(h as i32) {
        for x in x0.max(0)..x1.min(w as i32) {
            if depth.get_pixel(x as u32, y as u32)[0] > 0.0 {
                return true;
            }
        }
    }
    false
}

fn median_f32(values: &[f32]) -> f32 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    sorted[sorted.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb};
    use imageproc::rect::Rect;

    use crate::template::Pose;
    use crate::window::Candidate;

    /// Synthetic exemplar: a 60x60 source with a 40x40 object box at
    /// (10, 10). Diagonal dark stripes on a bright base supply edge and
    /// stable pixels; four depth-plane quadrants with distinct tilts give
    /// each region its own normal bin.
    fn textured_template(id: u32) -> Template {
        let bb = Rect::at(10, 10).of_size(40, 40);
        let inside = |x: u32, y: u32| (10..50).contains(&x) && (10..50).contains(&y);
        let stripe = |x: u32, y: u32| (x + y) % 8 == 0;

        let gray: GrayF32Image = ImageBuffer::from_fn(60, 60, |x, y| {
            Luma([if !inside(x, y) {
                0.0
            } else if stripe(x, y) {
                0.1
            } else {
                0.6
            }])
        });
        let rgb: RgbImage = ImageBuffer::from_fn(60, 60, |x, y| {
            if !inside(x, y) {
                Rgb([0, 0, 0])
            } else if stripe(x, y) {
                Rgb([30, 30, 30])
            } else {
                Rgb([160, 90, 40])
            }
        });
        let depth: GrayF32Image = ImageBuffer::from_fn(60, 60, |x, y| {
            Luma([if !inside(x, y) {
                0.0
            } else {
                quadrant_depth(x, y)
            }])
        });
        let hsv = features::rgb_to_hsv_image(&rgb);
        Template::new(id, id, rgb, gray, hsv, depth, bb, Pose::default(), 1.0)
    }

    fn quadrant_depth(x: u32, y: u32) -> f32 {
        match (x < 30, y < 30) {
            (true, true) => 2.0 + 0.02 * (30 - x) as f32,
            (false, true) => 2.0 + 0.02 * (x - 30) as f32,
            (true, false) => 2.0 + 0.02 * (49 - y) as f32,
            (false, false) => 2.0 + 0.02 * (y - 30) as f32,
        }
    }

    fn config() -> Config {
        Config::default()
    }

    fn scene_of(t: &Template) -> (GrayF32Image, GrayF32Image, RgbImage) {
        (t.src_gray.clone(), t.src_depth.clone(), t.src_hsv.clone())
    }

    // --- Feature selection ---

    #[test]
    fn test_training_selects_full_point_sets() {
        let config = config();
        let cancel = CancelToken::new();
        let trained =
            train_templates(vec![textured_template(0)], &config, &cancel).unwrap();
        let t = &trained[0];

        assert_eq!(t.edge_points.len(), config.feature_points_count);
        assert_eq!(t.stable_points.len(), config.feature_points_count);
        assert_eq!(t.features.gradient_orientations.len(), config.feature_points_count);
        assert_eq!(t.features.colors.len(), config.feature_points_count);

        for (i, p) in t.stable_points.iter().enumerate() {
            let depth = t.src_depth.get_pixel((10 + p.x) as u32, (10 + p.y) as u32)[0];
            assert!(depth > 0.0, "stable point {i} sits on a depth hole");
            assert!(t.features.surface_normals[i] < 8);
        }
        for &bin in &t.features.gradient_orientations {
            assert!(bin < 5);
        }
        assert!(t.features.depth_median >= 2);
    }

    #[test]
    fn test_training_is_reproducible_per_seed() {
        let config = config();
        let cancel = CancelToken::new();
        let a = train_templates(vec![textured_template(3)], &config, &cancel).unwrap();
        let b = train_templates(vec![textured_template(3)], &config, &cancel).unwrap();
        assert_eq!(a[0].edge_points, b[0].edge_points);
        assert_eq!(a[0].stable_points, b[0].stable_points);

        let reseeded = Config { root_seed: 777, ..config };
        let c = train_templates(vec![textured_template(3)], &reseeded, &cancel).unwrap();
        assert_ne!(a[0].edge_points, c[0].edge_points);
    }

    #[test]
    fn test_featureless_template_is_skipped_with_survivors() {
        let cancel = CancelToken::new();
        // A flat template offers no edges at all.
        let flat = {
            let mut t = textured_template(1);
            t.src_gray = ImageBuffer::from_pixel(60, 60, Luma([0.6]));
            t
        };
        let trained =
            train_templates(vec![textured_template(0), flat], &config(), &cancel).unwrap();
        assert_eq!(trained.len(), 1);
        assert_eq!(trained[0].id, 0);
    }

    #[test]
    fn test_all_templates_failing_is_an_error() {
        let cancel = CancelToken::new();
        let mut flat = textured_template(0);
        flat.src_gray = ImageBuffer::from_pixel(60, 60, Luma([0.6]));
        let result = train_templates(vec![flat], &config(), &cancel);
        assert!(matches!(
            result,
            Err(Error::InsufficientFeatures { id: 0, kind: "edge", .. })
        ));
    }

    #[test]
    fn test_border_touching_box_trains_cleanly() {
        let cancel = CancelToken::new();
        // Crop the source so the box occupies it entirely, border included.
        let full = {
            let t = textured_template(0);
            let crop = |left: u32, top: u32| {
                (
                    image::imageops::crop_imm(&t.src_rgb, left, top, 40, 40).to_image(),
                    left,
                    top,
                )
            };
            let (rgb, left, top) = crop(10, 10);
            let gray: GrayF32Image = ImageBuffer::from_fn(40, 40, |x, y| {
                *t.src_gray.get_pixel(x + left, y + top)
            });
            let depth: GrayF32Image = ImageBuffer::from_fn(40, 40, |x, y| {
                *t.src_depth.get_pixel(x + left, y + top)
            });
            let hsv = features::rgb_to_hsv_image(&rgb);
            Template::new(
                5,
                5,
                rgb,
                gray,
                hsv,
                depth,
                Rect::at(0, 0).of_size(40, 40),
                Pose::default(),
                1.0,
            )
        };
        let trained = train_templates(vec![full], &config(), &cancel).unwrap();
        let t = &trained[0];
        assert_eq!(t.stable_points.len(), config().feature_points_count);
        for &bin in &t.features.surface_normals {
            assert!(bin < 8);
        }
    }

    // --- Cascade ---

    fn identity_window() -> Window {
        Window {
            rect: Rect::at(10, 10).of_size(40, 40),
            candidates: vec![Candidate { template_id: 0, votes: 100 }],
        }
    }

    #[test]
    fn test_identity_window_scores_five_times_n() {
        let config = config();
        let cancel = CancelToken::new();
        let trained = train_templates(vec![textured_template(0)], &config, &cancel).unwrap();
        let store = TemplateStore::new(trained).unwrap();
        let t = store.get(0).unwrap();
        let (gray, depth, hsv) = scene_of(t);
        let input = CascadeInput { gray: &gray, depth: &depth, hsv: &hsv };

        let score = cascade(&input, &identity_window(), t, &config).unwrap();
        assert_eq!(score, 5 * config.feature_points_count as u32);
    }

    #[test]
    fn test_far_offset_window_is_rejected() {
        let config = config();
        let cancel = CancelToken::new();
        let trained = train_templates(vec![textured_template(0)], &config, &cancel).unwrap();
        let store = TemplateStore::new(trained).unwrap();
        let t = store.get(0).unwrap();
        let (gray, depth, hsv) = scene_of(t);
        let input = CascadeInput { gray: &gray, depth: &depth, hsv: &hsv };

        let shifted = Window {
            rect: Rect::at(10, 25).of_size(40, 40),
            candidates: identity_window().candidates,
        };
        assert_eq!(cascade(&input, &shifted, t, &config), None);
    }

    #[test]
    fn test_single_point_template_cascades() {
        let config = Config { feature_points_count: 1, ..config() };
        let cancel = CancelToken::new();
        let trained = train_templates(vec![textured_template(0)], &config, &cancel).unwrap();
        let store = TemplateStore::new(trained).unwrap();
        let t = store.get(0).unwrap();
        let (gray, depth, hsv) = scene_of(t);
        let input = CascadeInput { gray: &gray, depth: &depth, hsv: &hsv };

        let score = cascade(&input, &identity_window(), t, &config).unwrap();
        assert_eq!(score, 5);
    }

    #[test]
    fn test_depthless_window_is_dropped_before_evaluation() {
        let config = config();
        let cancel = CancelToken::new();
        let trained = train_templates(vec![textured_template(0)], &config, &cancel).unwrap();
        let store = TemplateStore::new(trained).unwrap();
        let (gray, _, hsv) = scene_of(store.get(0).unwrap());
        let empty_depth: GrayF32Image = ImageBuffer::new(60, 60);
        let input = CascadeInput { gray: &gray, depth: &empty_depth, hsv: &hsv };

        let (best, evaluated) = match_window(&input, &identity_window(), &store, &config);
        assert_eq!(best, None);
        assert_eq!(evaluated, 0);
    }

    #[test]
    fn test_match_windows_reports_evaluations() {
        let config = config();
        let cancel = CancelToken::new();
        let trained = train_templates(vec![textured_template(0)], &config, &cancel).unwrap();
        let store = TemplateStore::new(trained).unwrap();
        let t = store.get(0).unwrap();
        let (gray, depth, hsv) = scene_of(t);
        let input = CascadeInput { gray: &gray, depth: &depth, hsv: &hsv };

        let windows = vec![identity_window(), Window::new(Rect::at(0, 0).of_size(40, 40))];
        let (matches, evaluated) =
            match_windows(&input, &windows, &store, &config, &cancel).unwrap();
        // The second window carries no candidates.
        assert_eq!(evaluated, 1);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].template_id, 0);
    }
}
