//! Pipeline orchestration: `train` builds the model from parsed templates,
//! `detect` runs objectness, hash verification and the matcher cascade over
//! a scene in fixed order.

use std::collections::HashSet;
use std::time::Instant;

use image::RgbImage;
use serde::Serialize;

use crate::GrayF32Image;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::features;
use crate::hasher::{self, DepthBins, HashTable};
use crate::matcher::{self, CascadeInput};
use crate::objectness::{self, MinEdgels};
use crate::template::{Template, TemplateStore};
use crate::window::{self, Match};

/// An RGB-D scene to search. The grayscale plane is normalized to `[0, 1]`
/// and the depth plane uses the same units as the template depth planes;
/// zero depth marks holes.
pub struct Scene {
    pub rgb: RgbImage,
    pub gray: GrayF32Image,
    pub depth: GrayF32Image,
}

impl Scene {
    pub fn new(rgb: RgbImage, gray: GrayF32Image, depth: GrayF32Image) -> Result<Scene> {
        let dims = gray.dimensions();
        if dims != rgb.dimensions() || dims != depth.dimensions() {
            return Err(Error::InvalidInput(
                "scene planes disagree on resolution".into(),
            ));
        }
        let (w, h) = dims;
        if w < 3 || h < 3 {
            return Err(Error::InvalidInput(format!("{w}x{h} scene is too small")));
        }
        Ok(Scene { rgb, gray, depth })
    }
}

/// Everything training produces. Read-only during detection; collaborators
/// that persist trained state serialize the tables, the depth bins and the
/// minimum edgel counts.
pub struct TrainedModel {
    pub store: TemplateStore,
    pub hash_tables: Vec<HashTable>,
    pub depth_bins: DepthBins,
    pub min_edgels: MinEdgels,
}

/// Per-stage counters from one detection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Windows surviving the objectness filter.
    pub objectness_windows: usize,
    /// Windows keeping at least one hash candidate.
    pub verified_windows: usize,
    /// Candidates that entered the cascade.
    pub cascade_evaluations: u64,
    /// Matches surviving the cascade, before non-maximum suppression.
    pub matches_before_nms: usize,
}

/// The detection pipeline. Construction fixes the configuration; `train`
/// and `detect` are otherwise stateless and safe to call repeatedly.
pub struct Detector {
    config: Config,
}

impl Detector {
    pub fn new(config: Config) -> Result<Detector> {
        config.validate()?;
        Ok(Detector { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Train on parsed templates: feature-point selection, minimum edgel
    /// extraction, depth-bin calibration and hash-table insertion, in that
    /// order. Templates without enough feature pixels are skipped with a
    /// warning as long as at least one survives.
    pub fn train(&self, templates: Vec<Template>, cancel: &CancelToken) -> Result<TrainedModel> {
        if templates.is_empty() {
            return Err(Error::EmptyTrainingSet);
        }
        let mut ids = HashSet::new();
        for t in &templates {
            t.validate()?;
            if !ids.insert(t.id) {
                return Err(Error::InvalidInput(format!("duplicate template id {}", t.id)));
            }
        }

        let started = Instant::now();
        tracing::info!("training on {} templates", templates.len());

        let trained = matcher::train_templates(templates, &self.config, cancel)?;
        tracing::info!("feature selection kept {} templates", trained.len());
        let store = TemplateStore::new(trained)?;

        let min_edgels = objectness::extract_min_edgels(store.templates(), &self.config, cancel)?;
        tracing::info!(
            "minimum edgels: gray {}, color {}, depth {}",
            min_edgels.gray,
            min_edgels.color,
            min_edgels.depth
        );

        let triplets = hasher::generate_triplets(&self.config)?;
        let depth_bins = hasher::calibrate_depth_bins(&store, &triplets, &self.config, cancel)?;
        let hash_tables = hasher::train(&store, triplets, &depth_bins, &self.config, cancel)?;
        tracing::info!(
            "trained {} hash tables in {:.2?}",
            hash_tables.len(),
            started.elapsed()
        );

        Ok(TrainedModel { store, hash_tables, depth_bins, min_edgels })
    }

    /// Locate trained objects in a scene. An empty result is a valid
    /// outcome, not an error.
    pub fn detect(
        &self,
        scene: &Scene,
        model: &TrainedModel,
        cancel: &CancelToken,
    ) -> Result<Vec<Match>> {
        self.detect_with_stats(scene, model, cancel).map(|(matches, _)| matches)
    }

    /// `detect`, additionally reporting per-stage counters.
    pub fn detect_with_stats(
        &self,
        scene: &Scene,
        model: &TrainedModel,
        cancel: &CancelToken,
    ) -> Result<(Vec<Match>, PipelineStats)> {
        let started = Instant::now();
        let mut stats = PipelineStats::default();

        cancel.check()?;
        let window_size = window_size_of(&model.store, self.config.objectness_window_size_factor);
        let windows = objectness::detect_windows(
            &scene.rgb,
            &scene.gray,
            &scene.depth,
            &model.min_edgels,
            window_size,
            &self.config,
        );
        stats.objectness_windows = windows.len();
        tracing::info!("objectness kept {} windows", windows.len());

        let windows = hasher::verify_candidates(
            &scene.depth,
            &model.hash_tables,
            &model.depth_bins,
            &model.store.ids(),
            windows,
            &self.config,
            cancel,
        )?;
        stats.verified_windows = windows.len();
        tracing::info!("hash verification kept {} windows", windows.len());

        let scene_hsv = features::rgb_to_hsv_image(&scene.rgb);
        let input = CascadeInput {
            gray: &scene.gray,
            depth: &scene.depth,
            hsv: &scene_hsv,
        };
        let (matches, evaluations) =
            matcher::match_windows(&input, &windows, &model.store, &self.config, cancel)?;
        stats.cascade_evaluations = evaluations;
        stats.matches_before_nms = matches.len();

        let mut matches = window::non_max_suppression(matches);
        matches.sort_by(|a, b| {
            a.window_rect
                .top()
                .cmp(&b.window_rect.top())
                .then(a.window_rect.left().cmp(&b.window_rect.left()))
                .then(a.template_id.cmp(&b.template_id))
        });
        tracing::info!(
            "{} matches after suppression, {:.2?} total",
            matches.len(),
            started.elapsed()
        );
        Ok((matches, stats))
    }
}

/// Window size: the largest template bounding box, scaled.
fn window_size_of(store: &TemplateStore, factor: f32) -> (u32, u32) {
    let mut w = 0u32;
    let mut h = 0u32;
    for t in store.templates() {
        w = w.max(t.object_bb.width());
        h = h.max(t.object_bb.height());
    }
    (
        ((w as f32 * factor).round() as u32).max(1),
        ((h as f32 * factor).round() as u32).max(1),
    )
}
