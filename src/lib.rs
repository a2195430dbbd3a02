//! Rigid 3D object detection in cluttered RGB-D scenes, driven by a
//! database of synthetic template renderings.
//!
//! The pipeline cuts the sliding-window search space down in three stages:
//! an objectness pre-filter keeps windows with enough edge energy, triplet
//! hash tables vote a short template candidate list per window, and an
//! ordered cascade of per-feature tests (surface normals, intensity
//! gradients, depth consistency, color, object size) verifies the
//! survivors.
//!
//! ```no_run
//! use lookout::{CancelToken, Config, Detector};
//!
//! # fn run(templates: Vec<lookout::Template>, scene: lookout::Scene) -> lookout::Result<()> {
//! let detector = Detector::new(Config::default())?;
//! let cancel = CancelToken::new();
//! let model = detector.train(templates, &cancel)?;
//! let matches = detector.detect(&scene, &model, &cancel)?;
//! # Ok(())
//! # }
//! ```
//!
//! Image decoding, template file parsing and result visualization are
//! collaborator concerns; the crate consumes already-populated
//! [`Template`] records and raw pixel buffers.

mod cancel;
mod config;
mod detector;
mod error;
pub mod features;
mod hasher;
mod matcher;
mod objectness;
mod template;
mod window;

pub use cancel::CancelToken;
pub use config::Config;
pub use detector::{Detector, PipelineStats, Scene, TrainedModel};
pub use error::{Error, Result};
pub use hasher::{DepthBins, GridPoint, HashKey, HashTable, Triplet};
pub use objectness::MinEdgels;
pub use template::{Pose, Template, TemplateFeatures, TemplateGroup, TemplateStore};
pub use window::{Candidate, Match, Window};

/// Single-channel f32 plane: grayscale normalized to `[0, 1]` or depth in
/// scene units with zero marking holes.
pub type GrayF32Image = image::ImageBuffer<image::Luma<f32>, Vec<f32>>;
