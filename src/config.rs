use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Immutable pipeline configuration, fixed at [`Detector`](crate::Detector)
/// construction. Every component reads its parameters from here; nothing is
/// reconfigurable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Reference-point lattice (columns, rows) overlaid on a template
    /// bounding box for triplet sampling.
    pub reference_points_grid: (u32, u32),
    /// Number of independent triplet hash tables.
    pub hash_table_count: usize,
    /// Relative-depth quantization levels, calibrated from the training set.
    pub histogram_bin_count: usize,
    /// Minimum hash votes for a template to stay a window candidate.
    /// Zero admits every trained template.
    pub min_votes_per_template: u32,
    /// Upper bound on the pairwise chessboard distance between triplet
    /// points, in grid cells. The lower bound is always one cell.
    pub max_triplet_distance: u32,
    /// Edge and stable feature points sampled per template.
    pub feature_points_count: usize,
    /// Sliding-window stride in pixels.
    pub objectness_step: u32,
    /// Window size as a factor of the largest template bounding box.
    pub objectness_window_size_factor: f32,
    /// Lower hysteresis threshold for edge extraction, as a fraction of the
    /// full normalized intensity range.
    pub objectness_min_threshold: f32,
    /// Upper hysteresis threshold for edge extraction.
    pub objectness_max_threshold: f32,
    /// Fraction of the per-variant minimum training edgel count a window
    /// must contain to survive the objectness filter.
    pub objectness_match_threshold_factor: f32,
    /// Fraction of feature points each cascade test requires (rounded up).
    pub cascade_pass_fraction: f32,
    /// Cascade neighborhood radius in pixels (2 gives the 5x5 window).
    pub cascade_neighborhood: u32,
    /// Minimum gray level for stable-point candidates.
    pub grayscale_min_threshold: u8,
    /// Maximum Sobel gradient magnitude for stable-point candidates.
    pub sobel_max_threshold: u16,
    /// Factor k in the depth consistency test `|s - median| < k * diameter`.
    pub depth_consistency_factor: f32,
    /// Circular hue tolerance of the color test, in degrees.
    pub hue_tolerance_deg: f32,
    /// Saturation and value tolerance of the color test, out of 255.
    pub sat_val_tolerance: u8,
    /// Root seed every per-item RNG stream derives from.
    pub root_seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            reference_points_grid: (12, 12),
            hash_table_count: 100,
            histogram_bin_count: 5,
            min_votes_per_template: 3,
            max_triplet_distance: 5,
            feature_points_count: 100,
            objectness_step: 5,
            objectness_window_size_factor: 1.0,
            objectness_min_threshold: 0.01,
            objectness_max_threshold: 0.1,
            objectness_match_threshold_factor: 0.3,
            cascade_pass_fraction: 0.6,
            cascade_neighborhood: 2,
            grayscale_min_threshold: 50,
            sobel_max_threshold: 40,
            depth_consistency_factor: 1.0,
            hue_tolerance_deg: 15.0,
            sat_val_tolerance: 25,
            root_seed: 1,
        }
    }
}

impl Config {
    /// Matching feature points each cascade test requires.
    pub(crate) fn cascade_pass_threshold(&self) -> u32 {
        (self.cascade_pass_fraction * self.feature_points_count as f32).ceil() as u32
    }

    /// Seed for the RNG stream of one work item. Streams never overlap
    /// across items, so results do not depend on worker count.
    pub(crate) fn derive_seed(&self, item: u64) -> u64 {
        self.root_seed ^ (item.wrapping_add(1)).wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let (gw, gh) = self.reference_points_grid;
        if gw < 2 || gh < 2 {
            return Err(Error::InvalidInput(format!(
                "reference points grid {gw}x{gh} must be at least 2x2"
            )));
        }
        if self.hash_table_count == 0 {
            return Err(Error::InvalidInput("hash table count must be positive".into()));
        }
        if self.histogram_bin_count == 0 {
            return Err(Error::InvalidInput("histogram bin count must be positive".into()));
        }
        if self.max_triplet_distance == 0 {
            return Err(Error::InvalidInput("max triplet distance must be positive".into()));
        }
        if self.feature_points_count == 0 {
            return Err(Error::InvalidInput("feature points count must be positive".into()));
        }
        if self.objectness_step == 0 {
            return Err(Error::InvalidInput("objectness step must be positive".into()));
        }
        if self.objectness_window_size_factor <= 0.0 {
            return Err(Error::InvalidInput("window size factor must be positive".into()));
        }
        if self.objectness_min_threshold >= self.objectness_max_threshold {
            return Err(Error::InvalidInput(format!(
                "edge thresholds must satisfy min < max, got {} >= {}",
                self.objectness_min_threshold, self.objectness_max_threshold
            )));
        }
        if !(self.cascade_pass_fraction > 0.0 && self.cascade_pass_fraction <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "cascade pass fraction {} must lie in (0, 1]",
                self.cascade_pass_fraction
            )));
        }
        Ok(())
    }
}
