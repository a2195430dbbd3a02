//! Triplet hashing: quantized depth/normal signatures over a reference-point
//! lattice, used to cut the template database down to a handful of voted
//! candidates per window before the expensive cascade runs.

use std::collections::{HashMap, HashSet};

use imageproc::rect::Rect;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::GrayF32Image;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::features;
use crate::template::TemplateStore;
use crate::window::{Candidate, Window};

/// A point on the reference lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridPoint {
    pub x: u32,
    pub y: u32,
}

/// Three lattice points whose depth/normal signature keys one hash table.
/// Pairwise chessboard distances lie in `[1, max_triplet_distance]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triplet {
    pub p1: GridPoint,
    pub p2: GridPoint,
    pub p3: GridPoint,
}

impl Triplet {
    fn sample(grid: (u32, u32), max_distance: u32, rng: &mut StdRng) -> Triplet {
        loop {
            let mut point = || GridPoint {
                x: rng.gen_range(0..grid.0),
                y: rng.gen_range(0..grid.1),
            };
            let t = Triplet { p1: point(), p2: point(), p3: point() };
            if t.satisfies_distance_invariant(max_distance) {
                return t;
            }
        }
    }

    fn chessboard(a: GridPoint, b: GridPoint) -> u32 {
        a.x.abs_diff(b.x).max(a.y.abs_diff(b.y))
    }

    pub(crate) fn satisfies_distance_invariant(&self, max_distance: u32) -> bool {
        [
            Self::chessboard(self.p1, self.p2),
            Self::chessboard(self.p1, self.p3),
            Self::chessboard(self.p2, self.p3),
        ]
        .iter()
        .all(|&d| (1..=max_distance).contains(&d))
    }

    /// Pixel coordinates of the lattice points mapped onto `rect`, at the
    /// centers of the reference cells.
    pub(crate) fn project(&self, rect: &Rect, grid: (u32, u32)) -> [(i64, i64); 3] {
        let cell = |g: GridPoint| {
            let x = rect.left() as i64
                + ((2 * g.x as i64 + 1) * rect.width() as i64) / (2 * grid.0 as i64);
            let y = rect.top() as i64
                + ((2 * g.y as i64 + 1) * rect.height() as i64) / (2 * grid.1 as i64);
            (x, y)
        };
        [cell(self.p1), cell(self.p2), cell(self.p3)]
    }
}

/// Quantized triplet signature: two relative depths and three surface
/// normal bins. With five depth bins and eight normal bins there are at
/// most 5 * 5 * 8 * 8 * 8 = 12800 distinct keys per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashKey {
    pub d1: u8,
    pub d2: u8,
    pub n1: u8,
    pub n2: u8,
    pub n3: u8,
}

/// Adaptive relative-depth quantizer: equal-mass half-open ranges covering
/// the whole real line, stored by their interior boundaries. Calibrated once
/// from the pooled training observations; depth differences cluster far too
/// unevenly for fixed-width bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthBins {
    boundaries: Vec<f32>,
}

impl DepthBins {
    fn calibrate(mut values: Vec<f32>, bin_count: usize) -> Result<DepthBins> {
        if values.is_empty() {
            return Err(Error::NumericDegenerate(
                "no valid relative depths in the training set".into(),
            ));
        }
        values.sort_by(f32::total_cmp);
        let boundaries = (1..bin_count)
            .map(|k| values[k * values.len() / bin_count])
            .collect();
        Ok(DepthBins { boundaries })
    }

    /// Bin index of a relative depth. Total over the real line: everything
    /// below the first boundary is bin 0, everything at or above the last is
    /// the top bin.
    pub fn quantize(&self, d: f32) -> u8 {
        self.boundaries.partition_point(|&b| b <= d) as u8
    }

    pub fn bin_count(&self) -> usize {
        self.boundaries.len() + 1
    }
}

/// One triplet plus its key-to-template-id buckets. Read-only after
/// training; buckets hold ids sorted ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashTable {
    pub triplet: Triplet,
    pub buckets: HashMap<HashKey, Vec<u32>>,
}

impl HashTable {
    pub fn get(&self, key: &HashKey) -> Option<&[u32]> {
        self.buckets.get(key).map(Vec::as_slice)
    }

    fn canonicalize(&mut self) {
        for ids in self.buckets.values_mut() {
            ids.sort_unstable();
        }
    }
}

/// Depth and quantized-normal samples of a triplet projected onto `rect`.
/// `None` when any of the three samples lands on zero depth.
fn sample_triplet(
    depth: &GrayF32Image,
    triplet: &Triplet,
    rect: &Rect,
    grid: (u32, u32),
) -> Option<([f32; 3], [u8; 3])> {
    let (w, h) = depth.dimensions();
    let mut depths = [0.0f32; 3];
    let mut normals = [0u8; 3];
    for (i, &(px, py)) in triplet.project(rect, grid).iter().enumerate() {
        let (x, y) = features::clamp_interior(px, py, w, h);
        let d = depth.get_pixel(x, y)[0];
        if d <= 0.0 {
            return None;
        }
        depths[i] = d;
        normals[i] = features::quantize_surface_normal(features::surface_normal(depth, x, y));
    }
    Some((depths, normals))
}

fn key_of(depths: [f32; 3], normals: [u8; 3], bins: &DepthBins) -> HashKey {
    HashKey {
        d1: bins.quantize(depths[1] - depths[0]),
        d2: bins.quantize(depths[2] - depths[0]),
        n1: normals[0],
        n2: normals[1],
        n3: normals[2],
    }
}

/// Sample the configured number of distinct triplets. Depends only on the
/// root seed, never on the template set, so reordering templates cannot
/// perturb the tables.
pub(crate) fn generate_triplets(config: &Config) -> Result<Vec<Triplet>> {
    let mut rng = StdRng::seed_from_u64(config.root_seed);
    let mut seen = HashSet::new();
    let mut triplets = Vec::with_capacity(config.hash_table_count);
    let mut attempts = 0usize;
    while triplets.len() < config.hash_table_count {
        attempts += 1;
        if attempts > config.hash_table_count.saturating_mul(1000) {
            return Err(Error::InvalidInput(format!(
                "reference grid {:?} cannot supply {} distinct triplets",
                config.reference_points_grid, config.hash_table_count
            )));
        }
        let t = Triplet::sample(config.reference_points_grid, config.max_triplet_distance, &mut rng);
        if seen.insert(t) {
            triplets.push(t);
        }
    }
    Ok(triplets)
}

/// Pool the relative depths every template exhibits at every triplet and
/// split them into equal-mass quantization ranges.
pub(crate) fn calibrate_depth_bins(
    store: &TemplateStore,
    triplets: &[Triplet],
    config: &Config,
    cancel: &CancelToken,
) -> Result<DepthBins> {
    let grid = config.reference_points_grid;
    let pools: Vec<Vec<f32>> = store
        .templates()
        .par_iter()
        .map(|t| -> Result<Vec<f32>> {
            cancel.check()?;
            let mut values = Vec::with_capacity(triplets.len() * 2);
            for triplet in triplets {
                if let Some((depths, _)) = sample_triplet(&t.src_depth, triplet, &t.object_bb, grid)
                {
                    values.push(depths[1] - depths[0]);
                    values.push(depths[2] - depths[0]);
                }
            }
            Ok(values)
        })
        .collect::<Result<_>>()?;

    DepthBins::calibrate(pools.concat(), config.histogram_bin_count)
}

/// Build one hash table per triplet by inserting every template's quantized
/// signature. Templates whose triplet sampling hits a depth hole skip that
/// table. Buckets come out sorted, so the result is independent of the
/// input order of the templates.
pub(crate) fn train(
    store: &TemplateStore,
    triplets: Vec<Triplet>,
    bins: &DepthBins,
    config: &Config,
    cancel: &CancelToken,
) -> Result<Vec<HashTable>> {
    let grid = config.reference_points_grid;
    let mut tables: Vec<HashTable> = triplets
        .into_iter()
        .map(|triplet| HashTable { triplet, buckets: HashMap::new() })
        .collect();

    tables.par_iter_mut().try_for_each(|table| -> Result<()> {
        for t in store.templates() {
            cancel.check()?;
            if let Some((depths, normals)) =
                sample_triplet(&t.src_depth, &table.triplet, &t.object_bb, grid)
            {
                let key = key_of(depths, normals, bins);
                table.buckets.entry(key).or_default().push(t.id);
            }
        }
        Ok(())
    })?;

    for table in &mut tables {
        table.canonicalize();
    }
    Ok(tables)
}

/// Poll every hash table for every window and keep the templates reaching
/// the vote threshold. Windows left without candidates are dropped. A
/// zero-depth sample invalidates that table's key and contributes no vote.
pub(crate) fn verify_candidates(
    scene_depth: &GrayF32Image,
    tables: &[HashTable],
    bins: &DepthBins,
    all_ids: &[u32],
    windows: Vec<Window>,
    config: &Config,
    cancel: &CancelToken,
) -> Result<Vec<Window>> {
    let grid = config.reference_points_grid;
    let verified: Vec<Option<Window>> = windows
        .into_par_iter()
        .map(|mut window| -> Result<Option<Window>> {
            cancel.check()?;
            let mut votes: HashMap<u32, u32> = HashMap::new();
            if config.min_votes_per_template == 0 {
                // A zero threshold admits the whole database.
                for &id in all_ids {
                    votes.insert(id, 0);
                }
            }
            for table in tables {
                let Some((depths, normals)) =
                    sample_triplet(scene_depth, &table.triplet, &window.rect, grid)
                else {
                    continue;
                };
                if let Some(ids) = table.get(&key_of(depths, normals, bins)) {
                    for &id in ids {
                        *votes.entry(id).or_insert(0) += 1;
                    }
                }
            }

            let mut candidates: Vec<Candidate> = votes
                .into_iter()
                .filter(|&(_, v)| v >= config.min_votes_per_template)
                .map(|(template_id, votes)| Candidate { template_id, votes })
                .collect();
            if candidates.is_empty() {
                return Ok(None);
            }
            candidates.sort_by(|a, b| {
                b.votes.cmp(&a.votes).then(a.template_id.cmp(&b.template_id))
            });
            window.candidates = candidates;
            Ok(Some(window))
        })
        .collect::<Result<_>>()?;

    Ok(verified.into_iter().flatten().collect())
}
