//! Multi-hypothesis probabilistic occupancy grid.
//!
//! A fixed-size voxel map that accumulates stereo-ray evidence and answers
//! "how well does this candidate pose agree with what has been mapped?".
//!
//! # Sensor model
//!
//! Each [`StereoRay`] carries a most probable end point and a one-sigma range
//! uncertainty. Inserting a ray
//!
//! - raises occupancy in a Gaussian band of ±2σ around the end point, and
//! - lowers it (scaled by `vacancy_weighting`) in every cell between the
//!   camera and the start of that band.
//!
//! Evidence is accumulated as clamped log-odds. A cell holds zero or more
//! [`Hypothesis`] values: one in a [`GridType::Simple`] grid, one per
//! mapping source (recorded path) in a [`GridType::MultiHypothesis`] grid.
//!
//! # Extent
//!
//! The grid is anchored at a centre point: x and y span
//! `centre ± dimension_mm / 2`, z spans
//! `[centre.z, centre.z + dimension_vertical_mm)` so the ground plane sits at
//! the bottom of the volume.
//!
//! # Example
//!
//! ```rust
//! use stereonav_perception::occupancy::{GridParams, OccupancyGridMultiHypothesis};
//! use stereonav_types::{Point3, Pose, StereoRay};
//!
//! let mut grid = OccupancyGridMultiHypothesis::new(GridParams::default()).unwrap();
//! let ray = StereoRay {
//!     origin: Point3::new(0.0, 0.0, 500.0),
//!     end: Point3::new(0.0, 1000.0, 500.0),
//!     sigma_mm: 40.0,
//!     colour: None,
//! };
//! grid.insert(&[ray], &Pose::identity());
//!
//! assert!(grid.probability_at(Point3::new(0.0, 1010.0, 500.0)).unwrap() > 0.5);
//! assert!(grid.match_score(&Pose::identity(), &[ray]) > 0.0);
//! ```

use serde::{Deserialize, Serialize};
use stereonav_types::{NavError, Point3, Pose, StereoRay};

/// Occupancy band half-width in range sigmas.
const BAND_SIGMAS: f32 = 2.0;
/// Occupancy probability above 0.5 at the most probable point.
const PEAK_OCCUPANCY: f32 = 0.45;
/// Log-odds removed per vacancy observation at unit weighting.
const VACANCY_LOG_ODDS: f32 = 0.2;
/// Log-odds are clamped to ±this.
const LOG_ODDS_LIMIT: f32 = 8.0;
/// Upper bound on hypotheses per cell in a multi-hypothesis grid.
pub const MAX_HYPOTHESES: usize = 4;
/// Refuse to allocate grids larger than this many cells.
const MAX_CELLS: usize = 1 << 26;

// ────────────────────────────────────────────────────────────────────────────
// Parameters
// ────────────────────────────────────────────────────────────────────────────

/// How evidence from different mapping sources is kept apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridType {
    /// All evidence merges into one hypothesis per cell.
    #[default]
    Simple,
    /// Each mapping source keeps its own hypothesis; queries use the one
    /// that agrees best.
    MultiHypothesis,
}

/// Construction parameters; immutable for the lifetime of a grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    #[serde(default)]
    pub grid_type: GridType,
    pub dimension_mm: f32,
    pub dimension_vertical_mm: f32,
    pub cell_size_mm: f32,
    pub localisation_radius_mm: f32,
    pub max_mapping_range_mm: f32,
    pub vacancy_weighting: f32,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            grid_type: GridType::Simple,
            dimension_mm: 4000.0,
            dimension_vertical_mm: 2000.0,
            cell_size_mm: 50.0,
            localisation_radius_mm: 1000.0,
            max_mapping_range_mm: 3000.0,
            vacancy_weighting: 1.0,
        }
    }
}

impl GridParams {
    pub fn validate(&self) -> Result<(), NavError> {
        let positive = |label: &str, v: f32| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(NavError::invalid(format!("{label} must be positive, got {v}")))
            }
        };
        positive("cell size", self.cell_size_mm)?;
        positive("grid dimension", self.dimension_mm)?;
        positive("vertical grid dimension", self.dimension_vertical_mm)?;
        positive("localisation radius", self.localisation_radius_mm)?;
        positive("maximum mapping range", self.max_mapping_range_mm)?;
        if !(self.vacancy_weighting.is_finite() && self.vacancy_weighting >= 0.0) {
            return Err(NavError::invalid("vacancy weighting must be non-negative"));
        }
        if self.dimension_mm < self.cell_size_mm || self.dimension_vertical_mm < self.cell_size_mm {
            return Err(NavError::invalid("grid dimensions must hold at least one cell"));
        }
        let (h, v) = self.cell_counts();
        if h.saturating_mul(h).saturating_mul(v) > MAX_CELLS {
            return Err(NavError::invalid(format!(
                "grid of {h}x{h}x{v} cells exceeds the {MAX_CELLS} cell limit"
            )));
        }
        Ok(())
    }

    /// `(dimension_cells, dimension_cells_vertical)`.
    pub fn cell_counts(&self) -> (usize, usize) {
        (
            (self.dimension_mm / self.cell_size_mm).round().max(1.0) as usize,
            (self.dimension_vertical_mm / self.cell_size_mm).round().max(1.0) as usize,
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Hypothesis
// ────────────────────────────────────────────────────────────────────────────

/// One occupancy estimate for a cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hypothesis {
    pub log_odds: f32,
    pub evidence_count: u32,
    /// Mapping source that produced this hypothesis.
    pub source: u32,
    colour_sum: [f32; 3],
    colour_count: u32,
}

impl Hypothesis {
    fn new(source: u32) -> Self {
        Self {
            log_odds: 0.0,
            evidence_count: 0,
            source,
            colour_sum: [0.0; 3],
            colour_count: 0,
        }
    }

    pub fn probability(&self) -> f32 {
        1.0 / (1.0 + (-self.log_odds).exp())
    }

    /// Mean colour of the occupied evidence, if any was coloured.
    pub fn colour(&self) -> Option<[u8; 3]> {
        (self.colour_count > 0).then(|| {
            let n = self.colour_count as f32;
            self.colour_sum.map(|c| (c / n).round().clamp(0.0, 255.0) as u8)
        })
    }

    fn observe(&mut self, log_odds: f32, colour: Option<[u8; 3]>) {
        self.log_odds = (self.log_odds + log_odds).clamp(-LOG_ODDS_LIMIT, LOG_ODDS_LIMIT);
        self.evidence_count = self.evidence_count.saturating_add(1);
        if let Some(c) = colour
            && log_odds > 0.0
        {
            for (sum, v) in self.colour_sum.iter_mut().zip(c) {
                *sum += v as f32;
            }
            self.colour_count += 1;
        }
    }
}

/// Counters returned by [`OccupancyGridMultiHypothesis::insert`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertStats {
    pub rays_inserted: usize,
    /// Non-finite or zero-length rays.
    pub rays_dropped: usize,
    /// Rays longer than the maximum mapping range.
    pub rays_out_of_range: usize,
    pub cells_updated: usize,
}

impl InsertStats {
    pub fn merge(&mut self, other: InsertStats) {
        self.rays_inserted += other.rays_inserted;
        self.rays_dropped += other.rays_dropped;
        self.rays_out_of_range += other.rays_out_of_range;
        self.cells_updated += other.cells_updated;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OccupancyGridMultiHypothesis
// ────────────────────────────────────────────────────────────────────────────

/// Fixed-size probabilistic voxel map.
///
/// Storage is a dense cell index (`0` = no evidence) into a compact arena of
/// per-cell hypothesis lists, so resets and sparse maps stay cheap while
/// lookups remain O(1).
#[derive(Debug, Clone)]
pub struct OccupancyGridMultiHypothesis {
    params: GridParams,
    dimension_cells: usize,
    dimension_cells_vertical: usize,
    centre: Point3,
    /// World position of the low corner of cell (0, 0, 0).
    origin: Point3,
    index: Vec<u32>,
    cells: Vec<Vec<Hypothesis>>,
    source: u32,
}

impl OccupancyGridMultiHypothesis {
    /// Allocate an empty grid centred on the world origin.
    pub fn new(params: GridParams) -> Result<Self, NavError> {
        params.validate()?;
        let (h, v) = params.cell_counts();
        let mut grid = Self {
            params,
            dimension_cells: h,
            dimension_cells_vertical: v,
            centre: Point3::zero(),
            origin: Point3::zero(),
            index: vec![0; h * h * v],
            cells: Vec::new(),
            source: 0,
        };
        grid.reset_at(Point3::zero());
        Ok(grid)
    }

    pub fn params(&self) -> &GridParams {
        &self.params
    }

    pub fn dimension_cells(&self) -> usize {
        self.dimension_cells
    }

    pub fn dimension_cells_vertical(&self) -> usize {
        self.dimension_cells_vertical
    }

    pub fn centre(&self) -> Point3 {
        self.centre
    }

    /// Number of cells holding at least one hypothesis.
    pub fn evidence_cells(&self) -> usize {
        self.cells.len()
    }

    /// Number of cells whose best hypothesis is more likely occupied than not.
    pub fn occupied_cells(&self) -> usize {
        self.cells
            .iter()
            .filter(|hyps| best_hypothesis(hyps).is_some_and(|h| h.log_odds > 0.0))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Clear every hypothesis, keeping the current centre.
    pub fn reset(&mut self) {
        if !self.cells.is_empty() {
            self.index.fill(0);
            self.cells.clear();
        }
        self.source = 0;
    }

    /// Clear the grid and move it to a new centre.
    pub fn reset_at(&mut self, centre: Point3) {
        self.reset();
        let half = self.dimension_cells as f32 * self.params.cell_size_mm * 0.5;
        self.centre = centre;
        self.origin = Point3::new(centre.x - half, centre.y - half, centre.z);
    }

    /// Start a new mapping source. Only multi-hypothesis grids keep sources
    /// apart; returns the active source id.
    pub fn begin_source(&mut self) -> u32 {
        if self.params.grid_type == GridType::MultiHypothesis && !self.cells.is_empty() {
            self.source = self.source.wrapping_add(1);
        }
        self.source
    }

    /// Linear index of the cell containing `p`, if inside the grid.
    pub fn cell_index(&self, p: Point3) -> Option<usize> {
        let inv = 1.0 / self.params.cell_size_mm;
        let gx = ((p.x - self.origin.x) * inv).floor();
        let gy = ((p.y - self.origin.y) * inv).floor();
        let gz = ((p.z - self.origin.z) * inv).floor();
        let h = self.dimension_cells as f32;
        let v = self.dimension_cells_vertical as f32;
        // NaN fails every comparison and is rejected here too.
        if !(gx >= 0.0 && gy >= 0.0 && gz >= 0.0 && gx < h && gy < h && gz < v) {
            return None;
        }
        let n = self.dimension_cells;
        Some((gz as usize * n + gy as usize) * n + gx as usize)
    }

    /// Hypotheses stored for the cell containing `p`.
    pub fn hypotheses_at(&self, p: Point3) -> &[Hypothesis] {
        match self.cell_index(p).map(|i| self.index[i]) {
            Some(slot) if slot != 0 => &self.cells[slot as usize - 1],
            _ => &[],
        }
    }

    /// Occupancy probability of the best hypothesis at `p`; `None` when the
    /// cell holds no evidence or lies outside the grid.
    pub fn probability_at(&self, p: Point3) -> Option<f32> {
        best_hypothesis(self.hypotheses_at(p)).map(Hypothesis::probability)
    }

    /// Accumulate stereo rays observed from `observer` (body pose in world).
    pub fn insert(&mut self, rays: &[StereoRay], observer: &Pose) -> InsertStats {
        let mut stats = InsertStats::default();
        let cell = self.params.cell_size_mm;
        let vacancy = -VACANCY_LOG_ODDS * self.params.vacancy_weighting;

        for ray in rays {
            let start = observer.transform_point(ray.origin);
            let end = observer.transform_point(ray.end);
            let range = end.distance(start);
            if !(start.is_finite() && end.is_finite() && ray.sigma_mm.is_finite()) || range <= 0.0 {
                stats.rays_dropped += 1;
                continue;
            }
            if range > self.params.max_mapping_range_mm {
                stats.rays_out_of_range += 1;
                continue;
            }
            let dir = end.sub(start).scale(1.0 / range);
            let sigma = ray.sigma_mm.max(cell * 0.5);
            let band_start = (range - BAND_SIGMAS * sigma).max(0.0);
            let band_end = range + BAND_SIGMAS * sigma;

            // Free space in front of the occupancy band.
            if vacancy < 0.0 {
                let mut last = None;
                let mut d = cell * 0.5;
                while d < band_start {
                    if let Some(idx) = self.cell_index(start.add(dir.scale(d)))
                        && last != Some(idx)
                    {
                        self.observe(idx, vacancy, None);
                        stats.cells_updated += 1;
                        last = Some(idx);
                    }
                    d += cell;
                }
            }

            // Gaussian occupancy band; each cell takes the strongest sample.
            let two_var = 2.0 * sigma * sigma;
            let mut pending: Option<(usize, f32)> = None;
            let mut d = band_start;
            while d <= band_end {
                let g = (-(d - range) * (d - range) / two_var).exp();
                let p = 0.5 + PEAK_OCCUPANCY * g;
                let l = (p / (1.0 - p)).ln();
                if let Some(idx) = self.cell_index(start.add(dir.scale(d))) {
                    pending = match pending {
                        Some((prev, best)) if prev == idx => Some((prev, best.max(l))),
                        Some((prev, best)) => {
                            self.observe(prev, best, ray.colour);
                            stats.cells_updated += 1;
                            Some((idx, l))
                        }
                        None => Some((idx, l)),
                    };
                }
                d += cell * 0.5;
            }
            if let Some((prev, best)) = pending {
                self.observe(prev, best, ray.colour);
                stats.cells_updated += 1;
            }
            stats.rays_inserted += 1;
        }
        stats
    }

    /// Agreement between `rays` re-projected under `candidate` and the map.
    ///
    /// Sums `p − 0.5` over every re-projected end point whose cell holds
    /// evidence, so occupied cells add and vacated cells subtract. When both
    /// the ray and the cell carry colour the contribution is scaled by their
    /// similarity.
    pub fn match_score(&self, candidate: &Pose, rays: &[StereoRay]) -> f32 {
        let mut score = 0.0;
        for ray in rays {
            if !(ray.length() <= self.params.max_mapping_range_mm) {
                continue;
            }
            let end = candidate.transform_point(ray.end);
            let Some(best) = best_hypothesis(self.hypotheses_at(end)) else {
                continue;
            };
            let agreement = match (ray.colour, best.colour()) {
                (Some(a), Some(b)) => 0.5 + 0.5 * colour_similarity(a, b),
                _ => 1.0,
            };
            score += (best.probability() - 0.5) * agreement;
        }
        score
    }

    fn observe(&mut self, idx: usize, log_odds: f32, colour: Option<[u8; 3]>) {
        let source = self.source;
        let slot = self.index[idx];
        if slot == 0 {
            let mut h = Hypothesis::new(source);
            h.observe(log_odds, colour);
            self.cells.push(vec![h]);
            self.index[idx] = self.cells.len() as u32;
            return;
        }
        let hyps = &mut self.cells[slot as usize - 1];
        let pos = match self.params.grid_type {
            GridType::Simple => Some(0),
            GridType::MultiHypothesis => hyps.iter().position(|h| h.source == source),
        };
        match pos {
            Some(i) => hyps[i].observe(log_odds, colour),
            None if hyps.len() < MAX_HYPOTHESES => {
                let mut h = Hypothesis::new(source);
                h.observe(log_odds, colour);
                hyps.push(h);
            }
            None => {
                // Full: fold into the newest hypothesis.
                if let Some(last) = hyps.last_mut() {
                    last.observe(log_odds, colour);
                }
            }
        }
    }
}

fn best_hypothesis(hyps: &[Hypothesis]) -> Option<&Hypothesis> {
    hyps.iter().max_by(|a, b| a.log_odds.total_cmp(&b.log_odds))
}

fn colour_similarity(a: [u8; 3], b: [u8; 3]) -> f32 {
    let diff: u32 = a.iter().zip(b).map(|(&x, y)| (x as i32 - y as i32).unsigned_abs()).sum();
    1.0 - diff as f32 / (3.0 * 255.0)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
