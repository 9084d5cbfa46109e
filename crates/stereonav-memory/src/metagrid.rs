//! Metagrid buffer: a spatial windowing cache of occupancy grids.
//!
//! Only the map region near the robot is kept in memory. The buffer owns a
//! fixed pool of [`OccupancyGridMultiHypothesis`] slots, each anchored at a
//! centre and responsible for poses within `localisation_radius_mm` of it.
//!
//! ```text
//!  Empty ──(recentre + replay)──▶ Accumulating ──(robot left radius)──▶ Retiring
//!    ▲                                                                    │
//!    └───────────────────(cleared on the next move outside it)────────────┘
//! ```
//!
//! Grids are anchored on the ground plane: a slot's vertical span always
//! starts at z = 0 whatever height the pose that placed it carried.
//!
//! The mapped path kept for replay holds at most `max_path_steps` steps; the
//! oldest are dropped first.
//!
//! With two slots one is current while the other pre-warms the region the
//! robot is heading into, so crossing the radius boundary swaps maps instead
//! of starting from nothing.
//!
//! Every slot sits behind its own [`RwLock`]: queries hold a read lock for
//! the whole score computation and resets take the write lock, so a query
//! observes a slot either fully populated or fully cleared.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use stereonav_perception::{GridParams, GridType, InsertStats, OccupancyGridMultiHypothesis, RobotGeometry};
use stereonav_types::{NavError, Point3, Pose, StereoRay};
use tracing::{debug, info, instrument};

use crate::path_log::read_path_until;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

fn default_no_of_grids() -> usize {
    2
}

fn default_max_path_steps() -> usize {
    20_000
}

/// Slot count plus the parameters every slot's grid shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetagridConfig {
    #[serde(default = "default_no_of_grids")]
    pub no_of_grids: usize,
    #[serde(default)]
    pub grid_type: GridType,
    pub dimension_mm: f32,
    pub dimension_vertical_mm: f32,
    pub cell_size_mm: f32,
    pub localisation_radius_mm: f32,
    pub max_mapping_range_mm: f32,
    pub vacancy_weighting: f32,
    /// Mapped steps kept for replay into recycled slots.
    #[serde(default = "default_max_path_steps")]
    pub max_path_steps: usize,
}

impl Default for MetagridConfig {
    fn default() -> Self {
        let grid = GridParams::default();
        Self {
            no_of_grids: default_no_of_grids(),
            grid_type: grid.grid_type,
            dimension_mm: grid.dimension_mm,
            dimension_vertical_mm: grid.dimension_vertical_mm,
            cell_size_mm: grid.cell_size_mm,
            localisation_radius_mm: grid.localisation_radius_mm,
            max_mapping_range_mm: grid.max_mapping_range_mm,
            vacancy_weighting: grid.vacancy_weighting,
            max_path_steps: default_max_path_steps(),
        }
    }
}

impl MetagridConfig {
    pub fn grid_params(&self) -> GridParams {
        GridParams {
            grid_type: self.grid_type,
            dimension_mm: self.dimension_mm,
            dimension_vertical_mm: self.dimension_vertical_mm,
            cell_size_mm: self.cell_size_mm,
            localisation_radius_mm: self.localisation_radius_mm,
            max_mapping_range_mm: self.max_mapping_range_mm,
            vacancy_weighting: self.vacancy_weighting,
        }
    }

    pub fn validate(&self) -> Result<(), NavError> {
        if self.no_of_grids == 0 {
            return Err(NavError::invalid("metagrid buffer needs at least one grid"));
        }
        if self.max_path_steps == 0 {
            return Err(NavError::invalid("max_path_steps must be at least 1"));
        }
        self.grid_params().validate()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Slots
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Accumulating,
    /// Left behind by the robot. Cleared to `Empty` by the next move that
    /// lands outside its radius.
    Retiring,
}

#[derive(Debug)]
struct Slot {
    grid: OccupancyGridMultiHypothesis,
    state: SlotState,
    centre: Option<Point3>,
}

impl Slot {
    /// Whether this slot answers queries at `p`.
    fn owns(&self, p: Point3, radius: f32) -> bool {
        self.state == SlotState::Accumulating
            && self.centre.is_some_and(|c| c.planar_distance(p) <= radius)
    }

    fn clear(&mut self) {
        self.grid.reset();
        self.state = SlotState::Empty;
        self.centre = None;
    }
}

/// One mapped robot step kept for replay into recycled slots.
#[derive(Debug, Clone)]
pub struct MappedStep {
    /// Body pose in world.
    pub pose: Pose,
    /// Body-frame rays observed at `pose`.
    pub rays: Vec<StereoRay>,
    /// Mapping source (one per loaded or live path).
    pub source: u32,
}

/// Outcome of [`MetagridBuffer::load_path`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub records: usize,
    pub rays: usize,
    pub dropped_features: usize,
    pub skipped_batches: usize,
    pub stopped: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// MetagridBuffer
// ────────────────────────────────────────────────────────────────────────────

/// Pool of occupancy-grid slots that follows the robot.
#[derive(Debug)]
pub struct MetagridBuffer {
    config: MetagridConfig,
    slots: Vec<RwLock<Slot>>,
    current: Option<usize>,
    path: Vec<MappedStep>,
    source: u32,
}

impl MetagridBuffer {
    pub fn new(config: MetagridConfig) -> Result<Self, NavError> {
        config.validate()?;
        let params = config.grid_params();
        let slots = (0..config.no_of_grids)
            .map(|_| {
                OccupancyGridMultiHypothesis::new(params.clone()).map(|grid| {
                    RwLock::new(Slot {
                        grid,
                        state: SlotState::Empty,
                        centre: None,
                    })
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            config,
            slots,
            current: None,
            path: Vec::new(),
            source: 0,
        })
    }

    pub fn config(&self) -> &MetagridConfig {
        &self.config
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn current_slot(&self) -> Option<usize> {
        self.current
    }

    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|s| s.read().state)
    }

    pub fn slot_centre(&self, index: usize) -> Option<Point3> {
        self.slots.get(index).and_then(|s| s.read().centre)
    }

    /// Mapped steps available for replay.
    pub fn path(&self) -> &[MappedStep] {
        &self.path
    }

    /// Clear one slot. Safe to call while other threads query the buffer.
    pub fn reset_slot(&self, index: usize) -> Result<(), NavError> {
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| NavError::invalid(format!("slot {index} out of range")))?;
        slot.write().clear();
        debug!(slot = index, "slot reset");
        Ok(())
    }

    /// Clear every slot and forget the recorded path.
    pub fn reset(&mut self) {
        for slot in &self.slots {
            slot.write().clear();
        }
        self.current = None;
        self.path.clear();
        self.source = 0;
    }

    /// Track the robot: keep, pre-warm, swap or recycle slots so that one
    /// accumulating slot owns `pose`.
    pub fn move_to(&mut self, pose: &Pose) {
        let here = pose.position();
        let radius = self.config.localisation_radius_mm;
        self.clear_retired(here);

        if let Some(cur) = self.current {
            let slot = self.slots[cur].read();
            if slot.owns(here, radius) {
                let far = slot.centre.is_some_and(|c| c.planar_distance(here) > radius * 0.5);
                drop(slot);
                if far {
                    self.prewarm(here);
                }
                return;
            }
        }

        let old = self.current;
        let next = self
            .nearest_owner(here, old)
            .unwrap_or_else(|| self.recycle(here, old));
        if let Some(old) = old
            && old != next
        {
            let mut slot = self.slots[old].write();
            if slot.state == SlotState::Accumulating {
                slot.state = SlotState::Retiring;
            }
        }
        debug!(from = ?old, to = next, "current slot changed");
        self.current = Some(next);
    }

    /// Live mapping: insert rays observed at `pose` into every slot that
    /// covers it and keep the step for later replays.
    pub fn insert(&mut self, pose: &Pose, rays: Vec<StereoRay>) -> InsertStats {
        let mut stats = InsertStats::default();
        for slot in &self.slots {
            let mut slot = slot.write();
            if slot.state == SlotState::Accumulating
                && slot.centre.is_some_and(|c| self.covers(c, pose))
            {
                stats.merge(slot.grid.insert(&rays, pose));
            }
        }
        self.path.push(MappedStep {
            pose: *pose,
            rays,
            source: self.source,
        });
        self.trim_path();
        stats
    }

    /// Replace the recorded path with the one stored in the given files and
    /// rebuild the map around the robot.
    pub fn load_path(
        &mut self,
        index: &Path,
        pose_log: &Path,
        feature_log: &Path,
        geometry: &RobotGeometry,
        disparity_sigma_px: f32,
    ) -> Result<LoadSummary, NavError> {
        self.load_path_until(
            index,
            pose_log,
            feature_log,
            geometry,
            disparity_sigma_px,
            &AtomicBool::new(false),
        )
    }

    /// As [`load_path`][Self::load_path], stopping at the last complete
    /// record once `stop` is set.
    #[instrument(skip_all, fields(index = %index.display()))]
    pub fn load_path_until(
        &mut self,
        index: &Path,
        pose_log: &Path,
        feature_log: &Path,
        geometry: &RobotGeometry,
        disparity_sigma_px: f32,
        stop: &AtomicBool,
    ) -> Result<LoadSummary, NavError> {
        let log = read_path_until(index, pose_log, feature_log, stop)?;
        let mut summary = LoadSummary {
            records: log.records.len(),
            skipped_batches: log.skipped_batches,
            stopped: log.stopped,
            ..LoadSummary::default()
        };

        let mut steps = Vec::with_capacity(log.records.len());
        let source = self.source.wrapping_add(1);
        for record in &log.records {
            let camera = usize::try_from(record.camera_index)
                .map_err(|_| NavError::MalformedLog(format!("negative camera index {}", record.camera_index)))?;
            let batch = geometry.rays(camera, &record.head_pose(), &record.features, disparity_sigma_px)?;
            summary.rays += batch.rays.len();
            summary.dropped_features += batch.dropped;
            steps.push(MappedStep {
                pose: record.body_pose(),
                rays: batch.rays,
                source,
            });
        }
        let anchor = self
            .current
            .and_then(|i| self.slot_centre(i))
            .or_else(|| steps.first().map(|s| s.pose.position()));

        for slot in &self.slots {
            slot.write().clear();
        }
        self.current = None;
        self.path = steps;
        self.trim_path();
        self.source = source;

        if let Some(anchor) = anchor
            && !stop.load(Ordering::Relaxed)
        {
            self.move_to(&Pose::new(anchor.x, anchor.y, anchor.z, 0.0, 0.0, 0.0));
        }
        info!(
            records = summary.records,
            rays = summary.rays,
            skipped = summary.skipped_batches,
            "path loaded"
        );
        Ok(summary)
    }

    /// Match score of `rays` under `pose` against the slot that owns the
    /// pose's region; `0.0` when no slot does.
    pub fn localise_at_position(&self, pose: &Pose, rays: &[StereoRay]) -> f32 {
        let here = pose.position();
        let radius = self.config.localisation_radius_mm;
        let Some(owner) = self.owner_of(here) else {
            return 0.0;
        };
        let slot = self.slots[owner].read();
        // State may have changed since the owner was picked.
        if !slot.owns(here, radius) {
            return 0.0;
        }
        slot.grid.match_score(pose, rays)
    }

    /// Evidence cells held by the slot owning `pose`'s region.
    pub fn evidence_at(&self, pose: &Pose) -> usize {
        self.owner_of(pose.position())
            .map(|i| self.slots[i].read().grid.evidence_cells())
            .unwrap_or(0)
    }

    /// Clear every retiring slot whose radius no longer contains `p`.
    fn clear_retired(&self, p: Point3) {
        let radius = self.config.localisation_radius_mm;
        for (i, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.write();
            if slot.state == SlotState::Retiring
                && slot.centre.is_none_or(|c| c.planar_distance(p) > radius)
            {
                slot.clear();
                debug!(slot = i, "retired slot cleared");
            }
        }
    }

    /// Drop the oldest mapped steps beyond `max_path_steps`.
    fn trim_path(&mut self) {
        let excess = self.path.len().saturating_sub(self.config.max_path_steps);
        if excess > 0 {
            self.path.drain(..excess);
            debug!(dropped = excess, kept = self.path.len(), "path history trimmed");
        }
    }

    /// The current slot when it owns `p`, otherwise the nearest owning slot.
    fn owner_of(&self, p: Point3) -> Option<usize> {
        let radius = self.config.localisation_radius_mm;
        if let Some(cur) = self.current
            && self.slots[cur].read().owns(p, radius)
        {
            return Some(cur);
        }
        self.nearest_owner(p, self.current)
    }

    fn nearest_owner(&self, p: Point3, exclude: Option<usize>) -> Option<usize> {
        let radius = self.config.localisation_radius_mm;
        self.slots
            .iter()
            .enumerate()
            .filter(|&(i, _)| Some(i) != exclude)
            .filter_map(|(i, slot)| {
                let slot = slot.read();
                let c = slot.centre?;
                slot.owns(p, radius).then(|| (c.planar_distance(p), i))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, i)| i)
    }

    /// Start accumulating an idle slot around `p` unless one already
    /// covers the region ahead.
    fn prewarm(&mut self, p: Point3) {
        let half = self.config.localisation_radius_mm * 0.5;
        let covered = self.slots.iter().enumerate().any(|(i, slot)| {
            let slot = slot.read();
            Some(i) != self.current
                && slot.state == SlotState::Accumulating
                && slot.centre.is_some_and(|c| c.planar_distance(p) <= half)
        });
        if covered || self.slots.len() < 2 {
            return;
        }
        let index = self.recycle(p, self.current);
        debug!(slot = index, x = p.x, y = p.y, "slot pre-warmed");
    }

    /// Pick a slot other than `keep` (empty first, then retiring, then the
    /// farthest accumulating one), recentre it on `p` at ground level and
    /// replay the path into it.
    fn recycle(&mut self, p: Point3, keep: Option<usize>) -> usize {
        let rank = |state: SlotState| match state {
            SlotState::Empty => 0,
            SlotState::Retiring => 1,
            SlotState::Accumulating => 2,
        };
        let index = self
            .slots
            .iter()
            .enumerate()
            .filter(|&(i, _)| Some(i) != keep || self.slots.len() == 1)
            .map(|(i, slot)| {
                let slot = slot.read();
                let dist = slot.centre.map_or(f32::INFINITY, |c| c.planar_distance(p));
                (rank(slot.state), std::cmp::Reverse(OrderedDist(dist)), i)
            })
            .min()
            .map(|(_, _, i)| i)
            .unwrap_or(0);

        let anchor = Point3::new(p.x, p.y, 0.0);
        let mut slot = self.slots[index].write();
        slot.grid.reset_at(anchor);
        slot.centre = Some(anchor);
        slot.state = SlotState::Accumulating;
        let replayed = replay(&mut slot.grid, &self.path, anchor, self.config.dimension_mm * 0.5);
        debug!(slot = index, steps = replayed, "slot recentred");
        index
    }

    fn covers(&self, centre: Point3, pose: &Pose) -> bool {
        let half = self.config.dimension_mm * 0.5;
        (pose.x - centre.x).abs() <= half && (pose.y - centre.y).abs() <= half
    }
}

/// Re-insert every path step whose pose lies inside the grid's square.
fn replay(grid: &mut OccupancyGridMultiHypothesis, path: &[MappedStep], centre: Point3, half: f32) -> usize {
    let mut source = None;
    let mut replayed = 0;
    for step in path {
        if (step.pose.x - centre.x).abs() > half || (step.pose.y - centre.y).abs() > half {
            continue;
        }
        if source.is_some_and(|s| s != step.source) {
            grid.begin_source();
        }
        source = Some(step.source);
        grid.insert(&step.rays, &step.pose);
        replayed += 1;
    }
    replayed
}

/// Total order over distances for slot ranking.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedDist(f32);

impl Eq for OrderedDist {}

impl PartialOrd for OrderedDist {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedDist {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_log::PathWriter;
    use approx::assert_abs_diff_eq;
    use stereonav_perception::StereoCameraGeometry;
    use stereonav_types::OdometryRecord;

    fn config(no_of_grids: usize) -> MetagridConfig {
        MetagridConfig {
            no_of_grids,
            grid_type: GridType::Simple,
            dimension_mm: 3000.0,
            dimension_vertical_mm: 1000.0,
            cell_size_mm: 50.0,
            localisation_radius_mm: 1000.0,
            max_mapping_range_mm: 1400.0,
            vacancy_weighting: 1.0,
            max_path_steps: 1000,
        }
    }

    /// A wall of points one metre ahead of the robot, body frame.
    fn wall_rays() -> Vec<StereoRay> {
        (0..20)
            .map(|i| StereoRay {
                origin: Point3::new(0.0, 0.0, 500.0),
                end: Point3::new(-475.0 + i as f32 * 50.0, 1025.0, 275.0 + (i % 5) as f32 * 100.0),
                sigma_mm: 30.0,
                colour: None,
            })
            .collect()
    }

    // ── Construction ────────────────────────────────────────────────────────

    #[test]
    fn two_slots_are_independently_resettable() {
        let mut buf = MetagridBuffer::new(config(2)).unwrap();
        assert_eq!(buf.slot_count(), 2);

        let at = Pose::identity();
        buf.move_to(&at);
        buf.insert(&at, wall_rays());
        buf.move_to(&Pose::planar(0.0, 600.0, 0.0));
        assert_eq!(buf.slot_state(0), Some(SlotState::Accumulating));
        assert_eq!(buf.slot_state(1), Some(SlotState::Accumulating));

        buf.reset_slot(1).unwrap();
        assert_eq!(buf.slot_state(1), Some(SlotState::Empty));
        assert_eq!(buf.slot_state(0), Some(SlotState::Accumulating));
        assert!(buf.localise_at_position(&at, &wall_rays()) > 0.0);
        assert!(buf.reset_slot(2).is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(MetagridBuffer::new(config(0)).is_err());
        let mut c = config(2);
        c.cell_size_mm = -1.0;
        assert!(matches!(MetagridBuffer::new(c), Err(NavError::InvalidArgument(_))));
    }

    // ── Slot life cycle ─────────────────────────────────────────────────────

    #[test]
    fn slots_follow_the_robot() {
        let mut buf = MetagridBuffer::new(config(2)).unwrap();
        assert_eq!(buf.current_slot(), None);

        buf.move_to(&Pose::identity());
        assert_eq!(buf.current_slot(), Some(0));
        assert_eq!(buf.slot_state(1), Some(SlotState::Empty));

        // Past half the radius: slot 1 pre-warms around the robot.
        buf.move_to(&Pose::planar(0.0, 600.0, 0.0));
        assert_eq!(buf.current_slot(), Some(0));
        assert_eq!(buf.slot_state(1), Some(SlotState::Accumulating));
        assert_eq!(buf.slot_centre(1), Some(Point3::new(0.0, 600.0, 0.0)));

        // Leaving the radius swaps to the pre-warmed slot.
        buf.move_to(&Pose::planar(0.0, 1100.0, 0.0));
        assert_eq!(buf.current_slot(), Some(1));
        assert_eq!(buf.slot_state(0), Some(SlotState::Retiring));

        // Far away: the retiring slot is recycled.
        buf.move_to(&Pose::planar(0.0, 5000.0, 0.0));
        assert_eq!(buf.current_slot(), Some(0));
        assert_eq!(buf.slot_state(0), Some(SlotState::Accumulating));
        assert_eq!(buf.slot_state(1), Some(SlotState::Retiring));
    }

    #[test]
    fn single_slot_recycles_itself() {
        let mut buf = MetagridBuffer::new(config(1)).unwrap();
        buf.move_to(&Pose::identity());
        buf.move_to(&Pose::planar(0.0, 800.0, 0.0));
        assert_eq!(buf.slot_centre(0), Some(Point3::zero()));
        buf.move_to(&Pose::planar(0.0, 2500.0, 0.0));
        assert_eq!(buf.current_slot(), Some(0));
        assert_eq!(buf.slot_centre(0), Some(Point3::new(0.0, 2500.0, 0.0)));
    }

    #[test]
    fn retired_slot_is_cleared_once_robot_moves_on() {
        let mut buf = MetagridBuffer::new(config(2)).unwrap();
        buf.move_to(&Pose::identity());
        buf.insert(&Pose::identity(), wall_rays());
        buf.move_to(&Pose::planar(0.0, 600.0, 0.0));
        buf.move_to(&Pose::planar(0.0, 1100.0, 0.0));
        assert_eq!(buf.current_slot(), Some(1));
        assert_eq!(buf.slot_state(0), Some(SlotState::Retiring));

        // Back inside the retired radius: the slot is kept.
        buf.move_to(&Pose::planar(0.0, 900.0, 0.0));
        assert_eq!(buf.slot_state(0), Some(SlotState::Retiring));

        buf.move_to(&Pose::planar(0.0, 1050.0, 0.0));
        assert_eq!(buf.current_slot(), Some(1));
        assert_eq!(buf.slot_state(0), Some(SlotState::Empty));
        assert_eq!(buf.slot_centre(0), None);
    }

    #[test]
    fn slots_are_anchored_on_the_ground() {
        let raised = Pose::new(0.0, 0.0, 600.0, 0.0, 0.0, 0.0);
        let mut high = MetagridBuffer::new(config(2)).unwrap();
        high.move_to(&raised);
        assert_eq!(high.slot_centre(0), Some(Point3::zero()));

        let mut level = MetagridBuffer::new(config(2)).unwrap();
        level.move_to(&Pose::identity());

        let at = Pose::identity();
        high.insert(&at, wall_rays());
        level.insert(&at, wall_rays());
        assert_eq!(high.evidence_at(&at), level.evidence_at(&at));
        assert!(high.evidence_at(&at) > 0);
        assert_eq!(
            high.localise_at_position(&at, &wall_rays()),
            level.localise_at_position(&at, &wall_rays())
        );
    }

    // ── Path history ────────────────────────────────────────────────────────

    #[test]
    fn path_history_keeps_only_newest_steps() {
        let mut c = config(2);
        c.max_path_steps = 5;
        let mut buf = MetagridBuffer::new(c).unwrap();
        for i in 0..20 {
            let at = Pose::planar(0.0, i as f32 * 10.0, 0.0);
            buf.move_to(&at);
            buf.insert(&at, wall_rays());
            assert!(buf.path().len() <= 5);
        }
        let ys: Vec<f32> = buf.path().iter().map(|s| s.pose.y).collect();
        assert_eq!(ys, vec![150.0, 160.0, 170.0, 180.0, 190.0]);
    }

    #[test]
    fn zero_path_history_is_rejected() {
        let mut c = config(2);
        c.max_path_steps = 0;
        assert!(matches!(MetagridBuffer::new(c), Err(NavError::InvalidArgument(_))));
    }

    #[test]
    fn recycled_slot_replays_nearby_path() {
        let mut buf = MetagridBuffer::new(config(1)).unwrap();
        let at = Pose::identity();
        buf.move_to(&at);
        buf.insert(&at, wall_rays());
        let before = buf.localise_at_position(&at, &wall_rays());

        buf.move_to(&Pose::planar(0.0, 8000.0, 0.0));
        assert_eq!(buf.localise_at_position(&at, &wall_rays()), 0.0);

        buf.move_to(&at);
        let after = buf.localise_at_position(&at, &wall_rays());
        assert!(before > 0.0);
        assert_eq!(before, after);
    }

    #[test]
    fn query_outside_every_slot_scores_zero() {
        let mut buf = MetagridBuffer::new(config(2)).unwrap();
        buf.move_to(&Pose::identity());
        buf.insert(&Pose::identity(), wall_rays());
        assert_eq!(buf.localise_at_position(&Pose::planar(0.0, 4000.0, 0.0), &wall_rays()), 0.0);
        assert_eq!(buf.evidence_at(&Pose::planar(0.0, 4000.0, 0.0)), 0);
        assert!(buf.evidence_at(&Pose::identity()) > 0);
    }

    // ── Concurrency ─────────────────────────────────────────────────────────

    #[test]
    fn concurrent_reset_is_never_half_observed() {
        let mut buf = MetagridBuffer::new(config(2)).unwrap();
        let at = Pose::identity();
        buf.move_to(&at);
        buf.insert(&at, wall_rays());
        let full = buf.localise_at_position(&at, &wall_rays());
        assert!(full > 0.0);

        let buf = &buf;
        let rays = wall_rays();
        std::thread::scope(|s| {
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        (0..200)
                            .map(|_| buf.localise_at_position(&at, &rays))
                            .collect::<Vec<f32>>()
                    })
                })
                .collect();
            s.spawn(|| buf.reset_slot(0).unwrap());
            for reader in readers {
                for score in reader.join().unwrap() {
                    assert!(score == full || score == 0.0, "half-cleared score {score}");
                }
            }
        });
        assert_eq!(buf.localise_at_position(&at, &wall_rays()), 0.0);
    }

    // ── Path loading ────────────────────────────────────────────────────────

    /// Map a wall from three steps live while recording the same steps to
    /// disk, then rebuild a second buffer from the recording.
    fn live_and_loaded(colour: Option<[u8; 3]>) -> (MetagridBuffer, MetagridBuffer, LoadSummary) {
        let dir = tempfile::tempdir().unwrap();
        let (idx, poses, feats) = (
            dir.path().join("idx"),
            dir.path().join("pose"),
            dir.path().join("feat"),
        );

        let mut geometry = RobotGeometry::default();
        geometry
            .set_camera(0, StereoCameraGeometry { mount_z_mm: 500.0, ..StereoCameraGeometry::default() })
            .unwrap();
        geometry.head_centre_z_mm = 500.0;

        let targets: Vec<Point3> = (0..15)
            .map(|i| Point3::new(-350.0 + i as f32 * 50.0, 1200.0, 300.0 + (i % 3) as f32 * 100.0))
            .collect();
        let mut writer = PathWriter::create(&idx, &poses, &feats).unwrap();
        let mut live = MetagridBuffer::new(config(2)).unwrap();
        for step in 0..3 {
            let body = Pose::planar(0.0, step as f32 * 100.0, 0.0);
            let features: Vec<_> = targets
                .iter()
                .filter_map(|t| {
                    let local = body.inverse_transform_point(*t);
                    geometry.project(0, &Pose::identity(), local).unwrap()
                })
                .map(|mut f| {
                    f.colour = colour;
                    f
                })
                .collect();
            assert_eq!(features.len(), targets.len());
            let rays = geometry.rays(0, &Pose::identity(), &features, 0.5).unwrap().rays;
            live.move_to(&body);
            live.insert(&body, rays);
            writer
                .append(&OdometryRecord {
                    timestamp: step,
                    x: body.x,
                    y: body.y,
                    orientation: 0.0,
                    head_pan: 0.0,
                    head_tilt: 0.0,
                    head_roll: 0.0,
                    camera_index: 0,
                    features,
                })
                .unwrap();
        }
        writer.finish().unwrap();

        let mut loaded = MetagridBuffer::new(config(2)).unwrap();
        let summary = loaded.load_path(&idx, &poses, &feats, &geometry, 0.5).unwrap();
        (live, loaded, summary)
    }

    #[test]
    fn loaded_path_rebuilds_map_like_live_mapping() {
        let (live, loaded, summary) = live_and_loaded(Some([200, 40, 40]));
        assert_eq!(summary.records, 3);
        assert_eq!(summary.rays, 45);
        assert_eq!(loaded.path().len(), 3);
        assert_eq!(loaded.current_slot(), Some(0));

        let query = loaded.path()[0].rays.clone();
        let at = Pose::identity();
        let score = loaded.localise_at_position(&at, &query);
        assert!(score > 0.0);
        assert_abs_diff_eq!(live.localise_at_position(&at, &query), score, epsilon = 1e-3);
    }

    #[test]
    fn uncoloured_path_reloads_without_colour() {
        let (live, loaded, _) = live_and_loaded(None);
        assert!(loaded.path().iter().flat_map(|s| &s.rays).all(|r| r.colour.is_none()));

        // A coloured query must meet the same colourless cells in both maps.
        let query: Vec<StereoRay> = loaded.path()[0]
            .rays
            .iter()
            .map(|r| StereoRay { colour: Some([220, 220, 220]), ..*r })
            .collect();
        let at = Pose::identity();
        let live_score = live.localise_at_position(&at, &query);
        assert!(live_score > 0.0);
        assert_abs_diff_eq!(loaded.localise_at_position(&at, &query), live_score, epsilon = 1e-3);
    }

    #[test]
    fn load_path_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = MetagridBuffer::new(config(2)).unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            buf.load_path(&missing, &missing, &missing, &RobotGeometry::default(), 0.5),
            Err(NavError::Io { .. })
        ));
    }
}
