//! Synthetic path recording and bias calibration runs.
//!
//! A recorded path lives in one directory as three files: `path.idx`,
//! `path.pose` and `path.feat`. Both commands rebuild the same corridor from
//! the seed, so a calibration run observes the world the path was recorded
//! in.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use stereonav_memory::PathWriter;
use stereonav_runtime::simulation::straight_path;
use stereonav_runtime::{CorridorParams, Steersman, SteersmanConfig, SyntheticCorridor};
use stereonav_types::{NavError, Pose};
use tracing::info;

/// The three files of a recorded path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathFiles {
    pub index: PathBuf,
    pub poses: PathBuf,
    pub features: PathBuf,
}

impl PathFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            index: dir.join("path.idx"),
            poses: dir.join("path.pose"),
            features: dir.join("path.feat"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordOptions {
    pub length_mm: f32,
    pub step_mm: f32,
    pub features: usize,
    pub seed: u64,
}

/// Drive a straight synthetic path and write it to `dir`.
pub fn record(cfg: &SteersmanConfig, dir: &Path, opts: &RecordOptions) -> Result<usize, NavError> {
    fs::create_dir_all(dir).map_err(|e| NavError::io(dir, e))?;
    let files = PathFiles::in_dir(dir);
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let world = SyntheticCorridor::generate(&CorridorParams::default(), &mut rng)?;
    let path = straight_path(opts.length_mm, opts.step_mm)?;

    let mut writer = PathWriter::create(&files.index, &files.poses, &files.features)?;
    world.record_path(&cfg.geometry, &path, opts.features, &mut writer, &mut rng)?;
    let records = writer.finish()?;
    info!(records, dir = %dir.display(), "recorded synthetic path");
    Ok(records)
}

#[derive(Debug, Clone)]
pub struct CalibrateOptions {
    pub bias_x_mm: f32,
    pub bias_y_mm: f32,
    /// Localise at every `every`-th record.
    pub every: usize,
    pub features: usize,
    pub seed: u64,
}

/// Outcome of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationReport {
    pub records: usize,
    pub rays: usize,
    pub attempts: usize,
    pub localised: usize,
    pub failures: usize,
    pub bias_x_mm: f32,
    pub bias_y_mm: f32,
    pub mean_offset_x_mm: Option<f32>,
    pub mean_offset_y_mm: Option<f32>,
    pub mean_offset_pan_deg: Option<f32>,
    /// Distance between the mean offset and the injected bias.
    pub error_mm: Option<f32>,
    pub stopped: bool,
}

/// Replay the path in `dir`, then localise along it with the bias injected.
/// Setting `stop` ends the run after the current step.
pub fn calibrate(
    cfg: SteersmanConfig,
    dir: &Path,
    opts: &CalibrateOptions,
    stop: &AtomicBool,
) -> Result<CalibrationReport, NavError> {
    if opts.every == 0 {
        return Err(NavError::invalid("--every must be at least 1"));
    }
    let files = PathFiles::in_dir(dir);
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let world = SyntheticCorridor::generate(&CorridorParams::default(), &mut rng)?;

    let mut nav = Steersman::new(cfg)?;
    let summary = nav.load_path_until(&files.index, &files.poses, &files.features, stop)?;
    let truths: Vec<Pose> = nav.buffer().path().iter().map(|step| step.pose).collect();

    let geometry = nav.config().geometry.clone();
    let sigmas = vec![nav.config().sampling.disparity_sigma_px; geometry.camera_count()];
    let mut offsets: Vec<Pose> = Vec::new();
    let mut attempts = 0;
    let mut stopped = summary.stopped;

    if !stopped {
        for &truth in truths.iter().step_by(opts.every) {
            if stop.load(Ordering::Relaxed) {
                stopped = true;
                break;
            }
            let mut per_camera = Vec::with_capacity(geometry.camera_count());
            for camera in 0..geometry.camera_count() {
                nav.set_current_position(camera, truth)?;
                per_camera.push(world.observe(&geometry, camera, &truth, opts.features, &mut rng)?);
            }
            attempts += 1;
            if let Some(offset) = nav.localise(&per_camera, &sigmas, opts.bias_x_mm, opts.bias_y_mm)? {
                offsets.push(offset);
            }
        }
    }

    let mean = |f: fn(&Pose) -> f32| {
        (!offsets.is_empty()).then(|| offsets.iter().map(f).sum::<f32>() / offsets.len() as f32)
    };
    let mean_x = mean(|p| p.x);
    let mean_y = mean(|p| p.y);
    let error_mm = mean_x
        .zip(mean_y)
        .map(|(x, y)| (x - opts.bias_x_mm).hypot(y - opts.bias_y_mm));

    let report = CalibrationReport {
        records: summary.records,
        rays: summary.rays,
        attempts,
        localised: offsets.len(),
        failures: attempts - offsets.len(),
        bias_x_mm: opts.bias_x_mm,
        bias_y_mm: opts.bias_y_mm,
        mean_offset_x_mm: mean_x,
        mean_offset_y_mm: mean_y,
        mean_offset_pan_deg: mean(|p| p.pan).map(f32::to_degrees),
        error_mm,
        stopped,
    };
    info!(
        attempts = report.attempts,
        localised = report.localised,
        error_mm = ?report.error_mm,
        "calibration finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_short(dir: &Path) -> usize {
        let opts = RecordOptions {
            length_mm: 1000.0,
            step_mm: 100.0,
            features: 150,
            seed: 5,
        };
        record(&SteersmanConfig::default(), dir, &opts).expect("record")
    }

    fn calibrate_opts(every: usize) -> CalibrateOptions {
        CalibrateOptions {
            bias_x_mm: -100.0,
            bias_y_mm: 0.0,
            every,
            features: 50,
            seed: 5,
        }
    }

    fn seeded_config() -> SteersmanConfig {
        let mut cfg = SteersmanConfig::default();
        cfg.sampling.seed = Some(3);
        cfg.sampling.sample_count = 100;
        cfg
    }

    // ── Recording ───────────────────────────────────────────────────────────

    #[test]
    fn record_writes_three_files() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let out = dir.path().join("run");
        assert_eq!(record_short(&out), 11);
        let files = PathFiles::in_dir(&out);
        assert!(files.index.exists() && files.poses.exists() && files.features.exists());
    }

    // ── Calibration ─────────────────────────────────────────────────────────

    #[test]
    fn calibrate_localises_every_nth_record() {
        let dir = tempfile::tempdir().expect("tmp dir");
        record_short(dir.path());

        let report = calibrate(seeded_config(), dir.path(), &calibrate_opts(2), &AtomicBool::new(false))
            .expect("calibrate");
        assert_eq!(report.records, 11);
        assert_eq!(report.attempts, 6);
        assert_eq!(report.localised + report.failures, 6);
        assert_eq!(report.mean_offset_x_mm.is_some(), report.localised > 0);
        assert!(!report.stopped);

        let json = serde_json::to_string(&report).expect("json");
        assert!(json.contains("\"attempts\":6"));
    }

    #[test]
    fn loaded_steps_carry_recorded_body_poses() {
        let dir = tempfile::tempdir().expect("tmp dir");
        record_short(dir.path());
        let files = PathFiles::in_dir(dir.path());

        let mut nav = Steersman::new(seeded_config()).expect("steersman");
        nav.load_path(&files.index, &files.poses, &files.features).expect("load");
        let loaded: Vec<Pose> = nav.buffer().path().iter().map(|step| step.pose).collect();

        let log = stereonav_memory::read_path(&files.index, &files.poses, &files.features).expect("read");
        let recorded: Vec<Pose> = log.records.iter().map(|r| r.body_pose()).collect();
        assert_eq!(loaded, recorded);
    }

    #[test]
    fn stop_flag_ends_the_run() {
        let dir = tempfile::tempdir().expect("tmp dir");
        record_short(dir.path());

        let report = calibrate(seeded_config(), dir.path(), &calibrate_opts(1), &AtomicBool::new(true))
            .expect("calibrate");
        assert!(report.stopped);
        assert_eq!(report.attempts, 0);
        assert_eq!(report.error_mm, None);
    }

    #[test]
    fn zero_stride_is_rejected() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let err = calibrate(seeded_config(), dir.path(), &calibrate_opts(0), &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, NavError::InvalidArgument(_)));
    }

    #[test]
    fn missing_path_is_io_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let err = calibrate(seeded_config(), dir.path(), &calibrate_opts(1), &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, NavError::Io { .. }));
    }
}
