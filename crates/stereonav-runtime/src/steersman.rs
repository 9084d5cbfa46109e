//! The localisation façade.
//!
//! A [`Steersman`] owns the robot geometry, a [`MetagridBuffer`] and the last
//! known pose of each camera. Each [`localise`][Steersman::localise] call
//!
//! 1. converts the per-camera features into body-frame rays,
//! 2. samples candidate poses around `nominal − bias` with the moiré sampler,
//! 3. scores every candidate against the buffer on the rayon pool,
//! 4. collapses the scored set with [`find_best_pose`], and
//! 5. advances the camera poses by the recovered offset.
//!
//! Camera poses are body poses in the world frame: position, heading (pan)
//! and the head's tilt and roll folded in.

use std::path::Path;
use std::sync::atomic::AtomicBool;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use stereonav_memory::{LoadSummary, MetagridBuffer};
use stereonav_perception::{InsertStats, create_moire_grid, find_best_pose};
use stereonav_types::{NavError, Pose, StereoFeature, StereoRay};
use tracing::{debug, info, instrument};

use crate::config::SteersmanConfig;

/// One camera's contribution to a localisation cycle.
struct CameraRays {
    /// Sampling centre for this camera (`nominal − bias`).
    centre: Pose,
    rays: Vec<StereoRay>,
}

pub struct Steersman {
    config: SteersmanConfig,
    buffer: MetagridBuffer,
    current: Vec<Pose>,
    rng: StdRng,
    /// Dedicated scoring pool; `None` uses rayon's global pool.
    pool: Option<ThreadPool>,
}

impl Steersman {
    pub fn new(config: SteersmanConfig) -> Result<Self, NavError> {
        config.validate()?;
        let buffer = MetagridBuffer::new(config.buffer.clone())?;
        let rng = match config.sampling.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let pool = match config.sampling.worker_threads {
            0 => None,
            n => Some(
                ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("stereonav-score-{i}"))
                    .build()
                    .map_err(|e| NavError::Config(format!("failed to start scoring threads: {e}")))?,
            ),
        };
        Ok(Self {
            current: vec![Pose::identity(); config.geometry.camera_count()],
            config,
            buffer,
            rng,
            pool,
        })
    }

    /// Construct from a saved configuration file.
    pub fn load(path: &Path) -> Result<Self, NavError> {
        Self::new(SteersmanConfig::load_from(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), NavError> {
        self.config.save_to(path)
    }

    pub fn config(&self) -> &SteersmanConfig {
        &self.config
    }

    pub fn buffer(&self) -> &MetagridBuffer {
        &self.buffer
    }

    pub fn set_current_position(&mut self, camera: usize, pose: Pose) -> Result<(), NavError> {
        if !pose.is_finite() {
            return Err(NavError::invalid("camera pose must be finite"));
        }
        let slot = self
            .current
            .get_mut(camera)
            .ok_or_else(|| NavError::invalid(format!("camera index {camera} out of range")))?;
        *slot = pose;
        Ok(())
    }

    pub fn current_position(&self, camera: usize) -> Result<Pose, NavError> {
        self.current
            .get(camera)
            .copied()
            .ok_or_else(|| NavError::invalid(format!("camera index {camera} out of range")))
    }

    /// Forget the map and the recorded path; camera poses are kept.
    pub fn reset(&mut self) {
        self.buffer.reset();
    }

    pub fn load_path(&mut self, index: &Path, pose_log: &Path, feature_log: &Path) -> Result<LoadSummary, NavError> {
        self.load_path_until(index, pose_log, feature_log, &AtomicBool::new(false))
    }

    /// Replay a recorded path into the buffer, stopping early once `stop`
    /// is set.
    pub fn load_path_until(
        &mut self,
        index: &Path,
        pose_log: &Path,
        feature_log: &Path,
        stop: &AtomicBool,
    ) -> Result<LoadSummary, NavError> {
        let summary = self.buffer.load_path_until(
            index,
            pose_log,
            feature_log,
            &self.config.geometry,
            self.config.sampling.disparity_sigma_px,
            stop,
        )?;
        Ok(summary)
    }

    /// Live mapping: insert each camera's features at its current pose.
    pub fn map(&mut self, per_camera_features: &[Vec<StereoFeature>]) -> Result<InsertStats, NavError> {
        self.check_camera_count(per_camera_features.len(), "feature lists")?;
        let sigma = self.config.sampling.disparity_sigma_px;
        let mut stats = InsertStats::default();
        for (camera, features) in per_camera_features.iter().enumerate() {
            if features.is_empty() {
                continue;
            }
            let batch = self.config.geometry.rays(camera, &Pose::identity(), features, sigma)?;
            let pose = self.current[camera];
            self.buffer.move_to(&pose);
            stats.merge(self.buffer.insert(&pose, batch.rays));
        }
        Ok(stats)
    }

    /// Estimate the pose offset from stereo features.
    ///
    /// Candidates are sampled around `nominal − (bias_x, bias_y)` for each
    /// camera. On success the returned offset is `best − centre` and every
    /// camera pose becomes `centre + offset`. `Ok(None)` means localisation
    /// failed this cycle: no features, too little mapped evidence, or a flat
    /// score field.
    ///
    /// `per_camera_uncertainties` are disparity sigmas in pixels; a
    /// non-positive entry falls back to the configured default.
    #[instrument(skip(self, per_camera_features, per_camera_uncertainties), fields(cameras = per_camera_features.len()))]
    pub fn localise(
        &mut self,
        per_camera_features: &[Vec<StereoFeature>],
        per_camera_uncertainties: &[f32],
        bias_x_mm: f32,
        bias_y_mm: f32,
    ) -> Result<Option<Pose>, NavError> {
        self.check_camera_count(per_camera_features.len(), "feature lists")?;
        self.check_camera_count(per_camera_uncertainties.len(), "uncertainties")?;
        if !(bias_x_mm.is_finite() && bias_y_mm.is_finite()) {
            return Err(NavError::invalid("bias must be finite"));
        }

        let bias = Pose::new(bias_x_mm, bias_y_mm, 0.0, 0.0, 0.0, 0.0);
        let centres: Vec<Pose> = self.current.iter().map(|&p| p - bias).collect();

        let mut cameras = Vec::new();
        for (camera, (features, &sigma)) in per_camera_features.iter().zip(per_camera_uncertainties).enumerate() {
            if features.is_empty() {
                continue;
            }
            let sigma = if sigma.is_finite() && sigma > 0.0 {
                sigma
            } else {
                self.config.sampling.disparity_sigma_px
            };
            let batch = self.config.geometry.rays(camera, &Pose::identity(), features, sigma)?;
            if !batch.rays.is_empty() {
                cameras.push(CameraRays {
                    centre: centres[camera],
                    rays: batch.rays,
                });
            }
        }
        let Some(reference) = cameras.first().map(|c| c.centre) else {
            debug!("no usable features");
            return Ok(None);
        };

        self.buffer.move_to(&reference);
        let evidence = self.buffer.evidence_at(&reference);
        if evidence < self.config.sampling.min_evidence_cells {
            debug!(evidence, "too little mapped evidence");
            return Ok(None);
        }

        let samples = create_moire_grid(
            &self.config.sampling.envelope(),
            self.config.sampling.sample_count,
            &reference,
            &mut self.rng,
        )?;
        let scores = self.score_samples(&samples, &reference, &cameras);

        let peak = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = scores.iter().sum::<f32>() / scores.len().max(1) as f32;
        if !(peak > 0.0) || (peak - mean) / peak < self.config.sampling.min_peak_contrast {
            debug!(peak, mean, "score field too flat");
            return Ok(None);
        }

        let best = find_best_pose(&samples, &scores, self.config.sampling.radius_major_mm)?;
        let offset = best - reference;
        for (pose, centre) in self.current.iter_mut().zip(&centres) {
            *pose = *centre + offset;
        }
        info!(
            dx = offset.x,
            dy = offset.y,
            dpan = offset.pan,
            peak,
            "localised"
        );
        Ok(Some(offset))
    }

    /// Score every sample: the sum over cameras of the match score of that
    /// camera's rays at its own centre shifted by the sample's offset.
    fn score_samples(&self, samples: &[Pose], reference: &Pose, cameras: &[CameraRays]) -> Vec<f32> {
        let buffer = &self.buffer;
        let score = |sample: &Pose| -> f32 {
            let offset = *sample - *reference;
            cameras
                .iter()
                .map(|cam| buffer.localise_at_position(&(cam.centre + offset), &cam.rays))
                .sum()
        };
        let run = || samples.par_iter().map(score).collect::<Vec<f32>>();
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }

    fn check_camera_count(&self, len: usize, what: &str) -> Result<(), NavError> {
        if len != self.current.len() {
            return Err(NavError::invalid(format!(
                "expected {} {what}, got {len}",
                self.current.len()
            )));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
