//! Robot body and stereo camera geometry.
//!
//! Describes where each stereo camera sits on the robot and how its
//! rectified `(x, y, disparity)` features map into rays in the body frame.
//! Cameras are mounted on a pan/tilt/roll head that pivots about
//! `(centre_of_rotation_x, centre_of_rotation_y, head_centre_z)`.
//!
//! # Camera frame
//!
//! Like the body frame: +y along the optical axis, +x to the right, +z up.
//! Pixel rows grow downward, so image `y` maps to −z.
//!
//! # Example
//!
//! ```rust
//! use stereonav_perception::geometry::RobotGeometry;
//! use stereonav_types::{Point3, Pose};
//!
//! let geometry = RobotGeometry::default();
//! let head = Pose::identity();
//!
//! // A point 2 m ahead at camera height projects to the image centre.
//! let cam = geometry.camera_pose(0, &head).unwrap();
//! let target = Point3::new(cam.x, cam.y + 2000.0, cam.z);
//! let feature = geometry.project(0, &head, target).unwrap().unwrap();
//!
//! let batch = geometry.rays(0, &head, &[feature], 0.5).unwrap();
//! assert!((batch.rays[0].end.y - target.y).abs() < 1.0);
//! ```

use serde::{Deserialize, Serialize};
use stereonav_types::{NavError, Point3, Pose, StereoFeature, StereoRay};

/// Disparity noise assumed when the caller does not supply one (pixels).
pub const DEFAULT_DISPARITY_SIGMA_PX: f32 = 0.5;

/// Features closer than this to the camera plane are not projectable (mm).
const MIN_PROJECTION_DEPTH_MM: f32 = 1.0;

// ────────────────────────────────────────────────────────────────────────────
// StereoCameraGeometry
// ────────────────────────────────────────────────────────────────────────────

/// Calibration and mount pose of one rectified stereo pair.
///
/// Mount position is in millimetres in the body frame; mount angles are
/// radians relative to the sensor head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoCameraGeometry {
    pub baseline_mm: f32,
    pub image_width: u32,
    pub image_height: u32,
    /// Horizontal field of view (degrees).
    pub fov_degrees: f32,
    pub mount_x_mm: f32,
    pub mount_y_mm: f32,
    pub mount_z_mm: f32,
    #[serde(default)]
    pub mount_pan: f32,
    #[serde(default)]
    pub mount_tilt: f32,
    #[serde(default)]
    pub mount_roll: f32,
}

impl Default for StereoCameraGeometry {
    fn default() -> Self {
        Self {
            baseline_mm: 120.0,
            image_width: 640,
            image_height: 480,
            fov_degrees: 60.0,
            mount_x_mm: 0.0,
            mount_y_mm: 0.0,
            mount_z_mm: 800.0,
            mount_pan: 0.0,
            mount_tilt: 0.0,
            mount_roll: 0.0,
        }
    }
}

/// Rays derived from one camera's feature list, plus how many features were
/// rejected as degenerate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RayBatch {
    pub rays: Vec<StereoRay>,
    pub dropped: usize,
}

impl StereoCameraGeometry {
    /// Focal length in pixels derived from the horizontal field of view.
    pub fn focal_length_px(&self) -> f32 {
        let half_fov = (self.fov_degrees * 0.5).to_radians();
        (self.image_width as f32 * 0.5) / half_fov.tan()
    }

    pub fn principal_point(&self) -> (f32, f32) {
        (self.image_width as f32 * 0.5, self.image_height as f32 * 0.5)
    }

    pub fn mount_position(&self) -> Point3 {
        Point3::new(self.mount_x_mm, self.mount_y_mm, self.mount_z_mm)
    }

    pub fn validate(&self) -> Result<(), NavError> {
        if !(self.baseline_mm.is_finite() && self.baseline_mm > 0.0) {
            return Err(NavError::invalid("camera baseline must be positive"));
        }
        if self.image_width == 0 || self.image_height == 0 {
            return Err(NavError::invalid("camera image size must be non-zero"));
        }
        if !(self.fov_degrees.is_finite() && self.fov_degrees > 0.0 && self.fov_degrees < 180.0) {
            return Err(NavError::invalid("camera field of view must be in (0, 180) degrees"));
        }
        let mount = Pose::new(
            self.mount_x_mm,
            self.mount_y_mm,
            self.mount_z_mm,
            self.mount_pan,
            self.mount_tilt,
            self.mount_roll,
        );
        if !mount.is_finite() {
            return Err(NavError::invalid("camera mount pose must be finite"));
        }
        Ok(())
    }

    /// Convert features into rays, given the camera's pose in the body frame.
    pub fn rays_from_features(
        &self,
        camera_pose: &Pose,
        features: &[StereoFeature],
        disparity_sigma_px: f32,
    ) -> RayBatch {
        let sigma_px = if disparity_sigma_px.is_finite() && disparity_sigma_px > 0.0 {
            disparity_sigma_px
        } else {
            DEFAULT_DISPARITY_SIGMA_PX
        };
        let f = self.focal_length_px();
        let (cx, cy) = self.principal_point();
        let fb = f * self.baseline_mm;
        let origin = camera_pose.position();

        let mut batch = RayBatch {
            rays: Vec::with_capacity(features.len()),
            dropped: 0,
        };
        for feat in features {
            if !self.is_valid_feature(feat) {
                batch.dropped += 1;
                continue;
            }
            let depth = fb / feat.disparity;
            let local = Point3::new((feat.x - cx) * depth / f, depth, (cy - feat.y) * depth / f);
            let end = camera_pose.transform_point(local);
            let range = local.length();
            let sigma_depth = depth * depth * sigma_px / fb;
            batch.rays.push(StereoRay {
                origin,
                end,
                sigma_mm: sigma_depth * range / depth,
                colour: feat.colour,
            });
        }
        batch
    }

    /// Project a body-frame point into this camera. Returns `None` when the
    /// point is behind the camera or falls outside the image.
    pub fn project(&self, camera_pose: &Pose, body_point: Point3) -> Option<StereoFeature> {
        let local = camera_pose.inverse_transform_point(body_point);
        if !local.is_finite() || local.y < MIN_PROJECTION_DEPTH_MM {
            return None;
        }
        let f = self.focal_length_px();
        let (cx, cy) = self.principal_point();
        let feature = StereoFeature::new(
            cx + f * local.x / local.y,
            cy - f * local.z / local.y,
            f * self.baseline_mm / local.y,
        );
        self.is_valid_feature(&feature).then_some(feature)
    }

    fn is_valid_feature(&self, feat: &StereoFeature) -> bool {
        feat.x.is_finite()
            && feat.y.is_finite()
            && feat.disparity.is_finite()
            && feat.disparity > 0.0
            && feat.x >= 0.0
            && feat.y >= 0.0
            && feat.x < self.image_width as f32
            && feat.y < self.image_height as f32
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RobotGeometry
// ────────────────────────────────────────────────────────────────────────────

/// Static description of the robot body and its stereo cameras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotGeometry {
    #[serde(default = "default_name")]
    pub name: String,
    pub body_width_mm: f32,
    pub body_length_mm: f32,
    pub body_height_mm: f32,
    #[serde(default)]
    pub centre_of_rotation_x_mm: f32,
    #[serde(default)]
    pub centre_of_rotation_y_mm: f32,
    #[serde(default)]
    pub centre_of_rotation_z_mm: f32,
    /// Height of the pan/tilt head pivot above the ground plane.
    pub head_centre_z_mm: f32,
    pub cameras: Vec<StereoCameraGeometry>,
}

fn default_name() -> String {
    "robot".to_string()
}

impl Default for RobotGeometry {
    fn default() -> Self {
        Self {
            name: default_name(),
            body_width_mm: 450.0,
            body_length_mm: 500.0,
            body_height_mm: 900.0,
            centre_of_rotation_x_mm: 0.0,
            centre_of_rotation_y_mm: 0.0,
            centre_of_rotation_z_mm: 0.0,
            head_centre_z_mm: 800.0,
            cameras: vec![StereoCameraGeometry::default()],
        }
    }
}

impl RobotGeometry {
    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn camera(&self, index: usize) -> Result<&StereoCameraGeometry, NavError> {
        self.cameras.get(index).ok_or_else(|| {
            NavError::invalid(format!(
                "camera index {index} out of range ({} cameras)",
                self.cameras.len()
            ))
        })
    }

    /// Replace the calibration of an existing camera.
    pub fn set_camera(&mut self, index: usize, camera: StereoCameraGeometry) -> Result<(), NavError> {
        camera.validate()?;
        let count = self.cameras.len();
        let slot = self.cameras.get_mut(index).ok_or_else(|| {
            NavError::invalid(format!("camera index {index} out of range ({count} cameras)"))
        })?;
        *slot = camera;
        Ok(())
    }

    pub fn set_body_dimensions(&mut self, width_mm: f32, length_mm: f32, height_mm: f32) {
        self.body_width_mm = width_mm;
        self.body_length_mm = length_mm;
        self.body_height_mm = height_mm;
    }

    pub fn validate(&self) -> Result<(), NavError> {
        for (label, v) in [
            ("body width", self.body_width_mm),
            ("body length", self.body_length_mm),
            ("body height", self.body_height_mm),
        ] {
            if !(v.is_finite() && v > 0.0) {
                return Err(NavError::invalid(format!("{label} must be positive")));
            }
        }
        if self.cameras.is_empty() {
            return Err(NavError::invalid("robot geometry needs at least one camera"));
        }
        self.cameras.iter().try_for_each(StereoCameraGeometry::validate)
    }

    /// Pose of camera `index` in the body frame for a given head orientation.
    pub fn camera_pose(&self, index: usize, head: &Pose) -> Result<Pose, NavError> {
        let cam = self.camera(index)?;
        let pivot = Point3::new(
            self.centre_of_rotation_x_mm,
            self.centre_of_rotation_y_mm,
            self.head_centre_z_mm,
        );
        let head_frame = Pose::new(pivot.x, pivot.y, pivot.z, head.pan, head.tilt, head.roll);
        let offset = cam.mount_position().sub(pivot);
        let mount = Pose::new(
            offset.x,
            offset.y,
            offset.z,
            cam.mount_pan,
            cam.mount_tilt,
            cam.mount_roll,
        );
        Ok(head_frame.compose(&mount))
    }

    /// Body-frame rays for camera `index`'s features.
    pub fn rays(
        &self,
        index: usize,
        head: &Pose,
        features: &[StereoFeature],
        disparity_sigma_px: f32,
    ) -> Result<RayBatch, NavError> {
        let pose = self.camera_pose(index, head)?;
        let batch = self.cameras[index].rays_from_features(&pose, features, disparity_sigma_px);
        if batch.dropped > 0 {
            tracing::debug!(camera = index, dropped = batch.dropped, "degenerate stereo features dropped");
        }
        Ok(batch)
    }

    /// Project a body-frame point into camera `index`.
    pub fn project(
        &self,
        index: usize,
        head: &Pose,
        body_point: Point3,
    ) -> Result<Option<StereoFeature>, NavError> {
        let pose = self.camera_pose(index, head)?;
        Ok(self.cameras[index].project(&pose, body_point))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
