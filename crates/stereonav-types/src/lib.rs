//! `stereonav-types` – shared value types for the localisation core.
//!
//! Everything in here is plain data: points, rigid-body poses, stereo
//! features and the rays they become once a camera model has been applied,
//! the odometry record persisted in path logs, and the crate-spanning
//! [`NavError`].
//!
//! # Frame conventions
//!
//! All distances are millimetres, all angles radians.
//!
//! | axis | meaning |
//! |------|---------|
//! | +x   | to the right of the robot at pan 0 |
//! | +y   | forward at pan 0                   |
//! | +z   | up                                 |
//!
//! Positive pan turns the forward axis toward +x (clockwise seen from above),
//! positive tilt raises it, roll turns about it.

use std::f32::consts::{PI, TAU};
use std::ops::{Add, Sub};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Point3
// ────────────────────────────────────────────────────────────────────────────

/// A point (or displacement) in 3-D space, millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn scale(self, k: f32) -> Self {
        Self::new(self.x * k, self.y * k, self.z * k)
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance(self, other: Self) -> f32 {
        self.sub(other).length()
    }

    /// Distance ignoring the vertical component.
    pub fn planar_distance(self, other: Self) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// Wrap an angle into `(-π, π]`.
pub fn wrap_angle(a: f32) -> f32 {
    if !a.is_finite() {
        return a;
    }
    let mut w = (a + PI).rem_euclid(TAU) - PI;
    if w <= -PI {
        w += TAU;
    }
    w
}

/// A rigid-body pose: position in millimetres, orientation as pan/tilt/roll.
///
/// `Add`/`Sub` operate component-wise (angles wrapped), which is how pose
/// *offsets* are applied and recovered. Use [`Pose::compose`] to chain a
/// child pose expressed in this pose's frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub pan: f32,
    pub tilt: f32,
    pub roll: f32,
}

impl Pose {
    pub fn new(x: f32, y: f32, z: f32, pan: f32, tilt: f32, roll: f32) -> Self {
        Self { x, y, z, pan, tilt, roll }
    }

    /// A planar pose: position on the ground plane plus heading.
    pub fn planar(x: f32, y: f32, pan: f32) -> Self {
        Self::new(x, y, 0.0, pan, 0.0, 0.0)
    }

    pub fn identity() -> Self {
        Self::default()
    }

    pub fn position(&self) -> Point3 {
        Point3::new(self.x, self.y, self.z)
    }

    pub fn planar_distance(&self, other: &Pose) -> f32 {
        self.position().planar_distance(other.position())
    }

    pub fn is_finite(&self) -> bool {
        self.position().is_finite()
            && self.pan.is_finite()
            && self.tilt.is_finite()
            && self.roll.is_finite()
    }

    /// Rotate a vector from this pose's frame into the parent frame
    /// (roll, then tilt, then pan).
    pub fn rotate_point(&self, p: Point3) -> Point3 {
        let p = rotate_roll(p, self.roll);
        let p = rotate_tilt(p, self.tilt);
        rotate_pan(p, self.pan)
    }

    /// Inverse of [`rotate_point`][Self::rotate_point].
    pub fn inverse_rotate_point(&self, p: Point3) -> Point3 {
        let p = rotate_pan(p, -self.pan);
        let p = rotate_tilt(p, -self.tilt);
        rotate_roll(p, -self.roll)
    }

    /// Map a point expressed in this pose's frame into the parent frame.
    pub fn transform_point(&self, local: Point3) -> Point3 {
        self.rotate_point(local).add(self.position())
    }

    /// Map a point expressed in the parent frame into this pose's frame.
    pub fn inverse_transform_point(&self, world: Point3) -> Point3 {
        self.inverse_rotate_point(world.sub(self.position()))
    }

    /// Chain `child` (expressed in this pose's frame) onto this pose.
    ///
    /// Orientation angles add, which is exact for pan-only chains and a small
    /// angle approximation otherwise.
    pub fn compose(&self, child: &Pose) -> Pose {
        let p = self.transform_point(child.position());
        Pose::new(
            p.x,
            p.y,
            p.z,
            wrap_angle(self.pan + child.pan),
            wrap_angle(self.tilt + child.tilt),
            wrap_angle(self.roll + child.roll),
        )
    }

    /// Rotate this pose's position about the parent origin by `pan` and add
    /// `pan` to its heading.
    pub fn rotate(&self, pan: f32) -> Pose {
        let p = rotate_pan(self.position(), pan);
        Pose::new(p.x, p.y, p.z, wrap_angle(self.pan + pan), self.tilt, self.roll)
    }
}

impl Add for Pose {
    type Output = Pose;

    fn add(self, rhs: Pose) -> Pose {
        Pose::new(
            self.x + rhs.x,
            self.y + rhs.y,
            self.z + rhs.z,
            wrap_angle(self.pan + rhs.pan),
            wrap_angle(self.tilt + rhs.tilt),
            wrap_angle(self.roll + rhs.roll),
        )
    }
}

impl Sub for Pose {
    type Output = Pose;

    fn sub(self, rhs: Pose) -> Pose {
        Pose::new(
            self.x - rhs.x,
            self.y - rhs.y,
            self.z - rhs.z,
            wrap_angle(self.pan - rhs.pan),
            wrap_angle(self.tilt - rhs.tilt),
            wrap_angle(self.roll - rhs.roll),
        )
    }
}

fn rotate_pan(p: Point3, a: f32) -> Point3 {
    let (s, c) = a.sin_cos();
    Point3::new(p.x * c + p.y * s, -p.x * s + p.y * c, p.z)
}

fn rotate_tilt(p: Point3, a: f32) -> Point3 {
    let (s, c) = a.sin_cos();
    Point3::new(p.x, p.y * c - p.z * s, p.y * s + p.z * c)
}

fn rotate_roll(p: Point3, a: f32) -> Point3 {
    let (s, c) = a.sin_cos();
    Point3::new(p.x * c + p.z * s, p.y, -p.x * s + p.z * c)
}

/// A candidate pose together with its match score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSample {
    pub pose: Pose,
    pub score: f32,
}

// ────────────────────────────────────────────────────────────────────────────
// Stereo observations
// ────────────────────────────────────────────────────────────────────────────

/// One rectified stereo correspondence as produced by the external matcher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StereoFeature {
    /// Column in the rectified left image (pixels).
    pub x: f32,
    /// Row in the rectified left image (pixels).
    pub y: f32,
    /// Horizontal disparity (pixels).
    pub disparity: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colour: Option<[u8; 3]>,
}

impl StereoFeature {
    pub fn new(x: f32, y: f32, disparity: f32) -> Self {
        Self { x, y, disparity, colour: None }
    }

    pub fn with_colour(mut self, colour: [u8; 3]) -> Self {
        self.colour = Some(colour);
        self
    }
}

/// A stereo feature converted into a ray in the robot body frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoRay {
    /// Optical centre of the observing camera.
    pub origin: Point3,
    /// Most probable occupied point along the ray.
    pub end: Point3,
    /// One-sigma range uncertainty along the ray (mm).
    pub sigma_mm: f32,
    pub colour: Option<[u8; 3]>,
}

impl StereoRay {
    pub fn length(&self) -> f32 {
        self.end.distance(self.origin)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Odometry log
// ────────────────────────────────────────────────────────────────────────────

/// One entry of the append-only path log.
#[derive(Debug, Clone, PartialEq)]
pub struct OdometryRecord {
    /// Unix time of capture, milliseconds.
    pub timestamp: i64,
    pub x: f32,
    pub y: f32,
    /// Body heading (pan) in radians.
    pub orientation: f32,
    pub head_pan: f32,
    pub head_tilt: f32,
    pub head_roll: f32,
    pub camera_index: i32,
    pub features: Vec<StereoFeature>,
}

impl OdometryRecord {
    /// Pose of the robot body on the ground plane.
    pub fn body_pose(&self) -> Pose {
        Pose::planar(self.x, self.y, self.orientation)
    }

    /// Orientation of the sensor head relative to the body.
    pub fn head_pose(&self) -> Pose {
        Pose::new(0.0, 0.0, 0.0, self.head_pan, self.head_tilt, self.head_roll)
    }

    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error type shared by every stereonav crate.
///
/// A failed localisation is *not* an error; it is reported as `Ok(None)` by
/// the caller-facing API.
#[derive(Error, Debug)]
pub enum NavError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed path log: {0}")]
    MalformedLog(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl NavError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        NavError::InvalidArgument(msg.into())
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        NavError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
