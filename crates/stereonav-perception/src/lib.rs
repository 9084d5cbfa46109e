//! `stereonav-perception` – from stereo features to pose estimates.
//!
//! # Modules
//!
//! - [`geometry`] – [`RobotGeometry`][geometry::RobotGeometry]: body
//!   dimensions and per-camera mount/intrinsics; turns pixel + disparity
//!   features into body-frame [`StereoRay`][stereonav_types::StereoRay]s and
//!   projects body-frame points back into a camera.
//! - [`occupancy`] – [`OccupancyGridMultiHypothesis`][occupancy::OccupancyGridMultiHypothesis]:
//!   probabilistic voxel map that accumulates stereo-ray evidence and scores
//!   candidate poses against it.
//! - [`sampling`] – [`create_moire_grid`][sampling::create_moire_grid]:
//!   quasi-uniform candidate poses around a nominal pose.
//! - [`estimator`] – [`find_best_pose`][estimator::find_best_pose]:
//!   collapses a scored candidate set into one pose via a neighbour graph.

pub mod estimator;
pub mod geometry;
pub mod occupancy;
pub mod sampling;

pub use estimator::find_best_pose;
pub use geometry::{RayBatch, RobotGeometry, StereoCameraGeometry};
pub use occupancy::{GridParams, GridType, Hypothesis, InsertStats, OccupancyGridMultiHypothesis};
pub use sampling::{SamplingEnvelope, create_moire_grid};
