//! Synthetic corridor world.
//!
//! A seeded field of coloured point landmarks lining a straight corridor
//! along +y. The robot drives down the cleared centre strip; its cameras see
//! the landmarks on either side with exact disparities, which makes the
//! world useful for recording paths and checking that localisation recovers
//! an injected pose bias.

use chrono::Utc;
use rand::Rng;
use rand::seq::index;
use stereonav_memory::PathWriter;
use stereonav_perception::RobotGeometry;
use stereonav_types::{NavError, OdometryRecord, Point3, Pose, StereoFeature};
use tracing::debug;

/// Landmarks nearer than this (disparity below it) are not reported.
pub const MIN_DISPARITY_PX: f32 = 15.0;

/// Shape and density of a [`SyntheticCorridor`].
#[derive(Debug, Clone, PartialEq)]
pub struct CorridorParams {
    pub landmarks: usize,
    /// Landmarks lie within `|x| <= half_width_mm`...
    pub half_width_mm: f32,
    /// ...but outside the free strip `|x| < clear_half_width_mm`.
    pub clear_half_width_mm: f32,
    pub start_y_mm: f32,
    pub end_y_mm: f32,
    pub min_z_mm: f32,
    pub max_z_mm: f32,
}

impl Default for CorridorParams {
    fn default() -> Self {
        Self {
            landmarks: 4000,
            half_width_mm: 1500.0,
            clear_half_width_mm: 400.0,
            start_y_mm: -500.0,
            end_y_mm: 15_000.0,
            min_z_mm: 50.0,
            max_z_mm: 1950.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    pub position: Point3,
    pub colour: [u8; 3],
}

#[derive(Debug, Clone)]
pub struct SyntheticCorridor {
    landmarks: Vec<Landmark>,
}

impl SyntheticCorridor {
    pub fn generate<R: Rng + ?Sized>(params: &CorridorParams, rng: &mut R) -> Result<Self, NavError> {
        if !(params.clear_half_width_mm >= 0.0 && params.clear_half_width_mm < params.half_width_mm) {
            return Err(NavError::invalid("corridor clear strip must be narrower than the corridor"));
        }
        if !(params.start_y_mm < params.end_y_mm && params.min_z_mm < params.max_z_mm) {
            return Err(NavError::invalid("corridor extents are empty"));
        }
        let landmarks = (0..params.landmarks)
            .map(|_| {
                let side = if rng.random_bool(0.5) { 1.0 } else { -1.0 };
                let x = side * rng.random_range(params.clear_half_width_mm..=params.half_width_mm);
                Landmark {
                    position: Point3::new(
                        x,
                        rng.random_range(params.start_y_mm..=params.end_y_mm),
                        rng.random_range(params.min_z_mm..=params.max_z_mm),
                    ),
                    colour: [rng.random(), rng.random(), rng.random()],
                }
            })
            .collect();
        Ok(Self { landmarks })
    }

    pub fn landmarks(&self) -> &[Landmark] {
        &self.landmarks
    }

    /// Features camera `camera` sees from body pose `body` with the head
    /// centred, at most `max_features` of them chosen at random.
    pub fn observe<R: Rng + ?Sized>(
        &self,
        geometry: &RobotGeometry,
        camera: usize,
        body: &Pose,
        max_features: usize,
        rng: &mut R,
    ) -> Result<Vec<StereoFeature>, NavError> {
        let head = Pose::identity();
        let mut visible = Vec::new();
        for lm in &self.landmarks {
            let local = body.inverse_transform_point(lm.position);
            if let Some(f) = geometry.project(camera, &head, local)?
                && f.disparity >= MIN_DISPARITY_PX
            {
                visible.push(f.with_colour(lm.colour));
            }
        }
        if visible.len() <= max_features {
            return Ok(visible);
        }
        let mut picked: Vec<usize> = index::sample(rng, visible.len(), max_features).into_vec();
        picked.sort_unstable();
        Ok(picked.into_iter().map(|i| visible[i]).collect())
    }

    /// Drive `path`, observing up to `features_per_step` landmarks with
    /// camera 0 at every pose, and append each step to `writer`.
    pub fn record_path<R: Rng + ?Sized>(
        &self,
        geometry: &RobotGeometry,
        path: &[Pose],
        features_per_step: usize,
        writer: &mut PathWriter,
        rng: &mut R,
    ) -> Result<usize, NavError> {
        let start = Utc::now().timestamp_millis();
        for (step, pose) in path.iter().enumerate() {
            let features = self.observe(geometry, 0, pose, features_per_step, rng)?;
            debug!(step, features = features.len(), "synthetic step");
            writer.append(&OdometryRecord {
                timestamp: start + step as i64 * 100,
                x: pose.x,
                y: pose.y,
                orientation: pose.pan,
                head_pan: 0.0,
                head_tilt: 0.0,
                head_roll: 0.0,
                camera_index: 0,
                features,
            })?;
        }
        Ok(path.len())
    }
}

/// Poses every `step_mm` along +y from the origin, `length_mm` long.
pub fn straight_path(length_mm: f32, step_mm: f32) -> Result<Vec<Pose>, NavError> {
    if !(length_mm.is_finite() && length_mm >= 0.0 && step_mm.is_finite() && step_mm > 0.0) {
        return Err(NavError::invalid("path length must be >= 0 and step > 0"));
    }
    let steps = (length_mm / step_mm).floor() as usize;
    Ok((0..=steps).map(|k| Pose::planar(0.0, k as f32 * step_mm, 0.0)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn landmarks_stay_out_of_the_driving_strip() {
        let mut rng = StdRng::seed_from_u64(1);
        let params = CorridorParams::default();
        let world = SyntheticCorridor::generate(&params, &mut rng).unwrap();
        assert_eq!(world.landmarks().len(), 4000);
        for lm in world.landmarks() {
            let p = lm.position;
            assert!(p.x.abs() >= 400.0 && p.x.abs() <= 1500.0);
            assert!((-500.0..=15_000.0).contains(&p.y));
            assert!((50.0..=1950.0).contains(&p.z));
        }
    }

    #[test]
    fn observations_are_capped_and_reproject() {
        let mut rng = StdRng::seed_from_u64(2);
        let world = SyntheticCorridor::generate(&CorridorParams::default(), &mut rng).unwrap();
        let geometry = RobotGeometry::default();
        let body = Pose::planar(0.0, 2000.0, 0.0);

        let all = world.observe(&geometry, 0, &body, usize::MAX, &mut rng).unwrap();
        assert!(all.len() > 300, "only {} landmarks visible", all.len());
        assert!(all.iter().all(|f| f.disparity >= MIN_DISPARITY_PX && f.colour.is_some()));

        let some = world.observe(&geometry, 0, &body, 50, &mut rng).unwrap();
        assert_eq!(some.len(), 50);
    }

    #[test]
    fn straight_path_steps() {
        let path = straight_path(1000.0, 100.0).unwrap();
        assert_eq!(path.len(), 11);
        assert_eq!(path[10], Pose::planar(0.0, 1000.0, 0.0));
        assert!(straight_path(1000.0, 0.0).is_err());
    }

    #[test]
    fn bad_corridor_is_rejected() {
        let mut rng = StdRng::seed_from_u64(3);
        let params = CorridorParams {
            clear_half_width_mm: 2000.0,
            ..CorridorParams::default()
        };
        assert!(SyntheticCorridor::generate(&params, &mut rng).is_err());
    }
}
