//! Moiré candidate-pose sampler.
//!
//! Two square lattices are laid over the unit disc, the second offset by half
//! a pitch and rotated by a small fixed angle. Their union is radially warped
//! (`r → r^1.2`) so intersections crowd toward the centre, then stretched onto
//! the sampling ellipse whose major axis points along the nominal heading.
//! The result covers the ellipse quasi-uniformly without the clumps and holes
//! of independent random draws.

use rand::Rng;
use serde::{Deserialize, Serialize};
use stereonav_types::{NavError, Point3, Pose, wrap_angle};
use tracing::debug;

/// Rotation of the second lattice relative to the first (radians).
const MOIRE_ANGLE: f32 = 0.2;
/// Radial warp exponent; > 1 concentrates samples near the nominal pose.
const RADIAL_WARP: f32 = 1.2;
/// Accept an undershoot no larger than this fraction of the request.
const COUNT_TOLERANCE: f32 = 0.1;
const MAX_PITCH_ITERATIONS: usize = 24;
/// Low-discrepancy multipliers for the pan offset sequence.
const PAN_SEQUENCE: (f32, f32) = (0.618_034, 0.754_878);

/// Shape of the region candidate poses are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingEnvelope {
    /// Semi-axis along the nominal heading (mm).
    pub radius_major_mm: f32,
    /// Semi-axis across the nominal heading (mm).
    pub radius_minor_mm: f32,
    /// Bounds of the angular perturbations (radians).
    pub max_pan_var: f32,
    pub max_tilt_var: f32,
    pub max_roll_var: f32,
}

impl SamplingEnvelope {
    pub fn validate(&self) -> Result<(), NavError> {
        let radius_ok = |r: f32| r.is_finite() && r > 0.0;
        if !radius_ok(self.radius_major_mm) || !radius_ok(self.radius_minor_mm) {
            return Err(NavError::invalid(format!(
                "sampling radii must be positive, got major {} minor {}",
                self.radius_major_mm, self.radius_minor_mm
            )));
        }
        if self.radius_minor_mm > self.radius_major_mm {
            return Err(NavError::invalid("minor sampling radius exceeds the major radius"));
        }
        for (label, v) in [
            ("pan", self.max_pan_var),
            ("tilt", self.max_tilt_var),
            ("roll", self.max_roll_var),
        ] {
            if !(v.is_finite() && v >= 0.0) {
                return Err(NavError::invalid(format!("maximum {label} variance must be >= 0, got {v}")));
            }
        }
        Ok(())
    }
}

/// A lattice intersection inside the unit disc, before mapping to a pose.
#[derive(Debug, Clone, Copy)]
struct LatticePoint {
    u: f32,
    v: f32,
    i: i32,
    j: i32,
    layer: u8,
}

/// Generate about `count` candidate poses around `nominal`.
///
/// Overshoot is down-sampled by stride to exactly `count`; undershoot
/// tightens the pitch and retries. The result stays within ±10% of
/// `count`. `count == 0` yields an empty set.
///
/// The returned poses are absolute (nominal plus offset). Tilt and roll are
/// perturbed uniformly with `rng` only when their bound is non-zero, so the
/// output is a pure function of the arguments and the rng stream.
pub fn create_moire_grid<R: Rng + ?Sized>(
    envelope: &SamplingEnvelope,
    count: usize,
    nominal: &Pose,
    rng: &mut R,
) -> Result<Vec<Pose>, NavError> {
    envelope.validate()?;
    if count == 0 {
        return Ok(Vec::new());
    }

    let target = count as f32;
    let mut pitch = (2.0 * std::f32::consts::PI / target).sqrt();
    let mut best: Vec<LatticePoint> = Vec::new();
    let mut iterations = 0;

    for _ in 0..MAX_PITCH_ITERATIONS {
        iterations += 1;
        let points = moire_lattice(pitch);
        let n = points.len();
        if n >= count {
            best = stride_downsample(points, count);
            break;
        }
        let short = (count - n) as f32 > COUNT_TOLERANCE * target;
        if n > best.len() {
            best = points;
        }
        if !short {
            break;
        }
        pitch *= if n == 0 { 0.5 } else { (n as f32 / target).sqrt() * 0.97 };
    }

    debug!(requested = count, produced = best.len(), iterations, "moire grid");

    let heading = Pose::planar(0.0, 0.0, nominal.pan);
    let poses = best
        .into_iter()
        .map(|p| {
            let offset = heading.rotate_point(Point3::new(
                p.u * envelope.radius_minor_mm,
                p.v * envelope.radius_major_mm,
                0.0,
            ));
            let s = (p.i as f32 * PAN_SEQUENCE.0
                + p.j as f32 * PAN_SEQUENCE.1
                + p.layer as f32 * 0.5
                + 0.5)
                .rem_euclid(1.0);
            let pan = wrap_angle(nominal.pan + (2.0 * s - 1.0) * envelope.max_pan_var);
            Pose::new(
                nominal.x + offset.x,
                nominal.y + offset.y,
                nominal.z,
                pan,
                nominal.tilt + perturbation(rng, envelope.max_tilt_var),
                nominal.roll + perturbation(rng, envelope.max_roll_var),
            )
        })
        .collect();
    Ok(poses)
}

fn perturbation<R: Rng + ?Sized>(rng: &mut R, bound: f32) -> f32 {
    if bound > 0.0 {
        rng.random_range(-bound..=bound)
    } else {
        0.0
    }
}

/// Both lattice layers at the given pitch, warped, inside the unit disc.
fn moire_lattice(pitch: f32) -> Vec<LatticePoint> {
    let extent = (1.0 / pitch).ceil() as i32 + 1;
    let mut points = Vec::new();
    for layer in 0..2u8 {
        let (offset, (s, c)) = if layer == 0 {
            (0.0, (0.0_f32, 1.0_f32))
        } else {
            (0.5, MOIRE_ANGLE.sin_cos())
        };
        for j in -extent..=extent {
            for i in -extent..=extent {
                let a = (i as f32 + offset) * pitch;
                let b = (j as f32 + offset) * pitch;
                let (u, v) = (a * c - b * s, a * s + b * c);
                let r = (u * u + v * v).sqrt();
                if r > 1.0 {
                    continue;
                }
                let warp = if r > 0.0 { r.powf(RADIAL_WARP - 1.0) } else { 0.0 };
                points.push(LatticePoint {
                    u: u * warp,
                    v: v * warp,
                    i,
                    j,
                    layer,
                });
            }
        }
    }
    points
}

fn stride_downsample(points: Vec<LatticePoint>, count: usize) -> Vec<LatticePoint> {
    let n = points.len();
    if n == count {
        return points;
    }
    (0..count).map(|k| points[k * n / count]).collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn envelope() -> SamplingEnvelope {
        SamplingEnvelope {
            radius_major_mm: 100.0,
            radius_minor_mm: 80.0,
            max_pan_var: 5f32.to_radians(),
            max_tilt_var: 0.0,
            max_roll_var: 0.0,
        }
    }

    // ── Count ───────────────────────────────────────────────────────────────

    #[test]
    fn count_stays_within_tolerance() {
        let mut rng = StdRng::seed_from_u64(7);
        for count in [1usize, 2, 3, 5, 10, 37, 100, 400, 1000] {
            let poses = create_moire_grid(&envelope(), count, &Pose::identity(), &mut rng).unwrap();
            let diff = (poses.len() as f32 - count as f32).abs();
            assert!(
                diff <= 0.1 * count as f32,
                "requested {count}, got {}",
                poses.len()
            );
        }
    }

    #[test]
    fn count_tolerance_holds_for_other_radii() {
        let mut rng = StdRng::seed_from_u64(8);
        for (major, minor) in [(50.0, 50.0), (400.0, 300.0), (2000.0, 100.0)] {
            let env = SamplingEnvelope {
                radius_major_mm: major,
                radius_minor_mm: minor,
                ..envelope()
            };
            for count in [7usize, 64, 250] {
                let n = create_moire_grid(&env, count, &Pose::identity(), &mut rng).unwrap().len();
                assert!((n as f32 - count as f32).abs() <= 0.1 * count as f32);
            }
        }
    }

    #[test]
    fn zero_count_is_empty() {
        let mut rng = StdRng::seed_from_u64(1);
        let poses = create_moire_grid(&envelope(), 0, &Pose::identity(), &mut rng).unwrap();
        assert!(poses.is_empty());
    }

    // ── Shape ───────────────────────────────────────────────────────────────

    #[test]
    fn samples_stay_inside_envelope() {
        let mut rng = StdRng::seed_from_u64(3);
        let nominal = Pose::new(1000.0, -500.0, 0.0, 0.7, 0.0, 0.0);
        let env = envelope();
        let poses = create_moire_grid(&env, 400, &nominal, &mut rng).unwrap();
        for p in &poses {
            assert!(p.planar_distance(&nominal) <= env.radius_major_mm + 1e-3);
            assert!((p.pan - nominal.pan).abs() <= env.max_pan_var + 1e-6);
            assert_eq!(p.tilt, 0.0);
            assert_eq!(p.roll, 0.0);
        }
    }

    #[test]
    fn samples_are_denser_near_the_centre() {
        let mut rng = StdRng::seed_from_u64(4);
        let env = SamplingEnvelope {
            radius_minor_mm: 100.0,
            ..envelope()
        };
        let poses = create_moire_grid(&env, 1000, &Pose::identity(), &mut rng).unwrap();
        let inner = poses
            .iter()
            .filter(|p| p.planar_distance(&Pose::identity()) < 50.0)
            .count();
        // Uniform coverage would put a quarter of the samples inside r/2.
        assert!(inner as f32 > 0.25 * poses.len() as f32);
    }

    #[test]
    fn major_axis_follows_heading() {
        let mut rng = StdRng::seed_from_u64(5);
        let env = SamplingEnvelope {
            radius_major_mm: 400.0,
            radius_minor_mm: 50.0,
            ..envelope()
        };
        // Heading +x: spread along x must dominate.
        let nominal = Pose::planar(0.0, 0.0, std::f32::consts::FRAC_PI_2);
        let poses = create_moire_grid(&env, 200, &nominal, &mut rng).unwrap();
        let max_x = poses.iter().map(|p| p.x.abs()).fold(0.0, f32::max);
        let max_y = poses.iter().map(|p| p.y.abs()).fold(0.0, f32::max);
        assert!(max_x > 300.0);
        assert!(max_y <= 50.0 + 1e-3);
    }

    #[test]
    fn tilt_and_roll_perturbations_are_bounded() {
        let mut rng = StdRng::seed_from_u64(6);
        let env = SamplingEnvelope {
            max_tilt_var: 0.05,
            max_roll_var: 0.02,
            ..envelope()
        };
        let poses = create_moire_grid(&env, 100, &Pose::identity(), &mut rng).unwrap();
        assert!(poses.iter().all(|p| p.tilt.abs() <= 0.05 && p.roll.abs() <= 0.02));
        assert!(poses.iter().any(|p| p.tilt != 0.0));
    }

    #[test]
    fn same_seed_gives_same_samples() {
        let env = SamplingEnvelope {
            max_tilt_var: 0.05,
            ..envelope()
        };
        let a = create_moire_grid(&env, 50, &Pose::identity(), &mut StdRng::seed_from_u64(11)).unwrap();
        let b = create_moire_grid(&env, 50, &Pose::identity(), &mut StdRng::seed_from_u64(11)).unwrap();
        assert_eq!(a, b);
    }

    // ── Errors ──────────────────────────────────────────────────────────────

    #[test]
    fn invalid_envelopes_are_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let bad = [
            SamplingEnvelope { radius_major_mm: 0.0, ..envelope() },
            SamplingEnvelope { radius_minor_mm: -1.0, ..envelope() },
            SamplingEnvelope { radius_major_mm: f32::NAN, ..envelope() },
            SamplingEnvelope { radius_minor_mm: 200.0, ..envelope() },
            SamplingEnvelope { max_pan_var: -0.1, ..envelope() },
        ];
        for env in bad {
            assert!(matches!(
                create_moire_grid(&env, 10, &Pose::identity(), &mut rng),
                Err(NavError::InvalidArgument(_))
            ));
        }
    }
}
