//! Best-pose estimation over a scored candidate set.
//!
//! Candidates are linked into a k-nearest-neighbour graph in
//! `(x, y, scaled pan)` space, where pan is converted to millimetre-equivalent
//! units by `radius_major_mm / max_orientation_variance`. Each node's score is
//! smoothed with its neighbours (weights ∝ 1 / edge length), the best
//! smoothed node becomes the anchor, and the result is the score-weighted
//! centroid of the anchor and its neighbours.
//!
//! Samples are first put into a canonical order so the result does not
//! depend on the order the caller supplied them in.

use std::cmp::Ordering;

use stereonav_types::{NavError, Pose, wrap_angle};

/// Neighbours per node (more when several tie at the k-th distance).
const NEIGHBOURS: usize = 6;
/// Edges shorter than this are treated as this long.
const MIN_EDGE_MM: f32 = 1e-3;
/// Weight of the neighbour mean relative to a node's own score.
const NEIGHBOUR_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone, Copy)]
struct Node {
    pose: Pose,
    score: f32,
    /// Pan relative to the reference pan, wrapped.
    rel_pan: f32,
}

/// Collapse `poses` scored by `scores` into one best estimate.
///
/// `max_orientation_variance` is half the pan extent of the sample set; when
/// every sample has the same pan the pan axis is ignored for neighbour
/// search.
///
/// ```rust
/// use stereonav_perception::find_best_pose;
/// use stereonav_types::Pose;
///
/// let poses = [
///     Pose::planar(0.0, 0.0, 0.0),
///     Pose::planar(10.0, 0.0, 0.0),
///     Pose::planar(20.0, 0.0, 0.0),
/// ];
/// let best = find_best_pose(&poses, &[0.1, 1.0, 0.1], 100.0).unwrap();
/// assert!((best.x - 10.0).abs() < 1e-4);
/// ```
pub fn find_best_pose(poses: &[Pose], scores: &[f32], radius_major_mm: f32) -> Result<Pose, NavError> {
    if poses.is_empty() {
        return Err(NavError::invalid("no candidate poses"));
    }
    if poses.len() != scores.len() {
        return Err(NavError::invalid(format!(
            "{} poses but {} scores",
            poses.len(),
            scores.len()
        )));
    }
    if !(radius_major_mm.is_finite() && radius_major_mm > 0.0) {
        return Err(NavError::invalid(format!(
            "sampling radius must be positive, got {radius_major_mm}"
        )));
    }
    if let Some(i) = scores.iter().position(|s| !s.is_finite()) {
        return Err(NavError::invalid(format!("score {i} is not finite")));
    }
    if let Some(i) = poses.iter().position(|p| !p.is_finite()) {
        return Err(NavError::invalid(format!("pose {i} is not finite")));
    }

    let nodes = canonical_nodes(poses, scores);
    let (min_rel, max_rel) = nodes
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), n| (lo.min(n.rel_pan), hi.max(n.rel_pan)));
    let max_orientation_variance = (max_rel - min_rel) * 0.5;
    let pan_scale = if max_orientation_variance > 1e-6 {
        radius_major_mm / max_orientation_variance
    } else {
        0.0
    };

    let neighbours = neighbour_graph(&nodes, pan_scale);
    let effective: Vec<f32> = nodes
        .iter()
        .zip(&neighbours)
        .map(|(node, edges)| {
            if edges.is_empty() {
                return node.score;
            }
            let (weighted, total) = edges.iter().fold((0.0, 0.0), |(acc, w), &(d, j)| {
                let inv = 1.0 / d.max(MIN_EDGE_MM);
                (acc + nodes[j].score * inv, w + inv)
            });
            node.score + NEIGHBOUR_WEIGHT * weighted / total
        })
        .collect();

    // First maximum in canonical order.
    let anchor = effective
        .iter()
        .enumerate()
        .fold(0, |best, (i, &e)| if e > effective[best] { i } else { best });

    let members: Vec<usize> = std::iter::once(anchor)
        .chain(neighbours[anchor].iter().map(|&(_, j)| j))
        .collect();
    Ok(weighted_centroid(&nodes, &members, nodes[0].pose.pan))
}

fn canonical_nodes(poses: &[Pose], scores: &[f32]) -> Vec<Node> {
    let mut order: Vec<usize> = (0..poses.len()).collect();
    order.sort_by(|&a, &b| compare_samples(&poses[a], scores[a], &poses[b], scores[b]));
    let reference = poses[order[0]].pan;
    order
        .into_iter()
        .map(|i| Node {
            pose: poses[i],
            score: scores[i],
            rel_pan: wrap_angle(poses[i].pan - reference),
        })
        .collect()
}

fn compare_samples(a: &Pose, sa: f32, b: &Pose, sb: f32) -> Ordering {
    a.x.total_cmp(&b.x)
        .then(a.y.total_cmp(&b.y))
        .then(a.pan.total_cmp(&b.pan))
        .then(a.z.total_cmp(&b.z))
        .then(a.tilt.total_cmp(&b.tilt))
        .then(a.roll.total_cmp(&b.roll))
        .then(sa.total_cmp(&sb))
}

/// For each node, `(distance, index)` of its nearest neighbours sorted by
/// distance then index; ties at the k-th distance are all kept.
fn neighbour_graph(nodes: &[Node], pan_scale: f32) -> Vec<Vec<(f32, usize)>> {
    let n = nodes.len();
    let k = NEIGHBOURS.min(n - 1);
    let coords: Vec<[f32; 3]> = nodes
        .iter()
        .map(|node| [node.pose.x, node.pose.y, node.rel_pan * pan_scale])
        .collect();

    (0..n)
        .map(|i| {
            if k == 0 {
                return Vec::new();
            }
            let mut dists: Vec<(f32, usize)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| {
                    let [dx, dy, dp] = [0, 1, 2].map(|a| coords[i][a] - coords[j][a]);
                    ((dx * dx + dy * dy + dp * dp).sqrt(), j)
                })
                .collect();
            dists.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            let cutoff = dists[k - 1].0;
            dists.retain(|&(d, _)| d <= cutoff);
            dists
        })
        .collect()
}

/// Per-axis centroid weighted by score above the group minimum; uniform
/// when every member scores the same.
fn weighted_centroid(nodes: &[Node], members: &[usize], reference_pan: f32) -> Pose {
    let floor = members
        .iter()
        .map(|&j| nodes[j].score)
        .fold(f32::INFINITY, f32::min);
    let mut weights: Vec<f32> = members.iter().map(|&j| nodes[j].score - floor).collect();
    let mut total: f32 = weights.iter().sum();
    if total <= 0.0 {
        weights.fill(1.0);
        total = weights.len() as f32;
    }

    let mean = |axis: fn(&Node) -> f32| -> f32 {
        members
            .iter()
            .zip(&weights)
            .map(|(&j, &w)| axis(&nodes[j]) * w)
            .sum::<f32>()
            / total
    };
    Pose::new(
        mean(|n| n.pose.x),
        mean(|n| n.pose.y),
        mean(|n| n.pose.z),
        wrap_angle(reference_pan + mean(|n| n.rel_pan)),
        mean(|n| n.pose.tilt),
        mean(|n| n.pose.roll),
    )
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
