use nalgebra::{Matrix3, Quaternion, Vector3};

use crate::core::structures::{StructureTables, StructureType};

/// Converts a (not necessarily normalized) quaternion to a rotation
/// matrix after normalization.
pub fn quaternion_to_matrix(q: &Quaternion<f64>) -> Matrix3<f64> {
    let n = q.norm();
    let (w, x, y, z) = (q.w / n, q.i / n, q.j / n, q.k / n);
    Matrix3::new(
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y - w * z),
        2.0 * (x * z + w * y),
        2.0 * (x * y + w * z),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z - w * x),
        2.0 * (x * z - w * y),
        2.0 * (y * z + w * x),
        1.0 - 2.0 * (x * x + y * y),
    )
}

/// Shepperd's method, branching on the largest diagonal term.
pub fn quaternion_from_matrix(r: &Matrix3<f64>) -> Quaternion<f64> {
    let tr = r[(0, 0)] + r[(1, 1)] + r[(2, 2)];
    let (w, x, y, z);
    if tr > 0.0 {
        let s = (tr + 1.0).sqrt() * 2.0;
        w = 0.25 * s;
        x = (r[(2, 1)] - r[(1, 2)]) / s;
        y = (r[(0, 2)] - r[(2, 0)]) / s;
        z = (r[(1, 0)] - r[(0, 1)]) / s;
    } else if r[(0, 0)] > r[(1, 1)] && r[(0, 0)] > r[(2, 2)] {
        let s = (1.0 + r[(0, 0)] - r[(1, 1)] - r[(2, 2)]).sqrt() * 2.0;
        w = (r[(2, 1)] - r[(1, 2)]) / s;
        x = 0.25 * s;
        y = (r[(0, 1)] + r[(1, 0)]) / s;
        z = (r[(0, 2)] + r[(2, 0)]) / s;
    } else if r[(1, 1)] > r[(2, 2)] {
        let s = (1.0 + r[(1, 1)] - r[(0, 0)] - r[(2, 2)]).sqrt() * 2.0;
        w = (r[(0, 2)] - r[(2, 0)]) / s;
        x = (r[(0, 1)] + r[(1, 0)]) / s;
        y = 0.25 * s;
        z = (r[(1, 2)] + r[(2, 1)]) / s;
    } else {
        let s = (1.0 + r[(2, 2)] - r[(0, 0)] - r[(1, 1)]).sqrt() * 2.0;
        w = (r[(1, 0)] - r[(0, 1)]) / s;
        x = (r[(0, 2)] + r[(2, 0)]) / s;
        y = (r[(1, 2)] + r[(2, 1)]) / s;
        z = 0.25 * s;
    }
    Quaternion::new(w, x, y, z).normalize()
}

/// Rotation angle of a rotation matrix, in degrees.
pub fn rotation_angle_deg(r: &Matrix3<f64>) -> f64 {
    let c = 0.5 * (r.trace() - 1.0);
    c.clamp(-1.0, 1.0).acos().to_degrees()
}

/// Rotation angle of a unit quaternion, in degrees.
pub fn quaternion_angle_deg(q: &Quaternion<f64>) -> f64 {
    let w = (q.w / q.norm()).abs().clamp(0.0, 1.0);
    (2.0 * w.acos()).to_degrees()
}

/// Kabsch best-fit rotation mapping the `from` vectors onto the `to`
/// vectors in the least-squares sense.
pub fn kabsch_rotation(from: &[Vector3<f64>], to: &[Vector3<f64>]) -> Matrix3<f64> {
    debug_assert_eq!(from.len(), to.len());
    let mut h = Matrix3::zeros();
    for (f, t) in from.iter().zip(to.iter()) {
        h += t * f.transpose();
    }
    let svd = h.svd(true, true);
    let u = svd.u.expect("SVD of a 3x3 matrix yields U");
    let v_t = svd.v_t.expect("SVD of a 3x3 matrix yields V^T");
    let d = (u * v_t).determinant().signum();
    u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, d)) * v_t
}

/// Proper rotations of a structure's point group as unit quaternions,
/// taken from the lattice symmetry tables.
pub fn symmetry_quaternions(structure: StructureType) -> Vec<Quaternion<f64>> {
    let lattice = StructureTables::get().lattice(structure);
    lattice
        .permutations
        .iter()
        .map(|p| quaternion_from_matrix(&p.transformation))
        .collect()
}

/// Minimal rotation angle (degrees) between two orientations of the same
/// structure under its point group. `Infinity` for structures without a
/// lattice table.
pub fn disorientation_deg(
    structure: StructureType,
    qa: &Quaternion<f64>,
    qb: &Quaternion<f64>,
) -> f64 {
    let Some(lattice) = StructureTables::get().try_lattice(structure) else {
        return f64::INFINITY;
    };
    let qa = qa.normalize();
    let qb = qb.normalize();
    let rel = qa.conjugate() * qb;
    let mut best = f64::INFINITY;
    for p in &lattice.permutations {
        let s = quaternion_from_matrix(&p.transformation);
        let angle = quaternion_angle_deg(&(rel * s));
        if angle < best {
            best = angle;
        }
    }
    best
}

/// Disorientation between an orientation accumulator and a new
/// contribution, folding the contribution in: the accumulator is
/// renormalized to unit length first, then the symmetry-mapped,
/// sign-aligned contribution is added, so the running sum stays bounded
/// and recent merges keep their weight. Returns
/// `(angle_deg, updated_accumulator)`; the accumulator passes through
/// unchanged for structures without a lattice table.
pub fn map_and_calculate_disorientation(
    structure: StructureType,
    qa: &Quaternion<f64>,
    qb: &Quaternion<f64>,
) -> (f64, Quaternion<f64>) {
    let Some(lattice) = StructureTables::get().try_lattice(structure) else {
        return (f64::INFINITY, *qa);
    };
    let qa_n = qa.normalize();
    let qb_n = qb.normalize();
    let rel = qa_n.conjugate() * qb_n;
    let mut best = f64::INFINITY;
    let mut mapped = qb_n;
    for p in &lattice.permutations {
        let s = quaternion_from_matrix(&p.transformation);
        let candidate = rel * s;
        let angle = quaternion_angle_deg(&candidate);
        if angle < best {
            best = angle;
            mapped = qb_n * s;
            if mapped.dot(&qa_n) < 0.0 {
                mapped = -mapped;
            }
        }
    }
    (best, qa_n + mapped)
}

/// Rotation mapping hexagonal close-packed lattice coordinates into the
/// face-centered-cubic frame sharing the same close-packed plane: the
/// basal normal goes to [111]/sqrt(3) and the first basal neighbor to an
/// in-plane <110>/2 direction.
fn hex_to_cubic_rotation() -> Matrix3<f64> {
    let n = Vector3::new(1.0, 1.0, 1.0).normalize();
    let u = Vector3::new(0.5, -0.5, 0.0).normalize();
    let v = n.cross(&u);
    Matrix3::from_columns(&[u, v, n])
}

/// Full proper hexagonal point group D6 as quaternions: six rotations
/// about the c axis and six basal two-fold axes. The coordination
/// template's own group is smaller, but both stacking variants of a
/// coherent interface must fold together.
fn hexagonal_point_group_quaternions() -> Vec<Quaternion<f64>> {
    let mut result = Vec::with_capacity(12);
    for k in 0..6 {
        let half = (k as f64) * std::f64::consts::FRAC_PI_3 / 2.0;
        let (s, c) = half.sin_cos();
        result.push(Quaternion::new(c, 0.0, 0.0, s));
        // 180-degree rotation about the in-plane axis at angle phi/2.
        result.push(Quaternion::new(0.0, c, s, 0.0));
    }
    result
}

/// Disorientation across a coherent interface between a cubic structure
/// and its hexagonal sibling (FCC/HCP or cubic/hex diamond). `qa` is the
/// parent-phase orientation, `qb` the sibling one. Returns the angle in
/// degrees together with `qb` re-expressed in the parent frame.
pub fn interfacial_disorientation_deg(
    parent: StructureType,
    sibling: StructureType,
    qa: &Quaternion<f64>,
    qb: &Quaternion<f64>,
) -> (f64, Quaternion<f64>) {
    let conversion = quaternion_from_matrix(&hex_to_cubic_rotation());
    // With spatial = R(q) * L and L_cubic = M * L_hex, a hexagonal atom
    // reads q * C^-1 in the cubic frame and a cubic atom q * C in the
    // hexagonal frame.
    let parent_is_cubic = matches!(parent, StructureType::Fcc | StructureType::CubicDiamond);
    let to_parent_frame = if parent_is_cubic {
        conversion.conjugate()
    } else {
        conversion
    };
    let cubic_group = symmetry_quaternions(if parent_is_cubic { parent } else { sibling });
    let hex_group = hexagonal_point_group_quaternions();
    let (parent_syms, sibling_syms) = if parent_is_cubic {
        (cubic_group, hex_group)
    } else {
        (hex_group, cubic_group)
    };

    let qa_n = qa.normalize();
    let qb_n = qb.normalize();
    let mut best = f64::INFINITY;
    let mut best_mapped = qb_n;
    for t in &sibling_syms {
        let candidate = qb_n * t * to_parent_frame;
        let rel = qa_n.conjugate() * candidate;
        for s in &parent_syms {
            let angle = quaternion_angle_deg(&(rel * s));
            if angle < best {
                best = angle;
                let mut mapped = candidate * s;
                if mapped.dot(&qa_n) < 0.0 {
                    mapped = -mapped;
                }
                best_mapped = mapped;
            }
        }
    }
    (best, best_mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn quat_axis_angle(axis: Vector3<f64>, angle: f64) -> Quaternion<f64> {
        let axis = axis.normalize();
        let (s, c) = (angle / 2.0).sin_cos();
        Quaternion::new(c, axis.x * s, axis.y * s, axis.z * s)
    }

    #[test]
    fn matrix_round_trip() {
        let q = quat_axis_angle(Vector3::new(1.0, 2.0, 3.0), 0.7);
        let m = quaternion_to_matrix(&q);
        let q2 = quaternion_from_matrix(&m);
        let dot = q.dot(&q2).abs();
        assert!((dot - 1.0).abs() < 1e-10);
    }

    #[test]
    fn cubic_disorientation_folds_90_degrees_to_zero() {
        let qa = Quaternion::new(1.0, 0.0, 0.0, 0.0);
        let qb = quat_axis_angle(Vector3::z(), FRAC_PI_2);
        let angle = disorientation_deg(StructureType::Fcc, &qa, &qb);
        assert!(angle < 1e-6, "angle = {}", angle);
    }

    #[test]
    fn cubic_disorientation_of_ten_degree_tilt() {
        let qa = Quaternion::new(1.0, 0.0, 0.0, 0.0);
        let qb = quat_axis_angle(Vector3::z(), 10.0_f64.to_radians());
        let angle = disorientation_deg(StructureType::Fcc, &qa, &qb);
        assert!((angle - 10.0).abs() < 1e-6, "angle = {}", angle);
    }

    #[test]
    fn kabsch_recovers_pure_rotation() {
        let r = quaternion_to_matrix(&quat_axis_angle(Vector3::new(0.3, -1.0, 0.5), 1.1));
        let from = vec![
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 1.0, 1.0),
        ];
        let to: Vec<_> = from.iter().map(|v| r * v).collect();
        let fitted = kabsch_rotation(&from, &to);
        assert!((fitted - r).norm() < 1e-10);
    }

    #[test]
    fn interfacial_disorientation_of_matching_stacking_is_small() {
        // An HCP atom whose basal frame was produced by the conversion
        // rotation itself is a perfect coherent interface: zero angle.
        let qa = Quaternion::new(1.0, 0.0, 0.0, 0.0);
        let qb = quaternion_from_matrix(&hex_to_cubic_rotation());
        let (angle, _) = interfacial_disorientation_deg(
            StructureType::Fcc,
            StructureType::Hcp,
            &qa,
            &qb,
        );
        assert!(angle < 1e-5, "angle = {}", angle);
    }
}
