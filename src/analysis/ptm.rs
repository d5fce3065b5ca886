use nalgebra::{Matrix3, Quaternion, Vector3};
use std::sync::OnceLock;

use crate::analysis::neighbor_finder::{NeighborFinder, NeighborQuery};
use crate::core::structures::{StructureTables, StructureType};
use crate::math::rotation::{kabsch_rotation, quaternion_from_matrix};

/// Neighbors requested per atom before template matching.
pub const MAX_INPUT_NEIGHBORS: usize = 18;

/// Default RMSD cutoff above which an atom is demoted to OTHER.
pub const DEFAULT_RMSD_CUTOFF: f64 = 0.10;

/// Per-atom result of polyhedral template matching.
#[derive(Debug, Clone)]
pub struct PtmResult {
    pub structure: StructureType,
    /// Rotation mapping template (lattice) coordinates into spatial
    /// coordinates.
    pub orientation: Quaternion<f64>,
    pub rmsd: f64,
    /// Uniform scale from template lattice units to physical distance.
    pub scale: f64,
    pub interatomic_distance: f64,
    pub template_index: usize,
    /// Packed neighbor permutation + template index; layout is private to
    /// this module, everything else relays the code unchanged.
    pub correspondences: u64,
    /// Neighbor atom indices in template slot order.
    pub ordered_neighbors: Vec<usize>,
    /// Distance to the farthest matched neighbor.
    pub max_neighbor_distance: f64,
}

impl PtmResult {
    pub fn other() -> Self {
        Self {
            structure: StructureType::Other,
            orientation: Quaternion::new(1.0, 0.0, 0.0, 0.0),
            rmsd: f64::INFINITY,
            scale: 0.0,
            interatomic_distance: 0.0,
            template_index: 0,
            correspondences: 0,
            ordered_neighbors: Vec::new(),
            max_neighbor_distance: 0.0,
        }
    }
}

struct Template {
    structure: StructureType,
    index: usize,
    /// Ideal vectors scaled to unit mean length.
    unit_vectors: Vec<Vector3<f64>>,
    /// Mean length of the raw lattice vectors.
    mean_length: f64,
}

fn icosahedron_vectors() -> Vec<Vector3<f64>> {
    let phi = (1.0 + 5.0_f64.sqrt()) / 2.0;
    let mut v = Vec::with_capacity(12);
    for &(a, b) in &[(1.0, phi), (1.0, -phi), (-1.0, phi), (-1.0, -phi)] {
        v.push(Vector3::new(0.0, a, b));
        v.push(Vector3::new(a, b, 0.0));
        v.push(Vector3::new(b, 0.0, a));
    }
    v
}

fn templates() -> &'static [Template] {
    static TEMPLATES: OnceLock<Vec<Template>> = OnceLock::new();
    TEMPLATES.get_or_init(|| {
        let tables = StructureTables::get();
        let mut list = Vec::new();
        let lattice_backed = [
            StructureType::Fcc,
            StructureType::Hcp,
            StructureType::Bcc,
            StructureType::Sc,
            StructureType::CubicDiamond,
            StructureType::HexDiamond,
        ];
        for (index, &st) in lattice_backed.iter().enumerate() {
            let vectors = tables.lattice(st).coord.lattice_vectors.clone();
            list.push(make_template(st, index, vectors));
        }
        list.push(make_template(
            StructureType::Ico,
            lattice_backed.len(),
            icosahedron_vectors(),
        ));
        list
    })
}

fn make_template(structure: StructureType, index: usize, vectors: Vec<Vector3<f64>>) -> Template {
    let mean_length = vectors.iter().map(|v| v.norm()).sum::<f64>() / vectors.len() as f64;
    let unit_vectors = vectors.iter().map(|v| v / mean_length).collect();
    Template {
        structure,
        index,
        unit_vectors,
        mean_length,
    }
}

/// Packs the slot-to-observed-neighbor permutation and template index
/// into an opaque u64: template index in bits 60..63, the first fifteen
/// permutation entries at four bits each below (a 16-entry permutation is
/// recoverable from its first fifteen).
fn pack_correspondences(template_index: usize, mapping: &[usize]) -> u64 {
    let mut code = (template_index as u64) << 60;
    for (slot, &observed) in mapping.iter().take(15).enumerate() {
        code |= (observed as u64 & 0xF) << (4 * slot);
    }
    code
}

/// Unpacks the permutation for a template with `count` slots.
pub fn unpack_correspondences(code: u64, count: usize) -> Vec<usize> {
    let mut mapping = Vec::with_capacity(count);
    let mut seen = [false; 16];
    for slot in 0..count.min(15) {
        let observed = ((code >> (4 * slot)) & 0xF) as usize;
        mapping.push(observed);
        seen[observed] = true;
    }
    if count == 16 {
        let last = (0..16).find(|&i| !seen[i]).unwrap_or(15);
        mapping.push(last);
    }
    mapping
}

pub fn correspondences_template_index(code: u64) -> usize {
    (code >> 60) as usize
}

/// Greedy globally-sorted assignment of template slots to observed
/// vectors under the rotation `r`; pairs conflict-free in ascending
/// distance order.
fn assign_correspondences(
    rotated: &[Vector3<f64>],
    observed: &[Vector3<f64>],
) -> Vec<usize> {
    let n = rotated.len();
    let mut pairs = Vec::with_capacity(n * n);
    for (j, t) in rotated.iter().enumerate() {
        for (i, u) in observed.iter().enumerate() {
            pairs.push(((t - u).norm_squared(), j, i));
        }
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut slot_taken = vec![false; n];
    let mut obs_taken = vec![false; n];
    let mut mapping = vec![usize::MAX; n];
    let mut assigned = 0;
    for (_, j, i) in pairs {
        if slot_taken[j] || obs_taken[i] {
            continue;
        }
        mapping[j] = i;
        slot_taken[j] = true;
        obs_taken[i] = true;
        assigned += 1;
        if assigned == n {
            break;
        }
    }
    mapping
}

fn fit_rmsd(
    template: &Template,
    observed: &[Vector3<f64>],
    seed: &Matrix3<f64>,
) -> (f64, Matrix3<f64>, Vec<usize>) {
    let n = template.unit_vectors.len();
    let mut rotation = *seed;
    let mut mapping = Vec::new();
    for _ in 0..3 {
        let rotated: Vec<Vector3<f64>> =
            template.unit_vectors.iter().map(|t| rotation * t).collect();
        mapping = assign_correspondences(&rotated, observed);
        let from: Vec<Vector3<f64>> = template.unit_vectors.clone();
        let to: Vec<Vector3<f64>> = mapping.iter().map(|&i| observed[i]).collect();
        rotation = kabsch_rotation(&from, &to);
    }
    let mut sum = 0.0;
    for (j, t) in template.unit_vectors.iter().enumerate() {
        sum += (rotation * t - observed[mapping[j]]).norm_squared();
    }
    ((sum / n as f64).sqrt(), rotation, mapping)
}

/// Seed rotations aligning a well-separated observed vector pair with
/// compatible template pairs.
fn seed_rotations(template: &Template, observed: &[Vector3<f64>]) -> Vec<Matrix3<f64>> {
    let mut seeds = vec![Matrix3::identity()];
    // Pick the first observed vector and the one most orthogonal to it.
    let u0 = observed[0];
    let mut u1 = observed[1];
    let mut best = f64::MAX;
    for u in observed.iter().skip(1) {
        let c = (u0.normalize().dot(&u.normalize())).abs();
        if c < best {
            best = c;
            u1 = *u;
        }
    }
    let angle_obs = u0.normalize().dot(&u1.normalize()).clamp(-1.0, 1.0).acos();
    for (a, ta) in template.unit_vectors.iter().enumerate() {
        for tb in template.unit_vectors.iter().skip(a + 1) {
            let angle_t = ta.normalize().dot(&tb.normalize()).clamp(-1.0, 1.0).acos();
            if (angle_t - angle_obs).abs() > 0.25 {
                continue;
            }
            // Orthonormal frames from each pair give the aligning rotation.
            let fo = frame_from_pair(&u0, &u1);
            let ft = frame_from_pair(ta, tb);
            seeds.push(fo * ft.transpose());
            let ft_swapped = frame_from_pair(tb, ta);
            seeds.push(fo * ft_swapped.transpose());
        }
    }
    seeds
}

fn frame_from_pair(a: &Vector3<f64>, b: &Vector3<f64>) -> Matrix3<f64> {
    let e1 = a.normalize();
    let mut e2 = b - e1 * b.dot(&e1);
    if e2.norm_squared() < 1e-12 {
        e2 = e1.cross(&Vector3::z());
        if e2.norm_squared() < 1e-12 {
            e2 = e1.cross(&Vector3::y());
        }
    }
    let e2 = e2.normalize();
    let e3 = e1.cross(&e2);
    Matrix3::from_columns(&[e1, e2, e3])
}

/// Matches the local neighborhood of `atom` against the enabled
/// templates and returns the best fit, or an OTHER result when nothing
/// fits below the RMSD cutoff.
pub fn identify_atom(
    finder: &NeighborFinder,
    atom: usize,
    enabled: &[StructureType],
    rmsd_cutoff: f64,
) -> PtmResult {
    let mut query = NeighborQuery::new(finder, MAX_INPUT_NEIGHBORS);
    query.find_neighbors_of_atom(atom);
    let results = query.results();

    let mut best = PtmResult::other();
    for template in templates() {
        if !enabled.contains(&template.structure) {
            continue;
        }
        let n = template.unit_vectors.len();
        if results.len() < n {
            continue;
        }
        let deltas: Vec<Vector3<f64>> = results[..n].iter().map(|r| r.delta).collect();
        let mean_obs = deltas.iter().map(|d| d.norm()).sum::<f64>() / n as f64;
        if mean_obs <= 0.0 {
            continue;
        }
        let observed: Vec<Vector3<f64>> = deltas.iter().map(|d| d / mean_obs).collect();

        let mut template_best: Option<(f64, Matrix3<f64>, Vec<usize>)> = None;
        for seed in seed_rotations(template, &observed) {
            let (rmsd, rotation, mapping) = fit_rmsd(template, &observed, &seed);
            if template_best
                .as_ref()
                .map(|(r, _, _)| rmsd < *r)
                .unwrap_or(true)
            {
                template_best = Some((rmsd, rotation, mapping));
            }
            // A near-exact fit cannot be improved upon.
            if template_best.as_ref().unwrap().0 < 1e-5 {
                break;
            }
        }
        let Some((rmsd, rotation, mapping)) = template_best else {
            continue;
        };
        if rmsd < best.rmsd {
            let ordered_neighbors: Vec<usize> =
                mapping.iter().map(|&i| results[i].index).collect();
            let max_neighbor_distance = results[..n]
                .iter()
                .map(|r| r.distance_sq.sqrt())
                .fold(0.0, f64::max);
            best = PtmResult {
                structure: template.structure,
                orientation: quaternion_from_matrix(&rotation),
                rmsd,
                scale: mean_obs / template.mean_length,
                interatomic_distance: mean_obs,
                template_index: template.index,
                correspondences: pack_correspondences(template.index, &mapping),
                ordered_neighbors,
                max_neighbor_distance,
            };
        }
    }

    if best.rmsd > rmsd_cutoff {
        return PtmResult::other();
    }
    best
}

/// Observed neighbor indices of `atom` in template slot order, decoded
/// from the correspondences code. Falls back to distance order for
/// unidentified atoms.
pub fn ordered_neighbors(
    finder: &NeighborFinder,
    atom: usize,
    structure: StructureType,
    correspondences: u64,
    limit: usize,
) -> Vec<usize> {
    let mut query = NeighborQuery::new(finder, MAX_INPUT_NEIGHBORS);
    query.find_neighbors_of_atom(atom);
    let results = query.results();
    if structure == StructureType::Other || structure == StructureType::Ico {
        return results.iter().take(limit).map(|r| r.index).collect();
    }
    let count = structure.coordination_number().min(limit);
    let mapping = unpack_correspondences(correspondences, structure.coordination_number());
    mapping
        .iter()
        .take(count)
        .filter_map(|&pos| results.get(pos).map(|r| r.index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cell::SimulationCell;
    use crate::core::property::FloatProperty;

    fn fcc_lattice(nx: usize, a: f64) -> (FloatProperty, SimulationCell) {
        let basis = [
            [0.0, 0.0, 0.0],
            [0.5, 0.5, 0.0],
            [0.5, 0.0, 0.5],
            [0.0, 0.5, 0.5],
        ];
        let mut rows = Vec::new();
        for x in 0..nx {
            for y in 0..nx {
                for z in 0..nx {
                    for b in &basis {
                        rows.push([
                            (x as f64 + b[0]) * a,
                            (y as f64 + b[1]) * a,
                            (z as f64 + b[2]) * a,
                        ]);
                    }
                }
            }
        }
        let cell = SimulationCell::orthorhombic(
            nx as f64 * a,
            nx as f64 * a,
            nx as f64 * a,
            [true; 3],
        )
        .unwrap();
        (FloatProperty::from_positions(&rows), cell)
    }

    #[test]
    fn perfect_fcc_is_identified_with_identity_orientation() {
        let (positions, cell) = fcc_lattice(3, 4.0);
        let finder = NeighborFinder::prepare(&positions, &cell, None, None).unwrap();
        let result = identify_atom(
            &finder,
            0,
            &[StructureType::Fcc, StructureType::Hcp, StructureType::Bcc],
            DEFAULT_RMSD_CUTOFF,
        );
        assert_eq!(result.structure, StructureType::Fcc);
        assert!(result.rmsd < 1e-6, "rmsd = {}", result.rmsd);
        // Orientation is a cubic symmetry rotation of the identity.
        let angle = crate::math::rotation::disorientation_deg(
            StructureType::Fcc,
            &Quaternion::new(1.0, 0.0, 0.0, 0.0),
            &result.orientation,
        );
        assert!(angle < 1e-4, "angle = {}", angle);
        // Scale recovers the lattice parameter.
        assert!((result.scale - 4.0).abs() < 1e-6);
    }

    #[test]
    fn bcc_is_not_mistaken_for_fcc() {
        let basis = [[0.0, 0.0, 0.0], [0.5, 0.5, 0.5]];
        let a = 3.0;
        let n = 3;
        let mut rows = Vec::new();
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    for b in &basis {
                        rows.push([
                            (x as f64 + b[0]) * a,
                            (y as f64 + b[1]) * a,
                            (z as f64 + b[2]) * a,
                        ]);
                    }
                }
            }
        }
        let positions = FloatProperty::from_positions(&rows);
        let cell =
            SimulationCell::orthorhombic(n as f64 * a, n as f64 * a, n as f64 * a, [true; 3])
                .unwrap();
        let finder = NeighborFinder::prepare(&positions, &cell, None, None).unwrap();
        let result = identify_atom(
            &finder,
            0,
            &[StructureType::Fcc, StructureType::Hcp, StructureType::Bcc],
            DEFAULT_RMSD_CUTOFF,
        );
        assert_eq!(result.structure, StructureType::Bcc);
    }

    #[test]
    fn correspondences_round_trip() {
        let mapping: Vec<usize> = vec![3, 1, 4, 0, 2, 5, 6, 7, 8, 9, 10, 11];
        let code = pack_correspondences(2, &mapping);
        assert_eq!(correspondences_template_index(code), 2);
        assert_eq!(unpack_correspondences(code, 12), mapping);
    }

    #[test]
    fn sixteen_entry_permutation_recovers_last_slot() {
        let mapping: Vec<usize> = (0..16).rev().collect();
        let code = pack_correspondences(4, &mapping);
        assert_eq!(unpack_correspondences(code, 16), mapping);
    }

    #[test]
    fn rotated_fcc_recovers_the_rotation() {
        use crate::math::rotation::quaternion_to_matrix;
        let angle: f64 = 0.3;
        let q = Quaternion::new((angle / 2.0).cos(), 0.0, 0.0, (angle / 2.0).sin());
        let r = quaternion_to_matrix(&q);
        // Rotate a free-floating FCC neighborhood and check the fitted
        // orientation reproduces it modulo cubic symmetry.
        let vectors = StructureTables::get()
            .lattice(StructureType::Fcc)
            .coord
            .lattice_vectors
            .clone();
        let mut rows = vec![[50.0, 50.0, 50.0]];
        for v in &vectors {
            let p = r * (v * 4.0);
            rows.push([50.0 + p.x, 50.0 + p.y, 50.0 + p.z]);
        }
        let positions = FloatProperty::from_positions(&rows);
        let cell = SimulationCell::orthorhombic(100.0, 100.0, 100.0, [false; 3]).unwrap();
        let finder = NeighborFinder::prepare(&positions, &cell, None, None).unwrap();
        let result = identify_atom(&finder, 0, &[StructureType::Fcc], 0.12);
        assert_eq!(result.structure, StructureType::Fcc);
        let dis = crate::math::rotation::disorientation_deg(
            StructureType::Fcc,
            &q,
            &result.orientation,
        );
        assert!(dis < 0.5, "disorientation = {}", dis);
    }
}
