use nalgebra::Vector3;
use std::sync::OnceLock;

use crate::analysis::neighbor_finder::{NeighborFinder, NeighborQuery};
use crate::core::cell::EPSILON;
use crate::core::structures::{
    NeighborBondArray, StructureTables, StructureType, MAX_NEIGHBORS,
};

/// Scaling constant placing the local cutoff halfway between the first
/// and second neighbor shell of a close-packed structure: (1 + sqrt(2))/2.
pub const LOCAL_CUTOFF_SCALING: f64 = 1.2071067811865475;

/// Outcome of classifying one atom with common neighbor analysis.
pub struct CnaResult {
    pub structure: StructureType,
    /// Observed neighbor atom indices, reordered into template order.
    pub ordered_neighbors: Vec<usize>,
    /// Local cutoff radius, reduced over all atoms to size the ghost layer.
    pub cutoff: f64,
}

/// CNA triplet of one neighbor: number of common neighbors, bonds among
/// them, and the longest bond chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Triplet {
    ncn: usize,
    nb: usize,
    lcb: usize,
}

struct CnaTemplate {
    structure: StructureType,
    triplets: Vec<Triplet>,
    /// Sorted triplet multiset for whole-environment comparison.
    sorted: Vec<Triplet>,
}

fn template_for(structure: StructureType) -> &'static CnaTemplate {
    static TEMPLATES: OnceLock<Vec<CnaTemplate>> = OnceLock::new();
    let all = TEMPLATES.get_or_init(|| {
        [
            StructureType::Fcc,
            StructureType::Hcp,
            StructureType::Bcc,
            StructureType::Sc,
            StructureType::CubicDiamond,
            StructureType::HexDiamond,
        ]
        .iter()
        .map(|&st| {
            let coord = &StructureTables::get().lattice(st).coord;
            let triplets = compute_triplets(&coord.neighbor_array, coord.num_neighbors);
            let mut sorted = triplets.clone();
            sorted.sort();
            CnaTemplate {
                structure: st,
                triplets,
                sorted,
            }
        })
        .collect()
    });
    all.iter()
        .find(|t| t.structure == structure)
        .expect("CNA template exists for lattice structures")
}

fn compute_triplets(bonds: &NeighborBondArray, n: usize) -> Vec<Triplet> {
    (0..n)
        .map(|i| {
            let common: Vec<usize> = (0..n).filter(|&j| bonds.bond(i, j)).collect();
            let mut pair_bonds = Vec::new();
            for (a, &ca) in common.iter().enumerate() {
                for &cb in common.iter().skip(a + 1) {
                    if bonds.bond(ca, cb) {
                        pair_bonds.push((ca, cb));
                    }
                }
            }
            Triplet {
                ncn: common.len(),
                nb: pair_bonds.len(),
                lcb: longest_chain(&common, &pair_bonds),
            }
        })
        .collect()
}

/// Longest simple bond chain among the common neighbors, counted in
/// bonds. The sets involved never exceed six atoms.
fn longest_chain(common: &[usize], bonds: &[(usize, usize)]) -> usize {
    let mut best = 0;
    for &start in common {
        let mut used = vec![false; bonds.len()];
        best = best.max(chain_from(start, bonds, &mut used));
    }
    best
}

fn chain_from(node: usize, bonds: &[(usize, usize)], used: &mut [bool]) -> usize {
    let mut best = 0;
    for (k, &(a, b)) in bonds.iter().enumerate() {
        if used[k] {
            continue;
        }
        let next = if a == node {
            b
        } else if b == node {
            a
        } else {
            continue;
        };
        used[k] = true;
        best = best.max(1 + chain_from(next, bonds, used));
        used[k] = false;
    }
    best
}

/// Candidate structures tried for a given input crystal. The input type
/// comes first; its planar-defect sibling is added when stacking faults
/// are to be identified.
fn candidate_structures(input: StructureType, identify_planar_defects: bool) -> Vec<StructureType> {
    match input {
        StructureType::Fcc if identify_planar_defects => {
            vec![StructureType::Fcc, StructureType::Hcp]
        }
        StructureType::Hcp if identify_planar_defects => {
            vec![StructureType::Hcp, StructureType::Fcc]
        }
        StructureType::CubicDiamond if identify_planar_defects => {
            vec![StructureType::CubicDiamond, StructureType::HexDiamond]
        }
        StructureType::HexDiamond if identify_planar_defects => {
            vec![StructureType::HexDiamond, StructureType::CubicDiamond]
        }
        other => vec![other],
    }
}

/// Classifies the local environment of `atom` against the input crystal
/// structure. Returns `None` when the atom is not crystalline; nothing
/// short of that is an error.
pub fn determine_local_structure(
    finder: &NeighborFinder,
    atom: usize,
    input: StructureType,
    identify_planar_defects: bool,
) -> Option<CnaResult> {
    let cn = input.coordination_number();
    if cn == 0 {
        return None;
    }

    let mut query = NeighborQuery::new(finder, (cn + 1).min(MAX_NEIGHBORS + 1));
    query.find_neighbors_of_atom(atom);
    let results = query.results();
    if results.len() < cn {
        return None;
    }

    let mut neighbor_indices = vec![0usize; cn];
    let mut neighbor_vectors = vec![Vector3::zeros(); cn];
    let mut bonds = NeighborBondArray::new();

    let cutoff = match input {
        StructureType::Fcc | StructureType::Hcp | StructureType::Bcc => {
            let shell = if input == StructureType::Bcc { 8 } else { 12 };
            let mean: f64 = results[..shell]
                .iter()
                .map(|n| n.distance_sq.sqrt())
                .sum::<f64>()
                / shell as f64;
            let cutoff = if input == StructureType::Bcc {
                mean / (3.0_f64.sqrt() / 2.0) * 0.5 * (1.0 + 2.0_f64.sqrt())
            } else {
                mean * LOCAL_CUTOFF_SCALING
            };
            let cutoff_sq = cutoff * cutoff;
            // The (N+1)-th neighbor must lie beyond the cutoff.
            if results.len() > cn && results[cn].distance_sq <= cutoff_sq {
                return None;
            }
            for i in 0..cn {
                neighbor_indices[i] = results[i].index;
                neighbor_vectors[i] = results[i].delta;
                for j in (i + 1)..cn {
                    let bonded =
                        (results[i].delta - results[j].delta).norm_squared() <= cutoff_sq;
                    bonds.set_bond(i, j, bonded);
                }
            }
            cutoff
        }
        StructureType::Sc => {
            let mean: f64 =
                results[..6].iter().map(|n| n.distance_sq.sqrt()).sum::<f64>() / 6.0;
            let cutoff = mean * LOCAL_CUTOFF_SCALING;
            if results.len() > 6 && results[6].distance_sq <= cutoff * cutoff {
                return None;
            }
            // Perpendicularity test instead of a distance cutoff: bonded
            // neighbors point along perpendicular or opposite axes.
            for i in 0..6 {
                neighbor_indices[i] = results[i].index;
                neighbor_vectors[i] = results[i].delta;
                let vi = results[i].delta.normalize();
                for j in (i + 1)..6 {
                    let vj = results[j].delta.normalize();
                    let bonded = vi.dot(&vj).abs() < 0.25 || (vi + vj).norm() < 0.25;
                    bonds.set_bond(i, j, bonded);
                }
            }
            cutoff
        }
        StructureType::CubicDiamond | StructureType::HexDiamond => {
            generate_diamond_shells(
                finder,
                atom,
                results,
                &mut neighbor_indices,
                &mut neighbor_vectors,
                &mut bonds,
            )?
        }
        _ => return None,
    };

    // Classify against the candidate templates.
    let observed = compute_triplets(&bonds, cn);
    let mut observed_sorted = observed.clone();
    observed_sorted.sort();

    for candidate in candidate_structures(input, identify_planar_defects) {
        let template = template_for(candidate);
        if template.sorted != observed_sorted {
            continue;
        }
        if let Some(mapping) = find_matching_permutation(&bonds, &observed, template) {
            let ordered_neighbors = mapping.iter().map(|&m| neighbor_indices[m]).collect();
            return Some(CnaResult {
                structure: candidate,
                ordered_neighbors,
                cutoff,
            });
        }
    }
    None
}

/// Diamond path: the four covalent neighbors plus twelve generated
/// second-shell vectors, with first-to-own-second bonds marked during
/// generation and second-second bonds by the scaled distance cutoff.
fn generate_diamond_shells(
    finder: &NeighborFinder,
    atom: usize,
    results: &[crate::analysis::neighbor_finder::Neighbor],
    neighbor_indices: &mut [usize],
    neighbor_vectors: &mut [Vector3<f64>],
    bonds: &mut NeighborBondArray,
) -> Option<f64> {
    if results.len() < 4 {
        return None;
    }
    let mut output_index = 4;
    for i in 0..4 {
        let v0 = results[i].delta;
        neighbor_vectors[i] = v0;
        neighbor_indices[i] = results[i].index;

        let mut sub_query = NeighborQuery::new(finder, 4);
        sub_query.find_neighbors_of_atom(results[i].index);
        let sub = sub_query.results();
        if sub.len() < 4 {
            return None;
        }
        for s in &sub[..4] {
            let v = v0 + s.delta;
            if s.index == atom && v.norm_squared() <= EPSILON {
                continue;
            }
            if output_index == 16 {
                return None;
            }
            neighbor_indices[output_index] = s.index;
            neighbor_vectors[output_index] = v;
            bonds.set_bond(i, output_index, true);
            output_index += 1;
        }
        if output_index != i * 3 + 7 {
            return None;
        }
    }

    let mean: f64 = neighbor_vectors[4..16].iter().map(|v| v.norm()).sum::<f64>() / 12.0;
    let cutoff = mean * LOCAL_CUTOFF_SCALING;
    let cutoff_sq = cutoff * cutoff;
    for i in 4..16 {
        for j in (i + 1)..16 {
            let bonded = (neighbor_vectors[i] - neighbor_vectors[j]).norm_squared() <= cutoff_sq;
            bonds.set_bond(i, j, bonded);
        }
    }
    Some(cutoff)
}

/// Backtracking search for a permutation placing observed neighbors into
/// template slots so that the bond matrices coincide. Triplet equality
/// restricts each slot's candidates; bond consistency with already-placed
/// slots prunes the rest early.
fn find_matching_permutation(
    observed_bonds: &NeighborBondArray,
    observed_triplets: &[Triplet],
    template: &CnaTemplate,
) -> Option<Vec<usize>> {
    let n = observed_triplets.len();
    let coord = &StructureTables::get().lattice(template.structure).coord;
    let mut mapping = vec![usize::MAX; n];
    let mut used = vec![false; n];
    if backtrack(
        0,
        n,
        &mut mapping,
        &mut used,
        observed_bonds,
        observed_triplets,
        &template.triplets,
        &coord.neighbor_array,
    ) {
        Some(mapping)
    } else {
        None
    }
}

#[allow(clippy::too_many_arguments)]
fn backtrack(
    slot: usize,
    n: usize,
    mapping: &mut [usize],
    used: &mut [bool],
    observed_bonds: &NeighborBondArray,
    observed_triplets: &[Triplet],
    template_triplets: &[Triplet],
    template_bonds: &NeighborBondArray,
) -> bool {
    if slot == n {
        return true;
    }
    for candidate in 0..n {
        if used[candidate] || observed_triplets[candidate] != template_triplets[slot] {
            continue;
        }
        let consistent = (0..slot).all(|prev| {
            template_bonds.bond(prev, slot) == observed_bonds.bond(mapping[prev], candidate)
        });
        if !consistent {
            continue;
        }
        mapping[slot] = candidate;
        used[candidate] = true;
        if backtrack(
            slot + 1,
            n,
            mapping,
            used,
            observed_bonds,
            observed_triplets,
            template_triplets,
            template_bonds,
        ) {
            return true;
        }
        used[candidate] = false;
        mapping[slot] = usize::MAX;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fcc_and_hcp_templates_have_distinct_signatures() {
        let fcc = template_for(StructureType::Fcc);
        let hcp = template_for(StructureType::Hcp);
        assert_ne!(fcc.sorted, hcp.sorted);
        // All FCC neighbors share one triplet class.
        assert!(fcc.triplets.iter().all(|t| *t == fcc.triplets[0]));
        assert_eq!(fcc.triplets[0].ncn, 4);
        // HCP splits into two classes of six.
        let first = hcp.triplets[0];
        let class_a = hcp.triplets.iter().filter(|t| **t == first).count();
        assert_eq!(class_a, 6);
    }

    #[test]
    fn bcc_template_shells_differ() {
        let bcc = template_for(StructureType::Bcc);
        assert_eq!(bcc.triplets[0].ncn, 6);
        assert_eq!(bcc.triplets[8].ncn, 4);
    }

    #[test]
    fn template_matches_itself() {
        for st in [
            StructureType::Fcc,
            StructureType::Hcp,
            StructureType::Bcc,
            StructureType::Sc,
        ] {
            let template = template_for(st);
            let coord = &StructureTables::get().lattice(st).coord;
            let mapping = find_matching_permutation(
                &coord.neighbor_array,
                &template.triplets,
                template,
            )
            .unwrap_or_else(|| panic!("{:?} template fails to match itself", st));
            assert_eq!(mapping.len(), coord.num_neighbors);
        }
    }
}
