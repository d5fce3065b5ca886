use log::debug;
use nalgebra::{Matrix3, Quaternion};
use rayon::prelude::*;
use std::collections::VecDeque;

use crate::analysis::structure_analysis::StructureAnalysis;
use crate::core::cell::EPSILON;
use crate::core::cluster_graph::TransitionIdx;
use crate::core::structures::{
    is_orthogonal_matrix, StructureTables, StructureType, CA_TRANSITION_MATRIX_EPSILON,
};
use crate::math::rotation::quaternion_to_matrix;

/// Strict orientation threshold for low-RMSD atom pairs: 3 degrees.
const STRICT_THRESHOLD_DEG: f64 = 3.0;
/// Relaxed orientation threshold: 8 degrees.
const RELAXED_THRESHOLD_DEG: f64 = 8.0;

/// Builds clusters of like-structured atoms, computes inter-cluster
/// transition rotations and merges clusters into super-grains.
///
/// All three passes run sequentially in atom-index order so cluster and
/// transition ids are deterministic.
pub struct ClusterConnector<'a> {
    analysis: &'a mut StructureAnalysis,
    preferred_orientations: Vec<Matrix3<f64>>,
}

impl<'a> ClusterConnector<'a> {
    pub fn new(
        analysis: &'a mut StructureAnalysis,
        preferred_orientations: Vec<Matrix3<f64>>,
    ) -> Self {
        Self {
            analysis,
            preferred_orientations,
        }
    }

    // ------------------------------------------------------------------
    // §4.3.1 seeded growth
    // ------------------------------------------------------------------

    pub fn build_clusters(&mut self) {
        let atom_count = self.analysis.atom_count();
        for seed in 0..atom_count {
            if self.analysis.atom_clusters.get(seed) != 0 {
                continue;
            }
            let structure = self.analysis.structure_of(seed);
            if !structure.has_lattice() {
                continue;
            }

            let cluster_id = self.analysis.cluster_graph.create_cluster(structure);
            self.analysis.atom_clusters.set(seed, cluster_id);
            self.analysis.cluster_graph.cluster_mut(cluster_id).atom_count = 1;

            let seed_orientation = if self.analysis.ptm_orientations.is_some() {
                Some(self.analysis.ptm_orientation(seed))
            } else {
                None
            };
            self.analysis
                .atom_symmetry_permutations
                .as_mut()
                .expect("symmetry permutations alive")
                .set(seed, 0);
            if let Some(q) = &seed_orientation {
                // Scale the rotation so lattice-frame vectors map to
                // physical displacements, mirroring the CNA fit.
                let scale = self
                    .analysis
                    .ptm_scales
                    .as_ref()
                    .map(|s| s.get(seed))
                    .filter(|&s| s > 0.0)
                    .unwrap_or(1.0);
                self.analysis.cluster_graph.cluster_mut(cluster_id).orientation =
                    quaternion_to_matrix(q) * scale;
            }

            let mut orientation_v = Matrix3::zeros();
            let mut orientation_w = Matrix3::zeros();
            self.grow_cluster(
                cluster_id,
                seed,
                structure,
                seed_orientation,
                &mut orientation_v,
                &mut orientation_w,
            );

            if seed_orientation.is_none() {
                if let Some(v_inverse) = orientation_v.try_inverse() {
                    self.analysis.cluster_graph.cluster_mut(cluster_id).orientation =
                        orientation_w * v_inverse;
                }
            }

            if structure == self.analysis.input_structure
                && !self.preferred_orientations.is_empty()
            {
                self.apply_preferred_orientation(cluster_id);
            }
        }
        debug!(
            "built {} clusters",
            self.analysis.cluster_graph.cluster_count()
        );

        self.reorient_atoms_to_align_clusters();
    }

    fn grow_cluster(
        &mut self,
        cluster_id: i32,
        seed: usize,
        structure: StructureType,
        seed_orientation: Option<Quaternion<f64>>,
        orientation_v: &mut Matrix3<f64>,
        orientation_w: &mut Matrix3<f64>,
    ) {
        let lattice = StructureTables::get().lattice(structure);
        let num_neighbors = lattice.coord.num_neighbors;
        let mut queue = VecDeque::from([seed]);

        while let Some(atom) = queue.pop_front() {
            if self.analysis.number_of_neighbors(atom) != num_neighbors {
                continue;
            }
            for slot in 0..num_neighbors {
                let neighbor = self.analysis.neighbor(atom, slot);
                if neighbor < 0 {
                    continue;
                }
                let neighbor = neighbor as usize;

                // Orientation accumulators collect every bond of every
                // member atom, accepted or not.
                if seed_orientation.is_none() {
                    let lattice_vector = self.analysis.neighbor_lattice_vector(atom, slot);
                    let spatial_vector = self.analysis.cell.wrap_vector(
                        &(self.analysis_position(neighbor) - self.analysis_position(atom)),
                    );
                    *orientation_v += lattice_vector * lattice_vector.transpose();
                    *orientation_w += spatial_vector * lattice_vector.transpose();
                }

                if self.analysis.atom_clusters.get(neighbor) != 0 {
                    continue;
                }
                if self.analysis.structure_of(neighbor) != structure {
                    continue;
                }

                let accepted = match &seed_orientation {
                    Some(seed_q) => self.try_join_ptm(atom, neighbor, structure, seed_q),
                    None => self.try_join_cna(atom, neighbor, slot, structure),
                };
                if accepted {
                    self.analysis.atom_clusters.set(neighbor, cluster_id);
                    self.analysis.cluster_graph.cluster_mut(cluster_id).atom_count += 1;
                    queue.push_back(neighbor);
                }
            }
        }
    }

    /// CNA compatibility: the candidate transition built from the common
    /// neighbor basis must equal a lattice symmetry, which becomes the
    /// neighbor's symmetry permutation.
    fn try_join_cna(
        &mut self,
        atom: usize,
        neighbor: usize,
        slot: usize,
        structure: StructureType,
    ) -> bool {
        let lattice = StructureTables::get().lattice(structure);
        let coord = &lattice.coord;
        if self.analysis.number_of_neighbors(neighbor) != coord.num_neighbors {
            return false;
        }
        let perm_index = self
            .analysis
            .atom_symmetry_permutations
            .as_ref()
            .expect("symmetry permutations alive")
            .get(atom) as usize;
        let permutation = &lattice.permutations[perm_index].permutation;

        let mut tm1 = Matrix3::zeros();
        let mut tm2 = Matrix3::zeros();
        for i in 0..3 {
            let reference_atom;
            if i != 2 {
                let cn = coord.common_neighbors[slot][i];
                if cn < 0 {
                    return false;
                }
                let cn = cn as usize;
                reference_atom = self.analysis.neighbor(atom, cn);
                if reference_atom < 0 {
                    return false;
                }
                tm1.set_column(
                    i,
                    &(coord.lattice_vectors[permutation[cn]]
                        - coord.lattice_vectors[permutation[slot]]),
                );
            } else {
                reference_atom = atom as i32;
                tm1.set_column(i, &(-coord.lattice_vectors[permutation[slot]]));
            }
            let j = self
                .analysis
                .find_neighbor(neighbor, reference_atom as usize);
            if j == -1 {
                return false;
            }
            // The neighbor has no permutation yet; raw template order.
            tm2.set_column(i, &coord.lattice_vectors[j as usize]);
        }

        if tm1.determinant().abs() <= EPSILON {
            return false;
        }
        let Some(tm2_inverse) = tm2.try_inverse() else {
            return false;
        };
        let transition = tm1 * tm2_inverse;

        if let Some(index) = lattice.find_permutation(&transition) {
            self.analysis
                .atom_symmetry_permutations
                .as_mut()
                .expect("symmetry permutations alive")
                .set(neighbor, index as i32);
            true
        } else {
            false
        }
    }

    /// PTM compatibility: the relative rotation of the two quaternions
    /// must lie within the trace threshold of some lattice symmetry. The
    /// neighbor's symmetry index is assigned relative to the cluster seed
    /// so all member frames stay mutually consistent.
    fn try_join_ptm(
        &mut self,
        atom: usize,
        neighbor: usize,
        structure: StructureType,
        seed_q: &Quaternion<f64>,
    ) -> bool {
        let lattice = StructureTables::get().lattice(structure);
        let q1 = self.analysis.ptm_orientation(atom);
        let q2 = self.analysis.ptm_orientation(neighbor);
        let relative = quaternion_to_matrix(&(q1.conjugate() * q2));

        let rmsd = self.analysis.ptm_rmsd.as_ref().expect("PTM rmsd alive");
        let avg_rmsd = (rmsd.get(atom) + rmsd.get(neighbor)) * 0.5;
        let threshold_deg = if structure == StructureType::Sc {
            RELAXED_THRESHOLD_DEG
        } else if avg_rmsd < 0.1 {
            STRICT_THRESHOLD_DEG
        } else {
            RELAXED_THRESHOLD_DEG
        };
        let min_trace = 1.0 + 2.0 * threshold_deg.to_radians().cos();

        let compatible = lattice.permutations.iter().any(|p| {
            (relative * p.transformation.transpose()).trace() > min_trace
        });
        if !compatible {
            return false;
        }

        let cluster_relative = quaternion_to_matrix(&(seed_q.conjugate() * q2));
        let index = lattice.closest_permutation(&cluster_relative);
        self.analysis
            .atom_symmetry_permutations
            .as_mut()
            .expect("symmetry permutations alive")
            .set(neighbor, index as i32);
        true
    }

    fn apply_preferred_orientation(&mut self, cluster_id: i32) {
        let structure = self.analysis.cluster_graph.cluster(cluster_id).structure;
        let lattice = StructureTables::get().lattice(structure);
        let old_orientation = self.analysis.cluster_graph.cluster(cluster_id).orientation;

        let mut smallest_deviation = f64::MAX;
        let mut best = (0usize, old_orientation);
        for (sym_index, p) in lattice.permutations.iter().enumerate() {
            let new_orientation = old_orientation * p.transformation.transpose();
            let scaling = new_orientation.determinant().abs().powf(1.0 / 3.0);
            if scaling <= 0.0 {
                continue;
            }
            for preferred in &self.preferred_orientations {
                let deviation: f64 = new_orientation
                    .iter()
                    .zip(preferred.iter())
                    .map(|(a, b)| (a / scaling - b).abs())
                    .sum();
                if deviation < smallest_deviation {
                    smallest_deviation = deviation;
                    best = (sym_index, new_orientation);
                }
            }
        }
        let cluster = self.analysis.cluster_graph.cluster_mut(cluster_id);
        cluster.symmetry_transformation = best.0;
        cluster.orientation = best.1;
    }

    /// Rewrites every atom's symmetry permutation through the cluster's
    /// alignment transformation (parallel, disjoint output slots).
    fn reorient_atoms_to_align_clusters(&mut self) {
        let graph = &self.analysis.cluster_graph;
        let clusters = &self.analysis.atom_clusters;
        let structure_types = &self.analysis.structure_types;
        let Some(perms) = self.analysis.atom_symmetry_permutations.as_mut() else {
            return;
        };
        let updates: Vec<Option<i32>> = perms
            .as_slice()
            .par_iter()
            .enumerate()
            .map(|(atom, &old_perm)| {
                let cluster_id = clusters.get(atom);
                if cluster_id == 0 {
                    return None;
                }
                let cluster = graph.cluster(cluster_id);
                if cluster.symmetry_transformation == 0 {
                    return None;
                }
                let structure = StructureType::from_id(structure_types.get(atom));
                let lattice = StructureTables::get().lattice(structure);
                let new_perm = lattice.permutations[old_perm as usize].inverse_product
                    [cluster.symmetry_transformation];
                Some(new_perm as i32)
            })
            .collect();
        for (atom, update) in updates.into_iter().enumerate() {
            if let Some(p) = update {
                perms.set(atom, p);
            }
        }
    }

    // ------------------------------------------------------------------
    // §4.3.2 cluster-cluster transitions
    // ------------------------------------------------------------------

    pub fn connect_clusters(&mut self) {
        let atom_count = self.analysis.atom_count();
        for atom in 0..atom_count {
            let cluster_id = self.analysis.atom_clusters.get(atom);
            if cluster_id == 0 {
                continue;
            }
            self.connect_cluster_neighbors(atom, cluster_id);
        }
        debug!(
            "cluster graph has {} transitions",
            self.analysis.cluster_graph.transition_count()
        );
    }

    fn connect_cluster_neighbors(&mut self, atom: usize, cluster1: i32) {
        let structure = self.analysis.structure_of(atom);
        let num_neighbors = StructureTables::get()
            .lattice(structure)
            .coord
            .num_neighbors;
        if self.analysis.number_of_neighbors(atom) != num_neighbors {
            return;
        }
        for slot in 0..num_neighbors {
            let neighbor = self.analysis.neighbor(atom, slot);
            if neighbor < 0 || neighbor as usize >= self.analysis.atom_count() {
                continue;
            }
            let neighbor = neighbor as usize;
            let neighbor_cluster = self.analysis.atom_clusters.get(neighbor);

            if neighbor_cluster == 0 {
                self.add_reverse_neighbor(neighbor, atom);
                continue;
            }
            if neighbor_cluster == cluster1 {
                continue;
            }

            if let Some(t) = self
                .analysis
                .cluster_graph
                .find_transition(cluster1, neighbor_cluster)
            {
                let reverse = self.analysis.cluster_graph.transition(t).reverse;
                self.analysis.cluster_graph.transition_mut(t).area += 1;
                self.analysis.cluster_graph.transition_mut(reverse).area += 1;
                continue;
            }

            if let Some(transition) = self.calculate_misorientation(atom, neighbor, slot) {
                if is_orthogonal_matrix(&transition, CA_TRANSITION_MATRIX_EPSILON) {
                    let t = self.analysis.cluster_graph.create_transition(
                        cluster1,
                        neighbor_cluster,
                        transition,
                        1,
                    );
                    let reverse = self.analysis.cluster_graph.transition(t).reverse;
                    self.analysis.cluster_graph.transition_mut(t).area += 1;
                    self.analysis.cluster_graph.transition_mut(reverse).area += 1;
                }
            }
        }
    }

    /// Appends a back-reference into an unassigned neighbor's row so the
    /// adjacency stays symmetric for the mesh stage.
    fn add_reverse_neighbor(&mut self, neighbor: usize, atom: usize) {
        let count = self.analysis.number_of_neighbors(neighbor);
        let lists = self
            .analysis
            .neighbor_lists
            .as_mut()
            .expect("neighbor lists alive");
        if count < lists.component_count()
            && !lists.row(neighbor).contains(&(atom as i32))
        {
            lists.set_component(neighbor, count, atom as i32);
        }
    }

    /// Candidate rotation mapping this atom's cluster frame into the
    /// neighbor's cluster frame (`tm2 * tm1^-1`). `None` when the two
    /// environments do not overlap properly.
    fn calculate_misorientation(
        &self,
        atom: usize,
        neighbor: usize,
        slot: usize,
    ) -> Option<Matrix3<f64>> {
        let structure = self.analysis.structure_of(atom);
        let lattice = StructureTables::get().lattice(structure);
        let coord = &lattice.coord;
        let perms = self
            .analysis
            .atom_symmetry_permutations
            .as_ref()
            .expect("symmetry permutations alive");
        let perm_index = perms.get(atom) as usize;
        let permutation = &lattice.permutations[perm_index].permutation;

        // SC clusters under PTM have no shared first-shell neighbors; the
        // transition follows in closed form from the stored orientations
        // and local symmetries: T = S2 * R2^T * R1 * S1^T.
        if structure == StructureType::Sc && self.analysis.ptm_orientations.is_some() {
            let neighbor_structure = self.analysis.structure_of(neighbor);
            if neighbor_structure == StructureType::Sc {
                let neighbor_lattice = StructureTables::get().lattice(neighbor_structure);
                let s1 = lattice.permutations[perm_index].transformation;
                let s2 = neighbor_lattice.permutations[perms.get(neighbor) as usize]
                    .transformation;
                let r1 = quaternion_to_matrix(&self.analysis.ptm_orientation(atom));
                let r2 = quaternion_to_matrix(&self.analysis.ptm_orientation(neighbor));
                return Some(s2 * r2.transpose() * r1 * s1.transpose());
            }
        }

        let neighbor_structure = self.analysis.structure_of(neighbor);
        let neighbor_lattice = StructureTables::get().lattice(neighbor_structure);
        if self.analysis.number_of_neighbors(neighbor) != neighbor_lattice.coord.num_neighbors {
            return None;
        }
        let neighbor_perm =
            &neighbor_lattice.permutations[perms.get(neighbor) as usize].permutation;

        let mut tm1 = Matrix3::zeros();
        let mut tm2 = Matrix3::zeros();
        for i in 0..3 {
            let reference_atom;
            if i != 2 {
                let cn = coord.common_neighbors[slot][i];
                if cn < 0 {
                    return None;
                }
                let cn = cn as usize;
                let r = self.analysis.neighbor(atom, cn);
                if r < 0 {
                    return None;
                }
                reference_atom = r as usize;
                tm1.set_column(
                    i,
                    &(coord.lattice_vectors[permutation[cn]]
                        - coord.lattice_vectors[permutation[slot]]),
                );
            } else {
                reference_atom = atom;
                tm1.set_column(i, &(-coord.lattice_vectors[permutation[slot]]));
            }
            let j = self.analysis.find_neighbor(neighbor, reference_atom);
            if j == -1 {
                return None;
            }
            tm2.set_column(
                i,
                &neighbor_lattice.coord.lattice_vectors[neighbor_perm[j as usize]],
            );
        }

        if tm1.determinant().abs() < EPSILON {
            return None;
        }
        let tm1_inverse = tm1.try_inverse()?;
        Some(tm2 * tm1_inverse)
    }

    // ------------------------------------------------------------------
    // §4.3.3 super-grain merging
    // ------------------------------------------------------------------

    pub fn form_super_clusters(&mut self) {
        let old_transition_count = self.analysis.cluster_graph.transition_count();

        let cluster_ids: Vec<i32> = self
            .analysis
            .cluster_graph
            .clusters()
            .iter()
            .map(|c| c.id)
            .collect();
        for &id in &cluster_ids {
            let cluster = self.analysis.cluster_graph.cluster_mut(id);
            cluster.rank = 0;
            cluster.parent_transition = None;
        }

        // Bridge crystal clusters through shared defect clusters.
        for &id in &cluster_ids {
            if self.analysis.cluster_graph.cluster(id).structure
                != self.analysis.input_structure
            {
                self.process_defect_cluster(id);
            }
        }

        // Union the bridged crystal clusters, concatenating transitions
        // along compressed parent chains.
        let new_transition_count = self.analysis.cluster_graph.transition_count();
        for t in old_transition_count..new_transition_count {
            if self.analysis.cluster_graph.transition(t).distance != 2 {
                continue;
            }
            let (c1, c2) = {
                let transition = self.analysis.cluster_graph.transition(t);
                (transition.cluster1, transition.cluster2)
            };
            let parent1 = self.get_parent_grain(c1);
            let parent2 = self.get_parent_grain(c2);
            if parent1 == parent2 {
                continue;
            }

            let mut pt = t;
            if parent2 != c2 {
                let chain = self
                    .analysis
                    .cluster_graph
                    .cluster(c2)
                    .parent_transition
                    .expect("non-root cluster has a parent transition");
                pt = self.analysis.cluster_graph.concatenate(pt, chain);
            }
            if parent1 != c1 {
                let chain = self
                    .analysis
                    .cluster_graph
                    .cluster(c1)
                    .parent_transition
                    .expect("non-root cluster has a parent transition");
                let chain_reverse = self.analysis.cluster_graph.transition(chain).reverse;
                pt = self.analysis.cluster_graph.concatenate(chain_reverse, pt);
            }

            let rank1 = self.analysis.cluster_graph.cluster(parent1).rank;
            let rank2 = self.analysis.cluster_graph.cluster(parent2).rank;
            if rank1 > rank2 {
                let reverse = self.analysis.cluster_graph.transition(pt).reverse;
                self.analysis.cluster_graph.cluster_mut(parent2).parent_transition =
                    Some(reverse);
            } else {
                self.analysis.cluster_graph.cluster_mut(parent1).parent_transition = Some(pt);
                if rank1 == rank2 {
                    self.analysis.cluster_graph.cluster_mut(parent2).rank += 1;
                }
            }
        }

        // Flatten every parent chain once.
        for &id in &cluster_ids {
            self.get_parent_grain(id);
        }
        debug!("super-grain merging complete");
    }

    /// Creates distance-2 transitions between pairs of input-crystal
    /// clusters whose rotations through this defect cluster compose to a
    /// lattice symmetry.
    fn process_defect_cluster(&mut self, defect_cluster: i32) {
        let mut outgoing: Vec<TransitionIdx> = Vec::new();
        let mut cursor = self.analysis.cluster_graph.cluster(defect_cluster).transitions;
        while let Some(t) = cursor {
            let transition = self.analysis.cluster_graph.transition(t);
            if transition.distance == 1
                && self
                    .analysis
                    .cluster_graph
                    .cluster(transition.cluster2)
                    .structure
                    == self.analysis.input_structure
            {
                outgoing.push(t);
            }
            cursor = transition.next;
        }

        for (i, &t1) in outgoing.iter().enumerate() {
            for &t2 in outgoing.iter().skip(i + 1) {
                let (target1, target2, misorientation) = {
                    let first = self.analysis.cluster_graph.transition(t1);
                    let second = self.analysis.cluster_graph.transition(t2);
                    if first.cluster2 == second.cluster2 {
                        continue;
                    }
                    let reverse_tm = self
                        .analysis
                        .cluster_graph
                        .transition(first.reverse)
                        .tm;
                    (first.cluster2, second.cluster2, second.tm * reverse_tm)
                };
                let lattice = StructureTables::get()
                    .lattice(self.analysis.cluster_graph.cluster(target2).structure);
                if lattice.find_permutation(&misorientation).is_some() {
                    self.analysis.cluster_graph.create_transition(
                        target1,
                        target2,
                        misorientation,
                        2,
                    );
                }
            }
        }
    }

    /// Root of the cluster's parent forest, compressing the path by
    /// concatenating the transitions along it.
    fn get_parent_grain(&mut self, cluster: i32) -> i32 {
        let Some(mut parent_t) = self.analysis.cluster_graph.cluster(cluster).parent_transition
        else {
            return cluster;
        };
        let mut parent = self.analysis.cluster_graph.transition(parent_t).cluster2;
        while let Some(next) = self.analysis.cluster_graph.cluster(parent).parent_transition {
            parent_t = self.analysis.cluster_graph.concatenate(parent_t, next);
            parent = self.analysis.cluster_graph.transition(next).cluster2;
        }
        self.analysis.cluster_graph.cluster_mut(cluster).parent_transition = Some(parent_t);
        parent
    }

    fn analysis_position(&self, atom: usize) -> nalgebra::Point3<f64> {
        self.analysis
            .positions
            .as_ref()
            .expect("positions alive during clustering")
            .point3(atom)
    }
}
