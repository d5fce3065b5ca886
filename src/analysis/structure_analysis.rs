use log::debug;
use nalgebra::{Quaternion, Vector3};
use rayon::prelude::*;

use crate::analysis::cna;
use crate::analysis::neighbor_finder::{NeighborFinder, NeighborQuery};
use crate::analysis::ptm::{self, PtmResult};
use crate::core::cell::SimulationCell;
use crate::core::cluster_graph::ClusterGraph;
use crate::core::error::AnalysisError;
use crate::core::property::{FloatProperty, Int64Property, IntProperty};
use crate::core::structures::{StructureTables, StructureType, NUM_STRUCTURE_TYPES};

/// How per-atom structure types are determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentificationMode {
    Cna,
    Ptm,
    Diamond,
}

/// Per-type atom counts with an identification summary.
#[derive(Debug, Clone)]
pub struct StructureStatistics {
    pub counts: Vec<(StructureType, usize)>,
    pub total_atoms: usize,
    pub total_identified: usize,
}

impl StructureStatistics {
    pub fn identification_rate(&self) -> f64 {
        if self.total_atoms == 0 {
            0.0
        } else {
            self.total_identified as f64 / self.total_atoms as f64
        }
    }
}

/// Owns the per-atom properties produced by structure identification and
/// consumed by the cluster builder and the mesh stages.
pub struct StructureAnalysis {
    pub cell: SimulationCell,
    pub input_structure: StructureType,
    pub mode: IdentificationMode,
    pub identify_planar_defects: bool,
    pub rmsd_cutoff: f64,

    pub positions: Option<FloatProperty>,
    pub structure_types: IntProperty,
    pub atom_clusters: IntProperty,
    /// One row per atom, template-slot order, -1 beyond the actual count.
    pub neighbor_lists: Option<IntProperty>,
    pub atom_symmetry_permutations: Option<IntProperty>,
    /// Unit quaternions stored as (x, y, z, w).
    pub ptm_orientations: Option<FloatProperty>,
    pub ptm_rmsd: Option<FloatProperty>,
    /// Uniform template-to-physical scale per atom.
    pub ptm_scales: Option<FloatProperty>,
    pub correspondences: Option<Int64Property>,

    pub cluster_graph: ClusterGraph,
    pub maximum_neighbor_distance: f64,
}

impl StructureAnalysis {
    pub fn new(
        positions: FloatProperty,
        cell: SimulationCell,
        input_structure: StructureType,
        mode: IdentificationMode,
        identify_planar_defects: bool,
        rmsd_cutoff: f64,
    ) -> Self {
        let atom_count = positions.len();
        let max_neighbors = input_structure.coordination_number().max(
            if identify_planar_defects {
                planar_sibling(input_structure)
                    .map(|s| s.coordination_number())
                    .unwrap_or(0)
            } else {
                0
            },
        );
        Self {
            cell,
            input_structure,
            mode,
            identify_planar_defects,
            rmsd_cutoff,
            positions: Some(positions),
            structure_types: IntProperty::new(atom_count, 1, StructureType::Other.id()),
            atom_clusters: IntProperty::new(atom_count, 1, 0),
            neighbor_lists: Some(IntProperty::new(atom_count, max_neighbors.max(1), -1)),
            atom_symmetry_permutations: Some(IntProperty::new(atom_count, 1, 0)),
            ptm_orientations: None,
            ptm_rmsd: None,
            ptm_scales: None,
            correspondences: None,
            cluster_graph: ClusterGraph::new(),
            maximum_neighbor_distance: 0.0,
        }
    }

    pub fn atom_count(&self) -> usize {
        self.structure_types.len()
    }

    pub fn structure_of(&self, atom: usize) -> StructureType {
        StructureType::from_id(self.structure_types.get(atom))
    }

    /// Runs the configured identifier over all atoms and records the
    /// maximum observed neighbor distance as a side effect.
    pub fn identify_structures(&mut self, finder: &NeighborFinder) -> Result<(), AnalysisError> {
        match self.mode {
            IdentificationMode::Cna | IdentificationMode::Diamond => self.identify_cna(finder),
            IdentificationMode::Ptm => self.identify_ptm(finder),
        }
        debug!(
            "structure identification done, max neighbor distance = {:.4}",
            self.maximum_neighbor_distance
        );
        Ok(())
    }

    fn identify_cna(&mut self, finder: &NeighborFinder) {
        let input = self.input_structure;
        let identify_planar = self.identify_planar_defects;
        let results: Vec<Option<cna::CnaResult>> = (0..self.atom_count())
            .into_par_iter()
            .map(|atom| cna::determine_local_structure(finder, atom, input, identify_planar))
            .collect();

        let neighbor_lists = self
            .neighbor_lists
            .as_mut()
            .expect("neighbor lists live until cluster construction");
        for (atom, result) in results.into_iter().enumerate() {
            let Some(result) = result else { continue };
            self.structure_types.set(atom, result.structure.id());
            for (slot, &neighbor) in result.ordered_neighbors.iter().enumerate() {
                neighbor_lists.set_component(atom, slot, neighbor as i32);
            }
            if result.cutoff > self.maximum_neighbor_distance {
                self.maximum_neighbor_distance = result.cutoff;
            }
        }

        if self.mode == IdentificationMode::Diamond {
            self.post_process_diamond_neighbors(finder);
        }
    }

    fn identify_ptm(&mut self, finder: &NeighborFinder) {
        let n = self.atom_count();
        let enabled = self.enabled_ptm_structures();
        let cutoff = self.rmsd_cutoff;
        let results: Vec<PtmResult> = (0..n)
            .into_par_iter()
            .map(|atom| ptm::identify_atom(finder, atom, &enabled, cutoff))
            .collect();

        let mut orientations = FloatProperty::new(n, 4, 0.0);
        let mut rmsd = FloatProperty::new(n, 1, f64::INFINITY);
        let mut scales = FloatProperty::new(n, 1, 0.0);
        let mut codes = Int64Property::new(n, 0);
        let neighbor_lists = self
            .neighbor_lists
            .as_mut()
            .expect("neighbor lists live until cluster construction");

        for (atom, result) in results.into_iter().enumerate() {
            if result.structure == StructureType::Other {
                continue;
            }
            self.structure_types.set(atom, result.structure.id());
            // Stored x-y-z-w; the Quaternion type is w-first internally.
            let q = result.orientation;
            let row = orientations.row_mut(atom);
            row[0] = q.i;
            row[1] = q.j;
            row[2] = q.k;
            row[3] = q.w;
            rmsd.set(atom, result.rmsd);
            scales.set(atom, result.scale);
            codes.set(atom, result.correspondences);
            let slots = neighbor_lists.component_count();
            for (slot, &neighbor) in result.ordered_neighbors.iter().take(slots).enumerate() {
                neighbor_lists.set_component(atom, slot, neighbor as i32);
            }
            if result.max_neighbor_distance > self.maximum_neighbor_distance {
                self.maximum_neighbor_distance = result.max_neighbor_distance;
            }
        }
        self.ptm_orientations = Some(orientations);
        self.ptm_rmsd = Some(rmsd);
        self.ptm_scales = Some(scales);
        self.correspondences = Some(codes);
    }

    fn enabled_ptm_structures(&self) -> Vec<StructureType> {
        let mut enabled = vec![self.input_structure];
        if self.identify_planar_defects {
            if let Some(sibling) = planar_sibling(self.input_structure) {
                enabled.push(sibling);
            }
        }
        enabled
    }

    /// Labels the first and second neighbor shells of identified diamond
    /// atoms. The marks are informative only and never cluster.
    fn post_process_diamond_neighbors(&mut self, finder: &NeighborFinder) {
        let n = self.atom_count();
        let passes: [(&[StructureType], &[StructureType]); 2] = [
            (
                &[StructureType::CubicDiamond, StructureType::HexDiamond],
                &[
                    StructureType::CubicDiamondFirstNeigh,
                    StructureType::HexDiamondFirstNeigh,
                ],
            ),
            (
                &[
                    StructureType::CubicDiamondFirstNeigh,
                    StructureType::HexDiamondFirstNeigh,
                ],
                &[
                    StructureType::CubicDiamondSecondNeigh,
                    StructureType::HexDiamondSecondNeigh,
                ],
            ),
        ];
        for (sources, marks) in passes {
            let mut updates = vec![None; n];
            for atom in 0..n {
                let current = self.structure_of(atom);
                let Some(pos) = sources.iter().position(|&s| s == current) else {
                    continue;
                };
                let mut query = NeighborQuery::new(finder, 4);
                query.find_neighbors_of_atom(atom);
                for neighbor in query.results() {
                    if self.structure_of(neighbor.index) == StructureType::Other {
                        updates[neighbor.index] = Some(marks[pos]);
                    }
                }
            }
            for (atom, update) in updates.into_iter().enumerate() {
                if let Some(mark) = update {
                    self.structure_types.set(atom, mark.id());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Neighbor list accessors shared by the cluster and mesh stages.
    // ------------------------------------------------------------------

    pub fn number_of_neighbors(&self, atom: usize) -> usize {
        let lists = self.neighbor_lists.as_ref().expect("neighbor lists alive");
        lists.row(atom).iter().take_while(|&&n| n != -1).count()
    }

    pub fn neighbor(&self, atom: usize, slot: usize) -> i32 {
        self.neighbor_lists
            .as_ref()
            .expect("neighbor lists alive")
            .get_component(atom, slot)
    }

    /// Slot of `neighbor_atom` in `atom`'s list, or -1.
    pub fn find_neighbor(&self, atom: usize, neighbor_atom: usize) -> i32 {
        let lists = self.neighbor_lists.as_ref().expect("neighbor lists alive");
        for (slot, &n) in lists.row(atom).iter().enumerate() {
            if n == -1 {
                break;
            }
            if n as usize == neighbor_atom {
                return slot as i32;
            }
        }
        -1
    }

    /// Ideal lattice vector of a neighbor bond, permuted by the atom's
    /// current symmetry permutation.
    pub fn neighbor_lattice_vector(&self, atom: usize, slot: usize) -> Vector3<f64> {
        let structure = self.structure_of(atom);
        let lattice = StructureTables::get().lattice(structure);
        let perm_index = self
            .atom_symmetry_permutations
            .as_ref()
            .expect("symmetry permutations alive")
            .get(atom) as usize;
        let permutation = &lattice.permutations[perm_index].permutation;
        lattice.coord.lattice_vectors[permutation[slot]]
    }

    pub fn ptm_orientation(&self, atom: usize) -> Quaternion<f64> {
        let row = self
            .ptm_orientations
            .as_ref()
            .expect("PTM orientations alive")
            .row(atom);
        let q = Quaternion::new(row[3], row[0], row[1], row[2]);
        if q.norm_squared() > 0.0 {
            q.normalize()
        } else {
            Quaternion::new(1.0, 0.0, 0.0, 0.0)
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Releases the neighbor lists and symmetry permutations once the
    /// mesh stages no longer need them.
    pub fn free_neighbor_lists(&mut self) {
        self.neighbor_lists = None;
        self.atom_symmetry_permutations = None;
    }

    /// Releases PTM auxiliary arrays (orientations are kept, they are an
    /// output).
    pub fn free_ptm_data(&mut self) {
        self.ptm_rmsd = None;
        self.ptm_scales = None;
        self.correspondences = None;
    }

    pub fn structure_statistics(&self) -> StructureStatistics {
        let mut histogram = [0usize; NUM_STRUCTURE_TYPES];
        for atom in 0..self.atom_count() {
            let id = self.structure_types.get(atom);
            if id >= 0 && (id as usize) < NUM_STRUCTURE_TYPES {
                histogram[id as usize] += 1;
            }
        }
        let counts: Vec<(StructureType, usize)> = histogram
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(id, &count)| (StructureType::from_id(id as i32), count))
            .collect();
        let total_identified = counts
            .iter()
            .filter(|(st, _)| *st != StructureType::Other)
            .map(|(_, c)| c)
            .sum();
        StructureStatistics {
            counts,
            total_atoms: self.atom_count(),
            total_identified,
        }
    }
}

/// The stacking sibling identified alongside the input structure when
/// planar defects are of interest.
pub fn planar_sibling(structure: StructureType) -> Option<StructureType> {
    match structure {
        StructureType::Fcc => Some(StructureType::Hcp),
        StructureType::Hcp => Some(StructureType::Fcc),
        StructureType::CubicDiamond => Some(StructureType::HexDiamond),
        StructureType::HexDiamond => Some(StructureType::CubicDiamond),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::property::FloatProperty;

    fn fcc_lattice(n: usize, a: f64) -> (FloatProperty, SimulationCell) {
        let basis = [
            [0.0, 0.0, 0.0],
            [0.5, 0.5, 0.0],
            [0.5, 0.0, 0.5],
            [0.0, 0.5, 0.5],
        ];
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
        let side = n as f64 * a;
        (
            FloatProperty::from_positions(&rows),
            SimulationCell::orthorhombic(side, side, side, [true; 3]).unwrap(),
        )
    }

    #[test]
    fn cna_identifies_perfect_fcc() {
        let (positions, cell) = fcc_lattice(2, 4.0);
        let finder = NeighborFinder::prepare(&positions, &cell, None, None).unwrap();
        let mut analysis = StructureAnalysis::new(
            positions.clone(),
            cell,
            StructureType::Fcc,
            IdentificationMode::Cna,
            true,
            ptm::DEFAULT_RMSD_CUTOFF,
        );
        analysis.identify_structures(&finder).unwrap();
        for atom in 0..analysis.atom_count() {
            assert_eq!(analysis.structure_of(atom), StructureType::Fcc);
            assert_eq!(analysis.number_of_neighbors(atom), 12);
        }
        // Local cutoff of an ideal FCC lattice at nn distance d equals
        // d * (1 + sqrt(2)) / 2.
        let nn = 4.0 / 2.0_f64.sqrt();
        let expected = nn * cna::LOCAL_CUTOFF_SCALING;
        assert!((analysis.maximum_neighbor_distance - expected).abs() < 1e-9);
    }

    #[test]
    fn isolated_atom_stays_other() {
        let positions = FloatProperty::from_positions(&[[5.0, 5.0, 5.0]]);
        let cell = SimulationCell::orthorhombic(10.0, 10.0, 10.0, [false; 3]).unwrap();
        let finder = NeighborFinder::prepare(&positions, &cell, None, None).unwrap();
        let mut analysis = StructureAnalysis::new(
            positions.clone(),
            cell,
            StructureType::Fcc,
            IdentificationMode::Cna,
            true,
            ptm::DEFAULT_RMSD_CUTOFF,
        );
        analysis.identify_structures(&finder).unwrap();
        assert_eq!(analysis.structure_of(0), StructureType::Other);
        assert_eq!(analysis.maximum_neighbor_distance, 0.0);
    }

    #[test]
    fn statistics_count_identified_atoms() {
        let (positions, cell) = fcc_lattice(2, 4.0);
        let finder = NeighborFinder::prepare(&positions, &cell, None, None).unwrap();
        let mut analysis = StructureAnalysis::new(
            positions.clone(),
            cell,
            StructureType::Fcc,
            IdentificationMode::Cna,
            true,
            ptm::DEFAULT_RMSD_CUTOFF,
        );
        analysis.identify_structures(&finder).unwrap();
        let stats = analysis.structure_statistics();
        assert_eq!(stats.total_atoms, 32);
        assert_eq!(stats.total_identified, 32);
        assert!((stats.identification_rate() - 1.0).abs() < 1e-12);
    }
}
