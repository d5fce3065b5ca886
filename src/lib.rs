pub mod analysis;
pub mod core;
pub mod geometry;
pub mod math;

pub use crate::analysis::grains::{Grain, GrainSegmentationConfig, GrainSegmentationResult};
pub use crate::analysis::neighbor_finder::{NeighborFinder, NeighborQuery};
pub use crate::analysis::structure_analysis::{
    IdentificationMode, StructureAnalysis, StructureStatistics,
};
pub use crate::core::cell::SimulationCell;
pub use crate::core::error::AnalysisError;
pub use crate::core::structures::StructureType;
pub use crate::geometry::interface_mesh::{DefectMesh, InterfaceMesh};
pub use crate::geometry::tracing::{DislocationNetwork, DislocationSegment, TracerConfig};

use log::debug;
use nalgebra::Matrix3;

use crate::analysis::clustering::ClusterConnector;
use crate::analysis::grains::segment_grains;
use crate::core::cell::EPSILON;
use crate::core::property::FloatProperty;
use crate::geometry::delaunay::DelaunayTessellation;
use crate::geometry::tracing::BurgersCircuitTracer;

/// Thickness of the periodic ghost slab relative to the maximum observed
/// neighbor distance.
pub const GHOST_LAYER_FACTOR: f64 = 3.5;

/// In-memory snapshot of an atomistic configuration.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub positions: Vec<[f64; 3]>,
    /// Optional per-atom species ids for species-aware matching.
    pub particle_types: Option<Vec<i32>>,
    pub cell: SimulationCell,
}

/// Configuration object for the dislocation-extraction pipeline.
#[derive(Debug, Clone)]
pub struct DislocationAnalysis {
    pub input_crystal_structure: StructureType,
    pub identification_mode: IdentificationMode,
    pub rmsd_cutoff: f64,
    pub max_trial_circuit_size: usize,
    pub circuit_stretchability: usize,
    pub line_smoothing_level: usize,
    pub line_point_interval: f64,
    pub defect_mesh_smoothing_level: usize,
    pub only_perfect_dislocations: bool,
    pub mark_core_atoms: bool,
    /// Stop after structure identification; no meshing or tracing.
    pub structure_identification_only: bool,
    /// Run grain segmentation on the PTM results.
    pub grain_segmentation: bool,
    pub handle_coherent_interfaces: bool,
    pub min_grain_atom_count: usize,
    /// Crystal clusters are post-rotated toward the closest of these.
    pub preferred_crystal_orientations: Vec<Matrix3<f64>>,
}

impl Default for DislocationAnalysis {
    fn default() -> Self {
        Self {
            input_crystal_structure: StructureType::Fcc,
            identification_mode: IdentificationMode::Cna,
            rmsd_cutoff: 0.10,
            max_trial_circuit_size: 14,
            circuit_stretchability: 9,
            line_smoothing_level: 10,
            line_point_interval: 2.5,
            defect_mesh_smoothing_level: 8,
            only_perfect_dislocations: false,
            mark_core_atoms: false,
            structure_identification_only: false,
            grain_segmentation: false,
            handle_coherent_interfaces: true,
            min_grain_atom_count: 100,
            preferred_crystal_orientations: vec![Matrix3::identity()],
        }
    }
}

/// Per-cluster summary on the output bundle.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub id: i32,
    pub structure: StructureType,
    pub atom_count: usize,
    pub orientation: Matrix3<f64>,
}

/// Per-transition summary on the output bundle.
#[derive(Debug, Clone)]
pub struct TransitionInfo {
    pub cluster1: i32,
    pub cluster2: i32,
    pub tm: Matrix3<f64>,
    pub distance: i32,
    pub area: u32,
}

/// Everything one snapshot's analysis produces.
pub struct AnalysisOutput {
    pub structure_types: Vec<i32>,
    pub atom_clusters: Vec<i32>,
    /// Unit quaternions (x, y, z, w) for PTM runs.
    pub orientations: Option<Vec<[f64; 4]>>,
    pub clusters: Vec<ClusterInfo>,
    pub cluster_transitions: Vec<TransitionInfo>,
    pub defect_mesh: DefectMesh,
    pub interface_mesh: Option<InterfaceMesh>,
    pub dislocations: DislocationNetwork,
    pub grains: Option<GrainSegmentationResult>,
    pub statistics: StructureStatistics,
}

/// Flat report form of the result bundle for serializer front-ends.
pub struct AnalysisReport {
    pub is_failed: bool,
    pub error: Option<String>,
    pub output: Option<AnalysisOutput>,
}

impl DislocationAnalysis {
    /// Rejects out-of-range options before any work begins.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if !self.rmsd_cutoff.is_finite() || self.rmsd_cutoff <= 0.0 {
            return Err(AnalysisError::Configuration(format!(
                "RMSD cutoff must be positive, got {}",
                self.rmsd_cutoff
            )));
        }
        if self.max_trial_circuit_size < 3 {
            return Err(AnalysisError::Configuration(format!(
                "maximum trial circuit size must be at least 3, got {}",
                self.max_trial_circuit_size
            )));
        }
        if !self.line_point_interval.is_finite() || self.line_point_interval <= 0.0 {
            return Err(AnalysisError::Configuration(format!(
                "line point interval must be positive, got {}",
                self.line_point_interval
            )));
        }
        if !self.input_crystal_structure.has_lattice() {
            return Err(AnalysisError::Configuration(format!(
                "input crystal structure {} has no lattice table",
                self.input_crystal_structure.name()
            )));
        }
        if self.identification_mode == IdentificationMode::Diamond
            && !matches!(
                self.input_crystal_structure,
                StructureType::CubicDiamond | StructureType::HexDiamond
            )
        {
            return Err(AnalysisError::Configuration(
                "diamond identification requires a diamond input structure".into(),
            ));
        }
        Ok(())
    }

    /// Runs the full pipeline on a snapshot.
    pub fn compute(&self, snapshot: &Snapshot) -> Result<AnalysisOutput, AnalysisError> {
        self.validate()?;

        if snapshot.positions.is_empty() {
            return Err(AnalysisError::InvalidInput("zero atoms".into()));
        }
        if snapshot.cell.volume() <= EPSILON {
            return Err(AnalysisError::InvalidInput(
                "simulation cell volume is not positive".into(),
            ));
        }

        let positions = FloatProperty::from_positions(&snapshot.positions);
        let finder = NeighborFinder::prepare(&positions, &snapshot.cell, None, None)?;

        let mut analysis = StructureAnalysis::new(
            positions,
            finder.cell().clone(),
            self.input_crystal_structure,
            self.identification_mode,
            !self.only_perfect_dislocations,
            self.rmsd_cutoff,
        );
        analysis.identify_structures(&finder)?;
        self.check_cell_size(&analysis)?;
        let statistics = analysis.structure_statistics();

        if self.structure_identification_only {
            return Ok(self.assemble_output(analysis, None, None, None, statistics));
        }

        let mut connector =
            ClusterConnector::new(&mut analysis, self.preferred_crystal_orientations.clone());
        connector.build_clusters();
        connector.connect_clusters();
        connector.form_super_clusters();

        // Meshing needs a non-trivial crystalline neighborhood.
        let mut interface_mesh = None;
        let mut network = DislocationNetwork::default();
        if analysis.atom_count() >= 4 && analysis.maximum_neighbor_distance > 0.0 {
            let ghost_layer = GHOST_LAYER_FACTOR * analysis.maximum_neighbor_distance;
            let tessellation = DelaunayTessellation::generate(
                analysis.positions.as_ref().expect("positions alive"),
                &analysis.cell,
                ghost_layer,
            );
            if let Some(mut tessellation) = tessellation {
                let mesh = InterfaceMesh::build(
                    &mut tessellation,
                    &analysis,
                    analysis.maximum_neighbor_distance,
                );
                let tracer = BurgersCircuitTracer::new(
                    &mesh,
                    &analysis,
                    TracerConfig {
                        max_trial_circuit_size: self.max_trial_circuit_size,
                        circuit_stretchability: self.circuit_stretchability,
                        only_perfect_dislocations: self.only_perfect_dislocations,
                        mark_core_atoms: self.mark_core_atoms,
                        line_smoothing_level: self.line_smoothing_level,
                        line_point_interval: self.line_point_interval,
                    },
                );
                network = tracer.trace();
                interface_mesh = Some(mesh);
            }
        }
        analysis.free_neighbor_lists();

        let defect_mesh = interface_mesh
            .as_ref()
            .map(|m| m.to_defect_mesh(&analysis, self.defect_mesh_smoothing_level))
            .unwrap_or_default();

        let grains = if self.grain_segmentation
            && self.identification_mode == IdentificationMode::Ptm
        {
            Some(segment_grains(
                &analysis,
                &finder,
                &GrainSegmentationConfig {
                    handle_coherent_interfaces: self.handle_coherent_interfaces,
                    min_grain_atom_count: self.min_grain_atom_count,
                },
            ))
        } else {
            None
        };
        analysis.free_ptm_data();

        debug!(
            "analysis complete: {} clusters, {} segments",
            analysis.cluster_graph.cluster_count(),
            network.segments.len()
        );
        Ok(self.assemble_output(
            analysis,
            interface_mesh,
            Some((defect_mesh, network)),
            grains,
            statistics,
        ))
    }

    /// Result-bundle form with the `is_failed` / `error` contract.
    pub fn compute_report(&self, snapshot: &Snapshot) -> AnalysisReport {
        match self.compute(snapshot) {
            Ok(output) => AnalysisReport {
                is_failed: false,
                error: None,
                output: Some(output),
            },
            Err(error) => AnalysisReport {
                is_failed: true,
                error: Some(format!("{}: {}", error.class(), error)),
                output: None,
            },
        }
    }

    /// A periodic axis must accommodate every identified neighbor bond
    /// within half the cell.
    fn check_cell_size(&self, analysis: &StructureAnalysis) -> Result<(), AnalysisError> {
        let Some(positions) = analysis.positions.as_ref() else {
            return Ok(());
        };
        if analysis.neighbor_lists.is_none() {
            return Ok(());
        }
        let cell = &analysis.cell;
        let pbc = cell.pbc_flags();
        if !cell.has_periodic_boundaries() {
            return Ok(());
        }
        for atom in 0..analysis.atom_count() {
            let count = analysis.number_of_neighbors(atom);
            for slot in 0..count {
                let neighbor = analysis.neighbor(atom, slot);
                if neighbor < 0 {
                    break;
                }
                let delta = positions.point3(neighbor as usize) - positions.point3(atom);
                let reduced = cell.absolute_to_reduced(&cell.wrap_vector(&delta));
                for dim in 0..3 {
                    if pbc[dim] && reduced[dim].abs() >= 0.5 + EPSILON {
                        let width = 1.0 / cell.inverse_matrix().row(dim).norm();
                        return Err(AnalysisError::CellTooSmall {
                            axis: ['X', 'Y', 'Z'][dim],
                            half_width: width * 0.5,
                            cutoff: delta.norm(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn assemble_output(
        &self,
        analysis: StructureAnalysis,
        interface_mesh: Option<InterfaceMesh>,
        mesh_results: Option<(DefectMesh, DislocationNetwork)>,
        grains: Option<GrainSegmentationResult>,
        statistics: StructureStatistics,
    ) -> AnalysisOutput {
        let structure_types = analysis.structure_types.as_slice().to_vec();
        let atom_clusters = analysis.atom_clusters.as_slice().to_vec();
        let orientations = analysis.ptm_orientations.as_ref().map(|p| {
            (0..p.len())
                .map(|i| {
                    let row = p.row(i);
                    [row[0], row[1], row[2], row[3]]
                })
                .collect()
        });
        let clusters = analysis
            .cluster_graph
            .clusters()
            .iter()
            .map(|c| ClusterInfo {
                id: c.id,
                structure: c.structure,
                atom_count: c.atom_count,
                orientation: c.orientation,
            })
            .collect();
        // Emit each undirected transition once, through its forward half.
        let cluster_transitions = analysis
            .cluster_graph
            .transitions()
            .iter()
            .enumerate()
            .filter(|(i, t)| *i < t.reverse && t.cluster1 != t.cluster2)
            .map(|(_, t)| TransitionInfo {
                cluster1: t.cluster1,
                cluster2: t.cluster2,
                tm: t.tm,
                distance: t.distance,
                area: t.area,
            })
            .collect();
        let (defect_mesh, dislocations) = mesh_results.unwrap_or_default();
        AnalysisOutput {
            structure_types,
            atom_clusters,
            orientations,
            clusters,
            cluster_transitions,
            defect_mesh,
            interface_mesh,
            dislocations,
            grains,
            statistics,
        }
    }
}
