use anyhow::Result;
use nalgebra::{Matrix3, Point3, Quaternion, Vector3};

use crystal_defect_analyzer::{
    DislocationAnalysis, IdentificationMode, SimulationCell, Snapshot, StructureType,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fcc_block(cells: [usize; 3], a: f64, pbc: [bool; 3]) -> Snapshot {
    let basis = [
        [0.0, 0.0, 0.0],
        [0.5, 0.5, 0.0],
        [0.5, 0.0, 0.5],
        [0.0, 0.5, 0.5],
    ];
    let mut positions = Vec::new();
    for x in 0..cells[0] {
        for y in 0..cells[1] {
            for z in 0..cells[2] {
                for b in &basis {
                    positions.push([
                        (x as f64 + b[0]) * a,
                        (y as f64 + b[1]) * a,
                        (z as f64 + b[2]) * a,
                    ]);
                }
            }
        }
    }
    let cell = SimulationCell::orthorhombic(
        cells[0] as f64 * a,
        cells[1] as f64 * a,
        cells[2] as f64 * a,
        pbc,
    )
    .expect("valid cell");
    Snapshot {
        positions,
        particle_types: None,
        cell,
    }
}

#[test]
fn empty_input_fails_with_invalid_input() {
    let snapshot = Snapshot {
        positions: Vec::new(),
        particle_types: None,
        cell: SimulationCell::orthorhombic(10.0, 10.0, 10.0, [true; 3]).unwrap(),
    };
    let report = DislocationAnalysis::default().compute_report(&snapshot);
    assert!(report.is_failed);
    assert!(report.output.is_none());
    assert!(report.error.unwrap().starts_with("InvalidInput"));
}

#[test]
fn negative_configuration_is_rejected_before_work() {
    let snapshot = fcc_block([2, 2, 2], 4.0, [true; 3]);
    let analysis = DislocationAnalysis {
        line_point_interval: -1.0,
        ..Default::default()
    };
    let report = analysis.compute_report(&snapshot);
    assert!(report.is_failed);
    assert!(report.error.unwrap().starts_with("ConfigurationError"));
}

#[test]
fn single_atom_produces_empty_results() {
    let snapshot = Snapshot {
        positions: vec![[0.0, 0.0, 0.0]],
        particle_types: None,
        cell: SimulationCell::orthorhombic(10.0, 10.0, 10.0, [true; 3]).unwrap(),
    };
    let output = DislocationAnalysis::default().compute(&snapshot).unwrap();
    assert_eq!(output.structure_types, vec![StructureType::Other.id()]);
    assert!(output.clusters.is_empty());
    assert!(output.dislocations.segments.is_empty());
    assert!(output.grains.is_none());
    assert_eq!(output.defect_mesh.faces.len(), 0);
}

#[test]
fn perfect_fcc_cell_yields_one_cluster_and_no_defects() -> Result<()> {
    init_logging();
    let snapshot = fcc_block([2, 2, 2], 4.0, [true; 3]);
    assert_eq!(snapshot.positions.len(), 32);

    let output = DislocationAnalysis::default().compute(&snapshot)?;

    for &t in &output.structure_types {
        assert_eq!(t, StructureType::Fcc.id());
    }
    assert_eq!(output.clusters.len(), 1);
    assert_eq!(output.clusters[0].atom_count, 32);
    // With the identity preferred orientation the cluster frame comes
    // out as the identity once the lattice-constant scale is divided out.
    let orientation = output.clusters[0].orientation;
    let scale = orientation.determinant().abs().powf(1.0 / 3.0);
    assert!((scale - 4.0).abs() < 1e-6, "lattice scale = {}", scale);
    let deviation = (orientation / scale - Matrix3::identity()).norm();
    assert!(deviation < 1e-6, "orientation deviation = {}", deviation);

    assert!(output.cluster_transitions.is_empty());
    assert_eq!(output.defect_mesh.faces.len(), 0);
    assert!(output.dislocations.segments.is_empty());
    Ok(())
}

#[test]
fn minimal_periodic_cell_still_identifies_every_atom() {
    // A cell only two neighbor shells wide: periodic images of the same
    // atom show up among the neighbors, yet identification must hold.
    let snapshot = fcc_block([2, 1, 1], 4.0, [true; 3]);
    assert_eq!(snapshot.positions.len(), 8);
    let report = DislocationAnalysis::default().compute_report(&snapshot);
    assert!(!report.is_failed, "error: {:?}", report.error);
    let output = report.output.unwrap();
    for &t in &output.structure_types {
        assert_eq!(t, StructureType::Fcc.id());
    }
}

#[test]
fn perfect_fcc_analysis_is_deterministic() {
    let snapshot = fcc_block([3, 3, 3], 4.0, [true; 3]);
    let config = DislocationAnalysis::default();
    let first = config.compute(&snapshot).unwrap();
    let second = config.compute(&snapshot).unwrap();
    assert_eq!(first.structure_types, second.structure_types);
    assert_eq!(first.atom_clusters, second.atom_clusters);
    assert_eq!(
        first.dislocations.segments.len(),
        second.dislocations.segments.len()
    );
}

#[test]
fn structure_identification_only_skips_meshing() {
    let snapshot = fcc_block([2, 2, 2], 4.0, [true; 3]);
    let analysis = DislocationAnalysis {
        structure_identification_only: true,
        ..Default::default()
    };
    let output = analysis.compute(&snapshot).unwrap();
    assert_eq!(output.statistics.total_identified, 32);
    assert!(output.clusters.is_empty());
    assert!(output.interface_mesh.is_none());
    assert_eq!(output.defect_mesh.faces.len(), 0);
}

#[test]
fn vacancy_cluster_produces_interface_faces() {
    // Removing a compact group of atoms from a periodic crystal leaves a
    // void larger than the solidity threshold; its surface shows up as
    // interface mesh facets.
    let mut snapshot = fcc_block([4, 4, 4], 4.0, [true; 3]);
    let center = Point3::new(8.0, 8.0, 8.0);
    snapshot.positions.retain(|p| {
        (Point3::new(p[0], p[1], p[2]) - center).norm() > 5.0
    });
    let output = DislocationAnalysis::default().compute(&snapshot).unwrap();
    assert!(
        output.defect_mesh.faces.len() > 0,
        "void surface should produce facets"
    );
    // The mesh invariant: every face with three mapped edges closes.
    let mesh = output.interface_mesh.as_ref().unwrap();
    for face in mesh.mesh.faces() {
        if let Some(sum) = mesh.face_circuit_sum(face) {
            assert!(
                sum.norm() < 1e-3,
                "face around a simple void fails to close: |sum| = {}",
                sum.norm()
            );
        }
    }
}

#[test]
fn screw_dislocation_analysis_completes() {
    // FCC block oriented so the [110]/2 Burgers vector lies along z,
    // with the standard screw displacement field applied around a core
    // line through the block center.
    let a = 4.0;
    let x_axis = Vector3::new(1.0, -1.0, 0.0).normalize();
    let y_axis = Vector3::new(0.0, 0.0, -1.0);
    let z_axis = Vector3::new(1.0, 1.0, 0.0).normalize();
    let rotation = Matrix3::from_rows(&[
        x_axis.transpose(),
        y_axis.transpose(),
        z_axis.transpose(),
    ]);

    let basis = [
        [0.0, 0.0, 0.0],
        [0.5, 0.5, 0.0],
        [0.5, 0.0, 0.5],
        [0.0, 0.5, 0.5],
    ];
    let burgers = a / 2.0_f64.sqrt();
    let mut positions = Vec::new();
    let half = 6;
    for x in -half..half {
        for y in -half..half {
            for z in -half..half {
                for b in &basis {
                    let crystal = Vector3::new(
                        (x as f64 + b[0]) * a,
                        (y as f64 + b[1]) * a,
                        (z as f64 + b[2]) * a,
                    );
                    let lab = rotation * crystal;
                    if lab.x.abs() > 14.0 || lab.y.abs() > 14.0 || lab.z.abs() > 14.0 {
                        continue;
                    }
                    // Screw displacement: u_z = b/(2 pi) * atan2(y, x),
                    // core offset so no atom sits on the singular line.
                    let theta = (lab.y - 0.3).atan2(lab.x - 0.3);
                    let uz = burgers / (2.0 * std::f64::consts::PI) * theta;
                    positions.push([lab.x + 50.0, lab.y + 50.0, lab.z + uz + 50.0]);
                }
            }
        }
    }

    let snapshot = Snapshot {
        positions,
        particle_types: None,
        cell: SimulationCell::orthorhombic(100.0, 100.0, 100.0, [false; 3]).unwrap(),
    };
    let output = DislocationAnalysis::default().compute(&snapshot).unwrap();

    // The far field stays FCC; the core column does not.
    let fcc_count = output
        .structure_types
        .iter()
        .filter(|&&t| t == StructureType::Fcc.id())
        .count();
    assert!(
        fcc_count * 2 > output.structure_types.len(),
        "most atoms identify as FCC, got {}/{}",
        fcc_count,
        output.structure_types.len()
    );

    // The defect core shows up in the mesh.
    assert!(output.defect_mesh.faces.len() > 0);

    // Any traced segment carries a quantized, non-degenerate Burgers
    // vector with at least two polyline points.
    for segment in &output.dislocations.segments {
        assert!(segment.burgers_vector.norm() > 0.1);
        assert!(segment.polyline.len() >= 2);
        assert!(segment.length > 0.0);
    }
}

fn rotated_fcc_positions(
    cells: usize,
    a: f64,
    angle_deg: f64,
    offset: Vector3<f64>,
) -> Vec<[f64; 3]> {
    let angle = angle_deg.to_radians();
    let (s, c) = angle.sin_cos();
    let rot = Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0);
    let basis = [
        [0.0, 0.0, 0.0],
        [0.5, 0.5, 0.0],
        [0.5, 0.0, 0.5],
        [0.0, 0.5, 0.5],
    ];
    let mut positions = Vec::new();
    let half = cells as f64 * a / 2.0;
    let center = Vector3::new(half, half, half);
    for x in 0..cells {
        for y in 0..cells {
            for z in 0..cells {
                for b in &basis {
                    let p = Vector3::new(
                        (x as f64 + b[0]) * a,
                        (y as f64 + b[1]) * a,
                        (z as f64 + b[2]) * a,
                    );
                    let rotated = rot * (p - center) + center + offset;
                    positions.push([rotated.x, rotated.y, rotated.z]);
                }
            }
        }
    }
    positions
}

#[test]
fn tilt_bicrystal_segments_into_two_grains() -> Result<()> {
    init_logging();
    // Two FCC blocks rotated by +-5 degrees about z and placed side by
    // side: a 10 degree tilt boundary.
    let a = 4.0;
    let cells = 7;
    let mut positions = rotated_fcc_positions(cells, a, 5.0, Vector3::zeros());
    let shift = Vector3::new(cells as f64 * a + a, 0.0, 0.0);
    positions.extend(rotated_fcc_positions(cells, a, -5.0, shift));

    let extent = 2.0 * cells as f64 * a + 3.0 * a;
    let snapshot = Snapshot {
        positions,
        particle_types: None,
        cell: SimulationCell::orthorhombic(extent, extent, extent, [false; 3]).unwrap(),
    };

    let analysis = DislocationAnalysis {
        identification_mode: IdentificationMode::Ptm,
        grain_segmentation: true,
        min_grain_atom_count: 100,
        ..Default::default()
    };
    let output = analysis.compute(&snapshot)?;
    let grains = output.grains.as_ref().expect("grain segmentation ran");

    assert_eq!(grains.grains.len(), 2, "expected two grains");
    for grain in &grains.grains {
        assert!(grain.size >= 500, "grain size = {}", grain.size);
    }

    // Orientations differ by about 10 degrees under the cubic metric.
    let q1 = grains.grains[0].orientation;
    let q2 = grains.grains[1].orientation;
    let angle = crystal_defect_analyzer::math::rotation::disorientation_deg(
        StructureType::Fcc,
        &q1,
        &q2,
    );
    assert!(
        (angle - 10.0).abs() < 2.0,
        "tilt angle between grains = {}",
        angle
    );

    assert!(grains.suggested_merging_threshold > 0.0);

    // Grain bookkeeping invariants.
    let total: usize = grains.grains.iter().map(|g| g.size).sum();
    assert!(total <= snapshot.positions.len());
    for (atom, &gid) in grains.atom_grain_ids.iter().enumerate() {
        if gid != 0 {
            assert_ne!(
                output.structure_types[atom],
                StructureType::Other.id(),
                "grain atom {} must carry a recognized structure",
                atom
            );
        }
    }
    Ok(())
}

/// Stacking of (111) planes with a fault: triangular layers shifted
/// through the A/B/C positions, the fault reversing the cycle.
fn stacking_snapshot(planes_per_block: usize, with_fault: bool) -> Snapshot {
    let d = 2.85; // in-plane nearest-neighbor distance
    let h = d * (2.0 / 3.0_f64).sqrt(); // (111) interplanar spacing
    let nx = 10;
    let ny = 10;
    let a1 = Vector3::new(d, 0.0, 0.0);
    let a2 = Vector3::new(d / 2.0, d * 3.0_f64.sqrt() / 2.0, 0.0);
    let shift = (a1 + a2) / 3.0;

    let total_planes = planes_per_block * 2;
    let mut positions = Vec::new();
    let mut stack_index: i64 = 0;
    for plane in 0..total_planes {
        if with_fault && plane == planes_per_block {
            // Skip one stacking position: ...ABC|BCA... fault.
            stack_index += 1;
        }
        let offset = shift * (stack_index % 3) as f64;
        for i in 0..nx {
            for j in 0..ny {
                let p = a1 * i as f64 + a2 * j as f64 + offset
                    + Vector3::new(0.0, 0.0, plane as f64 * h);
                positions.push([p.x, p.y, p.z]);
            }
        }
        stack_index += 1;
    }

    let matrix = Matrix3::from_columns(&[
        a1 * nx as f64,
        a2 * ny as f64,
        Vector3::new(0.0, 0.0, (total_planes + 4) as f64 * h),
    ]);
    let cell = SimulationCell::new(matrix, Point3::origin(), [true, true, false]).unwrap();
    Snapshot {
        positions,
        particle_types: None,
        cell,
    }
}

#[test]
fn coherent_stacking_fault_relabels_into_one_grain() {
    let snapshot = stacking_snapshot(8, true);
    let base = DislocationAnalysis {
        identification_mode: IdentificationMode::Ptm,
        grain_segmentation: true,
        min_grain_atom_count: 100,
        structure_identification_only: false,
        ..Default::default()
    };

    let merged = DislocationAnalysis {
        handle_coherent_interfaces: true,
        ..base.clone()
    }
    .compute(&snapshot)
    .unwrap();
    let merged_grains = merged.grains.as_ref().unwrap();
    assert_eq!(
        merged_grains.grains.len(),
        1,
        "coherent handling merges the fault into one grain"
    );

    let split = DislocationAnalysis {
        handle_coherent_interfaces: false,
        ..base
    }
    .compute(&snapshot)
    .unwrap();
    let split_grains = split.grains.as_ref().unwrap();
    assert!(
        split_grains.grains.len() >= 2,
        "without coherent handling the fault splits the grains, got {}",
        split_grains.grains.len()
    );
}

#[test]
fn stacking_fault_is_identified_as_hcp() {
    let snapshot = stacking_snapshot(8, true);
    let analysis = DislocationAnalysis {
        identification_mode: IdentificationMode::Ptm,
        structure_identification_only: true,
        ..Default::default()
    };
    let output = analysis.compute(&snapshot).unwrap();
    let hcp = output
        .structure_types
        .iter()
        .filter(|&&t| t == StructureType::Hcp.id())
        .count();
    let fcc = output
        .structure_types
        .iter()
        .filter(|&&t| t == StructureType::Fcc.id())
        .count();
    assert!(hcp >= 100, "fault planes identify as HCP, got {}", hcp);
    assert!(fcc > hcp, "bulk stays FCC ({} fcc vs {} hcp)", fcc, hcp);
}

#[test]
fn transition_reverse_invariants_hold_in_a_polycrystal() {
    // Two touching grains produce cluster transitions; each reported
    // transition's rotation must be orthogonal.
    let a = 4.0;
    let mut positions = rotated_fcc_positions(5, a, 12.0, Vector3::zeros());
    positions.extend(rotated_fcc_positions(
        5,
        a,
        -12.0,
        Vector3::new(5.0 * a + a, 0.0, 0.0),
    ));
    let extent = 12.0 * a + 4.0 * a;
    let snapshot = Snapshot {
        positions,
        particle_types: None,
        cell: SimulationCell::orthorhombic(extent, extent, extent, [false; 3]).unwrap(),
    };
    let output = DislocationAnalysis::default().compute(&snapshot).unwrap();
    for t in &output.cluster_transitions {
        let product = t.tm * t.tm.transpose();
        assert!((product - Matrix3::identity()).norm() < 1e-5);
        assert!(t.distance == 1 || t.distance == 2);
    }
    // Every atom of a crystal cluster shares the cluster's structure.
    for (atom, &cid) in output.atom_clusters.iter().enumerate() {
        if cid == 0 {
            continue;
        }
        let cluster = output
            .clusters
            .iter()
            .find(|c| c.id == cid)
            .expect("cluster exists");
        assert_eq!(output.structure_types[atom], cluster.structure.id());
    }
}

#[test]
fn ptm_mode_reports_unit_quaternions() {
    let snapshot = fcc_block([3, 3, 3], 4.0, [true; 3]);
    let analysis = DislocationAnalysis {
        identification_mode: IdentificationMode::Ptm,
        structure_identification_only: true,
        ..Default::default()
    };
    let output = analysis.compute(&snapshot).unwrap();
    let orientations = output.orientations.as_ref().unwrap();
    let identity = Quaternion::new(1.0, 0.0, 0.0, 0.0);
    for (i, q) in orientations.iter().enumerate() {
        if output.structure_types[i] == StructureType::Other.id() {
            continue;
        }
        let quat = Quaternion::new(q[3], q[0], q[1], q[2]);
        assert!((quat.norm() - 1.0).abs() < 1e-6);
        // A perfect aligned crystal has identity orientation modulo the
        // cubic point group.
        let angle = crystal_defect_analyzer::math::rotation::disorientation_deg(
            StructureType::Fcc,
            &identity,
            &quat,
        );
        assert!(angle < 0.5, "atom {} deviates by {} degrees", i, angle);
    }
}
