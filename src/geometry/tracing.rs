use log::debug;
use nalgebra::{Point3, Vector3};

use crate::analysis::structure_analysis::StructureAnalysis;
use crate::core::structures::{StructureTables, StructureType};
use crate::geometry::half_edge_mesh::{EdgeIdx, FaceIdx};
use crate::geometry::interface_mesh::InterfaceMesh;
use crate::math::disjoint_set::DisjointSet;

/// Tolerance for matching a circuit sum against a candidate Burgers
/// vector (lattice units).
const BURGERS_MATCH_EPSILON: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub max_trial_circuit_size: usize,
    pub circuit_stretchability: usize,
    pub only_perfect_dislocations: bool,
    pub mark_core_atoms: bool,
    pub line_smoothing_level: usize,
    pub line_point_interval: f64,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            max_trial_circuit_size: 14,
            circuit_stretchability: 9,
            only_perfect_dislocations: false,
            mark_core_atoms: false,
            line_smoothing_level: 10,
            line_point_interval: 2.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DislocationSegment {
    pub id: usize,
    /// Quantized Burgers vector in the local lattice frame.
    pub burgers_vector: Vector3<f64>,
    /// The same vector rotated into world coordinates through the
    /// cluster orientation.
    pub burgers_vector_world: Vector3<f64>,
    pub cluster: i32,
    pub polyline: Vec<Point3<f64>>,
    pub length: f64,
    /// Segments merged into another chain carry the surviving id;
    /// readers follow this to the final segment.
    pub replaced_with: Option<usize>,
}

impl DislocationSegment {
    pub fn is_degenerate(&self) -> bool {
        self.burgers_vector.norm_squared() == 0.0 || self.polyline.len() < 2
    }
}

#[derive(Debug, Default)]
pub struct DislocationNetwork {
    pub segments: Vec<DislocationSegment>,
    pub core_atoms: Vec<usize>,
    pub total_line_length: f64,
}

/// Traces Burgers circuits on the interface mesh. Strictly sequential so
/// every face participates in at most one trial circuit.
pub struct BurgersCircuitTracer<'a> {
    mesh: &'a InterfaceMesh,
    analysis: &'a StructureAnalysis,
    config: TracerConfig,
    face_visited: Vec<bool>,
    face_segment: Vec<Option<usize>>,
    seed_tried: Vec<bool>,
}

impl<'a> BurgersCircuitTracer<'a> {
    pub fn new(
        mesh: &'a InterfaceMesh,
        analysis: &'a StructureAnalysis,
        config: TracerConfig,
    ) -> Self {
        let face_count = mesh.mesh.face_count();
        Self {
            mesh,
            analysis,
            config,
            face_visited: vec![false; face_count],
            face_segment: vec![None; face_count],
            seed_tried: vec![false; face_count],
        }
    }

    pub fn trace(mut self) -> DislocationNetwork {
        let mut network = DislocationNetwork::default();
        let mut merge_pairs: Vec<(usize, usize)> = Vec::new();

        let faces: Vec<FaceIdx> = self.mesh.mesh.faces().collect();
        for face in faces {
            if self.seed_tried[face.index()] || self.face_visited[face.index()] {
                continue;
            }
            // Primary candidates are faces whose lattice vectors fail to
            // close; faces with unmappable edges seed as well, since the
            // closure failure around a defect tube may hide there.
            let seed_worthy = match self.mesh.face_circuit_sum(face) {
                Some(sum) => sum.norm() > BURGERS_MATCH_EPSILON,
                None => true,
            };
            if !seed_worthy {
                continue;
            }
            self.seed_tried[face.index()] = true;
            if let Some(segment) = self.trace_from_seed(face, network.segments.len()) {
                if let Some(merged_into) = self.merged_segment(&segment) {
                    merge_pairs.push((merged_into, segment.id));
                }
                network.segments.push(segment);
            }
        }

        // Resolve provenance chains to final segment ids.
        let mut provenance = DisjointSet::new(network.segments.len());
        for (a, b) in merge_pairs {
            provenance.merge(a, b);
        }
        for i in 0..network.segments.len() {
            let root = provenance.find(i);
            if root != i {
                network.segments[i].replaced_with = Some(root);
            }
        }

        self.finish_segments(&mut network);
        if self.config.mark_core_atoms {
            network.core_atoms = self.collect_core_atoms();
        }
        debug!(
            "traced {} dislocation segments, total length {:.3}",
            network.segments.len(),
            network.total_line_length
        );
        network
    }

    /// Grows a trial circuit from the seed face until its lattice-vector
    /// sum quantizes to a Burgers vector, then continues the segment
    /// along the defect tube.
    fn trace_from_seed(&mut self, seed: FaceIdx, id: usize) -> Option<DislocationSegment> {
        let region = self.mesh.mesh.face(seed).data.region;
        if region == 0 {
            return None;
        }
        let cluster = self.analysis.cluster_graph.find_cluster(region)?;
        let structure = cluster.structure;
        let orientation = cluster.orientation;

        let mut circuit: Vec<EdgeIdx> = self.mesh.mesh.face_edges(seed);
        let mut absorbed = vec![seed];

        let burgers = loop {
            if let Some(b) = self.quantized_sum(&circuit, structure) {
                break b;
            }
            if circuit.len() >= self.config.max_trial_circuit_size {
                return None;
            }
            if !self.expand_once(&mut circuit, &mut absorbed, region) {
                return None;
            }
        };
        if burgers.norm() <= BURGERS_MATCH_EPSILON {
            // The enclosed closure failures canceled out.
            return None;
        }

        for &f in &absorbed {
            self.face_visited[f.index()] = true;
            self.face_segment[f.index()] = Some(id);
        }

        let mut polyline = vec![self.circuit_centroid(&circuit)];

        // Walk the tube in both directions, collecting ring centroids.
        let cap = circuit.len() + self.config.circuit_stretchability;
        let mut ring = circuit.clone();
        loop {
            let Some((next_ring, new_faces)) = self.advance_ring(&ring, region, cap) else {
                break;
            };
            for &f in &new_faces {
                self.face_visited[f.index()] = true;
                self.face_segment[f.index()] = Some(id);
            }
            polyline.push(self.circuit_centroid(&next_ring));
            ring = next_ring;
        }
        if let Some(mut ring) = reverse_circuit(self.mesh, &circuit) {
            loop {
                let Some((next_ring, new_faces)) = self.advance_ring(&ring, region, cap) else {
                    break;
                };
                for &f in &new_faces {
                    self.face_visited[f.index()] = true;
                    self.face_segment[f.index()] = Some(id);
                }
                polyline.insert(0, self.circuit_centroid(&next_ring));
                ring = next_ring;
            }
        }

        Some(DislocationSegment {
            id,
            burgers_vector: burgers,
            burgers_vector_world: orientation * burgers,
            cluster: region,
            polyline,
            length: 0.0,
            replaced_with: None,
        })
    }

    /// Replaces one circuit edge by the far side of its adjacent face,
    /// preferring faces that carry closure failures (they must end up
    /// enclosed by the circuit).
    fn expand_once(
        &self,
        circuit: &mut Vec<EdgeIdx>,
        absorbed: &mut Vec<FaceIdx>,
        region: i32,
    ) -> bool {
        let mut fallback: Option<(usize, FaceIdx)> = None;
        for (position, &edge) in circuit.iter().enumerate() {
            let Some(candidate) = self.expansion_face(edge, absorbed, region) else {
                continue;
            };
            let failing = self
                .mesh
                .face_circuit_sum(candidate)
                .map(|s| s.norm() > BURGERS_MATCH_EPSILON)
                .unwrap_or(true);
            if failing {
                self.apply_expansion(circuit, position, candidate, absorbed);
                return true;
            }
            if fallback.is_none() {
                fallback = Some((position, candidate));
            }
        }
        if let Some((position, candidate)) = fallback {
            self.apply_expansion(circuit, position, candidate, absorbed);
            return true;
        }
        false
    }

    fn expansion_face(
        &self,
        edge: EdgeIdx,
        absorbed: &[FaceIdx],
        region: i32,
    ) -> Option<FaceIdx> {
        let opposite = self.mesh.mesh.edge(edge).opposite?;
        let face = self.mesh.mesh.edge(opposite).face;
        if absorbed.contains(&face)
            || self.face_visited[face.index()]
            || self.mesh.mesh.face(face).data.region != region
        {
            return None;
        }
        Some(face)
    }

    fn apply_expansion(
        &self,
        circuit: &mut Vec<EdgeIdx>,
        position: usize,
        face: FaceIdx,
        absorbed: &mut Vec<FaceIdx>,
    ) {
        let edge = circuit[position];
        let opposite = self
            .mesh
            .mesh
            .edge(edge)
            .opposite
            .expect("expansion face reached through an opposite edge");
        let x = self.mesh.mesh.edge(opposite).next_face_edge;
        let y = self.mesh.mesh.edge(x).next_face_edge;
        circuit[position] = x;
        circuit.insert(position + 1, y);
        absorbed.push(face);
        simplify_circuit(self.mesh, circuit);
    }

    /// Sum of the circuit's lattice vectors quantized to the nearest
    /// candidate Burgers vector; the smallest-magnitude candidate within
    /// tolerance wins when several are feasible.
    fn quantized_sum(&self, circuit: &[EdgeIdx], structure: StructureType) -> Option<Vector3<f64>> {
        let mut sum = Vector3::zeros();
        for &e in circuit {
            sum += self.mesh.mesh.edge(e).data.lattice_vector?;
        }
        if sum.norm() <= BURGERS_MATCH_EPSILON {
            return Some(Vector3::zeros());
        }
        let candidates = burgers_candidates(structure, self.config.only_perfect_dislocations);
        let mut best: Option<Vector3<f64>> = None;
        for c in candidates {
            if (sum - c).norm() < BURGERS_MATCH_EPSILON {
                let better = best.map(|b| c.norm() < b.norm()).unwrap_or(true);
                if better {
                    best = Some(c);
                }
            }
        }
        best
    }

    /// Advances a ring circuit one face layer along the tube. Returns the
    /// new ring and the freshly absorbed faces, or `None` at the tube's
    /// end (or when the walk runs into already-traced territory).
    fn advance_ring(
        &self,
        ring: &[EdgeIdx],
        region: i32,
        cap: usize,
    ) -> Option<(Vec<EdgeIdx>, Vec<FaceIdx>)> {
        let mut next = ring.to_vec();
        let mut new_faces = Vec::new();
        let mut progressed = false;
        let mut position = 0;
        while position < next.len() {
            let edge = next[position];
            match self.expansion_face(edge, &new_faces, region) {
                Some(face) => {
                    let opposite = self.mesh.mesh.edge(edge).opposite?;
                    let x = self.mesh.mesh.edge(opposite).next_face_edge;
                    let y = self.mesh.mesh.edge(x).next_face_edge;
                    next[position] = x;
                    next.insert(position + 1, y);
                    new_faces.push(face);
                    progressed = true;
                    position += 2;
                }
                None => {
                    position += 1;
                }
            }
            if next.len() > cap * 2 {
                return None;
            }
        }
        if !progressed || new_faces.is_empty() {
            return None;
        }
        simplify_circuit(self.mesh, &mut next);
        if next.len() < 3 || next.len() > cap {
            return None;
        }
        Some((next, new_faces))
    }

    /// Centroid of the circuit's vertices with periodic unwrapping
    /// anchored at the first vertex.
    fn circuit_centroid(&self, circuit: &[EdgeIdx]) -> Point3<f64> {
        let mesh = &self.mesh.mesh;
        let cell = &self.analysis.cell;
        let anchor = mesh.vertex(mesh.vertex1(circuit[0])).pos;
        let mut accumulator = Vector3::zeros();
        for &e in circuit {
            let p = mesh.vertex(mesh.edge(e).vertex2).pos;
            accumulator += cell.wrap_vector(&(p - anchor));
        }
        anchor + accumulator / circuit.len() as f64
    }

    /// The segment previously traced on a face adjacent to this
    /// segment's faces, if any; used for provenance merging.
    fn merged_segment(&self, segment: &DislocationSegment) -> Option<usize> {
        for (face_index, owner) in self.face_segment.iter().enumerate() {
            if *owner != Some(segment.id) {
                continue;
            }
            let face = FaceIdx(face_index as u32);
            for edge in self.mesh.mesh.face_edges(face) {
                let Some(opposite) = self.mesh.mesh.edge(edge).opposite else {
                    continue;
                };
                let other_face = self.mesh.mesh.edge(opposite).face;
                if let Some(other) = self.face_segment[other_face.index()] {
                    if other != segment.id {
                        return Some(other);
                    }
                }
            }
        }
        None
    }

    fn collect_core_atoms(&self) -> Vec<usize> {
        let mut atoms = Vec::new();
        for (face_index, &visited) in self.face_visited.iter().enumerate() {
            if !visited {
                continue;
            }
            let face = FaceIdx(face_index as u32);
            for edge in self.mesh.mesh.face_edges(face) {
                let v = self.mesh.mesh.edge(edge).vertex2;
                let atom = self.mesh.mesh.vertex(v).data.atom;
                if !atoms.contains(&atom) {
                    atoms.push(atom);
                }
            }
        }
        atoms.sort_unstable();
        atoms
    }

    /// Smoothing, resampling, degenerate pruning and the total length.
    fn finish_segments(&self, network: &mut DislocationNetwork) {
        let cell = &self.analysis.cell;
        for segment in &mut network.segments {
            // Unwrap into a continuous line before smoothing.
            let mut line: Vec<Point3<f64>> = Vec::with_capacity(segment.polyline.len());
            for (i, p) in segment.polyline.iter().enumerate() {
                if i == 0 {
                    line.push(*p);
                } else {
                    let prev = line[i - 1];
                    line.push(prev + cell.wrap_vector(&(*p - prev)));
                }
            }

            smooth_polyline(&mut line, self.config.line_smoothing_level);
            let resampled = resample_polyline(&line, self.config.line_point_interval);
            segment.polyline = resampled;
            segment.length = polyline_length(&segment.polyline);
        }
        network
            .segments
            .retain(|segment| !segment.is_degenerate());
        network.total_line_length = network
            .segments
            .iter()
            .filter(|s| s.replaced_with.is_none())
            .map(|s| s.length)
            .sum();
    }
}

/// Removes immediately backtracking edge pairs from a circuit.
fn simplify_circuit(mesh: &InterfaceMesh, circuit: &mut Vec<EdgeIdx>) {
    loop {
        let n = circuit.len();
        if n < 2 {
            return;
        }
        let mut removed = false;
        for i in 0..n {
            let j = (i + 1) % n;
            if mesh.mesh.edge(circuit[i]).opposite == Some(circuit[j]) {
                let (hi, lo) = if i > j { (i, j) } else { (j, i) };
                circuit.remove(hi);
                circuit.remove(lo);
                removed = true;
                break;
            }
        }
        if !removed {
            return;
        }
    }
}

/// The same circuit traversed through the opposite half-edges, when they
/// all exist; used to continue the tube walk in the other direction.
fn reverse_circuit(mesh: &InterfaceMesh, circuit: &[EdgeIdx]) -> Option<Vec<EdgeIdx>> {
    let mut reversed = Vec::with_capacity(circuit.len());
    for &e in circuit.iter().rev() {
        reversed.push(mesh.mesh.edge(e).opposite?);
    }
    Some(reversed)
}

/// Candidate quantized Burgers vectors of a lattice: short primitive
/// translations, plus the Shockley partials for close-packed structures
/// unless only perfect dislocations are requested.
fn burgers_candidates(structure: StructureType, only_perfect: bool) -> Vec<Vector3<f64>> {
    let lattice = StructureTables::get().lattice(structure);
    let mut candidates = Vec::new();
    let cell = lattice.primitive_cell;
    for i in -1i32..=1 {
        for j in -1i32..=1 {
            for k in -1i32..=1 {
                if i == 0 && j == 0 && k == 0 {
                    continue;
                }
                let v = cell.column(0) * i as f64
                    + cell.column(1) * j as f64
                    + cell.column(2) * k as f64;
                if v.norm() < 1.5 {
                    candidates.push(v);
                }
            }
        }
    }
    if !only_perfect && structure == StructureType::Fcc {
        // Shockley partials 1/6<112>.
        for &(a, b, c) in &[
            (1.0, 1.0, -2.0),
            (1.0, -2.0, 1.0),
            (-2.0, 1.0, 1.0),
            (1.0, 1.0, 2.0),
            (1.0, 2.0, 1.0),
            (2.0, 1.0, 1.0),
            (1.0, -1.0, 2.0),
            (-1.0, 1.0, 2.0),
            (1.0, 2.0, -1.0),
            (-1.0, 2.0, 1.0),
            (2.0, 1.0, -1.0),
            (2.0, -1.0, 1.0),
        ] {
            let v = Vector3::new(a, b, c) / 6.0;
            candidates.push(v);
            candidates.push(-v);
        }
    }
    candidates
}

fn smooth_polyline(line: &mut [Point3<f64>], level: usize) {
    if line.len() < 3 {
        return;
    }
    for _ in 0..level {
        let snapshot: Vec<Point3<f64>> = line.to_vec();
        for i in 1..line.len() - 1 {
            let midpoint = (snapshot[i - 1].coords + snapshot[i + 1].coords) * 0.5;
            line[i] = Point3::from(snapshot[i].coords + (midpoint - snapshot[i].coords) * 0.5);
        }
    }
}

/// Resamples to approximately uniform spacing, keeping both endpoints.
fn resample_polyline(line: &[Point3<f64>], interval: f64) -> Vec<Point3<f64>> {
    if line.len() < 2 || interval <= 0.0 {
        return line.to_vec();
    }
    let total = polyline_length(line);
    if total <= interval {
        return vec![line[0], *line.last().expect("non-empty polyline")];
    }
    let segments = (total / interval).round().max(1.0) as usize;
    let step = total / segments as f64;
    let mut result = vec![line[0]];
    let mut distance_accum = 0.0;
    let mut next_target = step;
    for window in line.windows(2) {
        let seg_len = (window[1] - window[0]).norm();
        while next_target <= distance_accum + seg_len && result.len() < segments {
            let t = (next_target - distance_accum) / seg_len;
            result.push(Point3::from(
                window[0].coords + (window[1] - window[0]) * t,
            ));
            next_target += step;
        }
        distance_accum += seg_len;
    }
    result.push(*line.last().expect("non-empty polyline"));
    result
}

fn polyline_length(line: &[Point3<f64>]) -> f64 {
    line.windows(2).map(|w| (w[1] - w[0]).norm()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fcc_burgers_candidates_contain_half_110() {
        let candidates = burgers_candidates(StructureType::Fcc, true);
        let target = Vector3::new(0.5, 0.5, 0.0);
        assert!(candidates.iter().any(|c| (c - target).norm() < 1e-12));
        // Perfect-only excludes the partials.
        let partial = Vector3::new(1.0, 1.0, -2.0) / 6.0;
        assert!(!candidates.iter().any(|c| (c - partial).norm() < 1e-12));
        let with_partials = burgers_candidates(StructureType::Fcc, false);
        assert!(with_partials.iter().any(|c| (c - partial).norm() < 1e-12));
    }

    #[test]
    fn resampling_keeps_endpoints_and_spacing() {
        let line: Vec<Point3<f64>> =
            (0..11).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect();
        let resampled = resample_polyline(&line, 2.5);
        assert_eq!(resampled[0], line[0]);
        assert_eq!(*resampled.last().unwrap(), line[10]);
        for w in resampled.windows(2) {
            let d = (w[1] - w[0]).norm();
            assert!((d - 2.5).abs() < 1e-9, "spacing = {}", d);
        }
    }

    #[test]
    fn smoothing_straightens_a_zigzag() {
        let mut line: Vec<Point3<f64>> = (0..10)
            .map(|i| Point3::new(i as f64, if i % 2 == 0 { 0.5 } else { -0.5 }, 0.0))
            .collect();
        let before = polyline_length(&line);
        smooth_polyline(&mut line, 10);
        let after = polyline_length(&line);
        assert!(after < before);
    }
}
