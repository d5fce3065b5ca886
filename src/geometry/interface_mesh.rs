use log::debug;
use nalgebra::{Matrix3, Point3, Vector3};
use rayon::prelude::*;

use crate::analysis::structure_analysis::StructureAnalysis;
use crate::core::cluster_graph::ClusterGraph;
use crate::geometry::delaunay::{CellHandle, DelaunayTessellation};
use crate::geometry::half_edge_mesh::{EdgeIdx, FaceIdx, HalfEdgeMesh, VertexIdx};

/// Per-vertex payload: the source atom and its cluster id.
#[derive(Debug, Clone)]
pub struct InterfaceVertexData {
    pub atom: usize,
    pub cluster: i32,
}

/// Per-edge payload: the ideal lattice vector of the bond in the frame of
/// the face's region cluster; `None` marks a defective edge.
#[derive(Debug, Clone, Default)]
pub struct InterfaceEdgeData {
    pub lattice_vector: Option<Vector3<f64>>,
}

/// Per-face payload: region (cluster id) on the solid side, the region
/// on the far side of the facet, and the tessellation vertex handles the
/// face was built from.
#[derive(Debug, Clone)]
pub struct InterfaceFaceData {
    pub region: i32,
    pub opposite_region: i32,
    pub tess_vertices: [usize; 3],
}

impl Default for InterfaceFaceData {
    fn default() -> Self {
        Self {
            region: 0,
            opposite_region: 0,
            tess_vertices: [usize::MAX; 3],
        }
    }
}

pub type Mesh = HalfEdgeMesh<InterfaceVertexData, InterfaceEdgeData, InterfaceFaceData>;

/// Renderable copy of the defect surface: indexed triangles with
/// accumulated vertex normals and per-face region tags.
#[derive(Debug, Clone, Default)]
pub struct DefectMesh {
    pub vertices: Vec<Point3<f64>>,
    pub normals: Vec<Vector3<f64>>,
    pub faces: Vec<[u32; 3]>,
    pub face_regions: Vec<i32>,
}

/// Half-edge mesh of the crystal/defect interface with lattice vectors on
/// its edges.
pub struct InterfaceMesh {
    pub mesh: Mesh,
    /// Region shared by every cell, when the tessellation is space
    /// filling: -1 mixed, 0 empty default, otherwise the region id.
    pub space_filling_region: i32,
    pub is_closed: bool,
    /// In two-sided mode, pairs of half-edges associating the inner
    /// manifold with its mirror on the opposite side of each facet.
    pub manifold_links: Vec<(EdgeIdx, EdgeIdx)>,
}

impl InterfaceMesh {
    /// Builds the interface mesh between differently-classified regions
    /// of the tessellation. `alpha` is the solidity threshold (the
    /// maximum observed neighbor distance).
    pub fn build(
        tessellation: &mut DelaunayTessellation,
        analysis: &StructureAnalysis,
        alpha: f64,
    ) -> InterfaceMesh {
        Self::build_with_options(tessellation, analysis, alpha, false)
    }

    /// Two-sided variant: every interface facet also materializes its
    /// mirror face in the opposite region, and the two manifolds are
    /// associated edge by edge (used when meshing the interiors of
    /// planar faults).
    pub fn build_with_options(
        tessellation: &mut DelaunayTessellation,
        analysis: &StructureAnalysis,
        alpha: f64,
        two_sided: bool,
    ) -> InterfaceMesh {
        let space_filling_region = classify_tetrahedra(tessellation, analysis, alpha);
        let mut builder = MeshBuilder::new(analysis);
        builder.create_interface_facets(tessellation);
        let mut is_closed = builder.link_halfedges(tessellation);
        let mut manifold_links = Vec::new();
        if two_sided {
            manifold_links = builder.create_mirror_manifold();
            // The mirror faces pair among themselves; any leftover open
            // edge means the outer manifold is not closed either.
            is_closed = builder.mesh.connect_opposite_halfedges() && is_closed;
        }
        let mut result = InterfaceMesh {
            mesh: builder.mesh,
            space_filling_region,
            is_closed,
            manifold_links,
        };
        result.assign_ideal_vectors(analysis);
        debug!(
            "interface mesh: {} vertices, {} faces, closed = {}",
            result.mesh.vertex_count(),
            result.mesh.face_count(),
            result.is_closed
        );
        result
    }

    /// Sum of the three edge lattice vectors around a face; `None` when
    /// any edge is defective. A non-zero sum marks a Burgers circuit seed.
    pub fn face_circuit_sum(&self, face: FaceIdx) -> Option<Vector3<f64>> {
        let mut sum = Vector3::zeros();
        for e in self.mesh.face_edges(face) {
            sum += self.mesh.edge(e).data.lattice_vector?;
        }
        Some(sum)
    }

    /// Extracts the renderable defect mesh: vertex normals accumulated
    /// from face normals, then `smoothing_level` rounds of Laplacian
    /// smoothing with periodic wrapping.
    pub fn to_defect_mesh(
        &self,
        analysis: &StructureAnalysis,
        smoothing_level: usize,
    ) -> DefectMesh {
        let mesh = &self.mesh;
        let cell = &analysis.cell;
        let mut defect = DefectMesh {
            vertices: mesh.vertices().map(|v| mesh.vertex(v).pos).collect(),
            normals: vec![Vector3::zeros(); mesh.vertex_count()],
            faces: Vec::with_capacity(mesh.face_count()),
            face_regions: Vec::with_capacity(mesh.face_count()),
        };
        for f in mesh.faces() {
            let edges = mesh.face_edges(f);
            if edges.len() != 3 {
                continue;
            }
            let vs = [
                mesh.vertex1(edges[0]).index() as u32,
                mesh.edge(edges[0]).vertex2.index() as u32,
                mesh.edge(edges[1]).vertex2.index() as u32,
            ];
            defect.faces.push(vs);
            defect.face_regions.push(mesh.face(f).data.region);
        }

        // Laplacian smoothing in minimum-image space.
        let mut adjacency: Vec<Vec<u32>> = vec![Vec::new(); defect.vertices.len()];
        for face in &defect.faces {
            for i in 0..3 {
                let a = face[i];
                let b = face[(i + 1) % 3];
                if !adjacency[a as usize].contains(&b) {
                    adjacency[a as usize].push(b);
                }
                if !adjacency[b as usize].contains(&a) {
                    adjacency[b as usize].push(a);
                }
            }
        }
        for _ in 0..smoothing_level {
            let snapshot = defect.vertices.clone();
            for (v, neighbors) in adjacency.iter().enumerate() {
                if neighbors.is_empty() {
                    continue;
                }
                let mut shift = Vector3::zeros();
                for &n in neighbors {
                    shift += cell.wrap_vector(&(snapshot[n as usize] - snapshot[v]));
                }
                defect.vertices[v] += shift * (0.5 / neighbors.len() as f64);
            }
        }

        // Vertex normals from smoothed face normals.
        for face in &defect.faces {
            let p0 = defect.vertices[face[0] as usize];
            let e1 = cell.wrap_vector(&(defect.vertices[face[1] as usize] - p0));
            let e2 = cell.wrap_vector(&(defect.vertices[face[2] as usize] - p0));
            let n = e1.cross(&e2);
            if n.norm_squared() > 0.0 {
                let n = n.normalize();
                for &v in face {
                    defect.normals[v as usize] += n;
                }
            }
        }
        for n in &mut defect.normals {
            let len = n.norm();
            if len > 0.0 {
                *n /= len;
            }
        }
        defect
    }

    /// Assigns the ideal lattice vector of every half-edge in the frame
    /// of its face's region cluster. Edges spanning unrelated clusters
    /// stay defective.
    fn assign_ideal_vectors(&mut self, analysis: &StructureAnalysis) {
        let edges: Vec<EdgeIdx> = self.mesh.edges().collect();
        for e in edges {
            let face = self.mesh.edge(e).face;
            let region = self.mesh.face(face).data.region;
            let a = self.mesh.vertex(self.mesh.vertex1(e)).data.atom;
            let b = self.mesh.vertex(self.mesh.edge(e).vertex2).data.atom;
            let vector = ideal_bond_vector(analysis, a, b, region);
            self.mesh.edge_mut(e).data.lattice_vector = vector;
        }
    }
}

/// Ideal lattice vector of the bond `a -> b` expressed in the frame of
/// cluster `region`, concatenating cluster transitions when the bond's
/// native frame differs.
fn ideal_bond_vector(
    analysis: &StructureAnalysis,
    a: usize,
    b: usize,
    region: i32,
) -> Option<Vector3<f64>> {
    let cluster_a = analysis.atom_clusters.get(a);
    let cluster_b = analysis.atom_clusters.get(b);

    // Prefer the endpoint whose own template covers the bond.
    if cluster_a != 0 {
        let slot = analysis.find_neighbor(a, b);
        if slot >= 0 && (slot as usize) < analysis.structure_of(a).coordination_number() {
            let v = analysis.neighbor_lattice_vector(a, slot as usize);
            return transform_between_frames(&analysis.cluster_graph, cluster_a, region, &v);
        }
    }
    if cluster_b != 0 {
        let slot = analysis.find_neighbor(b, a);
        if slot >= 0 && (slot as usize) < analysis.structure_of(b).coordination_number() {
            let v = -analysis.neighbor_lattice_vector(b, slot as usize);
            return transform_between_frames(&analysis.cluster_graph, cluster_b, region, &v);
        }
    }
    None
}

/// Transforms a lattice vector from one cluster frame into another,
/// either directly or through the parent-grain transitions.
fn transform_between_frames(
    graph: &ClusterGraph,
    from: i32,
    to: i32,
    v: &Vector3<f64>,
) -> Option<Vector3<f64>> {
    if from == to {
        return Some(*v);
    }
    if let Some(t) = graph.find_transition(from, to) {
        return Some(graph.transition(t).tm * v);
    }
    // Both clusters may hang off the same super-grain root.
    let root_of = |c: i32| -> Option<(i32, Matrix3<f64>)> {
        match graph.cluster(c).parent_transition {
            Some(t) => Some((graph.transition(t).cluster2, graph.transition(t).tm)),
            None => Some((c, Matrix3::identity())),
        }
    };
    let (root_from, tm_from) = root_of(from)?;
    let (root_to, tm_to) = root_of(to)?;
    if root_from != root_to {
        return None;
    }
    // from-frame -> root-frame -> to-frame.
    Some(tm_to.transpose() * tm_from * v)
}

/// Classifies each tetrahedron as solid or empty (alpha test with sliver
/// rescue), assigns its region and builds the compact solid-cell index.
/// Returns the space-filling region.
fn classify_tetrahedra(
    tessellation: &mut DelaunayTessellation,
    analysis: &StructureAnalysis,
    alpha: f64,
) -> i32 {
    let cells: Vec<CellHandle> = tessellation.cells().collect();

    let classified: Vec<(CellHandle, i32)> = cells
        .par_iter()
        .map(|&cell| {
            let mut filled = false;
            if tessellation.is_valid_cell(cell) {
                match tessellation.alpha_test(cell, alpha) {
                    Some(result) => filled = result,
                    None => {
                        // Sliver rescue: solid unless some neighbor is
                        // definitively empty.
                        filled = (0..4).all(|f| {
                            let (neighbor, _) = tessellation.mirror_facet(cell, f);
                            tessellation.is_valid_cell(neighbor)
                                && tessellation
                                    .alpha_test(neighbor, alpha)
                                    .unwrap_or(true)
                        });
                    }
                }
            }
            let region = if filled {
                majority_cluster(tessellation, analysis, cell)
            } else {
                0
            };
            (cell, region)
        })
        .collect();

    let mut space_filling = -2;
    for &(cell, region) in &classified {
        tessellation.set_region(cell, region);
        if !tessellation.is_ghost_cell(cell) {
            if space_filling == -2 {
                space_filling = region;
            } else if space_filling != region {
                space_filling = -1;
            }
        }
    }

    // Compact index over solid non-ghost cells.
    let mut index = 0;
    for &(cell, region) in &classified {
        if region != 0 && !tessellation.is_ghost_cell(cell) {
            tessellation.set_cell_index(cell, index);
            index += 1;
        } else {
            tessellation.set_cell_index(cell, -1);
        }
    }

    if space_filling == -2 {
        space_filling = 0;
    }
    space_filling
}

/// Region of a solid cell: the cluster id held by the majority of its
/// four vertices, ties resolved toward the smaller id (0 is the defect
/// region).
fn majority_cluster(
    tessellation: &DelaunayTessellation,
    analysis: &StructureAnalysis,
    cell: CellHandle,
) -> i32 {
    let mut ids = [0i32; 4];
    for v in 0..4 {
        let atom = tessellation.vertex_atom(tessellation.cell_vertex(cell, v));
        ids[v] = analysis.atom_clusters.get(atom);
    }
    let mut best = ids[0];
    let mut best_count = 0;
    for &candidate in &ids {
        let count = ids.iter().filter(|&&x| x == candidate).count();
        if count > best_count || (count == best_count && candidate < best) {
            best = candidate;
            best_count = count;
        }
    }
    best
}

struct MeshBuilder<'a> {
    analysis: &'a StructureAnalysis,
    mesh: Mesh,
    /// Per-atom mesh vertex slot (write-once deduplication).
    vertex_map: Vec<Option<VertexIdx>>,
    /// Interface faces of each indexed solid cell, by facet.
    tetrahedra_face_list: Vec<[Option<FaceIdx>; 4]>,
    /// Cyclically normalized atom triple -> face, for faces reached
    /// through ghost cells.
    face_lookup: std::collections::HashMap<[usize; 3], FaceIdx>,
}

impl<'a> MeshBuilder<'a> {
    fn new(analysis: &'a StructureAnalysis) -> Self {
        Self {
            analysis,
            mesh: Mesh::new(),
            vertex_map: vec![None; analysis.atom_count()],
            tetrahedra_face_list: Vec::new(),
            face_lookup: std::collections::HashMap::new(),
        }
    }

    fn mesh_vertex(&mut self, atom: usize) -> VertexIdx {
        if let Some(v) = self.vertex_map[atom] {
            return v;
        }
        let pos = self
            .analysis
            .positions
            .as_ref()
            .expect("positions alive during mesh construction")
            .point3(atom);
        let v = self.mesh.create_vertex(
            pos,
            InterfaceVertexData {
                atom,
                cluster: self.analysis.atom_clusters.get(atom),
            },
        );
        self.vertex_map[atom] = Some(v);
        v
    }

    /// Creates one mesh face per solid-cell facet whose mirror neighbor
    /// has a different region, winding outward from the solid region.
    fn create_interface_facets(&mut self, tessellation: &DelaunayTessellation) {
        let solid_count = tessellation
            .cells()
            .filter(|&c| tessellation.cell_index(c) != -1)
            .count();
        self.tetrahedra_face_list = vec![[None; 4]; solid_count];

        for cell in tessellation.cells() {
            let internal = tessellation.cell_index(cell);
            if internal == -1 {
                continue;
            }
            let region = tessellation.region(cell);
            for f in 0..4 {
                let (adjacent, _) = tessellation.mirror_facet(cell, f);
                if tessellation.region(adjacent) == region {
                    continue;
                }
                let mut handles = [0usize; 3];
                let mut atoms = [0usize; 3];
                let mut vertices = [VertexIdx(0); 3];
                for v in 0..3 {
                    let handle = tessellation
                        .cell_vertex(cell, DelaunayTessellation::cell_facet_vertex_index(f, v));
                    handles[v] = handle;
                    atoms[v] = tessellation.vertex_atom(handle);
                    vertices[v] = self.mesh_vertex(atoms[v]);
                }
                let face = self.mesh.create_face(&vertices);
                self.mesh.face_mut(face).data = InterfaceFaceData {
                    region,
                    opposite_region: tessellation.region(adjacent),
                    tess_vertices: handles,
                };
                self.face_lookup.insert(normalized_triple(atoms), face);
                self.tetrahedra_face_list[internal as usize][f] = Some(face);
            }
        }
    }

    /// Links each half-edge to its opposite by rotating around the edge
    /// through same-region cells until the surface continues.
    fn link_halfedges(&mut self, tessellation: &DelaunayTessellation) -> bool {
        let mut closed = true;
        for cell in tessellation.cells() {
            let internal = tessellation.cell_index(cell);
            if internal == -1 {
                continue;
            }
            for f in 0..4 {
                let Some(face) = self.tetrahedra_face_list[internal as usize][f] else {
                    continue;
                };
                let edges = self.mesh.face_edges(face);
                let handles = self.mesh.face(face).data.tess_vertices;
                for (k, &edge) in edges.iter().enumerate() {
                    if self.mesh.edge(edge).opposite.is_some() {
                        continue;
                    }
                    let a = handles[k];
                    let b = handles[(k + 1) % 3];
                    match self.find_adjacent_face(tessellation, cell, f, a, b) {
                        Some(opposite_face) => {
                            let v1 = self.mesh.vertex1(edge);
                            let v2 = self.mesh.edge(edge).vertex2;
                            match self.mesh.find_face_edge(opposite_face, v2, v1) {
                                Some(opposite_edge)
                                    if self.mesh.edge(opposite_edge).opposite.is_none() =>
                                {
                                    self.mesh.link_opposite(edge, opposite_edge);
                                }
                                _ => closed = false,
                            }
                        }
                        None => closed = false,
                    }
                }
            }
        }
        closed
    }

    /// Rotates around edge (a, b) away from facet `f` through cells of
    /// the same region; the surface continues on the facet facing the
    /// first different-region cell.
    fn find_adjacent_face(
        &self,
        tessellation: &DelaunayTessellation,
        start_cell: CellHandle,
        start_facet: usize,
        a: usize,
        b: usize,
    ) -> Option<FaceIdx> {
        let region = tessellation.region(start_cell);
        let mut cell = start_cell;
        let mut exclude = start_facet;
        for _ in 0..tessellation.cell_count() {
            let facet = tessellation.other_facet_containing_edge(cell, exclude, a, b)?;
            let (neighbor, back) = tessellation.mirror_facet(cell, facet);
            if tessellation.region(neighbor) != region {
                return self.find_cell_face(tessellation, cell, facet);
            }
            cell = neighbor;
            exclude = back;
        }
        None
    }

    /// Materializes the mirror of every interface face with reversed
    /// winding and the adjacent cell's region, returning the edge pairs
    /// that associate the two manifolds: each inner half-edge is paired
    /// with the mirror edge starting at its terminal vertex.
    fn create_mirror_manifold(&mut self) -> Vec<(EdgeIdx, EdgeIdx)> {
        let mut links = Vec::new();
        let inner_faces: Vec<FaceIdx> = self.mesh.faces().collect();
        for face in inner_faces {
            let edges = self.mesh.face_edges(face);
            if edges.len() != 3 {
                continue;
            }
            let data = self.mesh.face(face).data.clone();
            let handles = data.tess_vertices;
            let vertices: Vec<VertexIdx> = edges
                .iter()
                .map(|&e| self.mesh.vertex1(e))
                .collect();
            let reversed: Vec<VertexIdx> = vertices.iter().rev().copied().collect();
            let mirror = self.mesh.create_face(&reversed);
            self.mesh.face_mut(mirror).data = InterfaceFaceData {
                region: data.opposite_region,
                opposite_region: data.region,
                tess_vertices: [handles[2], handles[1], handles[0]],
            };
            let mirror_edges = self.mesh.face_edges(mirror);
            for &edge in &edges {
                let end = self.mesh.edge(edge).vertex2;
                if let Some(&partner) = mirror_edges
                    .iter()
                    .find(|&&m| self.mesh.vertex1(m) == end)
                {
                    links.push((edge, partner));
                }
            }
        }
        links
    }

    /// Face stored for (cell, facet): directly for indexed cells, by atom
    /// triple for ghost copies of solid cells.
    fn find_cell_face(
        &self,
        tessellation: &DelaunayTessellation,
        cell: CellHandle,
        facet: usize,
    ) -> Option<FaceIdx> {
        let internal = tessellation.cell_index(cell);
        if internal != -1 {
            return self.tetrahedra_face_list[internal as usize][facet];
        }
        let mut atoms = [0usize; 3];
        for v in 0..3 {
            let handle = tessellation
                .cell_vertex(cell, DelaunayTessellation::cell_facet_vertex_index(facet, v));
            atoms[v] = tessellation.vertex_atom(handle);
        }
        self.face_lookup.get(&normalized_triple(atoms)).copied()
    }
}

/// Rotates the triple so its smallest element comes first, preserving the
/// cyclic (winding) order.
fn normalized_triple(mut triple: [usize; 3]) -> [usize; 3] {
    let min_pos = triple
        .iter()
        .enumerate()
        .min_by_key(|(_, &v)| v)
        .map(|(i, _)| i)
        .unwrap_or(0);
    triple.rotate_left(min_pos);
    triple
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_triple_preserves_cycle() {
        assert_eq!(normalized_triple([5, 2, 9]), [2, 9, 5]);
        assert_eq!(normalized_triple([1, 2, 3]), [1, 2, 3]);
        assert_eq!(normalized_triple([3, 1, 2]), [1, 2, 3]);
    }
}
