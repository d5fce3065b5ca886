use nalgebra::Point3;

/// Index newtypes for the mesh arenas. The arenas are append-only during
/// construction, so indices stay stable without generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexIdx(pub u32);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeIdx(pub u32);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaceIdx(pub u32);

impl VertexIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
impl EdgeIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
impl FaceIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct Vertex<V> {
    pub pos: Point3<f64>,
    /// Head of the intrusive list of outgoing half-edges.
    pub first_edge: Option<EdgeIdx>,
    pub num_edges: usize,
    pub data: V,
}

#[derive(Debug, Clone)]
pub struct HalfEdge<E> {
    pub opposite: Option<EdgeIdx>,
    /// Terminal vertex.
    pub vertex2: VertexIdx,
    pub face: FaceIdx,
    pub next_face_edge: EdgeIdx,
    pub prev_face_edge: EdgeIdx,
    pub next_vertex_edge: Option<EdgeIdx>,
    pub data: E,
}

#[derive(Debug, Clone)]
pub struct Face<F> {
    pub first_edge: Option<EdgeIdx>,
    pub data: F,
}

/// Half-edge triangle mesh in struct-of-arrays form. Payload types carry
/// the per-element extensions (lattice vectors, flags, circuit pointers).
#[derive(Debug, Default)]
pub struct HalfEdgeMesh<V, E, F> {
    vertices: Vec<Vertex<V>>,
    edges: Vec<HalfEdge<E>>,
    faces: Vec<Face<F>>,
}

impl<V, E, F> HalfEdgeMesh<V, E, F>
where
    E: Default,
    F: Default,
{
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            edges: Vec::new(),
            faces: Vec::new(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn vertex(&self, v: VertexIdx) -> &Vertex<V> {
        &self.vertices[v.index()]
    }

    pub fn vertex_mut(&mut self, v: VertexIdx) -> &mut Vertex<V> {
        &mut self.vertices[v.index()]
    }

    pub fn edge(&self, e: EdgeIdx) -> &HalfEdge<E> {
        &self.edges[e.index()]
    }

    pub fn edge_mut(&mut self, e: EdgeIdx) -> &mut HalfEdge<E> {
        &mut self.edges[e.index()]
    }

    pub fn face(&self, f: FaceIdx) -> &Face<F> {
        &self.faces[f.index()]
    }

    pub fn face_mut(&mut self, f: FaceIdx) -> &mut Face<F> {
        &mut self.faces[f.index()]
    }

    pub fn vertices(&self) -> impl Iterator<Item = VertexIdx> {
        (0..self.vertices.len()).map(|i| VertexIdx(i as u32))
    }

    pub fn edges(&self) -> impl Iterator<Item = EdgeIdx> {
        (0..self.edges.len()).map(|i| EdgeIdx(i as u32))
    }

    pub fn faces(&self) -> impl Iterator<Item = FaceIdx> {
        (0..self.faces.len()).map(|i| FaceIdx(i as u32))
    }

    /// Origin vertex of a half-edge (terminal vertex of its predecessor).
    pub fn vertex1(&self, e: EdgeIdx) -> VertexIdx {
        let prev = self.edge(e).prev_face_edge;
        self.edge(prev).vertex2
    }

    pub fn create_vertex(&mut self, pos: Point3<f64>, data: V) -> VertexIdx {
        let idx = VertexIdx(self.vertices.len() as u32);
        self.vertices.push(Vertex {
            pos,
            first_edge: None,
            num_edges: 0,
            data,
        });
        idx
    }

    /// Creates a face from a cyclic vertex list, materializing one
    /// half-edge per consecutive pair.
    pub fn create_face(&mut self, vertices: &[VertexIdx]) -> FaceIdx {
        debug_assert!(vertices.len() >= 3);
        let face = FaceIdx(self.faces.len() as u32);
        self.faces.push(Face {
            first_edge: None,
            data: F::default(),
        });
        for i in 0..vertices.len() {
            let v1 = vertices[i];
            let v2 = vertices[(i + 1) % vertices.len()];
            self.create_edge(v1, v2, face);
        }
        face
    }

    /// Appends a half-edge `v1 -> v2` to the face's cyclic edge list.
    pub fn create_edge(&mut self, v1: VertexIdx, v2: VertexIdx, face: FaceIdx) -> EdgeIdx {
        let edge = EdgeIdx(self.edges.len() as u32);
        self.edges.push(HalfEdge {
            opposite: None,
            vertex2: v2,
            face,
            next_face_edge: edge,
            prev_face_edge: edge,
            next_vertex_edge: self.vertices[v1.index()].first_edge,
            data: E::default(),
        });
        self.vertices[v1.index()].first_edge = Some(edge);
        self.vertices[v1.index()].num_edges += 1;

        if let Some(first) = self.faces[face.index()].first_edge {
            let last = self.edges[first.index()].prev_face_edge;
            self.edges[edge.index()].next_face_edge = first;
            self.edges[edge.index()].prev_face_edge = last;
            self.edges[last.index()].next_face_edge = edge;
            self.edges[first.index()].prev_face_edge = edge;
        } else {
            self.faces[face.index()].first_edge = Some(edge);
        }
        edge
    }

    /// Pairs two half-edges as opposites. Both must be unpaired.
    pub fn link_opposite(&mut self, a: EdgeIdx, b: EdgeIdx) {
        debug_assert!(self.edge(a).opposite.is_none());
        debug_assert!(self.edge(b).opposite.is_none());
        self.edges[a.index()].opposite = Some(b);
        self.edges[b.index()].opposite = Some(a);
    }

    /// Outgoing half-edges of a vertex.
    pub fn vertex_edges(&self, v: VertexIdx) -> VertexEdgeIter<'_, V, E, F> {
        VertexEdgeIter {
            mesh: self,
            next: self.vertex(v).first_edge,
        }
    }

    /// The three (or more) half-edges of a face in cyclic order.
    pub fn face_edges(&self, f: FaceIdx) -> Vec<EdgeIdx> {
        let mut result = Vec::with_capacity(3);
        let Some(first) = self.face(f).first_edge else {
            return result;
        };
        let mut e = first;
        loop {
            result.push(e);
            e = self.edge(e).next_face_edge;
            if e == first {
                break;
            }
        }
        result
    }

    /// Searches a face for the half-edge `v1 -> v2`.
    pub fn find_face_edge(&self, f: FaceIdx, v1: VertexIdx, v2: VertexIdx) -> Option<EdgeIdx> {
        self.face_edges(f)
            .into_iter()
            .find(|&e| self.vertex1(e) == v1 && self.edge(e).vertex2 == v2)
    }

    /// Pairs up all unpaired half-edges globally; returns whether the
    /// mesh came out closed.
    pub fn connect_opposite_halfedges(&mut self) -> bool {
        let mut closed = true;
        for v1 in 0..self.vertices.len() {
            let v1 = VertexIdx(v1 as u32);
            let outgoing: Vec<EdgeIdx> = self.vertex_edges(v1).collect();
            for e in outgoing {
                if self.edge(e).opposite.is_some() {
                    continue;
                }
                let v2 = self.edge(e).vertex2;
                let candidates: Vec<EdgeIdx> = self.vertex_edges(v2).collect();
                let mut found = false;
                for oe in candidates {
                    if self.edge(oe).opposite.is_none() && self.edge(oe).vertex2 == v1 {
                        self.link_opposite(e, oe);
                        found = true;
                        break;
                    }
                }
                if !found {
                    closed = false;
                }
            }
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.edges.iter().all(|e| e.opposite.is_some())
    }
}

pub struct VertexEdgeIter<'a, V, E, F> {
    mesh: &'a HalfEdgeMesh<V, E, F>,
    next: Option<EdgeIdx>,
}

impl<'a, V, E, F> Iterator for VertexEdgeIter<'a, V, E, F> {
    type Item = EdgeIdx;

    fn next(&mut self) -> Option<EdgeIdx> {
        let current = self.next?;
        self.next = self.mesh.edges[current.index()].next_vertex_edge;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Mesh = HalfEdgeMesh<(), (), ()>;

    #[test]
    fn face_edges_form_a_cycle() {
        let mut mesh = Mesh::new();
        let a = mesh.create_vertex(Point3::new(0.0, 0.0, 0.0), ());
        let b = mesh.create_vertex(Point3::new(1.0, 0.0, 0.0), ());
        let c = mesh.create_vertex(Point3::new(0.0, 1.0, 0.0), ());
        let f = mesh.create_face(&[a, b, c]);
        let edges = mesh.face_edges(f);
        assert_eq!(edges.len(), 3);
        for &e in &edges {
            let next = mesh.edge(e).next_face_edge;
            assert_eq!(mesh.edge(next).prev_face_edge, e);
            assert_eq!(mesh.vertex1(next), mesh.edge(e).vertex2);
        }
    }

    #[test]
    fn tetrahedron_surface_closes() {
        let mut mesh = Mesh::new();
        let v: Vec<VertexIdx> = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ]
        .iter()
        .map(|p| mesh.create_vertex(Point3::new(p[0], p[1], p[2]), ()))
        .collect();
        // Four faces with consistent outward winding.
        mesh.create_face(&[v[0], v[2], v[1]]);
        mesh.create_face(&[v[0], v[1], v[3]]);
        mesh.create_face(&[v[1], v[2], v[3]]);
        mesh.create_face(&[v[2], v[0], v[3]]);
        assert!(mesh.connect_opposite_halfedges());
        assert!(mesh.is_closed());
        for e in mesh.edges() {
            let o = mesh.edge(e).opposite.unwrap();
            assert_eq!(mesh.edge(o).opposite, Some(e));
            assert_eq!(mesh.vertex1(e), mesh.edge(o).vertex2);
            assert_eq!(mesh.edge(e).vertex2, mesh.vertex1(o));
        }
    }

    #[test]
    fn open_fan_reports_not_closed() {
        let mut mesh = Mesh::new();
        let a = mesh.create_vertex(Point3::new(0.0, 0.0, 0.0), ());
        let b = mesh.create_vertex(Point3::new(1.0, 0.0, 0.0), ());
        let c = mesh.create_vertex(Point3::new(0.0, 1.0, 0.0), ());
        mesh.create_face(&[a, b, c]);
        assert!(!mesh.connect_opposite_halfedges());
        assert!(!mesh.is_closed());
    }
}
