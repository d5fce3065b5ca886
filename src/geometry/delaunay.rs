use log::debug;
use nalgebra::{Matrix3, Point3, Vector3};

use crate::core::cell::SimulationCell;
use crate::core::property::FloatProperty;

/// Index of a tessellation vertex (an atom or one of its ghost images).
pub type VertexHandle = usize;
/// Index of a tetrahedral cell.
pub type CellHandle = usize;

/// Facet-to-vertex table: facet `f` is opposite local vertex `f`; its
/// three vertices are listed with the outward winding of a positively
/// oriented tetrahedron (the opposite vertex lies on the negative side).
const FACET_VERTICES: [[usize; 3]; 4] = [[1, 2, 3], [2, 0, 3], [3, 0, 1], [0, 2, 1]];

#[derive(Debug, Clone)]
struct TessellationVertex {
    pos: Point3<f64>,
    /// Source atom index; `usize::MAX` for the enclosing super vertices.
    atom: usize,
    is_ghost: bool,
}

#[derive(Debug, Clone)]
struct Cell {
    verts: [usize; 4],
    /// Adjacent cell across the facet opposite each vertex; `usize::MAX`
    /// when the facet lies on the hull.
    adj: [usize; 4],
    alive: bool,
    /// Caller-set region id.
    region: i32,
    /// Compact index over valid non-ghost solid cells, -1 otherwise.
    cell_index: i32,
}

const NO_CELL: usize = usize::MAX;

/// Incremental Bowyer-Watson Delaunay tessellation over atom positions
/// plus ghost images within a configurable layer across each periodic
/// boundary.
pub struct DelaunayTessellation {
    vertices: Vec<TessellationVertex>,
    cells: Vec<Cell>,
    num_primary_vertices: usize,
}

impl DelaunayTessellation {
    /// Tessellates the given positions. `ghost_layer` is the thickness of
    /// the periodic image slab (absolute units).
    pub fn generate(
        positions: &FloatProperty,
        cell: &SimulationCell,
        ghost_layer: f64,
    ) -> Option<DelaunayTessellation> {
        let n = positions.len();
        if n == 0 {
            return None;
        }

        let mut vertices = Vec::with_capacity(n * 2);
        for i in 0..n {
            let p = cell.wrap_point(&positions.point3(i));
            vertices.push(TessellationVertex {
                pos: p,
                atom: i,
                is_ghost: false,
            });
        }

        // Ghost images: every non-zero shift over the periodic axes whose
        // shifted copy falls within the ghost slab around the cell.
        let pbc = cell.pbc_flags();
        let reduced_margin = Vector3::new(
            ghost_layer * cell.inverse_matrix().row(0).norm(),
            ghost_layer * cell.inverse_matrix().row(1).norm(),
            ghost_layer * cell.inverse_matrix().row(2).norm(),
        );
        let range = |dim: usize| if pbc[dim] { -1..=1 } else { 0..=0 };
        for sx in range(0) {
            for sy in range(1) {
                for sz in range(2) {
                    if sx == 0 && sy == 0 && sz == 0 {
                        continue;
                    }
                    let shift =
                        cell.matrix() * Vector3::new(sx as f64, sy as f64, sz as f64);
                    for i in 0..n {
                        let p = vertices[i].pos + shift;
                        let rp = cell.absolute_to_reduced_point(&p);
                        let inside = (0..3).all(|dim| {
                            rp[dim] >= -reduced_margin[dim] && rp[dim] <= 1.0 + reduced_margin[dim]
                        });
                        if inside {
                            vertices.push(TessellationVertex {
                                pos: p,
                                atom: i,
                                is_ghost: true,
                            });
                        }
                    }
                }
            }
        }

        let mut tessellation = DelaunayTessellation {
            vertices,
            cells: Vec::new(),
            num_primary_vertices: n,
        };
        tessellation.triangulate(ghost_layer)?;
        debug!(
            "tessellation: {} vertices ({} ghosts), {} cells",
            tessellation.vertices.len(),
            tessellation.vertices.len() - n,
            tessellation.cells.iter().filter(|c| c.alive).count()
        );
        Some(tessellation)
    }

    // ------------------------------------------------------------------
    // Accessors used by the manifold constructor
    // ------------------------------------------------------------------

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> impl Iterator<Item = CellHandle> + '_ {
        (0..self.cells.len()).filter(move |&c| self.cells[c].alive)
    }

    /// A cell is valid when it is alive and touches no super vertex.
    pub fn is_valid_cell(&self, cell: CellHandle) -> bool {
        cell != NO_CELL
            && self.cells[cell].alive
            && self.cells[cell]
                .verts
                .iter()
                .all(|&v| self.vertices[v].atom != usize::MAX)
    }

    /// A cell is a ghost when the vertex with the smallest source atom
    /// index is itself a ghost copy; each physical tetrahedron then has
    /// exactly one non-ghost representative.
    pub fn is_ghost_cell(&self, cell: CellHandle) -> bool {
        if !self.is_valid_cell(cell) {
            return true;
        }
        let min_vertex = self.cells[cell]
            .verts
            .iter()
            .min_by_key(|&&v| self.vertices[v].atom)
            .copied()
            .expect("cells have four vertices");
        self.vertices[min_vertex].is_ghost
    }

    pub fn cell_vertex(&self, cell: CellHandle, local: usize) -> VertexHandle {
        self.cells[cell].verts[local]
    }

    pub fn vertex_atom(&self, vertex: VertexHandle) -> usize {
        self.vertices[vertex].atom
    }

    pub fn vertex_is_ghost(&self, vertex: VertexHandle) -> bool {
        self.vertices[vertex].is_ghost
    }

    pub fn vertex_pos(&self, vertex: VertexHandle) -> Point3<f64> {
        self.vertices[vertex].pos
    }

    pub fn cell_facet_vertex_index(facet: usize, corner: usize) -> usize {
        FACET_VERTICES[facet][corner]
    }

    pub fn set_region(&mut self, cell: CellHandle, region: i32) {
        self.cells[cell].region = region;
    }

    pub fn region(&self, cell: CellHandle) -> i32 {
        if cell == NO_CELL {
            return 0;
        }
        self.cells[cell].region
    }

    pub fn set_cell_index(&mut self, cell: CellHandle, index: i32) {
        self.cells[cell].cell_index = index;
    }

    pub fn cell_index(&self, cell: CellHandle) -> i32 {
        self.cells[cell].cell_index
    }

    /// The same facet seen from the neighboring cell: returns the
    /// adjacent cell and the local facet index pointing back.
    pub fn mirror_facet(&self, cell: CellHandle, facet: usize) -> (CellHandle, usize) {
        let adjacent = self.cells[cell].adj[facet];
        if adjacent == NO_CELL {
            return (NO_CELL, 0);
        }
        let back = self.cells[adjacent]
            .adj
            .iter()
            .position(|&c| c == cell)
            .expect("adjacency is symmetric");
        (adjacent, back)
    }

    /// The facet of `cell` other than `facet` that contains both global
    /// vertices `a` and `b`.
    pub fn other_facet_containing_edge(
        &self,
        cell: CellHandle,
        facet: usize,
        a: VertexHandle,
        b: VertexHandle,
    ) -> Option<usize> {
        for f in 0..4 {
            if f == facet {
                continue;
            }
            let vs = &FACET_VERTICES[f];
            let has_a = vs.iter().any(|&v| self.cells[cell].verts[v] == a);
            let has_b = vs.iter().any(|&v| self.cells[cell].verts[v] == b);
            if has_a && has_b {
                return Some(f);
            }
        }
        None
    }

    /// Local vertex index of the global vertex `v` within `cell`.
    pub fn local_vertex_index(&self, cell: CellHandle, v: VertexHandle) -> Option<usize> {
        self.cells[cell].verts.iter().position(|&w| w == v)
    }

    /// Alpha test: is the cell's circumradius within alpha? `None` for
    /// degenerate (sliver) cells whose circumsphere is unstable.
    pub fn alpha_test(&self, cell: CellHandle, alpha: f64) -> Option<bool> {
        let p: Vec<Point3<f64>> = self.cells[cell]
            .verts
            .iter()
            .map(|&v| self.vertices[v].pos)
            .collect();
        circumradius_squared(&p[0], &p[1], &p[2], &p[3]).map(|r2| r2 <= alpha * alpha)
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    fn triangulate(&mut self, scale_hint: f64) -> Option<()> {
        // Deterministic symbolic perturbation: lattice snapshots are
        // exactly cospherical, which would make insertion cavities
        // ambiguous.
        let jitter_amplitude = (scale_hint.max(1e-3)) * 1e-7;
        let jittered: Vec<Point3<f64>> = (0..self.vertices.len())
            .map(|i| {
                let h = hash3(i as u64);
                self.vertices[i].pos
                    + Vector3::new(h.0, h.1, h.2) * jitter_amplitude
            })
            .collect();

        // Enclosing super tetrahedron.
        let mut min = jittered[0];
        let mut max = jittered[0];
        for p in &jittered {
            for d in 0..3 {
                min[d] = min[d].min(p[d]);
                max[d] = max[d].max(p[d]);
            }
        }
        let center = Point3::from((min.coords + max.coords) * 0.5);
        let size = (max - min).norm().max(1.0) * 100.0;
        let super_base = self.vertices.len();
        let super_points = [
            center + Vector3::new(size, 0.0, -size / 2.0_f64.sqrt()),
            center + Vector3::new(-size, 0.0, -size / 2.0_f64.sqrt()),
            center + Vector3::new(0.0, size, size / 2.0_f64.sqrt()),
            center + Vector3::new(0.0, -size, size / 2.0_f64.sqrt()),
        ];
        for p in super_points {
            self.vertices.push(TessellationVertex {
                pos: p,
                atom: usize::MAX,
                is_ghost: true,
            });
        }
        let mut points = jittered;
        points.extend(super_points.iter().copied());

        let mut first = [super_base, super_base + 1, super_base + 2, super_base + 3];
        if orient3d(&points[first[0]], &points[first[1]], &points[first[2]], &points[first[3]])
            < 0.0
        {
            first.swap(2, 3);
        }
        self.cells.push(Cell {
            verts: first,
            adj: [NO_CELL; 4],
            alive: true,
            region: 0,
            cell_index: -1,
        });

        let mut last_alive = 0;
        let vertex_count = super_base;
        for v in 0..vertex_count {
            last_alive = self.insert_point(v, &points, last_alive)?;
        }

        // Cells touching the super vertices stay in the arena (adjacency
        // through them yields region 0) but are not valid.
        Some(())
    }

    fn insert_point(&mut self, v: usize, points: &[Point3<f64>], hint: usize) -> Option<usize> {
        let start = self.locate(points, v, hint)?;

        // Grow the cavity of conflicting cells.
        let mut bad = vec![start];
        let mut marked = std::collections::HashSet::new();
        marked.insert(start);
        let mut stack = vec![start];
        while let Some(c) = stack.pop() {
            for f in 0..4 {
                let n = self.cells[c].adj[f];
                if n == NO_CELL || marked.contains(&n) || !self.cells[n].alive {
                    continue;
                }
                if self.in_circumsphere(n, &points[v], points) {
                    marked.insert(n);
                    bad.push(n);
                    stack.push(n);
                }
            }
        }

        // Boundary facets of the cavity.
        struct BoundaryFacet {
            verts: [usize; 3],
            outside: usize,
        }
        let mut boundary = Vec::new();
        for &c in &bad {
            for f in 0..4 {
                let n = self.cells[c].adj[f];
                if n != NO_CELL && marked.contains(&n) {
                    continue;
                }
                let vs = [
                    self.cells[c].verts[FACET_VERTICES[f][0]],
                    self.cells[c].verts[FACET_VERTICES[f][1]],
                    self.cells[c].verts[FACET_VERTICES[f][2]],
                ];
                boundary.push(BoundaryFacet { verts: vs, outside: n });
            }
        }

        for &c in &bad {
            self.cells[c].alive = false;
        }

        // One new tetrahedron per boundary facet, apex at the new vertex.
        let mut edge_map: std::collections::HashMap<(usize, usize), (usize, usize)> =
            std::collections::HashMap::new();
        let mut created = Vec::with_capacity(boundary.len());
        for facet in &boundary {
            let mut verts = [facet.verts[0], facet.verts[1], facet.verts[2], v];
            if orient3d(
                &points[verts[0]],
                &points[verts[1]],
                &points[verts[2]],
                &points[verts[3]],
            ) < 0.0
            {
                verts.swap(0, 1);
            }
            let new_cell = self.cells.len();
            self.cells.push(Cell {
                verts,
                adj: [NO_CELL; 4],
                alive: true,
                region: 0,
                cell_index: -1,
            });
            created.push(new_cell);

            // Facet opposite the apex faces the outside cell.
            self.cells[new_cell].adj[3] = facet.outside;
            if facet.outside != NO_CELL {
                // Identify the matching facet of the outside cell by
                // vertex set and point it back at the new tetrahedron.
                let back = (0..4).find(|&f| {
                    let cell_verts = &self.cells[facet.outside].verts;
                    FACET_VERTICES[f]
                        .iter()
                        .all(|&i| facet.verts.contains(&cell_verts[i]))
                });
                if let Some(back) = back {
                    self.cells[facet.outside].adj[back] = new_cell;
                }
            }

            // Internal facets pair up across shared boundary edges.
            for i in 0..3 {
                let a = verts[i];
                let b = verts[(i + 1) % 3];
                let key = (a.min(b), a.max(b));
                let local_facet = (0..4)
                    .find(|&f| {
                        let vs = &FACET_VERTICES[f];
                        let cell_verts = &self.cells[new_cell].verts;
                        vs.iter().any(|&x| cell_verts[x] == a)
                            && vs.iter().any(|&x| cell_verts[x] == b)
                            && vs.iter().any(|&x| cell_verts[x] == v)
                    })
                    .expect("internal facet contains the apex and the edge");
                if let Some(&(other_cell, other_facet)) = edge_map.get(&key) {
                    self.cells[new_cell].adj[local_facet] = other_cell;
                    self.cells[other_cell].adj[other_facet] = new_cell;
                } else {
                    edge_map.insert(key, (new_cell, local_facet));
                }
            }
        }

        created.first().copied()
    }

    /// Finds a cell whose circumsphere contains the point: directed walk
    /// with a linear-scan fallback for robustness.
    fn locate(&self, points: &[Point3<f64>], v: usize, hint: usize) -> Option<usize> {
        let p = points[v];
        let mut current = if self.cells[hint].alive {
            hint
        } else {
            (0..self.cells.len()).rev().find(|&c| self.cells[c].alive)?
        };
        let mut steps = 0;
        let max_steps = self.cells.len() * 4 + 64;
        'walk: while steps < max_steps {
            steps += 1;
            for f in 0..4 {
                let vs: Vec<Point3<f64>> = FACET_VERTICES[f]
                    .iter()
                    .map(|&i| points[self.cells[current].verts[i]])
                    .collect();
                // The facet winding faces outward; a positive volume with
                // p means p lies beyond this facet.
                if orient3d(&vs[0], &vs[1], &vs[2], &p) > 0.0 {
                    let n = self.cells[current].adj[f];
                    if n != NO_CELL && self.cells[n].alive {
                        current = n;
                        continue 'walk;
                    }
                }
            }
            // Inside (or on) this cell.
            if self.in_circumsphere(current, &p, points) {
                return Some(current);
            }
            break;
        }
        // Fallback: exhaustive conflict search.
        (0..self.cells.len())
            .rev()
            .find(|&c| self.cells[c].alive && self.in_circumsphere(c, &p, points))
    }

    fn in_circumsphere(&self, cell: usize, p: &Point3<f64>, points: &[Point3<f64>]) -> bool {
        let vs = self.cells[cell].verts;
        insphere(
            &points[vs[0]],
            &points[vs[1]],
            &points[vs[2]],
            &points[vs[3]],
            p,
        ) > 0.0
    }
}

/// Positive when `d` lies on the positive side of plane (a, b, c).
fn orient3d(a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>, d: &Point3<f64>) -> f64 {
    Matrix3::from_columns(&[b - a, c - a, d - a]).determinant()
}

/// Positive when `p` lies inside the circumsphere of the positively
/// oriented tetrahedron (a, b, c, d). With rows (q - p, |q - p|^2) the
/// raw determinant comes out negative for interior points under this
/// orientation convention, hence the sign flip.
fn insphere(
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    d: &Point3<f64>,
    p: &Point3<f64>,
) -> f64 {
    let rows: Vec<[f64; 4]> = [a, b, c, d]
        .iter()
        .map(|q| {
            let v = *q - p;
            [v.x, v.y, v.z, v.norm_squared()]
        })
        .collect();
    -det4(&rows)
}

fn det4(m: &[[f64; 4]]) -> f64 {
    let mut det = 0.0;
    for col in 0..4 {
        let mut sub = [[0.0; 3]; 3];
        for (si, row) in m.iter().skip(1).enumerate() {
            let mut sj = 0;
            for (j, &value) in row.iter().enumerate() {
                if j == col {
                    continue;
                }
                sub[si][sj] = value;
                sj += 1;
            }
        }
        let minor = sub[0][0] * (sub[1][1] * sub[2][2] - sub[1][2] * sub[2][1])
            - sub[0][1] * (sub[1][0] * sub[2][2] - sub[1][2] * sub[2][0])
            + sub[0][2] * (sub[1][0] * sub[2][1] - sub[1][1] * sub[2][0]);
        det += if col % 2 == 0 { 1.0 } else { -1.0 } * m[0][col] * minor;
    }
    det
}

/// Squared circumradius of a tetrahedron, `None` when degenerate.
fn circumradius_squared(
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    d: &Point3<f64>,
) -> Option<f64> {
    let m = Matrix3::from_rows(&[
        (b - a).transpose(),
        (c - a).transpose(),
        (d - a).transpose(),
    ]);
    let rhs = Vector3::new(
        (b - a).norm_squared() * 0.5,
        (c - a).norm_squared() * 0.5,
        (d - a).norm_squared() * 0.5,
    );
    let inverse = m.try_inverse()?;
    let offset = inverse * rhs;
    if !offset.iter().all(|x| x.is_finite()) {
        return None;
    }
    Some(offset.norm_squared())
}

fn hash3(seed: u64) -> (f64, f64, f64) {
    let mut x = seed.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(1);
    let mut next = || {
        x ^= x >> 30;
        x = x.wrapping_mul(0xBF58476D1CE4E5B9);
        x ^= x >> 27;
        x = x.wrapping_mul(0x94D049BB133111EB);
        x ^= x >> 31;
        (x as f64 / u64::MAX as f64) * 2.0 - 1.0
    };
    (next(), next(), next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tessellates_a_cube_of_points() {
        let mut rows = Vec::new();
        for x in 0..3 {
            for y in 0..3 {
                for z in 0..3 {
                    rows.push([x as f64, y as f64, z as f64]);
                }
            }
        }
        let positions = FloatProperty::from_positions(&rows);
        let cell = SimulationCell::orthorhombic(3.0, 3.0, 3.0, [false; 3]).unwrap();
        let tessellation = DelaunayTessellation::generate(&positions, &cell, 0.0).unwrap();

        // Valid cells partition the cube: total volume = 8.
        let mut volume = 0.0;
        for c in tessellation.cells() {
            if !tessellation.is_valid_cell(c) {
                continue;
            }
            let p: Vec<Point3<f64>> = (0..4)
                .map(|i| tessellation.vertex_pos(tessellation.cell_vertex(c, i)))
                .collect();
            volume += orient3d(&p[0], &p[1], &p[2], &p[3]) / 6.0;
        }
        assert!((volume - 8.0).abs() < 1e-3, "volume = {}", volume);
    }

    #[test]
    fn adjacency_is_symmetric() {
        let mut rows = Vec::new();
        for x in 0..3 {
            for y in 0..3 {
                for z in 0..3 {
                    rows.push([x as f64 * 1.1, y as f64 * 1.1, z as f64 * 1.1]);
                }
            }
        }
        let positions = FloatProperty::from_positions(&rows);
        let cell = SimulationCell::orthorhombic(3.3, 3.3, 3.3, [false; 3]).unwrap();
        let t = DelaunayTessellation::generate(&positions, &cell, 0.0).unwrap();
        for c in t.cells() {
            for f in 0..4 {
                let (n, back) = t.mirror_facet(c, f);
                if n == NO_CELL {
                    continue;
                }
                let (c2, f2) = t.mirror_facet(n, back);
                assert_eq!(c2, c);
                assert_eq!(f2, f);
            }
        }
    }

    #[test]
    fn ghost_cells_dedupe_periodic_copies() {
        let mut rows = Vec::new();
        for x in 0..4 {
            for y in 0..4 {
                for z in 0..4 {
                    rows.push([x as f64, y as f64, z as f64]);
                }
            }
        }
        let positions = FloatProperty::from_positions(&rows);
        let cell = SimulationCell::orthorhombic(4.0, 4.0, 4.0, [true; 3]).unwrap();
        let t = DelaunayTessellation::generate(&positions, &cell, 2.0).unwrap();

        // Non-ghost valid cells tile the periodic cell exactly once:
        // their volumes must sum to the cell volume.
        let mut volume = 0.0;
        for c in t.cells() {
            if !t.is_valid_cell(c) || t.is_ghost_cell(c) {
                continue;
            }
            let p: Vec<Point3<f64>> = (0..4)
                .map(|i| t.vertex_pos(t.cell_vertex(c, i)))
                .collect();
            volume += orient3d(&p[0], &p[1], &p[2], &p[3]) / 6.0;
        }
        assert!((volume - 64.0).abs() < 0.5, "volume = {}", volume);
    }

    #[test]
    fn alpha_test_accepts_compact_cells() {
        let positions = FloatProperty::from_positions(&[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ]);
        let cell = SimulationCell::orthorhombic(10.0, 10.0, 10.0, [false; 3]).unwrap();
        let t = DelaunayTessellation::generate(&positions, &cell, 0.0).unwrap();
        let valid: Vec<_> = t.cells().filter(|&c| t.is_valid_cell(c)).collect();
        assert_eq!(valid.len(), 1);
        assert_eq!(t.alpha_test(valid[0], 2.0), Some(true));
        assert_eq!(t.alpha_test(valid[0], 0.1), Some(false));
    }
}
