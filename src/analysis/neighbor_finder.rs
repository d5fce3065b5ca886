use nalgebra::{Point3, Vector3};

use crate::core::cell::{SimulationCell, EPSILON};
use crate::core::error::AnalysisError;
use crate::core::property::FloatProperty;

const BUCKET_SIZE: usize = 8;
const TREE_DEPTH_LIMIT: usize = 17;

/// A single result of a bounded-k nearest-neighbor query.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    pub index: usize,
    /// Vector from the query point to the neighbor (periodic image
    /// already applied).
    pub delta: Vector3<f64>,
    pub distance_sq: f64,
}

#[derive(Debug)]
struct TreeNode {
    bounds_min: Point3<f64>,
    bounds_max: Point3<f64>,
    /// -1 marks a leaf.
    split_dim: i8,
    split_pos: f64,
    children: [usize; 2],
    atoms: Vec<usize>,
}

impl TreeNode {
    fn leaf(bounds_min: Point3<f64>, bounds_max: Point3<f64>) -> Self {
        Self {
            bounds_min,
            bounds_max,
            split_dim: -1,
            split_pos: 0.0,
            children: [0, 0],
            atoms: Vec::new(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.split_dim < 0
    }
}

/// K-d tree over reduced coordinates answering bounded-k nearest-neighbor
/// queries across periodic images. Read-only after [`NeighborFinder::prepare`];
/// each thread runs its own [`NeighborQuery`].
#[derive(Debug)]
pub struct NeighborFinder {
    cell: SimulationCell,
    plane_normals: [Vector3<f64>; 3],
    pbc_images: Vec<Vector3<f64>>,
    nodes: Vec<TreeNode>,
    /// Atom positions wrapped back into the primary cell.
    positions: Vec<Point3<f64>>,
    /// Reduced coordinates of the wrapped positions, kept for splitting.
    reduced: Vec<Point3<f64>>,
    prepared: bool,
}

impl NeighborFinder {
    /// Builds the index. `required_cutoff` enables the cell-too-small
    /// validation: every periodic axis must leave at least twice the
    /// cutoff between its faces.
    pub fn prepare(
        positions: &FloatProperty,
        cell: &SimulationCell,
        selection: Option<&[i32]>,
        required_cutoff: Option<f64>,
    ) -> Result<Self, AnalysisError> {
        let mut cell = cell.clone();

        // 2D systems get a thin but non-degenerate Z axis and lose Z
        // periodicity.
        if cell.is_2d() {
            let [px, py, _] = cell.pbc_flags();
            cell.set_pbc_flags([px, py, false]);
            let mut m = *cell.matrix();
            m.set_column(2, &Vector3::new(0.0, 0.0, 0.01));
            cell.set_matrix(m)?;
        }

        if cell.volume() <= EPSILON {
            return Err(AnalysisError::InvalidInput(
                "simulation cell is degenerate".into(),
            ));
        }

        if let Some(cutoff) = required_cutoff {
            for dim in 0..3 {
                if !cell.pbc_flags()[dim] {
                    continue;
                }
                // Perpendicular distance between the two periodic faces.
                let width = 1.0 / cell.inverse_matrix().row(dim).norm();
                if width * 0.5 < cutoff {
                    return Err(AnalysisError::CellTooSmall {
                        axis: ['X', 'Y', 'Z'][dim],
                        half_width: width * 0.5,
                        cutoff,
                    });
                }
            }
        }

        let plane_normals = [
            cell.cell_normal_vector(0),
            cell.cell_normal_vector(1),
            cell.cell_normal_vector(2),
        ];

        // Periodic image shifts, nearest first so queries prune whole
        // images early.
        let mut pbc_images = Vec::new();
        let n: [i32; 3] = [
            cell.pbc_flags()[0] as i32,
            cell.pbc_flags()[1] as i32,
            cell.pbc_flags()[2] as i32,
        ];
        for iz in -n[2]..=n[2] {
            for iy in -n[1]..=n[1] {
                for ix in -n[0]..=n[0] {
                    pbc_images
                        .push(cell.matrix() * Vector3::new(ix as f64, iy as f64, iz as f64));
                }
            }
        }
        pbc_images.sort_by(|a, b| a.norm_squared().total_cmp(&b.norm_squared()));

        // Bounding box in reduced coordinates: the unit cube on periodic
        // axes, the atom extents on open ones.
        let mut bounds_min = Point3::<f64>::new(0.0, 0.0, 0.0);
        let mut bounds_max = Point3::<f64>::new(1.0, 1.0, 1.0);
        if !cell.pbc_flags().iter().all(|&f| f) {
            for i in 0..positions.len() {
                let rp = cell.absolute_to_reduced_point(&positions.point3(i));
                for dim in 0..3 {
                    if !cell.pbc_flags()[dim] {
                        bounds_min[dim] = bounds_min[dim].min(rp[dim]);
                        bounds_max[dim] = bounds_max[dim].max(rp[dim]);
                    }
                }
            }
        }

        let mut finder = Self {
            cell,
            plane_normals,
            pbc_images,
            nodes: vec![TreeNode::leaf(bounds_min, bounds_max)],
            positions: Vec::with_capacity(positions.len()),
            reduced: Vec::with_capacity(positions.len()),
            prepared: false,
        };

        // Wrap atoms into the primary cell, then insert.
        for i in 0..positions.len() {
            let mut pos = positions.point3(i);
            let mut rp = finder.cell.absolute_to_reduced_point(&pos);
            for dim in 0..3 {
                if finder.cell.pbc_flags()[dim] {
                    let shift = rp[dim].floor();
                    if shift != 0.0 {
                        rp[dim] -= shift;
                        pos -= shift * finder.cell.matrix().column(dim);
                    }
                }
            }
            finder.positions.push(pos);
            finder.reduced.push(rp);
        }
        for i in 0..finder.positions.len() {
            let selected = selection.map(|s| s[i] != 0).unwrap_or(true);
            if selected {
                finder.insert_atom(i, 0, 0);
            }
        }

        finder.convert_to_absolute(0);
        finder.prepared = true;
        Ok(finder)
    }

    pub fn cell(&self) -> &SimulationCell {
        &self.cell
    }

    pub fn atom_position(&self, index: usize) -> Point3<f64> {
        self.positions[index]
    }

    fn insert_atom(&mut self, atom: usize, node: usize, depth: usize) {
        let mut node = node;
        let mut depth = depth;
        loop {
            if self.nodes[node].is_leaf() {
                self.nodes[node].atoms.push(atom);
                if self.nodes[node].atoms.len() > BUCKET_SIZE && depth < TREE_DEPTH_LIMIT {
                    let dim = self.split_direction(node);
                    self.split_leaf(node, dim);
                }
                return;
            }
            let dim = self.nodes[node].split_dim as usize;
            let child = if self.reduced[atom][dim] < self.nodes[node].split_pos {
                0
            } else {
                1
            };
            node = self.nodes[node].children[child];
            depth += 1;
        }
    }

    /// Largest extent axis measured in absolute units.
    fn split_direction(&self, node: usize) -> usize {
        let n = &self.nodes[node];
        let mut dmax = 0.0;
        let mut dmax_dim = 0;
        for dim in 0..3 {
            let size = n.bounds_max[dim] - n.bounds_min[dim];
            let d = self.cell.matrix().column(dim).norm_squared() * size * size;
            if d > dmax {
                dmax = d;
                dmax_dim = dim;
            }
        }
        dmax_dim
    }

    fn split_leaf(&mut self, node: usize, split_dim: usize) {
        let split_pos =
            (self.nodes[node].bounds_min[split_dim] + self.nodes[node].bounds_max[split_dim]) * 0.5;
        let atoms = std::mem::take(&mut self.nodes[node].atoms);

        let mut lower = TreeNode::leaf(self.nodes[node].bounds_min, self.nodes[node].bounds_max);
        let mut upper = TreeNode::leaf(self.nodes[node].bounds_min, self.nodes[node].bounds_max);
        lower.bounds_max[split_dim] = split_pos;
        upper.bounds_min[split_dim] = split_pos;

        for atom in atoms {
            if self.reduced[atom][split_dim] < split_pos {
                lower.atoms.push(atom);
            } else {
                upper.atoms.push(atom);
            }
        }

        let lower_index = self.nodes.len();
        self.nodes.push(lower);
        let upper_index = self.nodes.len();
        self.nodes.push(upper);

        let n = &mut self.nodes[node];
        n.split_dim = split_dim as i8;
        n.split_pos = split_pos;
        n.children = [lower_index, upper_index];
    }

    fn convert_to_absolute(&mut self, node: usize) {
        let min = self.nodes[node].bounds_min;
        let max = self.nodes[node].bounds_max;
        self.nodes[node].bounds_min = self.cell.reduced_to_absolute_point(&min);
        self.nodes[node].bounds_max = self.cell.reduced_to_absolute_point(&max);
        if !self.nodes[node].is_leaf() {
            let [c0, c1] = self.nodes[node].children;
            self.convert_to_absolute(c0);
            self.convert_to_absolute(c1);
        }
    }

    /// Squared distance from the query point to the closest point of the
    /// node's (absolute-space) bounding box.
    fn minimum_distance(&self, node: usize, query: &Point3<f64>) -> f64 {
        let n = &self.nodes[node];
        let p1 = n.bounds_min - query;
        let p2 = query - n.bounds_max;
        let mut min_distance = 0.0;
        for dim in 0..3 {
            let t_min = self.plane_normals[dim].dot(&p1);
            if t_min > min_distance {
                min_distance = t_min;
            }
            let t_max = self.plane_normals[dim].dot(&p2);
            if t_max > min_distance {
                min_distance = t_max;
            }
        }
        min_distance * min_distance
    }
}

/// Fixed-capacity max-heap holding the current k best neighbors.
#[derive(Debug, Clone)]
struct BoundedHeap {
    items: Vec<Neighbor>,
    capacity: usize,
}

impl BoundedHeap {
    fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn full(&self) -> bool {
        self.items.len() == self.capacity
    }

    fn top_distance_sq(&self) -> f64 {
        self.items[0].distance_sq
    }

    fn insert(&mut self, n: Neighbor) {
        if !self.full() {
            self.items.push(n);
            let mut i = self.items.len() - 1;
            while i > 0 {
                let parent = (i - 1) / 2;
                if self.items[parent].distance_sq < self.items[i].distance_sq {
                    self.items.swap(parent, i);
                    i = parent;
                } else {
                    break;
                }
            }
        } else if n.distance_sq < self.items[0].distance_sq {
            self.items[0] = n;
            let mut i = 0;
            loop {
                let left = 2 * i + 1;
                let right = 2 * i + 2;
                let mut largest = i;
                if left < self.items.len()
                    && self.items[left].distance_sq > self.items[largest].distance_sq
                {
                    largest = left;
                }
                if right < self.items.len()
                    && self.items[right].distance_sq > self.items[largest].distance_sq
                {
                    largest = right;
                }
                if largest == i {
                    break;
                }
                self.items.swap(i, largest);
                i = largest;
            }
        }
    }
}

/// Query state for one thread: the bounded heap plus scratch coordinates.
pub struct NeighborQuery<'a> {
    finder: &'a NeighborFinder,
    heap: BoundedHeap,
    results: Vec<Neighbor>,
    q: Point3<f64>,
    qr: Point3<f64>,
}

impl<'a> NeighborQuery<'a> {
    pub fn new(finder: &'a NeighborFinder, k: usize) -> Self {
        assert!(finder.prepared, "neighbor finder used before prepare()");
        Self {
            finder,
            heap: BoundedHeap::new(k),
            results: Vec::with_capacity(k),
            q: Point3::origin(),
            qr: Point3::origin(),
        }
    }

    pub fn find_neighbors_of_atom(&mut self, index: usize) {
        let p = self.finder.atom_position(index);
        self.find_neighbors(&p);
    }

    /// Collects the k nearest neighbors of the query point across all
    /// periodic images, excluding exact zero distance (the query atom
    /// itself).
    pub fn find_neighbors(&mut self, point: &Point3<f64>) {
        self.heap.clear();
        for image in 0..self.finder.pbc_images.len() {
            let shift = self.finder.pbc_images[image];
            self.q = point - shift;
            if !self.heap.full()
                || self.heap.top_distance_sq() > self.finder.minimum_distance(0, &self.q)
            {
                self.qr = self.finder.cell.absolute_to_reduced_point(&self.q);
                self.visit_node(0);
            }
        }
        self.results.clear();
        self.results.extend_from_slice(&self.heap.items);
        self.results
            .sort_by(|a, b| a.distance_sq.total_cmp(&b.distance_sq));
    }

    pub fn results(&self) -> &[Neighbor] {
        &self.results
    }

    fn visit_node(&mut self, node: usize) {
        if self.finder.nodes[node].is_leaf() {
            for &atom in &self.finder.nodes[node].atoms {
                let delta = self.finder.positions[atom] - self.q;
                let distance_sq = delta.norm_squared();
                if distance_sq != 0.0 {
                    self.heap.insert(Neighbor {
                        index: atom,
                        delta,
                        distance_sq,
                    });
                }
            }
        } else {
            let dim = self.finder.nodes[node].split_dim as usize;
            let children = self.finder.nodes[node].children;
            let (near, far) = if self.qr[dim] < self.finder.nodes[node].split_pos {
                (children[0], children[1])
            } else {
                (children[1], children[0])
            };
            self.visit_node(near);
            if !self.heap.full()
                || self.heap.top_distance_sq() > self.finder.minimum_distance(far, &self.q)
            {
                self.visit_node(far);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::property::FloatProperty;

    fn simple_cubic_positions(n: usize, a: f64) -> FloatProperty {
        let mut rows = Vec::new();
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    rows.push([x as f64 * a, y as f64 * a, z as f64 * a]);
                }
            }
        }
        FloatProperty::from_positions(&rows)
    }

    #[test]
    fn finds_six_nearest_in_simple_cubic() {
        let positions = simple_cubic_positions(4, 1.0);
        let cell = SimulationCell::orthorhombic(4.0, 4.0, 4.0, [true; 3]).unwrap();
        let finder = NeighborFinder::prepare(&positions, &cell, None, None).unwrap();
        let mut query = NeighborQuery::new(&finder, 6);
        query.find_neighbors_of_atom(0);
        assert_eq!(query.results().len(), 6);
        for n in query.results() {
            assert!((n.distance_sq - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn periodic_images_are_visible_across_the_boundary() {
        let positions = FloatProperty::from_positions(&[[0.5, 5.0, 5.0], [9.5, 5.0, 5.0]]);
        let cell = SimulationCell::orthorhombic(10.0, 10.0, 10.0, [true; 3]).unwrap();
        let finder = NeighborFinder::prepare(&positions, &cell, None, None).unwrap();
        let mut query = NeighborQuery::new(&finder, 1);
        query.find_neighbors_of_atom(0);
        let n = &query.results()[0];
        assert_eq!(n.index, 1);
        assert!((n.distance_sq - 1.0).abs() < 1e-10, "{}", n.distance_sq);
        assert!((n.delta.x - -1.0).abs() < 1e-10);
    }

    #[test]
    fn open_boundaries_hide_images() {
        let positions = FloatProperty::from_positions(&[[0.5, 5.0, 5.0], [9.5, 5.0, 5.0]]);
        let cell = SimulationCell::orthorhombic(10.0, 10.0, 10.0, [false; 3]).unwrap();
        let finder = NeighborFinder::prepare(&positions, &cell, None, None).unwrap();
        let mut query = NeighborQuery::new(&finder, 1);
        query.find_neighbors_of_atom(0);
        let n = &query.results()[0];
        assert!((n.distance_sq - 81.0).abs() < 1e-10);
    }

    #[test]
    fn too_small_cell_is_rejected() {
        let positions = simple_cubic_positions(2, 1.0);
        let cell = SimulationCell::orthorhombic(2.0, 2.0, 2.0, [true; 3]).unwrap();
        let err = NeighborFinder::prepare(&positions, &cell, None, Some(1.5)).unwrap_err();
        assert_eq!(err.class(), "CellTooSmall");
    }

    #[test]
    fn rebuild_is_deterministic() {
        let positions = simple_cubic_positions(3, 1.1);
        let cell = SimulationCell::orthorhombic(3.3, 3.3, 3.3, [true; 3]).unwrap();
        let finder1 = NeighborFinder::prepare(&positions, &cell, None, None).unwrap();
        let finder2 = NeighborFinder::prepare(&positions, &cell, None, None).unwrap();
        for atom in 0..positions.len() {
            let mut q1 = NeighborQuery::new(&finder1, 12);
            let mut q2 = NeighborQuery::new(&finder2, 12);
            q1.find_neighbors_of_atom(atom);
            q2.find_neighbors_of_atom(atom);
            let a: Vec<_> = q1.results().iter().map(|n| (n.index, n.distance_sq)).collect();
            let b: Vec<_> = q2.results().iter().map(|n| (n.index, n.distance_sq)).collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn two_dimensional_cell_disables_z() {
        let positions = FloatProperty::from_positions(&[[1.0, 1.0, 0.0], [1.0, 2.0, 0.0]]);
        let mut cell = SimulationCell::orthorhombic(4.0, 4.0, 1.0, [true, true, true]).unwrap();
        cell.set_2d(true);
        let finder = NeighborFinder::prepare(&positions, &cell, None, None).unwrap();
        assert_eq!(finder.cell().pbc_flags(), [true, true, false]);
        let mut query = NeighborQuery::new(&finder, 1);
        query.find_neighbors_of_atom(0);
        assert!((query.results()[0].distance_sq - 1.0).abs() < 1e-10);
    }
}
