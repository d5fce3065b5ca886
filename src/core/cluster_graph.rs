use nalgebra::Matrix3;

use crate::core::structures::{matrices_equal, StructureType, CA_TRANSITION_MATRIX_EPSILON};

/// Index of a transition inside the [`ClusterGraph`] arena.
pub type TransitionIdx = usize;

/// Atom cluster of a single structure type with a shared orientation
/// frame. Cluster id 0 is reserved to mean "unassigned"; the arena hands
/// out ids starting at 1.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: i32,
    pub structure: StructureType,
    pub atom_count: usize,
    /// Transformation from lattice space to spatial coordinates.
    pub orientation: Matrix3<f64>,
    /// Index of the lattice symmetry applied when the cluster was aligned
    /// to a preferred orientation.
    pub symmetry_transformation: usize,
    /// Transition toward this cluster's parent grain; `None` for roots.
    pub parent_transition: Option<TransitionIdx>,
    pub rank: u32,
    /// Head of the intrusive list of outgoing transitions.
    pub transitions: Option<TransitionIdx>,
}

/// Directed transition between two clusters. Every transition has a
/// reverse with the inverse rotation; both are created together.
#[derive(Debug, Clone)]
pub struct ClusterTransition {
    pub cluster1: i32,
    pub cluster2: i32,
    /// Rotation mapping lattice vectors of cluster1's frame into
    /// cluster2's frame.
    pub tm: Matrix3<f64>,
    /// Number of atom-atom bonds this transition crosses.
    pub distance: i32,
    pub area: u32,
    pub reverse: TransitionIdx,
    /// Next transition in cluster1's list.
    pub next: Option<TransitionIdx>,
}

/// Owns all clusters and transitions of one analysis run. References
/// between them are arena indices, never pointers.
#[derive(Debug, Default)]
pub struct ClusterGraph {
    clusters: Vec<Cluster>,
    transitions: Vec<ClusterTransition>,
}

impl ClusterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn transitions(&self) -> &[ClusterTransition] {
        &self.transitions
    }

    pub fn create_cluster(&mut self, structure: StructureType) -> i32 {
        let id = self.clusters.len() as i32 + 1;
        self.clusters.push(Cluster {
            id,
            structure,
            atom_count: 0,
            orientation: Matrix3::identity(),
            symmetry_transformation: 0,
            parent_transition: None,
            rank: 0,
            transitions: None,
        });
        id
    }

    pub fn cluster(&self, id: i32) -> &Cluster {
        &self.clusters[(id - 1) as usize]
    }

    pub fn cluster_mut(&mut self, id: i32) -> &mut Cluster {
        &mut self.clusters[(id - 1) as usize]
    }

    pub fn find_cluster(&self, id: i32) -> Option<&Cluster> {
        if id <= 0 || id as usize > self.clusters.len() {
            None
        } else {
            Some(self.cluster(id))
        }
    }

    pub fn transition(&self, index: TransitionIdx) -> &ClusterTransition {
        &self.transitions[index]
    }

    pub fn transition_mut(&mut self, index: TransitionIdx) -> &mut ClusterTransition {
        &mut self.transitions[index]
    }

    /// Linear scan of cluster `a`'s transition list for one ending at `b`.
    pub fn find_transition(&self, a: i32, b: i32) -> Option<TransitionIdx> {
        let mut cursor = self.cluster(a).transitions;
        while let Some(t) = cursor {
            if self.transitions[t].cluster2 == b {
                return Some(t);
            }
            cursor = self.transitions[t].next;
        }
        None
    }

    /// Scan for a transition `a -> b` with the given rotation.
    pub fn find_transition_with_tm(
        &self,
        a: i32,
        b: i32,
        tm: &Matrix3<f64>,
    ) -> Option<TransitionIdx> {
        let mut cursor = self.cluster(a).transitions;
        while let Some(t) = cursor {
            let transition = &self.transitions[t];
            if transition.cluster2 == b
                && matrices_equal(&transition.tm, tm, CA_TRANSITION_MATRIX_EPSILON)
            {
                return Some(t);
            }
            cursor = transition.next;
        }
        None
    }

    /// Creates a transition `a -> b` with the given rotation and its
    /// reverse `b -> a` with the inverse, linking both into the
    /// respective clusters' transition lists.
    pub fn create_transition(
        &mut self,
        a: i32,
        b: i32,
        tm: Matrix3<f64>,
        distance: i32,
    ) -> TransitionIdx {
        let forward = self.transitions.len();
        let backward = forward + 1;
        let tm_inverse = tm.transpose();
        self.transitions.push(ClusterTransition {
            cluster1: a,
            cluster2: b,
            tm,
            distance,
            area: 0,
            reverse: backward,
            next: self.cluster(a).transitions,
        });
        self.transitions.push(ClusterTransition {
            cluster1: b,
            cluster2: a,
            tm: tm_inverse,
            distance,
            area: 0,
            reverse: forward,
            next: self.cluster(b).transitions,
        });
        self.cluster_mut(a).transitions = Some(forward);
        self.cluster_mut(b).transitions = Some(backward);
        forward
    }

    /// Returns a transition equivalent to following `t1` then `t2`,
    /// reusing an existing transition when one matches. Following a
    /// transition by its own reverse collapses to a self transition with
    /// the identity rotation.
    pub fn concatenate(&mut self, t1: TransitionIdx, t2: TransitionIdx) -> TransitionIdx {
        let first = self.transitions[t1].clone();
        let second = self.transitions[t2].clone();
        debug_assert_eq!(first.cluster2, second.cluster1);

        if second.reverse == t1 {
            return self.self_transition(first.cluster1);
        }

        let tm = second.tm * first.tm;
        let a = first.cluster1;
        let b = second.cluster2;
        if let Some(existing) = self.find_transition_with_tm(a, b, &tm) {
            return existing;
        }
        self.create_transition(a, b, tm, first.distance + second.distance)
    }

    /// The identity transition of a cluster onto itself.
    pub fn self_transition(&mut self, cluster: i32) -> TransitionIdx {
        if let Some(existing) =
            self.find_transition_with_tm(cluster, cluster, &Matrix3::identity())
        {
            return existing;
        }
        self.create_transition(cluster, cluster, Matrix3::identity(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn rot_z_90() -> Matrix3<f64> {
        Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0)
    }

    #[test]
    fn reverse_linkage_invariants() {
        let mut graph = ClusterGraph::new();
        let a = graph.create_cluster(StructureType::Fcc);
        let b = graph.create_cluster(StructureType::Fcc);
        let t = graph.create_transition(a, b, rot_z_90(), 1);
        let r = graph.transition(t).reverse;
        assert_eq!(graph.transition(r).reverse, t);
        let product = graph.transition(t).tm * graph.transition(r).tm;
        assert!(matrices_equal(
            &product,
            &Matrix3::identity(),
            CA_TRANSITION_MATRIX_EPSILON
        ));
    }

    #[test]
    fn find_transition_walks_the_list() {
        let mut graph = ClusterGraph::new();
        let a = graph.create_cluster(StructureType::Fcc);
        let b = graph.create_cluster(StructureType::Hcp);
        let c = graph.create_cluster(StructureType::Fcc);
        let t_ab = graph.create_transition(a, b, Matrix3::identity(), 1);
        let t_ac = graph.create_transition(a, c, rot_z_90(), 1);
        assert_eq!(graph.find_transition(a, b), Some(t_ab));
        assert_eq!(graph.find_transition(a, c), Some(t_ac));
        assert_eq!(graph.find_transition(b, c), None);
    }

    #[test]
    fn concatenate_composes_rotations() {
        let mut graph = ClusterGraph::new();
        let a = graph.create_cluster(StructureType::Fcc);
        let b = graph.create_cluster(StructureType::Fcc);
        let c = graph.create_cluster(StructureType::Fcc);
        let t_ab = graph.create_transition(a, b, rot_z_90(), 1);
        let t_bc = graph.create_transition(b, c, rot_z_90(), 1);
        let t_ac = graph.concatenate(t_ab, t_bc);
        let expected = rot_z_90() * rot_z_90();
        assert!(matrices_equal(&graph.transition(t_ac).tm, &expected, 1e-12));
        assert_eq!(graph.transition(t_ac).distance, 2);
        // Rotating a vector through the composition matches two steps.
        let v = Vector3::new(1.0, 0.0, 0.0);
        assert!((graph.transition(t_ac).tm * v - expected * v).norm() < 1e-12);
    }

    #[test]
    fn concatenating_with_reverse_yields_self_transition() {
        let mut graph = ClusterGraph::new();
        let a = graph.create_cluster(StructureType::Fcc);
        let b = graph.create_cluster(StructureType::Fcc);
        let t_ab = graph.create_transition(a, b, rot_z_90(), 1);
        let t_ba = graph.transition(t_ab).reverse;
        let t_aa = graph.concatenate(t_ab, t_ba);
        assert_eq!(graph.transition(t_aa).cluster1, a);
        assert_eq!(graph.transition(t_aa).cluster2, a);
        assert!(matrices_equal(
            &graph.transition(t_aa).tm,
            &Matrix3::identity(),
            1e-12
        ));
    }
}
