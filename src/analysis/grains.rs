use log::debug;
use nalgebra::Quaternion;
use petgraph::graphmap::UnGraphMap;
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeSet};

use crate::analysis::neighbor_finder::NeighborFinder;
use crate::analysis::ptm;
use crate::analysis::structure_analysis::StructureAnalysis;
use crate::core::structures::StructureType;
use crate::math::disjoint_set::DisjointSet;
use crate::math::rotation::{
    disorientation_deg, interfacial_disorientation_deg, map_and_calculate_disorientation,
};

/// Bonds between same-phase atoms (or coherent siblings) below this
/// disorientation enter the clustering graph.
const MISORIENTATION_THRESHOLD_DEG: f64 = 4.0;

/// Neighbor cap for atoms without a recognized structure.
const MAX_DISORDERED_NEIGHBORS: usize = 8;

#[derive(Debug, Clone)]
pub struct GrainSegmentationConfig {
    pub handle_coherent_interfaces: bool,
    pub min_grain_atom_count: usize,
}

impl Default for GrainSegmentationConfig {
    fn default() -> Self {
        Self {
            handle_coherent_interfaces: true,
            min_grain_atom_count: 100,
        }
    }
}

/// Undirected atom-atom bond with its disorientation angle.
#[derive(Debug, Clone, Copy)]
pub struct NeighborBond {
    pub a: usize,
    pub b: usize,
    pub disorientation: f64,
    pub length: f64,
}

/// One merge step of the hierarchical clustering; `a` is the surviving
/// parent node.
#[derive(Debug, Clone)]
pub struct DendrogramNode {
    pub a: usize,
    pub b: usize,
    pub distance: f64,
    pub disorientation: f64,
    pub size: usize,
    pub merge_size: f64,
    pub orientation: Quaternion<f64>,
}

#[derive(Debug, Clone)]
pub struct Grain {
    pub id: i32,
    pub size: usize,
    pub orientation: Quaternion<f64>,
}

#[derive(Debug, Default)]
pub struct GrainSegmentationResult {
    pub atom_grain_ids: Vec<i32>,
    pub grains: Vec<Grain>,
    pub suggested_merging_threshold: f64,
    pub merge_count: usize,
}

/// Partitions PTM-identified atoms into grains of consistent orientation
/// via nearest-neighbor chain clustering of the bond disorientation
/// graph.
pub fn segment_grains(
    analysis: &StructureAnalysis,
    finder: &NeighborFinder,
    config: &GrainSegmentationConfig,
) -> GrainSegmentationResult {
    let n = analysis.atom_count();
    if n == 0 || analysis.ptm_orientations.is_none() {
        return GrainSegmentationResult::default();
    }

    let mut engine = Engine {
        analysis,
        finder,
        handle_boundaries: config.handle_coherent_interfaces,
        adjusted_types: (0..n).map(|i| analysis.structure_of(i)).collect(),
        adjusted_orientations: (0..n).map(|i| analysis.ptm_orientation(i)).collect(),
        bonds: Vec::new(),
    };

    engine.create_neighbor_bonds();
    if config.handle_coherent_interfaces {
        engine.rotate_interface_atoms();
    }
    engine.compute_disorientation_angles();
    let (dendrogram, threshold) = engine.determine_merge_sequence(n);
    let result = assign_grains(
        n,
        &dendrogram,
        threshold,
        &engine.adjusted_orientations,
        config.min_grain_atom_count,
    );
    debug!(
        "grain segmentation: {} grains, threshold {:.4}",
        result.grains.len(),
        result.suggested_merging_threshold
    );
    result
}

/// Relabeling policy across coherent interfaces: the more abundant
/// sibling becomes the parent phase.
struct InterfaceHandler {
    parent_fcc: bool,
    parent_dcub: bool,
}

impl InterfaceHandler {
    fn new(types: &[StructureType]) -> Self {
        let count = |t: StructureType| types.iter().filter(|&&x| x == t).count();
        Self {
            parent_fcc: count(StructureType::Fcc) >= count(StructureType::Hcp),
            parent_dcub: count(StructureType::CubicDiamond)
                >= count(StructureType::HexDiamond),
        }
    }

    fn parent_phase(&self, s: StructureType) -> StructureType {
        match s {
            StructureType::Hcp if self.parent_fcc => StructureType::Fcc,
            StructureType::Fcc if !self.parent_fcc => StructureType::Hcp,
            StructureType::HexDiamond if self.parent_dcub => StructureType::CubicDiamond,
            StructureType::CubicDiamond if !self.parent_dcub => StructureType::HexDiamond,
            other => other,
        }
    }

    /// Reorders a sibling-phase bond so `a` carries the parent phase.
    /// Returns false for bonds that are not coherent-interface pairs.
    fn reorder_bond(&self, bond: &mut NeighborBond, types: &[StructureType]) -> bool {
        let sa = types[bond.a];
        let sb = types[bond.b];
        let flipped = match (sa, sb) {
            (StructureType::Fcc, StructureType::Hcp) => !self.parent_fcc,
            (StructureType::Hcp, StructureType::Fcc) => self.parent_fcc,
            (StructureType::CubicDiamond, StructureType::HexDiamond) => !self.parent_dcub,
            (StructureType::HexDiamond, StructureType::CubicDiamond) => self.parent_dcub,
            _ => return false,
        };
        if flipped {
            std::mem::swap(&mut bond.a, &mut bond.b);
        }
        true
    }
}

struct Engine<'a> {
    analysis: &'a StructureAnalysis,
    finder: &'a NeighborFinder,
    handle_boundaries: bool,
    adjusted_types: Vec<StructureType>,
    adjusted_orientations: Vec<Quaternion<f64>>,
    bonds: Vec<NeighborBond>,
}

impl<'a> Engine<'a> {
    fn desired_neighbor_count(&self, structure: StructureType) -> usize {
        let cn = structure.coordination_number();
        if cn == 0 {
            MAX_DISORDERED_NEIGHBORS
        } else {
            cn
        }
    }

    fn ptm_ordered_neighbors(&self, atom: usize, limit: usize) -> Vec<usize> {
        let correspondences = self
            .analysis
            .correspondences
            .as_ref()
            .map(|c| c.get(atom))
            .unwrap_or(0);
        ptm::ordered_neighbors(
            self.finder,
            atom,
            self.adjusted_types[atom],
            correspondences,
            limit,
        )
    }

    /// One bond per undirected neighbor pair with `a < b`.
    fn create_neighbor_bonds(&mut self) {
        let n = self.analysis.atom_count();
        let per_atom: Vec<Vec<NeighborBond>> = (0..n)
            .into_par_iter()
            .map(|atom| {
                let structure = self.adjusted_types[atom];
                let limit = self.desired_neighbor_count(structure);
                let neighbors = self.ptm_ordered_neighbors(atom, limit);
                let pos = self.finder.atom_position(atom);
                neighbors
                    .into_iter()
                    .filter(|&nb| atom < nb)
                    .map(|nb| {
                        let delta = self
                            .analysis
                            .cell
                            .wrap_vector(&(self.finder.atom_position(nb) - pos));
                        NeighborBond {
                            a: atom,
                            b: nb,
                            disorientation: f64::INFINITY,
                            length: delta.norm(),
                        }
                    })
                    .collect()
            })
            .collect();
        self.bonds = per_atom.into_iter().flatten().collect();
        debug!("grain segmentation: {} neighbor bonds", self.bonds.len());
    }

    /// Checks a bond across a coherent interface; on success returns the
    /// defect atom's orientation re-expressed in the parent phase frame.
    fn interface_cubic_hex(
        &self,
        bond: &mut NeighborBond,
        iface: &InterfaceHandler,
    ) -> Option<Quaternion<f64>> {
        bond.disorientation = f64::INFINITY;
        if !iface.reorder_bond(bond, &self.adjusted_types) {
            return None;
        }
        let sa = self.adjusted_types[bond.a];
        let sb = self.adjusted_types[bond.b];
        let (angle, mapped) = interfacial_disorientation_deg(
            sa,
            sb,
            &self.adjusted_orientations[bond.a],
            &self.adjusted_orientations[bond.b],
        );
        bond.disorientation = angle;
        if angle < MISORIENTATION_THRESHOLD_DEG {
            Some(mapped)
        } else {
            None
        }
    }

    /// Iteratively relabels sibling-phase atoms bordering coherent
    /// interfaces into the parent phase, lowest disorientation first.
    fn rotate_interface_atoms(&mut self) {
        let iface = InterfaceHandler::new(&self.adjusted_types);

        struct HeapBond(NeighborBond);
        impl PartialEq for HeapBond {
            fn eq(&self, other: &Self) -> bool {
                self.cmp(other) == std::cmp::Ordering::Equal
            }
        }
        impl Eq for HeapBond {}
        impl PartialOrd for HeapBond {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for HeapBond {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.0
                    .disorientation
                    .total_cmp(&other.0.disorientation)
                    .then_with(|| self.0.a.cmp(&other.0.a))
                    .then_with(|| self.0.b.cmp(&other.0.b))
            }
        }

        let mut heap: BinaryHeap<Reverse<HeapBond>> = BinaryHeap::new();
        for bond in self.bonds.clone() {
            let mut candidate = bond;
            if self.interface_cubic_hex(&mut candidate, &iface).is_some() {
                heap.push(Reverse(HeapBond(candidate)));
            }
        }

        while let Some(Reverse(HeapBond(bond))) = heap.pop() {
            let mut candidate = bond;
            let Some(rotated) = self.interface_cubic_hex(&mut candidate, &iface) else {
                continue;
            };
            let idx = candidate.b;
            self.adjusted_types[idx] = iface.parent_phase(self.adjusted_types[idx]);
            self.adjusted_orientations[idx] = rotated;

            let limit = self.desired_neighbor_count(self.adjusted_types[idx]);
            for nb in self.ptm_ordered_neighbors(idx, limit) {
                let mut next = NeighborBond {
                    a: idx,
                    b: nb,
                    disorientation: 0.0,
                    length: 0.0,
                };
                if self.interface_cubic_hex(&mut next, &iface).is_some() {
                    heap.push(Reverse(HeapBond(next)));
                }
            }
        }
    }

    fn is_crystalline_bond(&self, bond: &NeighborBond) -> bool {
        let a = self.adjusted_types[bond.a];
        let b = self.adjusted_types[bond.b];
        if a == StructureType::Other || b == StructureType::Other {
            return false;
        }
        if a == b {
            return true;
        }
        self.handle_boundaries && is_sibling_pair(a, b)
    }

    fn compute_disorientation_angles(&mut self) {
        let types = &self.adjusted_types;
        let orientations = &self.adjusted_orientations;
        let handle_boundaries = self.handle_boundaries;
        self.bonds.par_iter_mut().for_each(|bond| {
            let sa = types[bond.a];
            let sb = types[bond.b];
            if sa == StructureType::Other || sb == StructureType::Other {
                bond.disorientation = f64::INFINITY;
            } else if sa == sb {
                bond.disorientation =
                    disorientation_deg(sa, &orientations[bond.a], &orientations[bond.b]);
            } else if handle_boundaries && is_sibling_pair(sa, sb) {
                let (angle, _) = interfacial_disorientation_deg(
                    sa,
                    sb,
                    &orientations[bond.a],
                    &orientations[bond.b],
                );
                bond.disorientation = angle;
            } else {
                bond.disorientation = f64::INFINITY;
            }
        });
        self.bonds
            .sort_by(|x, y| x.disorientation.total_cmp(&y.disorientation));
    }

    /// Builds the weighted graph and runs the nearest-neighbor chain
    /// clustering, returning the dendrogram (sorted by merge distance)
    /// and the suggested merging threshold.
    fn determine_merge_sequence(&mut self, n: usize) -> (Vec<DendrogramNode>, f64) {
        let mut graph = ContractionGraph::new(n);
        for bond in &self.bonds {
            if self.is_crystalline_bond(bond)
                && bond.disorientation < MISORIENTATION_THRESHOLD_DEG
            {
                graph.add_edge(bond.a, bond.b, graph_weight(bond.disorientation));
            }
        }

        let mut qsum = self.adjusted_orientations.clone();
        let mut dendrogram = self.node_pair_sampling_clustering(&mut graph, &mut qsum);

        dendrogram.sort_by(|x, y| x.distance.total_cmp(&y.distance));

        // Replay through a disjoint set to attach merge sizes.
        let mut uf = DisjointSet::new(n);
        for node in dendrogram.iter_mut() {
            let root_a = uf.find(node.a);
            let root_b = uf.find(node.b);
            let sa = uf.node_size(root_a);
            let sb = uf.node_size(root_b);
            node.merge_size = 2.0 / (1.0 / sa as f64 + 1.0 / sb as f64);
            node.size = sa.min(sb);
            uf.merge(node.a, node.b);
        }

        let threshold = Regressor::new(&dendrogram)
            .map(|r| r.calculate_threshold(&dendrogram, 1.5))
            .unwrap_or(0.0);
        (dendrogram, threshold)
    }

    /// Nearest-neighbor chain clustering: extend a chain by repeated
    /// nearest-neighbor jumps; when two chain ends nominate each other,
    /// contract their edge and record the merge.
    fn node_pair_sampling_clustering(
        &self,
        graph: &mut ContractionGraph,
        qsum: &mut [Quaternion<f64>],
    ) -> Vec<DendrogramNode> {
        let total_weight = 1.0;
        let mut dendrogram = Vec::new();
        let mut chain: Vec<usize> = Vec::new();
        while let Some(node) = graph.next_node() {
            chain.push(node);
            while let Some(a) = chain.pop() {
                let Some((d, b)) = graph.nearest_neighbor(a) else {
                    // The connected component is exhausted.
                    graph.remove_node(a);
                    continue;
                };
                if let Some(c) = chain.pop() {
                    if b == c {
                        let parent = graph.contract_edge(a, b);
                        let child = if parent == a { b } else { a };
                        let structure = self.adjusted_types[parent];
                        // The accumulator is renormalized before the
                        // child's mapped contribution is folded in.
                        let (disorientation, accumulated) = map_and_calculate_disorientation(
                            structure,
                            &qsum[parent],
                            &qsum[child],
                        );
                        if disorientation.is_finite() {
                            qsum[parent] = accumulated;
                        }
                        dendrogram.push(DendrogramNode {
                            a: parent,
                            b: child,
                            distance: d / total_weight,
                            disorientation,
                            size: 1,
                            merge_size: 0.0,
                            orientation: qsum[parent],
                        });
                    } else {
                        chain.push(c);
                        chain.push(a);
                        chain.push(b);
                    }
                } else {
                    chain.push(a);
                    chain.push(b);
                }
            }
        }
        dendrogram
    }
}

/// Cubic/hexagonal stacking siblings that may share a coherent interface.
fn is_sibling_pair(a: StructureType, b: StructureType) -> bool {
    matches!(
        (a, b),
        (StructureType::Fcc, StructureType::Hcp)
            | (StructureType::Hcp, StructureType::Fcc)
            | (StructureType::CubicDiamond, StructureType::HexDiamond)
            | (StructureType::HexDiamond, StructureType::CubicDiamond)
    )
}

/// Edge weight of the disorientation graph: exp(-theta^2 / 3).
fn graph_weight(theta_deg: f64) -> f64 {
    let theta = if theta_deg < 1e-5 { 0.0 } else { theta_deg };
    (-(theta * theta) / 3.0).exp()
}

/// Sparse undirected graph with weighted edges supporting deterministic
/// edge contraction. Each node tracks its total incident weight; the
/// active set is ordered so the chain clustering is reproducible.
struct ContractionGraph {
    graph: UnGraphMap<usize, f64>,
    wnode: Vec<f64>,
    active: BTreeSet<usize>,
}

impl ContractionGraph {
    fn new(n: usize) -> Self {
        Self {
            graph: UnGraphMap::new(),
            wnode: vec![0.0; n],
            active: BTreeSet::new(),
        }
    }

    fn add_edge(&mut self, u: usize, v: usize, w: f64) {
        self.wnode[u] += w;
        self.wnode[v] += w;
        self.active.insert(u);
        self.active.insert(v);
        if let Some(existing) = self.graph.edge_weight_mut(u, v) {
            *existing += w;
        } else {
            self.graph.add_edge(u, v, w);
        }
    }

    fn next_node(&self) -> Option<usize> {
        self.active.first().copied()
    }

    fn remove_node(&mut self, u: usize) {
        self.graph.remove_node(u);
        self.active.remove(&u);
    }

    /// The neighbor minimizing `w_total(v) / w(u, v)`, ties toward the
    /// smaller node index. Returns `(distance * w_total(u), v)`.
    fn nearest_neighbor(&self, u: usize) -> Option<(f64, usize)> {
        let mut dmin = f64::INFINITY;
        let mut vmin = usize::MAX;
        for (_, v, &w) in self.graph.edges(u) {
            debug_assert_ne!(v, u, "graph has self loops");
            let d = self.wnode[v] / w.max(1e-300);
            if d < dmin || (d == dmin && v < vmin) {
                dmin = d;
                vmin = v;
            }
        }
        if vmin == usize::MAX {
            None
        } else {
            Some((dmin * self.wnode[u], vmin))
        }
    }

    /// Contracts the edge, merging the smaller adjacency into the larger
    /// and summing duplicate edge weights. Returns the surviving node.
    fn contract_edge(&mut self, a: usize, b: usize) -> usize {
        let (a, b) = if self.graph.edges(b).count() > self.graph.edges(a).count() {
            (b, a)
        } else {
            (a, b)
        };
        let _ = self.graph.remove_edge(a, b);
        let transferred: Vec<(usize, f64)> = self
            .graph
            .edges(b)
            .map(|(_, v, &w)| (v, w))
            .collect();
        self.graph.remove_node(b);
        self.active.remove(&b);
        for (v, w) in transferred {
            if let Some(existing) = self.graph.edge_weight_mut(a, v) {
                *existing += w;
            } else {
                self.graph.add_edge(a, v, w);
            }
        }
        self.wnode[a] += self.wnode[b];
        if self.graph.edges(a).count() == 0 {
            self.active.remove(&a);
        }
        a
    }
}

/// Robust log-log regression of merge distance against merge size,
/// iteratively reweighted (Huber-like).
struct Regressor {
    gradient: f64,
    intercept: f64,
    mean_absolute_deviation: f64,
}

impl Regressor {
    fn new(dendrogram: &[DendrogramNode]) -> Option<Regressor> {
        if dendrogram.is_empty() {
            return None;
        }
        let weights: Vec<f64> = dendrogram.iter().map(|n| n.merge_size).collect();
        let xs: Vec<f64> = dendrogram.iter().map(|n| n.merge_size.ln()).collect();
        let ys: Vec<f64> = dendrogram.iter().map(|n| n.distance.ln()).collect();

        let mut w = weights.clone();
        let mut gradient = 0.0;
        let mut intercept = 0.0;
        let mut residuals = vec![0.0; xs.len()];
        for _ in 0..100 {
            let (g, c) = weighted_linear_regression(&w, &xs, &ys);
            gradient = g;
            intercept = c;
            for i in 0..xs.len() {
                let r = (ys[i] - (gradient * xs[i] + intercept)).abs();
                residuals[i] = r;
                w[i] = weights[i] / r.max(1e-4);
            }
        }
        let mean_absolute_deviation = median(&mut residuals);
        Some(Regressor {
            gradient,
            intercept,
            mean_absolute_deviation,
        })
    }

    /// The largest inlier log-distance: nodes whose signed residual
    /// stays below `cutoff` times the MAD.
    fn calculate_threshold(&self, dendrogram: &[DendrogramNode], cutoff: f64) -> f64 {
        let mut threshold: f64 = 0.0;
        for node in dendrogram {
            let x = node.merge_size.ln();
            let y = node.distance.ln();
            let residual = y - (x * self.gradient + self.intercept);
            if residual < cutoff * self.mean_absolute_deviation {
                threshold = threshold.max(y);
            }
        }
        threshold
    }
}

fn weighted_linear_regression(weights: &[f64], xs: &[f64], ys: &[f64]) -> (f64, f64) {
    let wsum: f64 = weights.iter().sum();
    if wsum <= 0.0 {
        return (0.0, 0.0);
    }
    let mut xmean = 0.0;
    let mut ymean = 0.0;
    for i in 0..weights.len() {
        xmean += weights[i] / wsum * xs[i];
        ymean += weights[i] / wsum * ys[i];
    }
    let mut sum_xx = 0.0;
    let mut sum_xy = 0.0;
    for i in 0..weights.len() {
        sum_xx += weights[i] / wsum * (xs[i] - xmean) * (xs[i] - xmean);
        sum_xy += weights[i] / wsum * (xs[i] - xmean) * (ys[i] - ymean);
    }
    if sum_xx.abs() < 1e-12 {
        return (0.0, ymean);
    }
    let gradient = sum_xy / sum_xx;
    (gradient, ymean - gradient * xmean)
}

fn median(data: &mut [f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.sort_by(|a, b| a.total_cmp(b));
    let n = data.len();
    if n % 2 == 0 {
        (data[n / 2] + data[n / 2 - 1]) / 2.0
    } else {
        data[n / 2]
    }
}

/// Replays the dendrogram below the threshold and assigns grain ids,
/// discarding grains below the minimum atom count.
fn assign_grains(
    n: usize,
    dendrogram: &[DendrogramNode],
    threshold: f64,
    orientations: &[Quaternion<f64>],
    min_grain_atom_count: usize,
) -> GrainSegmentationResult {
    let mut uf = DisjointSet::new(n);
    let mut mean_q: Vec<Quaternion<f64>> = orientations.to_vec();
    let mut merge_count = 0;
    for node in dendrogram {
        if node.distance.ln() > threshold {
            break;
        }
        uf.merge(node.a, node.b);
        let root = uf.find(node.a);
        mean_q[root] = node.orientation;
        merge_count += 1;
    }

    let mut rep_to_id = vec![0i32; n];
    let mut next_id = 1;
    for i in 0..n {
        if uf.find(i) == i && uf.node_size(i) >= min_grain_atom_count {
            rep_to_id[i] = next_id;
            next_id += 1;
        }
    }

    let mut atom_grain_ids = vec![0i32; n];
    for i in 0..n {
        let rep = uf.find(i);
        atom_grain_ids[i] = rep_to_id[rep];
    }

    let mut grains = Vec::with_capacity((next_id - 1) as usize);
    for rep in 0..n {
        if uf.find(rep) == rep && rep_to_id[rep] > 0 {
            grains.push(Grain {
                id: rep_to_id[rep],
                size: uf.node_size(rep),
                orientation: mean_q[rep].normalize(),
            });
        }
    }

    GrainSegmentationResult {
        atom_grain_ids,
        grains,
        suggested_merging_threshold: threshold,
        merge_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_weight_matches_contract() {
        assert!((graph_weight(0.0) - 1.0).abs() < 1e-12);
        let w = graph_weight(3.0);
        assert!((w - (-3.0_f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn contraction_merges_duplicate_edges() {
        let mut g = ContractionGraph::new(4);
        g.add_edge(0, 1, 1.0);
        g.add_edge(0, 2, 0.5);
        g.add_edge(1, 2, 0.25);
        let parent = g.contract_edge(0, 1);
        // The 0-2 and 1-2 edges combine into one with summed weight.
        let weight = *g.graph.edge_weight(parent, 2).unwrap();
        assert!((weight - 0.75).abs() < 1e-12);
    }

    #[test]
    fn chain_clustering_of_a_triangle_produces_two_merges() {
        // Three mutually bonded nodes collapse through two merges.
        let mut g = ContractionGraph::new(3);
        g.add_edge(0, 1, 1.0);
        g.add_edge(1, 2, 1.0);
        g.add_edge(0, 2, 1.0);
        let mut merges = 0;
        let mut chain: Vec<usize> = Vec::new();
        while let Some(node) = g.next_node() {
            chain.push(node);
            while let Some(a) = chain.pop() {
                let Some((_, b)) = g.nearest_neighbor(a) else {
                    g.remove_node(a);
                    continue;
                };
                if let Some(c) = chain.pop() {
                    if b == c {
                        g.contract_edge(a, b);
                        merges += 1;
                    } else {
                        chain.push(c);
                        chain.push(a);
                        chain.push(b);
                    }
                } else {
                    chain.push(a);
                    chain.push(b);
                }
            }
        }
        assert_eq!(merges, 2);
    }

    #[test]
    fn regressor_flags_outlier_merges() {
        // Small-distance merges on a smooth trend plus one far outlier.
        let mut dendrogram: Vec<DendrogramNode> = (1..50)
            .map(|i| DendrogramNode {
                a: 0,
                b: i,
                distance: 0.01 * i as f64,
                disorientation: 0.5,
                size: 1,
                merge_size: i as f64,
                orientation: Quaternion::new(1.0, 0.0, 0.0, 0.0),
            })
            .collect();
        dendrogram.push(DendrogramNode {
            a: 0,
            b: 50,
            distance: 1e6,
            disorientation: 40.0,
            size: 50,
            merge_size: 25.0,
            orientation: Quaternion::new(1.0, 0.0, 0.0, 0.0),
        });
        let regressor = Regressor::new(&dendrogram).unwrap();
        let threshold = regressor.calculate_threshold(&dendrogram, 1.5);
        // The outlier's log distance lies above the suggested threshold.
        assert!(threshold < (1e6_f64).ln());
        assert!(threshold >= (0.01_f64).ln());
    }
}
