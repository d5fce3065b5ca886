use nalgebra::{Matrix3, Vector3};
use std::sync::OnceLock;

use crate::core::cell::EPSILON;

/// Tolerance used when comparing transition matrices against lattice
/// symmetries. Part of the numeric contract.
pub const CA_TRANSITION_MATRIX_EPSILON: f64 = 1e-6;

/// Largest neighbor count over all coordination structures.
pub const MAX_NEIGHBORS: usize = 16;

// ============================================================================
// STRUCTURE TYPES
// ============================================================================

/// Per-atom structure classification. The numeric ids are fixed for
/// serialization and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StructureType {
    Other = 0,
    Fcc = 1,
    Hcp = 2,
    Bcc = 3,
    Ico = 4,
    Sc = 5,
    CubicDiamond = 6,
    CubicDiamondFirstNeigh = 7,
    CubicDiamondSecondNeigh = 8,
    HexDiamond = 9,
    HexDiamondFirstNeigh = 10,
    HexDiamondSecondNeigh = 11,
    Graphene = 12,
}

pub const NUM_STRUCTURE_TYPES: usize = 13;

impl StructureType {
    pub fn from_id(id: i32) -> StructureType {
        match id {
            1 => StructureType::Fcc,
            2 => StructureType::Hcp,
            3 => StructureType::Bcc,
            4 => StructureType::Ico,
            5 => StructureType::Sc,
            6 => StructureType::CubicDiamond,
            7 => StructureType::CubicDiamondFirstNeigh,
            8 => StructureType::CubicDiamondSecondNeigh,
            9 => StructureType::HexDiamond,
            10 => StructureType::HexDiamondFirstNeigh,
            11 => StructureType::HexDiamondSecondNeigh,
            12 => StructureType::Graphene,
            _ => StructureType::Other,
        }
    }

    pub fn id(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            StructureType::Other => "OTHER",
            StructureType::Fcc => "FCC",
            StructureType::Hcp => "HCP",
            StructureType::Bcc => "BCC",
            StructureType::Ico => "ICO",
            StructureType::Sc => "SC",
            StructureType::CubicDiamond => "CUBIC_DIAMOND",
            StructureType::CubicDiamondFirstNeigh => "CUBIC_DIAMOND_FIRST_NEIGH",
            StructureType::CubicDiamondSecondNeigh => "CUBIC_DIAMOND_SECOND_NEIGH",
            StructureType::HexDiamond => "HEX_DIAMOND",
            StructureType::HexDiamondFirstNeigh => "HEX_DIAMOND_FIRST_NEIGH",
            StructureType::HexDiamondSecondNeigh => "HEX_DIAMOND_SECOND_NEIGH",
            StructureType::Graphene => "GRAPHENE",
        }
    }

    /// Structure types that carry a lattice structure table.
    pub fn has_lattice(self) -> bool {
        matches!(
            self,
            StructureType::Fcc
                | StructureType::Hcp
                | StructureType::Bcc
                | StructureType::Sc
                | StructureType::CubicDiamond
                | StructureType::HexDiamond
        )
    }

    /// Number of neighbors the identifier analyzes for this structure.
    pub fn coordination_number(self) -> usize {
        match self {
            StructureType::Fcc | StructureType::Hcp => 12,
            StructureType::Bcc => 14,
            StructureType::CubicDiamond | StructureType::HexDiamond => 16,
            StructureType::Sc => 6,
            _ => 0,
        }
    }
}

// ============================================================================
// BOND BIT-ARRAY
// ============================================================================

/// Symmetric bit-matrix marking bonds between the neighbors of a central
/// atom. One u32 row per neighbor keeps the whole array in registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeighborBondArray {
    rows: [u32; MAX_NEIGHBORS],
}

impl NeighborBondArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bond(&self, i: usize, j: usize) -> bool {
        self.rows[i] & (1 << j) != 0
    }

    pub fn set_bond(&mut self, i: usize, j: usize, bonded: bool) {
        if bonded {
            self.rows[i] |= 1 << j;
            self.rows[j] |= 1 << i;
        } else {
            self.rows[i] &= !(1 << j);
            self.rows[j] &= !(1 << i);
        }
    }

    /// Number of bonds of neighbor `i` to the first `n` neighbors.
    pub fn bond_count(&self, i: usize, n: usize) -> usize {
        (self.rows[i] & ((1u32 << n) - 1)).count_ones() as usize
    }

    /// Bitmask of neighbors bonded to `i`, restricted to the first `n`.
    pub fn bonds_of(&self, i: usize, n: usize) -> u32 {
        self.rows[i] & ((1u32 << n) - 1)
    }
}

// ============================================================================
// SYMMETRY PERMUTATIONS
// ============================================================================

/// A point-group rotation of the lattice together with the permutation of
/// neighbor indices it induces on the ideal-neighbor table, plus the
/// Cayley product tables over all permutations of the lattice.
#[derive(Debug, Clone)]
pub struct SymmetryPermutation {
    pub transformation: Matrix3<f64>,
    pub permutation: Vec<usize>,
    /// `product[s2]` is the index of `S_{s2} * S_self`.
    pub product: Vec<usize>,
    /// `inverse_product[s2]` is the index of `S_{s2}^-1 * S_self`.
    pub inverse_product: Vec<usize>,
}

// ============================================================================
// COORDINATION / LATTICE STRUCTURE TABLES
// ============================================================================

/// Immutable per-structure table of the ideal coordination polyhedron.
#[derive(Debug, Clone)]
pub struct CoordinationStructure {
    pub num_neighbors: usize,
    pub lattice_vectors: Vec<Vector3<f64>>,
    pub neighbor_array: NeighborBondArray,
    pub cna_signatures: Vec<i32>,
    /// For each neighbor, two further neighbor indices that complete a
    /// non-coplanar basis with the neighbor vector itself.
    pub common_neighbors: Vec<[i32; 2]>,
}

/// Immutable per-lattice table: coordination structure, primitive cell
/// and the symmetry permutation group.
#[derive(Debug, Clone)]
pub struct LatticeStructure {
    pub structure: StructureType,
    pub coord: CoordinationStructure,
    pub primitive_cell: Matrix3<f64>,
    pub primitive_cell_inverse: Matrix3<f64>,
    pub permutations: Vec<SymmetryPermutation>,
}

impl LatticeStructure {
    pub fn max_neighbors(&self) -> usize {
        self.coord.num_neighbors
    }

    /// Finds the permutation whose rotation equals `m` within tolerance.
    pub fn find_permutation(&self, m: &Matrix3<f64>) -> Option<usize> {
        self.permutations
            .iter()
            .position(|p| matrices_equal(&p.transformation, m, CA_TRANSITION_MATRIX_EPSILON))
    }

    /// Index of the symmetry rotation minimizing the Frobenius deviation
    /// `||R * S^T - I||` from the given rotation.
    pub fn closest_permutation(&self, rotation: &Matrix3<f64>) -> usize {
        let mut best = 0;
        let mut best_dev = f64::MAX;
        for (index, p) in self.permutations.iter().enumerate() {
            let dev = (rotation * p.transformation.transpose() - Matrix3::identity()).norm();
            if dev < best_dev {
                best_dev = dev;
                best = index;
            }
        }
        best
    }
}

pub fn matrices_equal(a: &Matrix3<f64>, b: &Matrix3<f64>, eps: f64) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= eps)
}

pub fn is_orthogonal_matrix(m: &Matrix3<f64>, eps: f64) -> bool {
    matrices_equal(&(m * m.transpose()), &Matrix3::identity(), eps)
}

pub fn is_rotation_matrix(m: &Matrix3<f64>, eps: f64) -> bool {
    is_orthogonal_matrix(m, eps) && (m.determinant() - 1.0).abs() <= eps
}

// ============================================================================
// IDEAL NEIGHBOR VECTORS
// ============================================================================
// All cubic lattices are expressed in units of the cubic lattice constant,
// hexagonal ones in a frame sharing the same nearest-neighbor distance, so
// that cross-structure constructions (diamond second shells, fcc/hcp
// stacking comparisons) line up without rescaling.

fn fcc_vectors() -> Vec<Vector3<f64>> {
    vec![
        Vector3::new(0.5, 0.0, 0.5),
        Vector3::new(0.5, 0.5, 0.0),
        Vector3::new(0.0, 0.5, 0.5),
        Vector3::new(0.5, 0.0, -0.5),
        Vector3::new(0.0, 0.5, -0.5),
        Vector3::new(-0.5, 0.0, -0.5),
        Vector3::new(-0.5, 0.5, 0.0),
        Vector3::new(-0.5, 0.0, 0.5),
        Vector3::new(0.0, -0.5, 0.5),
        Vector3::new(0.5, -0.5, 0.0),
        Vector3::new(0.0, -0.5, -0.5),
        Vector3::new(-0.5, -0.5, 0.0),
    ]
}

fn hcp_vectors() -> Vec<Vector3<f64>> {
    // Nearest-neighbor distance matches the FCC table (1/sqrt(2)).
    let a = std::f64::consts::FRAC_1_SQRT_2;
    let mut v = Vec::with_capacity(12);
    // Six basal-plane neighbors.
    for k in 0..6 {
        let phi = (k as f64) * std::f64::consts::FRAC_PI_3;
        v.push(Vector3::new(a * phi.cos(), a * phi.sin(), 0.0));
    }
    // Three above and three below the basal plane.
    let r = a / 3.0_f64.sqrt();
    let h = a * (2.0 / 3.0_f64).sqrt();
    for &sign in &[1.0, -1.0] {
        for k in 0..3 {
            let phi = std::f64::consts::FRAC_PI_6 + (k as f64) * 2.0 * std::f64::consts::FRAC_PI_3;
            v.push(Vector3::new(r * phi.cos(), r * phi.sin(), sign * h));
        }
    }
    v
}

fn bcc_vectors() -> Vec<Vector3<f64>> {
    let mut v = Vec::with_capacity(14);
    for &x in &[0.5, -0.5] {
        for &y in &[0.5, -0.5] {
            for &z in &[0.5, -0.5] {
                v.push(Vector3::new(x, y, z));
            }
        }
    }
    v.push(Vector3::new(1.0, 0.0, 0.0));
    v.push(Vector3::new(-1.0, 0.0, 0.0));
    v.push(Vector3::new(0.0, 1.0, 0.0));
    v.push(Vector3::new(0.0, -1.0, 0.0));
    v.push(Vector3::new(0.0, 0.0, 1.0));
    v.push(Vector3::new(0.0, 0.0, -1.0));
    v
}

fn sc_vectors() -> Vec<Vector3<f64>> {
    // Ordered {+x,-x,+y,-y,+z,-z}: index^1 is the opposite direction.
    vec![
        Vector3::new(1.0, 0.0, 0.0),
        Vector3::new(-1.0, 0.0, 0.0),
        Vector3::new(0.0, 1.0, 0.0),
        Vector3::new(0.0, -1.0, 0.0),
        Vector3::new(0.0, 0.0, 1.0),
        Vector3::new(0.0, 0.0, -1.0),
    ]
}

fn cubic_diamond_vectors() -> Vec<Vector3<f64>> {
    // Four covalent first neighbors followed by the twelve second
    // neighbors each first neighbor contributes three of (in generation
    // order, so the bond marks line up with the identifier's output).
    let first = [
        Vector3::new(0.25, 0.25, 0.25),
        Vector3::new(0.25, -0.25, -0.25),
        Vector3::new(-0.25, 0.25, -0.25),
        Vector3::new(-0.25, -0.25, 0.25),
    ];
    let mut v = first.to_vec();
    // Each first neighbor contributes three second-shell vectors through
    // its own (inverted) tetrahedron; the bond back to the center drops
    // out as the zero vector.
    for f in &first {
        for g in &first {
            let second = f - g;
            if second.norm_squared() > EPSILON {
                v.push(second);
            }
        }
    }
    debug_assert_eq!(v.len(), 16);
    v
}

fn hex_diamond_vectors() -> Vec<Vector3<f64>> {
    // Ideal wurtzite environment in the hexagonal frame of the HCP table:
    // the bond length sqrt(3)/4 makes the second shell coincide with the
    // 12 HCP vectors (second-neighbor distance b * sqrt(8/3) = 1/sqrt(2)).
    let b = 3.0_f64.sqrt() / 4.0;
    let r = 2.0 * 2.0_f64.sqrt() * b / 3.0;
    let down_azimuth =
        |k: usize| std::f64::consts::FRAC_PI_6 + (k as f64) * 2.0 * std::f64::consts::FRAC_PI_3;

    // First shell: one apical bond up, three bonds down.
    let mut v = vec![Vector3::new(0.0, 0.0, b)];
    for k in 0..3 {
        let phi = down_azimuth(k);
        v.push(Vector3::new(r * phi.cos(), r * phi.sin(), -b / 3.0));
    }

    // Second shell, three contributions per first neighbor. The apical
    // neighbor's outward bonds are eclipsed with the central atom's
    // downward bonds; each downward neighbor has an axial bond straight
    // down and two remaining non-axial bonds.
    let apical = v[0];
    for k in 0..3 {
        let phi = down_azimuth(k);
        v.push(apical + Vector3::new(r * phi.cos(), r * phi.sin(), b / 3.0));
    }
    for k in 0..3 {
        let dk = v[1 + k];
        v.push(dk + Vector3::new(0.0, 0.0, -b));
        // The two non-axial bonds not pointing back at the center sit at
        // 120 degrees on either side of that back bond.
        let back = down_azimuth(k) + std::f64::consts::PI;
        for &delta in &[2.0 * std::f64::consts::FRAC_PI_3, -2.0 * std::f64::consts::FRAC_PI_3] {
            let chi = back + delta;
            v.push(dk + Vector3::new(r * chi.cos(), r * chi.sin(), b / 3.0));
        }
    }
    debug_assert_eq!(v.len(), 16);
    v
}

// ============================================================================
// SYMMETRY ROTATION CANDIDATES
// ============================================================================

fn cubic_rotations() -> Vec<Matrix3<f64>> {
    let perms: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    let signs: [[f64; 3]; 8] = [
        [1.0, 1.0, 1.0],
        [1.0, -1.0, -1.0],
        [-1.0, 1.0, -1.0],
        [-1.0, -1.0, 1.0],
        [1.0, 1.0, -1.0],
        [1.0, -1.0, 1.0],
        [-1.0, 1.0, 1.0],
        [-1.0, -1.0, -1.0],
    ];
    let mut rotations = Vec::new();
    for p in &perms {
        for s in &signs {
            let mut m = Matrix3::zeros();
            for i in 0..3 {
                m[(p[i], i)] = s[i];
            }
            if (m.determinant() - 1.0).abs() < 1e-8 {
                rotations.push(m);
            }
        }
    }
    rotations
}

fn hexagonal_rotations() -> Vec<Matrix3<f64>> {
    let mut rotations = Vec::new();
    for k in 0..6 {
        let phi = (k as f64) * std::f64::consts::FRAC_PI_3;
        let (s, c) = phi.sin_cos();
        // Rotation about z.
        rotations.push(Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0));
        // Two-fold rotation about the in-plane axis at angle phi/2.
        rotations.push(Matrix3::new(c, s, 0.0, s, -c, 0.0, 0.0, 0.0, -1.0));
    }
    rotations
}

// ============================================================================
// TABLE CONSTRUCTION
// ============================================================================

fn build_coordination_structure<B, S>(
    vectors: Vec<Vector3<f64>>,
    bond_pred: B,
    signature: S,
) -> CoordinationStructure
where
    B: Fn(usize, &Vector3<f64>, usize, &Vector3<f64>) -> bool,
    S: Fn(usize, &Vector3<f64>) -> i32,
{
    let n = vectors.len();
    let mut array = NeighborBondArray::new();
    let mut signatures = Vec::with_capacity(n);
    for i in 0..n {
        for j in (i + 1)..n {
            array.set_bond(i, j, bond_pred(i, &vectors[i], j, &vectors[j]));
        }
        signatures.push(signature(i, &vectors[i]));
    }
    let common_neighbors = find_common_neighbors(&vectors, &array);
    CoordinationStructure {
        num_neighbors: n,
        lattice_vectors: vectors,
        neighbor_array: array,
        cna_signatures: signatures,
        common_neighbors,
    }
}

/// For every neighbor, picks two further neighbor indices so that the
/// three ideal vectors span a non-degenerate basis. SC needs the special
/// case: its neighbors share no bonds, so any two non-collinear axes do.
fn find_common_neighbors(
    vectors: &[Vector3<f64>],
    bonds: &NeighborBondArray,
) -> Vec<[i32; 2]> {
    let n = vectors.len();
    let mut result = vec![[-1i32; 2]; n];
    for ni in 0..n {
        let mut found = false;
        if n == 6 {
            // SC: skip the target direction and its opposite (index ^ 1).
            'sc: for i1 in 0..6 {
                if i1 == ni || i1 == (ni ^ 1) {
                    continue;
                }
                for i2 in (i1 + 1)..6 {
                    if i2 == ni || i2 == (ni ^ 1) || i2 == (i1 ^ 1) {
                        continue;
                    }
                    let m = Matrix3::from_columns(&[vectors[ni], vectors[i1], vectors[i2]]);
                    if m.determinant().abs() > EPSILON {
                        result[ni] = [i1 as i32, i2 as i32];
                        found = true;
                        break 'sc;
                    }
                }
            }
        }
        if !found {
            'outer: for i1 in 0..n {
                if !bonds.bond(ni, i1) {
                    continue;
                }
                for i2 in (i1 + 1)..n {
                    if !bonds.bond(ni, i2) {
                        continue;
                    }
                    let m = Matrix3::from_columns(&[vectors[ni], vectors[i1], vectors[i2]]);
                    if m.determinant().abs() > EPSILON {
                        result[ni] = [i1 as i32, i2 as i32];
                        break 'outer;
                    }
                }
            }
        }
    }
    result
}

/// Keeps the candidate rotations that map the coordination vector set
/// onto itself and records the induced neighbor permutation.
fn generate_symmetry_permutations(
    coord: &CoordinationStructure,
    candidates: &[Matrix3<f64>],
) -> Vec<SymmetryPermutation> {
    let n = coord.num_neighbors;
    let mut permutations: Vec<SymmetryPermutation> = Vec::new();
    for rot in candidates {
        let mut permutation = Vec::with_capacity(n);
        let mut valid = true;
        for v in &coord.lattice_vectors {
            let image = rot * v;
            match coord
                .lattice_vectors
                .iter()
                .position(|w| (image - w).norm() < 1e-4)
            {
                Some(j) => permutation.push(j),
                None => {
                    valid = false;
                    break;
                }
            }
        }
        if !valid {
            continue;
        }
        if permutations
            .iter()
            .any(|p| matrices_equal(&p.transformation, rot, 1e-8))
        {
            continue;
        }
        permutations.push(SymmetryPermutation {
            transformation: *rot,
            permutation,
            product: Vec::new(),
            inverse_product: Vec::new(),
        });
    }
    // The identity is generated first by both candidate sets; assert the
    // invariant the cluster code relies on.
    debug_assert!(matrices_equal(
        &permutations[0].transformation,
        &Matrix3::identity(),
        1e-8
    ));
    compute_symmetry_products(&mut permutations);
    permutations
}

fn compute_symmetry_products(permutations: &mut [SymmetryPermutation]) {
    let count = permutations.len();
    let transforms: Vec<Matrix3<f64>> =
        permutations.iter().map(|p| p.transformation).collect();
    for s1 in 0..count {
        let mut product = Vec::with_capacity(count);
        let mut inverse_product = Vec::with_capacity(count);
        for s2 in 0..count {
            let prod = transforms[s2] * transforms[s1];
            let inv_prod = transforms[s2].transpose() * transforms[s1];
            product.push(
                transforms
                    .iter()
                    .position(|t| matrices_equal(t, &prod, 1e-6))
                    .expect("symmetry group is closed under products"),
            );
            inverse_product.push(
                transforms
                    .iter()
                    .position(|t| matrices_equal(t, &inv_prod, 1e-6))
                    .expect("symmetry group is closed under inverse products"),
            );
        }
        permutations[s1].product = product;
        permutations[s1].inverse_product = inverse_product;
    }
}

fn build_lattice(
    structure: StructureType,
    coord: CoordinationStructure,
    primitive_cell: Matrix3<f64>,
    candidates: &[Matrix3<f64>],
) -> LatticeStructure {
    let permutations = generate_symmetry_permutations(&coord, candidates);
    let primitive_cell_inverse = primitive_cell
        .try_inverse()
        .expect("primitive cell is invertible");
    LatticeStructure {
        structure,
        coord,
        primitive_cell,
        primitive_cell_inverse,
        permutations,
    }
}

/// Process-wide immutable structure tables, built on first use.
pub struct StructureTables {
    lattices: Vec<Option<LatticeStructure>>,
}

impl StructureTables {
    pub fn get() -> &'static StructureTables {
        static TABLES: OnceLock<StructureTables> = OnceLock::new();
        TABLES.get_or_init(StructureTables::build)
    }

    pub fn lattice(&self, structure: StructureType) -> &LatticeStructure {
        self.lattices[structure.id() as usize]
            .as_ref()
            .expect("structure has a lattice table")
    }

    pub fn try_lattice(&self, structure: StructureType) -> Option<&LatticeStructure> {
        self.lattices
            .get(structure.id() as usize)
            .and_then(|l| l.as_ref())
    }

    fn build() -> StructureTables {
        let cubic = cubic_rotations();
        let hexagonal = hexagonal_rotations();
        let close_packed_cutoff = (0.5_f64.sqrt() + 1.0) * 0.5;

        let fcc = build_coordination_structure(
            fcc_vectors(),
            |_, v1, _, v2| (v1 - v2).norm() < close_packed_cutoff,
            |_, _| 0,
        );
        let hcp = build_coordination_structure(
            hcp_vectors(),
            |_, v1, _, v2| (v1 - v2).norm() < close_packed_cutoff,
            |_, v| if v.z == 0.0 { 1 } else { 0 },
        );
        let bcc = build_coordination_structure(
            bcc_vectors(),
            |_, v1, _, v2| (v1 - v2).norm() < (1.0 + 2.0_f64.sqrt()) * 0.5,
            |ni, _| if ni < 8 { 0 } else { 1 },
        );
        let sc = build_coordination_structure(
            sc_vectors(),
            |_, v1, _, v2| v1.dot(v2).abs() < EPSILON || (v1 + v2).norm_squared() < EPSILON,
            |_, _| 0,
        );
        let dcub = build_coordination_structure(
            cubic_diamond_vectors(),
            diamond_bond_predicate,
            |ni, _| if ni < 4 { 0 } else { 1 },
        );
        let dhex = build_coordination_structure(
            hex_diamond_vectors(),
            diamond_bond_predicate,
            |ni, v| {
                if ni < 4 {
                    0
                } else if v.z.abs() < 1e-9 {
                    2
                } else {
                    1
                }
            },
        );

        let fcc_cell = Matrix3::from_columns(&[
            Vector3::new(0.5, 0.5, 0.0),
            Vector3::new(0.0, 0.5, 0.5),
            Vector3::new(0.5, 0.0, 0.5),
        ]);
        let bcc_cell = Matrix3::from_columns(&[
            Vector3::new(-0.5, 0.5, 0.5),
            Vector3::new(0.5, -0.5, 0.5),
            Vector3::new(0.5, 0.5, -0.5),
        ]);
        let sc_cell = Matrix3::identity();
        let a = std::f64::consts::FRAC_1_SQRT_2;
        let hcp_cell = Matrix3::from_columns(&[
            Vector3::new(a, 0.0, 0.0),
            Vector3::new(a * 0.5, a * 0.75_f64.sqrt(), 0.0),
            Vector3::new(0.0, 0.0, a * (8.0 / 3.0_f64).sqrt()),
        ]);

        let mut lattices: Vec<Option<LatticeStructure>> = vec![None; NUM_STRUCTURE_TYPES];
        lattices[StructureType::Fcc.id() as usize] =
            Some(build_lattice(StructureType::Fcc, fcc, fcc_cell, &cubic));
        lattices[StructureType::Hcp.id() as usize] =
            Some(build_lattice(StructureType::Hcp, hcp, hcp_cell, &hexagonal));
        lattices[StructureType::Bcc.id() as usize] =
            Some(build_lattice(StructureType::Bcc, bcc, bcc_cell, &cubic));
        lattices[StructureType::Sc.id() as usize] =
            Some(build_lattice(StructureType::Sc, sc, sc_cell, &cubic));
        lattices[StructureType::CubicDiamond.id() as usize] = Some(build_lattice(
            StructureType::CubicDiamond,
            dcub,
            fcc_cell,
            &cubic,
        ));
        lattices[StructureType::HexDiamond.id() as usize] = Some(build_lattice(
            StructureType::HexDiamond,
            dhex,
            hcp_cell,
            &hexagonal,
        ));
        StructureTables { lattices }
    }
}

/// Diamond templates bond first-shell neighbors only to their own three
/// second-shell vectors; first-first pairs are never bonded.
fn diamond_bond_predicate(i: usize, v1: &Vector3<f64>, j: usize, v2: &Vector3<f64>) -> bool {
    if i < 4 && j < 4 {
        return false;
    }
    let cutoff = if i.min(j) < 4 {
        (3.0_f64.sqrt() * 0.25 + 0.5_f64.sqrt()) / 2.0
    } else {
        (1.0 + 0.5_f64.sqrt()) / 2.0
    };
    (v1 - v2).norm() < cutoff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fcc_table_shape() {
        let tables = StructureTables::get();
        let fcc = tables.lattice(StructureType::Fcc);
        assert_eq!(fcc.coord.num_neighbors, 12);
        // Each FCC neighbor is bonded to exactly four others.
        for i in 0..12 {
            assert_eq!(fcc.coord.neighbor_array.bond_count(i, 12), 4);
        }
        // Full proper cubic rotation group.
        assert_eq!(fcc.permutations.len(), 24);
    }

    #[test]
    fn bcc_table_shape() {
        let bcc = StructureTables::get().lattice(StructureType::Bcc);
        assert_eq!(bcc.coord.num_neighbors, 14);
        // Each <111> neighbor touches three others of its shell plus
        // three of the <100> shell.
        for i in 0..8 {
            assert_eq!(bcc.coord.neighbor_array.bond_count(i, 8), 3);
            assert_eq!(bcc.coord.neighbor_array.bond_count(i, 14), 6);
        }
        assert_eq!(bcc.permutations.len(), 24);
    }

    #[test]
    fn hcp_symmetry_group_preserves_basal_signature() {
        let hcp = StructureTables::get().lattice(StructureType::Hcp);
        assert_eq!(hcp.coord.num_neighbors, 12);
        assert!(!hcp.permutations.is_empty());
        for p in &hcp.permutations {
            for (i, &j) in p.permutation.iter().enumerate() {
                assert_eq!(hcp.coord.cna_signatures[i], hcp.coord.cna_signatures[j]);
            }
        }
    }

    #[test]
    fn symmetry_products_are_closed() {
        let fcc = StructureTables::get().lattice(StructureType::Fcc);
        let count = fcc.permutations.len();
        for s1 in 0..count {
            for s2 in 0..count {
                let k = fcc.permutations[s1].product[s2];
                let expected =
                    fcc.permutations[s2].transformation * fcc.permutations[s1].transformation;
                assert!(matrices_equal(
                    &fcc.permutations[k].transformation,
                    &expected,
                    1e-9
                ));
            }
        }
    }

    #[test]
    fn identity_permutation_is_first() {
        for st in [
            StructureType::Fcc,
            StructureType::Hcp,
            StructureType::Bcc,
            StructureType::Sc,
            StructureType::CubicDiamond,
            StructureType::HexDiamond,
        ] {
            let lattice = StructureTables::get().lattice(st);
            assert!(matrices_equal(
                &lattice.permutations[0].transformation,
                &Matrix3::identity(),
                1e-9
            ));
            for (i, &j) in lattice.permutations[0].permutation.iter().enumerate() {
                assert_eq!(i, j);
            }
        }
    }

    #[test]
    fn common_neighbors_form_bases() {
        for st in [StructureType::Fcc, StructureType::Bcc, StructureType::Sc] {
            let lattice = StructureTables::get().lattice(st);
            for (ni, pair) in lattice.coord.common_neighbors.iter().enumerate() {
                assert!(pair[0] >= 0 && pair[1] >= 0, "{:?} neighbor {}", st, ni);
                let m = Matrix3::from_columns(&[
                    lattice.coord.lattice_vectors[ni],
                    lattice.coord.lattice_vectors[pair[0] as usize],
                    lattice.coord.lattice_vectors[pair[1] as usize],
                ]);
                assert!(m.determinant().abs() > EPSILON);
            }
        }
    }

    #[test]
    fn hex_diamond_second_shell_matches_hcp() {
        let dhex = StructureTables::get().lattice(StructureType::HexDiamond);
        let hcp = StructureTables::get().lattice(StructureType::Hcp);
        for v in &dhex.coord.lattice_vectors[4..] {
            assert!(
                hcp.coord
                    .lattice_vectors
                    .iter()
                    .any(|w| (v - w).norm() < 1e-9),
                "second-shell vector {:?} not an HCP vector",
                v
            );
        }
    }

    #[test]
    fn diamond_second_shell_matches_fcc() {
        let dcub = StructureTables::get().lattice(StructureType::CubicDiamond);
        let fcc = StructureTables::get().lattice(StructureType::Fcc);
        for v in &dcub.coord.lattice_vectors[4..] {
            assert!(
                fcc.coord
                    .lattice_vectors
                    .iter()
                    .any(|w| (v - w).norm() < 1e-9),
                "second-shell vector {:?} not an FCC vector",
                v
            );
        }
    }
}
