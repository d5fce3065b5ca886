use crate::core::error::AnalysisError;
use nalgebra::{Matrix3, Point3, Vector3};

pub const EPSILON: f64 = 1e-6;

/// Simulation cell: a 3x3 basis matrix (columns are the cell vectors),
/// an origin, per-axis periodicity flags and an optional 2D marker.
///
/// The inverse basis is precomputed so reduced/absolute conversions and
/// minimum-image wrapping stay cheap on the query hot paths.
#[derive(Debug, Clone)]
pub struct SimulationCell {
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
    origin: Point3<f64>,
    pbc: [bool; 3],
    is_2d: bool,
}

impl SimulationCell {
    pub fn new(
        matrix: Matrix3<f64>,
        origin: Point3<f64>,
        pbc: [bool; 3],
    ) -> Result<Self, AnalysisError> {
        for value in matrix.iter() {
            if !value.is_finite() {
                return Err(AnalysisError::InvalidInput(
                    "cell matrix contains a non-finite component".into(),
                ));
            }
        }
        let inverse = matrix.try_inverse().ok_or_else(|| {
            AnalysisError::InvalidInput("cell matrix is singular".into())
        })?;
        Ok(Self {
            matrix,
            inverse,
            origin,
            pbc,
            is_2d: false,
        })
    }

    /// Orthorhombic convenience constructor used throughout the tests.
    pub fn orthorhombic(lx: f64, ly: f64, lz: f64, pbc: [bool; 3]) -> Result<Self, AnalysisError> {
        Self::new(
            Matrix3::from_diagonal(&Vector3::new(lx, ly, lz)),
            Point3::origin(),
            pbc,
        )
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    pub fn inverse_matrix(&self) -> &Matrix3<f64> {
        &self.inverse
    }

    pub fn origin(&self) -> &Point3<f64> {
        &self.origin
    }

    pub fn pbc_flags(&self) -> [bool; 3] {
        self.pbc
    }

    pub fn set_pbc_flags(&mut self, pbc: [bool; 3]) {
        self.pbc = pbc;
    }

    pub fn is_2d(&self) -> bool {
        self.is_2d
    }

    pub fn set_2d(&mut self, flag: bool) {
        self.is_2d = flag;
    }

    /// Replaces the basis matrix, keeping the inverse in sync. The new
    /// matrix must be invertible (callers only ever substitute a thin but
    /// non-degenerate Z axis for 2D systems).
    pub fn set_matrix(&mut self, matrix: Matrix3<f64>) -> Result<(), AnalysisError> {
        let inverse = matrix.try_inverse().ok_or_else(|| {
            AnalysisError::InvalidInput("cell matrix is singular".into())
        })?;
        self.matrix = matrix;
        self.inverse = inverse;
        Ok(())
    }

    pub fn volume(&self) -> f64 {
        self.matrix.determinant().abs()
    }

    pub fn has_periodic_boundaries(&self) -> bool {
        self.pbc[0] || self.pbc[1] || self.pbc[2]
    }

    pub fn absolute_to_reduced_point(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.inverse * (p - self.origin))
    }

    pub fn reduced_to_absolute_point(&self, p: &Point3<f64>) -> Point3<f64> {
        self.origin + self.matrix * p.coords
    }

    pub fn absolute_to_reduced(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.inverse * v
    }

    pub fn reduced_to_absolute(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.matrix * v
    }

    /// Minimum-image wrap of a displacement vector along periodic axes.
    pub fn wrap_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        let mut rv = self.inverse * v;
        for dim in 0..3 {
            if self.pbc[dim] {
                rv[dim] -= rv[dim].round();
            }
        }
        self.matrix * rv
    }

    /// Minimum-image wrap of a displacement already in reduced coordinates.
    pub fn wrap_reduced_vector(&self, mut rv: Vector3<f64>) -> Vector3<f64> {
        for dim in 0..3 {
            if self.pbc[dim] {
                rv[dim] -= rv[dim].round();
            }
        }
        rv
    }

    /// Folds a point back into the primary cell along periodic axes.
    pub fn wrap_point(&self, p: &Point3<f64>) -> Point3<f64> {
        let mut rp = self.absolute_to_reduced_point(p);
        for dim in 0..3 {
            if self.pbc[dim] {
                rp[dim] -= rp[dim].floor();
            }
        }
        self.reduced_to_absolute_point(&rp)
    }

    /// True if the minimum-image convention would fold this vector.
    pub fn is_wrapped_vector(&self, v: &Vector3<f64>) -> bool {
        let rv = self.inverse * v;
        (0..3).any(|dim| self.pbc[dim] && rv[dim].abs() > 0.5)
    }

    /// Unit normal of the cell face spanned by the two other basis
    /// vectors, oriented to point out of the cell along axis `dim`.
    pub fn cell_normal_vector(&self, dim: usize) -> Vector3<f64> {
        let a = self.matrix.column((dim + 1) % 3).into_owned();
        let b = self.matrix.column((dim + 2) % 3).into_owned();
        let mut n = a.cross(&b);
        if n.dot(&self.matrix.column(dim)) < 0.0 {
            n = -n;
        }
        let len = n.norm();
        if len > EPSILON {
            n / len
        } else {
            Vector3::zeros()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_vector_folds_across_periodic_boundary() {
        let cell = SimulationCell::orthorhombic(10.0, 10.0, 10.0, [true, true, true]).unwrap();
        let v = Vector3::new(9.0, 0.2, -9.5);
        let w = cell.wrap_vector(&v);
        assert!((w.x - -1.0).abs() < 1e-12);
        assert!((w.y - 0.2).abs() < 1e-12);
        assert!(w.z.abs() <= 5.0 + 1e-12);
    }

    #[test]
    fn wrap_respects_open_boundaries() {
        let cell = SimulationCell::orthorhombic(10.0, 10.0, 10.0, [false, true, false]).unwrap();
        let v = Vector3::new(9.0, 9.0, 9.0);
        let w = cell.wrap_vector(&v);
        assert!((w.x - 9.0).abs() < 1e-12);
        assert!((w.y - -1.0).abs() < 1e-12);
        assert!((w.z - 9.0).abs() < 1e-12);
    }

    #[test]
    fn face_normals_point_outward() {
        let cell = SimulationCell::orthorhombic(4.0, 6.0, 8.0, [true, true, true]).unwrap();
        for dim in 0..3 {
            let n = cell.cell_normal_vector(dim);
            assert!((n.norm() - 1.0).abs() < 1e-12);
            assert!(n.dot(&cell.matrix().column(dim)) > 0.0);
        }
    }

    #[test]
    fn singular_cell_is_rejected() {
        let m = Matrix3::from_diagonal(&Vector3::new(1.0, 0.0, 1.0));
        assert!(SimulationCell::new(m, Point3::origin(), [true; 3]).is_err());
    }
}
