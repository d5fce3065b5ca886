use nalgebra::{Point3, Vector3};

/// Contiguous typed per-atom array with a fixed component count per row.
///
/// The analysis stages hand each other these plain arrays instead of an
/// ownership graph: positions, structure types, orientations, neighbor
/// lists, cluster ids, symmetry permutation indices, correspondence codes
/// and PTM auxiliary data all live in one of the three variants below.
/// Auxiliary properties are dropped explicitly as soon as the last
/// consumer stage completes to bound peak memory.
#[derive(Debug, Clone)]
pub struct IntProperty {
    data: Vec<i32>,
    components: usize,
}

#[derive(Debug, Clone)]
pub struct Int64Property {
    data: Vec<u64>,
    components: usize,
}

#[derive(Debug, Clone)]
pub struct FloatProperty {
    data: Vec<f64>,
    components: usize,
}

impl IntProperty {
    pub fn new(count: usize, components: usize, fill: i32) -> Self {
        Self {
            data: vec![fill; count * components],
            components,
        }
    }

    pub fn len(&self) -> usize {
        if self.components == 0 {
            0
        } else {
            self.data.len() / self.components
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn component_count(&self) -> usize {
        self.components
    }

    pub fn get(&self, index: usize) -> i32 {
        debug_assert_eq!(self.components, 1);
        self.data[index]
    }

    pub fn set(&mut self, index: usize, value: i32) {
        debug_assert_eq!(self.components, 1);
        self.data[index] = value;
    }

    pub fn get_component(&self, index: usize, component: usize) -> i32 {
        self.data[index * self.components + component]
    }

    pub fn set_component(&mut self, index: usize, component: usize, value: i32) {
        self.data[index * self.components + component] = value;
    }

    pub fn row(&self, index: usize) -> &[i32] {
        &self.data[index * self.components..(index + 1) * self.components]
    }

    pub fn row_mut(&mut self, index: usize) -> &mut [i32] {
        &mut self.data[index * self.components..(index + 1) * self.components]
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [i32] {
        &mut self.data
    }
}

impl Int64Property {
    pub fn new(count: usize, fill: u64) -> Self {
        Self {
            data: vec![fill; count],
            components: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: usize) -> u64 {
        self.data[index]
    }

    pub fn set(&mut self, index: usize, value: u64) {
        self.data[index] = value;
    }
}

impl FloatProperty {
    pub fn new(count: usize, components: usize, fill: f64) -> Self {
        Self {
            data: vec![fill; count * components],
            components,
        }
    }

    /// Builds a 3-component position property from a flat xyz array.
    pub fn from_positions(positions: &[[f64; 3]]) -> Self {
        let mut data = Vec::with_capacity(positions.len() * 3);
        for p in positions {
            data.extend_from_slice(p);
        }
        Self {
            data,
            components: 3,
        }
    }

    pub fn len(&self) -> usize {
        if self.components == 0 {
            0
        } else {
            self.data.len() / self.components
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn component_count(&self) -> usize {
        self.components
    }

    pub fn get(&self, index: usize) -> f64 {
        debug_assert_eq!(self.components, 1);
        self.data[index]
    }

    pub fn set(&mut self, index: usize, value: f64) {
        debug_assert_eq!(self.components, 1);
        self.data[index] = value;
    }

    pub fn row(&self, index: usize) -> &[f64] {
        &self.data[index * self.components..(index + 1) * self.components]
    }

    pub fn row_mut(&mut self, index: usize) -> &mut [f64] {
        &mut self.data[index * self.components..(index + 1) * self.components]
    }

    pub fn point3(&self, index: usize) -> Point3<f64> {
        let r = self.row(index);
        Point3::new(r[0], r[1], r[2])
    }

    pub fn set_point3(&mut self, index: usize, p: &Point3<f64>) {
        let r = self.row_mut(index);
        r[0] = p.x;
        r[1] = p.y;
        r[2] = p.z;
    }

    pub fn vector3(&self, index: usize) -> Vector3<f64> {
        let r = self.row(index);
        Vector3::new(r[0], r[1], r[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_accessors_are_consistent() {
        let mut p = IntProperty::new(4, 3, -1);
        p.set_component(2, 1, 7);
        assert_eq!(p.row(2), &[-1, 7, -1]);
        assert_eq!(p.len(), 4);
    }

    #[test]
    fn positions_round_trip() {
        let p = FloatProperty::from_positions(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(p.len(), 2);
        assert_eq!(p.point3(1), Point3::new(4.0, 5.0, 6.0));
    }
}
