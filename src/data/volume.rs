use crate::spatial::{Point3, Transform, TransformType};
use ndarray::Array3;

/// A scalar 3D image with its physical geometry.
///
/// Voxels are stored as `data[[k, j, i]]` so that `i` (x) varies fastest in
/// memory, matching the on-disk order of NRRD and most medical formats.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array3<f32>,
    spacing: [f64; 3],
    origin: [f64; 3],
    /// Direction cosines; column `c` is the world direction of index axis `c`.
    direction: [[f64; 3]; 3],
}

impl Volume {
    pub fn new(data: Array3<f32>, spacing: [f64; 3], origin: [f64; 3]) -> Self {
        Self {
            data,
            spacing,
            origin,
            direction: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    pub fn with_direction(mut self, direction: [[f64; 3]; 3]) -> Self {
        self.direction = direction;
        self
    }

    /// Build a volume of `dims = [nx, ny, nz]` from a voxel function `f(i, j, k)`.
    pub fn from_fn(dims: [usize; 3], spacing: [f64; 3], origin: [f64; 3], mut f: impl FnMut(usize, usize, usize) -> f32) -> Self {
        let data = Array3::from_shape_fn((dims[2], dims[1], dims[0]), |(k, j, i)| f(i, j, k));
        Self::new(data, spacing, origin)
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    pub fn direction(&self) -> [[f64; 3]; 3] {
        self.direction
    }

    /// Size as `[nx, ny, nz]`.
    pub fn dims(&self) -> [usize; 3] {
        let (nz, ny, nx) = self.data.dim();
        [nx, ny, nz]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn value(&self, i: usize, j: usize, k: usize) -> f32 {
        self.data[[k, j, i]]
    }

    /// Continuous index to world transform: `origin + D * (spacing ⊙ index)`.
    pub fn index_to_world(&self) -> Transform {
        let mut linear = [[0.0; 3]; 3];
        for (r, row) in linear.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = self.direction[r][c] * self.spacing[c];
            }
        }
        Transform::from_linear_offset(linear, self.origin, TransformType::Affine)
    }

    /// World to continuous index transform, `None` for degenerate geometry.
    pub fn world_to_index(&self) -> Option<Transform> {
        self.index_to_world().inverse()
    }

    pub fn voxel_center(&self, i: usize, j: usize, k: usize) -> Point3 {
        self.index_to_world().apply(Point3::new(i as f64, j as f64, k as f64))
    }

    /// Trilinear interpolation at a continuous index; `None` outside the grid.
    pub fn sample(&self, index: Point3) -> Option<f32> {
        let [nx, ny, nz] = self.dims();
        if nx == 0 || ny == 0 || nz == 0 {
            return None;
        }
        let coords = index.to_array();
        let limits = [nx, ny, nz];

        let mut base = [0usize; 3];
        let mut frac = [0.0f64; 3];
        for axis in 0..3 {
            let c = coords[axis];
            let max = (limits[axis] - 1) as f64;
            if !(0.0..=max).contains(&c) {
                return None;
            }
            let floor = c.floor();
            // Clamp so the upper neighbour stays inside the grid.
            let b = (floor as usize).min(limits[axis].saturating_sub(2));
            base[axis] = b;
            frac[axis] = if limits[axis] == 1 { 0.0 } else { c - b as f64 };
        }

        let step = |axis: usize| usize::from(limits[axis] > 1);
        let mut value = 0.0f64;
        for dk in 0..=step(2) {
            let wk = if dk == 0 { 1.0 - frac[2] } else { frac[2] };
            for dj in 0..=step(1) {
                let wj = if dj == 0 { 1.0 - frac[1] } else { frac[1] };
                for di in 0..=step(0) {
                    let wi = if di == 0 { 1.0 - frac[0] } else { frac[0] };
                    let v = self.data[[base[2] + dk, base[1] + dj, base[0] + di]] as f64;
                    value += wi * wj * wk * v;
                }
            }
        }
        Some(value as f32)
    }

    /// Minimum and maximum intensity, `None` for an empty volume.
    pub fn intensity_range(&self) -> Option<(f32, f32)> {
        self.data.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }
}
