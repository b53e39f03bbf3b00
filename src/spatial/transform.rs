use super::Point3;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Kind of linear mapping held by a [`Transform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformType {
    Identity,
    Translation,
    Rigid,
    Affine,
    Composite,
}

/// Homogeneous 4x4 transform mapping points between physical spaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Row-major homogeneous matrix; the last row is `[0, 0, 0, 1]`.
    pub matrix: [[f64; 4]; 4],

    pub transform_type: TransformType,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub fn identity() -> Self {
        let mut matrix = [[0.0; 4]; 4];
        for (i, row) in matrix.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self {
            matrix,
            transform_type: TransformType::Identity,
        }
    }

    pub fn translation(offset: [f64; 3]) -> Self {
        let mut t = Self::identity();
        for (i, value) in offset.iter().enumerate() {
            t.matrix[i][3] = *value;
        }
        t.transform_type = TransformType::Translation;
        t
    }

    /// Build `x -> linear * x + offset`.
    pub fn from_linear_offset(linear: [[f64; 3]; 3], offset: [f64; 3], transform_type: TransformType) -> Self {
        let mut matrix = [[0.0; 4]; 4];
        for i in 0..3 {
            matrix[i][..3].copy_from_slice(&linear[i]);
            matrix[i][3] = offset[i];
        }
        matrix[3][3] = 1.0;
        Self {
            matrix,
            transform_type,
        }
    }

    /// Build `x -> linear * (x - center) + translation + center`, the
    /// centered parameterization used by ITK matrix-offset transforms.
    pub fn from_centered(
        linear: [[f64; 3]; 3],
        translation: [f64; 3],
        center: [f64; 3],
        transform_type: TransformType,
    ) -> Self {
        let mut offset = [0.0; 3];
        for i in 0..3 {
            let rotated_center: f64 = (0..3).map(|j| linear[i][j] * center[j]).sum();
            offset[i] = translation[i] + center[i] - rotated_center;
        }
        Self::from_linear_offset(linear, offset, transform_type)
    }

    /// Rigid rotation about `center` with ITK Euler3D ordering (Z * X * Y).
    pub fn from_euler_zxy(angles: [f64; 3], translation: [f64; 3], center: [f64; 3]) -> Self {
        let (sx, cx) = angles[0].sin_cos();
        let (sy, cy) = angles[1].sin_cos();
        let (sz, cz) = angles[2].sin_cos();

        let rx = [[1.0, 0.0, 0.0], [0.0, cx, -sx], [0.0, sx, cx]];
        let ry = [[cy, 0.0, sy], [0.0, 1.0, 0.0], [-sy, 0.0, cy]];
        let rz = [[cz, -sz, 0.0], [sz, cz, 0.0], [0.0, 0.0, 1.0]];

        let linear = mul3(&mul3(&rz, &rx), &ry);
        Self::from_centered(linear, translation, center, TransformType::Rigid)
    }

    pub fn linear(&self) -> [[f64; 3]; 3] {
        let mut linear = [[0.0; 3]; 3];
        for (i, row) in linear.iter_mut().enumerate() {
            row.copy_from_slice(&self.matrix[i][..3]);
        }
        linear
    }

    pub fn offset(&self) -> [f64; 3] {
        [self.matrix[0][3], self.matrix[1][3], self.matrix[2][3]]
    }

    /// Apply the transform to a point (homogeneous coordinate 1).
    pub fn apply(&self, p: Point3) -> Point3 {
        let v = [p.x, p.y, p.z, 1.0];
        let mut out = [0.0; 3];
        for (i, value) in out.iter_mut().enumerate() {
            *value = (0..4).map(|j| self.matrix[i][j] * v[j]).sum();
        }
        Point3::from(out)
    }

    /// `self ∘ inner`: apply `inner` first, then `self`.
    pub fn compose(&self, inner: &Transform) -> Transform {
        let mut matrix = [[0.0; 4]; 4];
        for i in 0..4 {
            for j in 0..4 {
                matrix[i][j] = (0..4).map(|k| self.matrix[i][k] * inner.matrix[k][j]).sum();
            }
        }
        let transform_type = match (self.transform_type, inner.transform_type) {
            (TransformType::Identity, other) | (other, TransformType::Identity) => other,
            _ => TransformType::Composite,
        };
        Transform {
            matrix,
            transform_type,
        }
    }

    /// Inverse transform, or `None` when the linear part is singular.
    pub fn inverse(&self) -> Option<Transform> {
        let inv = invert3(&self.linear())?;
        let offset = self.offset();
        let mut inv_offset = [0.0; 3];
        for i in 0..3 {
            inv_offset[i] = -(0..3).map(|j| inv[i][j] * offset[j]).sum::<f64>();
        }
        Some(Transform::from_linear_offset(inv, inv_offset, self.transform_type))
    }

    pub fn is_identity(&self, tolerance: f64) -> bool {
        let identity = Transform::identity();
        self.matrix
            .iter()
            .flatten()
            .zip(identity.matrix.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }

    pub fn is_finite(&self) -> bool {
        self.matrix.iter().flatten().all(|v| v.is_finite())
    }
}

fn mul3(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn invert3(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ])
}

/// Caller-owned transform slot.
///
/// Clones share the same storage, so a slot handed out to other parts of an
/// application keeps observing the content written by a finished run.
#[derive(Debug, Clone)]
pub struct TransformNode {
    name: String,
    content: Arc<RwLock<Transform>>,
}

impl TransformNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_content(name, Transform::identity())
    }

    pub fn with_content(name: impl Into<String>, transform: Transform) -> Self {
        Self {
            name: name.into(),
            content: Arc::new(RwLock::new(transform)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current content.
    pub fn transform(&self) -> Transform {
        match self.content.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Overwrite the content in place; the slot identity is unchanged.
    pub fn copy_content(&self, transform: &Transform) {
        match self.content.write() {
            Ok(mut guard) => *guard = transform.clone(),
            Err(poisoned) => *poisoned.into_inner() = transform.clone(),
        }
    }

    /// True when both handles refer to the same slot.
    pub fn same_node(&self, other: &TransformNode) -> bool {
        Arc::ptr_eq(&self.content, &other.content)
    }
}
