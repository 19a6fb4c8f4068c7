use crate::linalg::{matmul33, matvec33, transform_points, transpose33};

/// Compute the rotation matrix from an axis and angle.
///
/// # Arguments
///
/// * `axis` - The axis of rotation.
/// * `angle` - The angle of rotation.
///
/// # Returns
///
/// The rotation matrix.
pub fn axis_angle_to_rotation_matrix(
    axis: &[f64; 3],
    angle: f64,
) -> Result<[[f64; 3]; 3], &'static str> {
    // normalize the vector
    let axis_norm = {
        let magnitude = (axis[0].powi(2) + axis[1].powi(2) + axis[2].powi(2)).sqrt();
        match magnitude < 1e-10 {
            true => return Err("cannot compute rotation matrix from a zero vector"),
            false => [
                axis[0] / magnitude,
                axis[1] / magnitude,
                axis[2] / magnitude,
            ],
        }
    };

    let (x, y, z) = (axis_norm[0], axis_norm[1], axis_norm[2]);

    let c = angle.cos();
    let s = angle.sin();
    let t = 1.0 - c;

    Ok([
        [c + x * x * t, x * y * t - z * s, x * z * t + y * s],
        [x * y * t + z * s, c + y * y * t, y * z * t - x * s],
        [x * z * t - y * s, y * z * t + x * s, c + z * z * t],
    ])
}

/// A rigid transformation composed of a rotation matrix and a translation
/// vector, mapping points as `p' = R * p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    /// The rotation matrix.
    pub rotation: [[f64; 3]; 3],
    /// The translation vector.
    pub translation: [f64; 3],
}

impl RigidTransform {
    /// The identity transformation.
    pub const IDENTITY: Self = Self {
        rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        translation: [0.0, 0.0, 0.0],
    };

    /// Create a new rigid transformation from a rotation and a translation.
    pub fn new(rotation: [[f64; 3]; 3], translation: [f64; 3]) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Create a rigid transformation from an axis-angle rotation and a
    /// translation.
    pub fn from_axis_angle(
        axis: &[f64; 3],
        angle: f64,
        translation: [f64; 3],
    ) -> Result<Self, &'static str> {
        Ok(Self {
            rotation: axis_angle_to_rotation_matrix(axis, angle)?,
            translation,
        })
    }

    /// Compose two rigid transformations, applying `other` first.
    pub fn compose(&self, other: &Self) -> Self {
        let mut rotation = [[0.0; 3]; 3];
        matmul33(&self.rotation, &other.rotation, &mut rotation);
        let rotated = matvec33(&self.rotation, &other.translation);
        Self {
            rotation,
            translation: [
                rotated[0] + self.translation[0],
                rotated[1] + self.translation[1],
                rotated[2] + self.translation[2],
            ],
        }
    }

    /// Invert the rigid transformation.
    ///
    /// `R' = R^T` and `t' = -R^T * t`.
    pub fn inverse(&self) -> Self {
        let rotation = transpose33(&self.rotation);
        let rotated = matvec33(&rotation, &self.translation);
        Self {
            rotation,
            translation: [-rotated[0], -rotated[1], -rotated[2]],
        }
    }

    /// Apply the transformation to a single point.
    pub fn transform_point(&self, point: &[f64; 3]) -> [f64; 3] {
        let rotated = matvec33(&self.rotation, point);
        [
            rotated[0] + self.translation[0],
            rotated[1] + self.translation[1],
            rotated[2] + self.translation[2],
        ]
    }

    /// Apply the transformation to a set of points.
    ///
    /// PRECONDITION: dst is a pre-allocated slice of the same size as src.
    pub fn transform_points(&self, src: &[[f64; 3]], dst: &mut [[f64; 3]]) {
        transform_points(src, &self.rotation, &self.translation, dst);
    }
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}
