//! se(3) twist algebra.
//!
//! A twist is a 6-vector `[w, v]` with the angular velocity `w` first and the
//! linear velocity `v` last. The exponential map of the angular part follows
//! the Rodrigues formula with a series fallback near zero.

use gmmreg_3d::linalg::{matmul33, matvec33};

// below this squared angle the closed form divides by near-zero
const SMALL_ANGLE_SQ: f64 = 1e-12;

/// Skew-symmetric generator of a 3-vector.
pub fn skew(v: &[f64; 3]) -> [[f64; 3]; 3] {
    [
        [0.0, -v[2], v[1]],
        [v[2], 0.0, -v[0]],
        [-v[1], v[0], 0.0],
    ]
}

/// Exponential map of a twist into a rotation matrix and translation vector.
///
/// The rotation is `exp(skew(w))` by the Rodrigues formula; the linear part
/// of the twist passes through as the translation.
pub fn twist_exp(twist: &[f64; 6]) -> ([[f64; 3]; 3], [f64; 3]) {
    let w = [twist[0], twist[1], twist[2]];
    let theta_sq = w[0] * w[0] + w[1] * w[1] + w[2] * w[2];

    // sin(t)/t and (1 - cos(t))/t^2, with second-order series near zero
    let (a, b) = if theta_sq > SMALL_ANGLE_SQ {
        let theta = theta_sq.sqrt();
        (theta.sin() / theta, (1.0 - theta.cos()) / theta_sq)
    } else {
        (1.0 - theta_sq / 6.0, 0.5 - theta_sq / 24.0)
    };

    let s = skew(&w);
    let mut s_sq = [[0.0; 3]; 3];
    matmul33(&s, &s, &mut s_sq);

    let mut rotation = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            let eye = if i == j { 1.0 } else { 0.0 };
            rotation[i][j] = eye + a * s[i][j] + b * s_sq[i][j];
        }
    }

    (rotation, [twist[3], twist[4], twist[5]])
}

/// Compose a twist with a prior rotation and translation.
///
/// The incremental motion acts on the left: `R' = exp(skew(w)) * R` and
/// `t' = exp(skew(w)) * t + v`.
pub fn twist_mul(
    twist: &[f64; 6],
    rotation: &[[f64; 3]; 3],
    translation: &[f64; 3],
) -> ([[f64; 3]; 3], [f64; 3]) {
    let (delta_r, delta_t) = twist_exp(twist);

    let mut new_rotation = [[0.0; 3]; 3];
    matmul33(&delta_r, rotation, &mut new_rotation);

    let rotated_t = matvec33(&delta_r, translation);
    let new_translation = [
        rotated_t[0] + delta_t[0],
        rotated_t[1] + delta_t[1],
        rotated_t[2] + delta_t[2],
    ];

    (new_rotation, new_translation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use gmmreg_3d::transforms::axis_angle_to_rotation_matrix;

    #[test]
    fn test_skew_antisymmetric() {
        let s = skew(&[1.0, 2.0, 3.0]);
        for i in 0..3 {
            assert_eq!(s[i][i], 0.0);
            for j in 0..3 {
                assert_eq!(s[i][j], -s[j][i]);
            }
        }
    }

    #[test]
    fn test_twist_exp_matches_axis_angle() -> Result<(), Box<dyn std::error::Error>> {
        let angle = 0.3;
        let twist = [angle, 0.0, 0.0, 0.0, 0.0, 0.0];
        let (rotation, translation) = twist_exp(&twist);

        let expected = axis_angle_to_rotation_matrix(&[1.0, 0.0, 0.0], angle)?;
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(rotation[i][j], expected[i][j], epsilon = 1e-12);
            }
        }
        assert_eq!(translation, [0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_twist_exp_near_zero_is_orthonormal() {
        let twist = [1e-9, -2e-9, 1e-9, 0.1, 0.2, 0.3];
        let (rotation, translation) = twist_exp(&twist);

        // R^T R = I
        let mut prod = [[0.0; 3]; 3];
        matmul33(&gmmreg_3d::linalg::transpose33(&rotation), &rotation, &mut prod);
        for (i, row) in prod.iter().enumerate() {
            for (j, val) in row.iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(val, &expected, epsilon = 1e-12);
            }
        }
        assert_eq!(translation, [0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_zero_twist_preserves_prior() -> Result<(), Box<dyn std::error::Error>> {
        let rotation = axis_angle_to_rotation_matrix(&[0.0, 1.0, 1.0], 0.8)?;
        let translation = [0.5, -1.0, 2.0];

        let (new_rotation, new_translation) =
            twist_mul(&[0.0; 6], &rotation, &translation);

        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(new_rotation[i][j], rotation[i][j], epsilon = 1e-12);
            }
            assert_relative_eq!(new_translation[i], translation[i], epsilon = 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_twist_mul_rotates_translation() {
        // half turn about z moves t = [1, 0, 0] to [-1, 0, 0]
        let twist = [0.0, 0.0, std::f64::consts::PI, 0.0, 0.0, 0.0];
        let eye = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let (_, new_translation) = twist_mul(&twist, &eye, &[1.0, 0.0, 0.0]);
        assert_relative_eq!(new_translation[0], -1.0, epsilon = 1e-12);
        assert_relative_eq!(new_translation[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(new_translation[2], 0.0, epsilon = 1e-12);
    }
}
