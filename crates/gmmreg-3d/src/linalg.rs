/// Utility function to convert a 3-vector to a faer column view.
pub fn array3_to_faer_col(array: &[f64; 3]) -> faer::ColRef<'_, f64> {
    faer::col::from_slice(array)
}

/// Utility function to convert a 3x3 array to a faer matrix view.
pub fn array33_to_faer_mat33(array: &[[f64; 3]; 3]) -> faer::MatRef<'_, f64> {
    let array_slice =
        unsafe { std::slice::from_raw_parts(array.as_ptr() as *const f64, array.len() * 3) };
    faer::mat::from_row_major_slice(array_slice, 3, 3)
}

/// Transform a set of points using a rotation and translation.
///
/// # Arguments
///
/// * `src_points` - A set of points to be transformed.
/// * `dst_r_src` - A rotation matrix.
/// * `dst_t_src` - A translation vector.
/// * `dst_points` - A pre-allocated vector to store the transformed points.
///
/// PRECONDITION: dst_points is a pre-allocated vector of the same size as source.
///
/// Example:
///
/// ```no_run
/// use gmmreg_3d::linalg::transform_points;
///
/// let src_points = vec![[2.0, 2.0, 2.0], [3.0, 4.0, 5.0]];
/// let rotation = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
/// let translation = [0.0, 0.0, 0.0];
/// let mut dst_points = vec![[0.0; 3]; src_points.len()];
/// transform_points(&src_points, &rotation, &translation, &mut dst_points);
/// ```
pub fn transform_points(
    src_points: &[[f64; 3]],
    dst_r_src: &[[f64; 3]; 3],
    dst_t_src: &[f64; 3],
    dst_points: &mut [[f64; 3]],
) {
    assert_eq!(src_points.len(), dst_points.len());

    // create views of the rotation and translation matrices
    let dst_r_src_mat = array33_to_faer_mat33(dst_r_src);
    let dst_t_src_col = array3_to_faer_col(dst_t_src);

    // create view of the source points
    let points_in_src = {
        let src_points_slice = unsafe {
            std::slice::from_raw_parts(src_points.as_ptr() as *const f64, src_points.len() * 3)
        };
        // SAFETY: src_points_slice is an Nx3 matrix where each row represents a 3D point
        faer::mat::from_row_major_slice(src_points_slice, src_points.len(), 3)
    };

    // create a mutable view of the destination points
    let mut points_in_dst = {
        let dst_points_slice = unsafe {
            std::slice::from_raw_parts_mut(
                dst_points.as_mut_ptr() as *mut f64,
                dst_points.len() * 3,
            )
        };
        // SAFETY: dst_points_slice is a 3xN matrix where each column represents a 3D point
        faer::mat::from_column_major_slice_mut(dst_points_slice, 3, dst_points.len())
    };

    // perform the matrix multiplication
    faer::linalg::matmul::matmul(
        &mut points_in_dst,
        dst_r_src_mat,
        points_in_src.transpose(),
        None,
        1.0,
        faer::Parallelism::None,
    );

    // SAFETY: dst_t_src is guaranteed to be length 3 by construction
    let (tx, ty, tz) = unsafe {
        (
            dst_t_src_col.read_unchecked(0),
            dst_t_src_col.read_unchecked(1),
            dst_t_src_col.read_unchecked(2),
        )
    };

    // SAFETY: points_in_dst is a 3xN matrix where each column represents a 3D point
    // The unchecked reads/writes are within bounds as we're only accessing indices 0,1,2
    for mut col in points_in_dst.col_iter_mut() {
        unsafe {
            col.write_unchecked(0, col.read_unchecked(0) + tx);
            col.write_unchecked(1, col.read_unchecked(1) + ty);
            col.write_unchecked(2, col.read_unchecked(2) + tz);
        }
    }
}

/// Multiply two 3x3 matrices, storing the product in `dst`.
pub fn matmul33(lhs: &[[f64; 3]; 3], rhs: &[[f64; 3]; 3], dst: &mut [[f64; 3]; 3]) {
    for i in 0..3 {
        for j in 0..3 {
            dst[i][j] = lhs[i][0] * rhs[0][j] + lhs[i][1] * rhs[1][j] + lhs[i][2] * rhs[2][j];
        }
    }
}

/// Multiply a 3x3 matrix by a 3-vector.
#[inline]
pub fn matvec33(mat: &[[f64; 3]; 3], vec: &[f64; 3]) -> [f64; 3] {
    [
        mat[0][0] * vec[0] + mat[0][1] * vec[1] + mat[0][2] * vec[2],
        mat[1][0] * vec[0] + mat[1][1] * vec[1] + mat[1][2] * vec[2],
        mat[2][0] * vec[0] + mat[2][1] * vec[1] + mat[2][2] * vec[2],
    ]
}

/// Transpose a 3x3 matrix.
#[inline]
pub fn transpose33(mat: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    [
        [mat[0][0], mat[1][0], mat[2][0]],
        [mat[0][1], mat[1][1], mat[2][1]],
        [mat[0][2], mat[1][2], mat[2][2]],
    ]
}

/// Cross product of two 3-vectors.
#[inline]
pub fn cross3(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Outer product `a * b^T` of two 3-vectors.
#[inline]
pub fn outer3(a: &[f64; 3], b: &[f64; 3]) -> [[f64; 3]; 3] {
    [
        [a[0] * b[0], a[0] * b[1], a[0] * b[2]],
        [a[1] * b[0], a[1] * b[1], a[1] * b[2]],
        [a[2] * b[0], a[2] * b[1], a[2] * b[2]],
    ]
}

/// Determinant of a 3x3 matrix.
pub fn det33(mat: &[[f64; 3]; 3]) -> f64 {
    mat[0][0] * (mat[1][1] * mat[2][2] - mat[1][2] * mat[2][1])
        - mat[0][1] * (mat[1][0] * mat[2][2] - mat[1][2] * mat[2][0])
        + mat[0][2] * (mat[1][0] * mat[2][1] - mat[1][1] * mat[2][0])
}

/// Inverse of a 3x3 matrix by the adjugate formula.
///
/// Returns `None` when the matrix is singular.
pub fn inverse33(mat: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = det33(mat);
    if det.abs() < f64::MIN_POSITIVE {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        [
            (mat[1][1] * mat[2][2] - mat[1][2] * mat[2][1]) * inv_det,
            (mat[0][2] * mat[2][1] - mat[0][1] * mat[2][2]) * inv_det,
            (mat[0][1] * mat[1][2] - mat[0][2] * mat[1][1]) * inv_det,
        ],
        [
            (mat[1][2] * mat[2][0] - mat[1][0] * mat[2][2]) * inv_det,
            (mat[0][0] * mat[2][2] - mat[0][2] * mat[2][0]) * inv_det,
            (mat[0][2] * mat[1][0] - mat[0][0] * mat[1][2]) * inv_det,
        ],
        [
            (mat[1][0] * mat[2][1] - mat[1][1] * mat[2][0]) * inv_det,
            (mat[0][1] * mat[2][0] - mat[0][0] * mat[2][1]) * inv_det,
            (mat[0][0] * mat[1][1] - mat[0][1] * mat[1][0]) * inv_det,
        ],
    ])
}
