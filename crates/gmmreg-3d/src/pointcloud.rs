use glam::DVec3;

/// A point cloud holding an ordered sequence of 3D points.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    // The points in the point cloud.
    points: Vec<[f64; 3]>,
}

impl PointCloud {
    /// Create a new point cloud from a vector of points.
    pub fn new(points: Vec<[f64; 3]>) -> Self {
        Self { points }
    }

    /// Get the number of points in the point cloud.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the point cloud is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Get as reference the points in the point cloud.
    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    /// Convert a point from [f64; 3] to DVec3.
    fn point_to_dvec3(point: &[f64; 3]) -> DVec3 {
        DVec3::new(point[0], point[1], point[2])
    }

    /// Get the minimum bound of the point cloud.
    pub fn get_min_bound(&self) -> DVec3 {
        self.points
            .iter()
            .map(Self::point_to_dvec3)
            .fold(DVec3::INFINITY, |a, b| a.min(b))
    }

    /// Get the maximum bound of the point cloud.
    pub fn get_max_bound(&self) -> DVec3 {
        self.points
            .iter()
            .map(Self::point_to_dvec3)
            .fold(DVec3::NEG_INFINITY, |a, b| a.max(b))
    }

    /// Get the centroid of the point cloud, or zero for an empty cloud.
    pub fn centroid(&self) -> DVec3 {
        if self.points.is_empty() {
            return DVec3::ZERO;
        }
        let sum = self
            .points
            .iter()
            .map(Self::point_to_dvec3)
            .fold(DVec3::ZERO, |a, b| a + b);
        sum / self.points.len() as f64
    }
}

/// Types that expose an ordered slice of 3D points.
///
/// Implemented for the raw slice/vector representations and for
/// [`PointCloud`], so that the registration APIs accept either one at every
/// boundary.
pub trait AsPoints {
    /// Borrow the points as an ordered slice of 3-vectors.
    fn as_points(&self) -> &[[f64; 3]];
}

impl AsPoints for PointCloud {
    fn as_points(&self) -> &[[f64; 3]] {
        self.points()
    }
}

impl AsPoints for Vec<[f64; 3]> {
    fn as_points(&self) -> &[[f64; 3]] {
        self
    }
}

impl AsPoints for [[f64; 3]] {
    fn as_points(&self) -> &[[f64; 3]] {
        self
    }
}

impl AsPoints for &[[f64; 3]] {
    fn as_points(&self) -> &[[f64; 3]] {
        self
    }
}
