//! Nearest-center classification against one tree level.

use kiddo::immutable::float::kdtree::ImmutableKdTree;
use rayon::prelude::*;

use crate::error::GmmTreeError;
use crate::tree::{level_range, GmmNode};

/// Assign each query point to the nearest node center of one tree level.
///
/// # Arguments
///
/// * `nodes` - Flat node arena from the builder.
/// * `tree_level` - Depth of the tree the arena was built with.
/// * `level` - The level to classify against, in `[1, tree_level]`.
/// * `queries` - Query points.
/// * `parallel` - Run the per-query lookups on the rayon pool.
///
/// # Returns
///
/// One label per query point: the index of the nearest center within the
/// level's contiguous node slice.
///
/// # Errors
///
/// [`GmmTreeError::InvalidLevel`] when `level` is outside `[1, tree_level]`.
pub fn classify(
    nodes: &[GmmNode],
    tree_level: usize,
    level: usize,
    queries: &[[f64; 3]],
    parallel: bool,
) -> Result<Vec<usize>, GmmTreeError> {
    if level < 1 || level > tree_level {
        return Err(GmmTreeError::InvalidLevel {
            level,
            max_level: tree_level,
        });
    }

    let centers = nodes[level_range(level)]
        .iter()
        .map(|node| node.mean)
        .collect::<Vec<_>>();

    // nearest-center lookup through a kd-tree over the level's centers
    let kdtree: ImmutableKdTree<f64, u32, 3, 32> = ImmutableKdTree::new_from_slice(&centers);

    let best = |query: &[f64; 3]| {
        kdtree
            .nearest_one::<kiddo::SquaredEuclidean>(query)
            .item as usize
    };

    let labels = if parallel {
        queries.par_iter().map(best).collect()
    } else {
        queries.iter().map(best).collect()
    };

    Ok(labels)
}
