/// Errors raised by the GMM tree construction and registration pipeline.
#[derive(thiserror::Error, Debug)]
pub enum GmmTreeError {
    /// The source points cannot support a valid tree split.
    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    /// The requested tree level is outside the valid range.
    #[error("tree level {level} is outside the valid range [1, {max_level}]")]
    InvalidLevel {
        /// The requested level.
        level: usize,
        /// The deepest level available in the tree.
        max_level: usize,
    },

    /// The maximization step cannot produce a meaningful motion update.
    #[error("numerical instability: {0}")]
    NumericalInstability(String),
}
