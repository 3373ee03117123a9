use thiserror::Error;

/// Unified error type for `dsgers` operations.
#[derive(Debug, Error)]
pub enum DsgeError {
    /// Raised when provided arrays or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, often the model-implied value.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when a parameter is assigned a value outside its bounds.
    #[error("value {value} of parameter `{key}` lies outside its bounds [{lower}, {upper}]")]
    BoundsViolation {
        key: String,
        value: f64,
        lower: f64,
        upper: f64,
    },

    /// Raised when a model-space value cannot be mapped onto the real line.
    #[error("value {value} of parameter `{key}` is outside the domain of its transform")]
    TransformDomain { key: String, value: f64 },

    /// Raised when a fixed parameter is constructed with a prior.
    #[error("fixed parameter `{key}` cannot carry a prior")]
    FixedParameterPrior { key: String },

    /// Raised when two parameters share a key inside one collection.
    #[error("parameter key `{key}` appears more than once")]
    DuplicateParameter { key: String },

    /// Raised when a lookup names a key that is not in the collection.
    #[error("no parameter named `{key}`")]
    UnknownParameter { key: String },

    /// Raised when prior hyperparameters do not describe a valid density.
    #[error("invalid prior: {reason}")]
    InvalidPrior { reason: String },

    /// Raised when the number of unstable roots cannot be matched by the expectational errors.
    #[error(
        "no stable equilibrium exists: {unstable} unstable roots but only {spanned} independent expectational errors load on them"
    )]
    NoStableSolution { unstable: usize, spanned: usize },

    /// Raised when the stable solution is not unique.
    #[error("equilibrium is indeterminate: {loose} loose expectational errors")]
    Indeterminacy { loose: usize },

    /// Raised when a generalized eigenvalue pair is 0/0.
    #[error("coincident zeros in the generalized Schur form at position {position}")]
    CoincidentZeros { position: usize },

    /// Raised when the QZ iteration or the eigenvalue reordering breaks down.
    #[error("QZ decomposition failed: {reason}")]
    QzFailure { reason: &'static str },

    /// Raised when the Kalman filter meets a non positive-definite innovation covariance.
    #[error("innovation covariance is singular in period {period}")]
    SingularInnovation { period: usize },

    /// Raised when linear algebra operations encounter a singular system.
    #[error("matrix in {context} is singular")]
    SingularMatrix { context: &'static str },

    /// Raised when numerical routines produce NaN.
    #[error("encountered NaN during {context}")]
    NumericalError { context: &'static str },

    /// Raised when finite differencing the objective yields a non-finite entry.
    #[error("Hessian entry ({row}, {col}) is not finite")]
    HessianNotFinite { row: usize, col: usize },

    /// Raised when the sampler starts from a point with zero posterior density.
    #[error("starting point has log posterior {value}")]
    InfeasibleStart { value: f64 },

    /// Raised when state augmentation overwrites part of the solved transition.
    #[error("augmented transition altered the solved {block}")]
    AugmentationAltered { block: &'static str },

    /// Raised when an option value is outside its admissible range.
    #[error("invalid option `{option}`: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: &'static str,
    },
}

impl DsgeError {
    /// Helper to format a [`DimensionMismatch`](DsgeError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper to raise when a matrix factorization fails due to singularity.
    pub fn singular(context: &'static str) -> Self {
        Self::SingularMatrix { context }
    }

    /// Helper for rejecting out-of-range option values.
    pub fn invalid_option(option: &'static str, reason: &'static str) -> Self {
        Self::InvalidOption { option, reason }
    }

    /// Whether this error is an expected outcome of evaluating a parameter draw
    /// (as opposed to a malformed model or input).
    ///
    /// The posterior maps these to a log density of negative infinity.
    pub fn is_infeasible_draw(&self) -> bool {
        matches!(
            self,
            Self::BoundsViolation { .. }
                | Self::TransformDomain { .. }
                | Self::NoStableSolution { .. }
                | Self::Indeterminacy { .. }
                | Self::CoincidentZeros { .. }
                | Self::QzFailure { .. }
                | Self::SingularInnovation { .. }
                | Self::SingularMatrix { .. }
        )
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, DsgeError>;
