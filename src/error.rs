//! Error types for entrenar-privacy.

use thiserror::Error;

/// Errors raised by the layer library, the optimizers and the privacy engine.
///
/// Every variant is a contract violation: nothing here is retried, and the
/// call that raised it leaves prior state (ledger, hooks, gradients) as it was.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Incompatible module '{layer_name}' ({layer_type}): no per-example gradients")]
    IncompatibleModule {
        layer_name: String,
        layer_type: String,
    },

    #[error("Already attached: {0}")]
    DoubleAttach(String),

    #[error("Parameter '{param}' has a gradient but no per-example gradient sample")]
    MissingGradSample { param: String },

    #[error("Parameter '{param}' holds a stale per-example gradient sample")]
    StaleGradSample { param: String },

    #[error("Parameter '{param}' has {actual} per-example samples, expected {expected}")]
    SampleCountMismatch {
        param: String,
        expected: usize,
        actual: usize,
    },

    #[error("No trainable parameter has a gradient to privatize")]
    NoGradients,

    #[error("Invalid target delta: {0} (must be in (0, 1))")]
    InvalidTargetDelta(f64),

    #[error("Privacy ledger is empty: no steps recorded")]
    EmptyLedger,

    #[error("Privacy engine is not attached")]
    NotAttached,

    #[error("Privacy budget exhausted: spent {spent:.4} > allowed {budget:.4}")]
    BudgetExhausted { spent: f64, budget: f64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error(transparent)]
    NdShape(#[from] ndarray::ShapeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for entrenar-privacy operations
pub type Result<T> = std::result::Result<T, Error>;
