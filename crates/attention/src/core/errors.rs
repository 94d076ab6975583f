//! Error types emitted by attention implementations and the comparison harness.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// The kernel cannot run on the device holding the inputs.
    #[error("unsupported device {location}")]
    UnsupportedDevice { location: String },
    /// A configuration value outside its accepted range.
    #[error("invalid attention config: {0}")]
    InvalidConfig(String),
    /// A backend-specific failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

/// Failures raised while comparing a fused kernel against the reference.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Attention(#[from] AttentionError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("{what}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(
        "{what}: {mismatched}/{total} elements not close (rtol={rtol}, atol={atol}); \
         max abs diff {max_abs:.3e}, max rel diff {max_rel:.3e}, worst at flat index {worst_index}"
    )]
    NotClose {
        what: String,
        mismatched: usize,
        total: usize,
        worst_index: usize,
        max_abs: f32,
        max_rel: f32,
        rtol: f64,
        atol: f64,
    },

    #[error("{what}: no gradient recorded")]
    MissingGradient { what: String },

    #[error("invalid case configuration: {0}")]
    InvalidCase(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("suite config error: {0}")]
    Toml(#[from] toml::de::Error),
}
