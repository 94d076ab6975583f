//! Configuration options shared by all attention implementations.
//!
//! The [`Config`] struct captures run-time knobs such as dropout and causality
//! that callers can tune without swapping implementations.

use super::AttentionError;

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Probability for dropout applied to attention weights.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
    /// Restrict each query to keys at or before its own position.
    pub causal: bool,
    /// Ask fused kernels to also hand back the softmax matrix.
    pub return_softmax: bool,
}

impl Config {
    /// Validated dropout probability, `0.0` when disabled.
    pub fn dropout(&self) -> Result<f32, AttentionError> {
        match self.dropout_p {
            None => Ok(0.0),
            Some(p) if (0.0..1.0).contains(&p) => Ok(p),
            Some(p) => Err(AttentionError::InvalidConfig(format!(
                "dropout probability must be in [0, 1), got {p}"
            ))),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dropout_p: None,
            causal: true,
            return_softmax: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_causal_without_dropout() {
        let config = Config::default();
        assert!(config.causal);
        assert!(!config.return_softmax);
        assert_eq!(config.dropout().unwrap(), 0.0);
    }

    #[test]
    fn dropout_outside_unit_interval_is_rejected() {
        for p in [-0.1f32, 1.0, 1.5, f32::NAN] {
            let config = Config {
                dropout_p: Some(p),
                ..Config::default()
            };
            assert!(
                matches!(config.dropout(), Err(AttentionError::InvalidConfig(_))),
                "p={p}"
            );
        }
    }
}
