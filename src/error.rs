use thiserror::Error;

/// Construction-time configuration failures.
///
/// Every model constructor validates its configuration before building any
/// layer and returns one of these instead of silently substituting defaults.
/// Shape mismatches at forward time are left to the tensor backend.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown activation '{name}', expected one of {expected:?}")]
    UnknownActivation {
        name: String,
        expected: &'static [&'static str],
    },

    #[error("dropout {dropout} inside basis-expansion blocks is not implemented, set it to 0")]
    DropoutNotImplemented { dropout: f64 },

    #[error("unknown stack type '{name}', expected one of [identity, trend, seasonality]")]
    UnknownStackType { name: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl ModelError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ModelError::InvalidConfig {
            reason: reason.into(),
        }
    }
}
