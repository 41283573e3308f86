//! Error type shared by the data, model and I/O layers.

use thiserror::Error;

/// Errors raised while loading data, validating priors or writing results.
///
/// Numerical trouble inside the line search is not represented here: a factor
/// whose update cannot produce a finite loss is simply left unchanged for the
/// sweep.
#[derive(Debug, Error)]
pub enum CaviError {
    #[error("invalid data: {reason}")]
    InvalidData { reason: String },

    #[error("invalid prior for {field}: {reason}")]
    InvalidPrior { field: &'static str, reason: String },

    #[error("prior precision matrix is not symmetric positive definite")]
    SingularPrecision,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, CaviError>;

/// Checks that a scale, rate, shape or concentration parameter is strictly positive.
pub(crate) fn positive(value: f64, field: &'static str) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(CaviError::InvalidPrior {
            field,
            reason: format!("expected a finite value > 0, got {value}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_accepts_and_rejects() {
        assert_eq!(positive(0.5, "beta0").unwrap(), 0.5);
        assert!(positive(0.0, "beta0").is_err());
        assert!(positive(-1.0, "a0").is_err());
        assert!(positive(f64::NAN, "b0").is_err());
        assert!(positive(f64::INFINITY, "b0").is_err());
    }

    #[test]
    fn test_error_messages() {
        let err = positive(-2.0, "alpha0").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid prior for alpha0: expected a finite value > 0, got -2"
        );
        let err = CaviError::InvalidData {
            reason: "empty".to_string(),
        };
        assert_eq!(err.to_string(), "invalid data: empty");
    }
}
