#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("shape mismatch in {op}: {details}")]
    ShapeMismatch { op: &'static str, details: String },

    #[error("invalid argument to {op}: {details}")]
    InvalidArgument { op: &'static str, details: String },

    #[error("invalid state in {op}: {details}")]
    InvalidState { op: &'static str, details: String },

    #[error("gradient mismatch at {index:?}: analytic {analytic}, numerical {numerical}")]
    GradientMismatch {
        index: Vec<usize>,
        analytic: f64,
        numerical: f64,
    },
}

impl Error {
    pub fn shape_mismatch(op: &'static str, details: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            op,
            details: details.into(),
        }
    }

    pub fn invalid_argument(op: &'static str, details: impl Into<String>) -> Self {
        Error::InvalidArgument {
            op,
            details: details.into(),
        }
    }

    pub fn invalid_state(op: &'static str, details: impl Into<String>) -> Self {
        Error::InvalidState {
            op,
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
