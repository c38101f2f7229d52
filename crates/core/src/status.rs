use serde::{Deserialize, Serialize};

/// Status returned by every kernel step's `compute` entry point.
///
/// `Pending` is deliberately absent: a pended step returns [`StatusCode::Ok`]
/// and sets the `pending` flag on its run context instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok = 0,
    /// Malformed task descriptor. Never retried.
    ParameterInvalid = 1,
    /// Model/registry inconsistency.
    InnerError = 2,
    /// An underlying driver call failed.
    FromDriver = 3,
    /// A padded, degraded batch was produced.
    DiscardData = 4,
    /// Clean abort because the model is being torn down.
    ModelUnload = 5,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether the scheduler may advance past the step that returned this.
    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::DiscardData)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "OK"),
            StatusCode::ParameterInvalid => write!(f, "PARAMETER_INVALID"),
            StatusCode::InnerError => write!(f, "INNER_ERROR"),
            StatusCode::FromDriver => write!(f, "FROM_DRIVER"),
            StatusCode::DiscardData => write!(f, "DISCARD_DATA"),
            StatusCode::ModelUnload => write!(f, "MODEL_UNLOAD"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_codes_are_stable() {
        assert_eq!(StatusCode::Ok.code(), 0);
        assert_eq!(StatusCode::ModelUnload.code(), 5);
    }

    #[test]
    fn discard_data_counts_as_success() {
        assert!(StatusCode::DiscardData.is_success());
        assert!(!StatusCode::FromDriver.is_success());
        assert!(!StatusCode::ModelUnload.is_success());
    }
}
