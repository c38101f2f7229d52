use thiserror::Error;

use crate::ids::ModelId;
use crate::status::StatusCode;

/// A failed driver primitive, carrying the driver's raw return code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("driver {op} failed, ret[{code}]")]
pub struct DriverError {
    pub op: &'static str,
    pub code: i32,
}

impl DriverError {
    pub fn new(op: &'static str, code: i32) -> Self {
        Self { op, code }
    }
}

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("parameter invalid: {0}")]
    ParameterInvalid(String),

    #[error("inner error: {0}")]
    Inner(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("{0} is unloaded or being destroyed")]
    ModelUnloaded(ModelId),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

impl SchedError {
    /// Status a kernel step reports when it fails with this error.
    pub fn status(&self) -> StatusCode {
        match self {
            SchedError::ParameterInvalid(_) => StatusCode::ParameterInvalid,
            SchedError::Driver(_) => StatusCode::FromDriver,
            SchedError::ModelUnloaded(_) => StatusCode::ModelUnload,
            SchedError::Inner(_)
            | SchedError::Config(_)
            | SchedError::ConfigParse(_)
            | SchedError::ConfigIo(_) => StatusCode::InnerError,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(
            SchedError::ParameterInvalid("x".into()).status(),
            StatusCode::ParameterInvalid
        );
        assert_eq!(
            SchedError::from(DriverError::new("alloc", -12)).status(),
            StatusCode::FromDriver
        );
        assert_eq!(SchedError::ModelUnloaded(ModelId(1)).status(), StatusCode::ModelUnload);
        assert_eq!(SchedError::Inner("y".into()).status(), StatusCode::InnerError);
    }

    #[test]
    fn driver_error_message_names_the_operation() {
        let err = DriverError::new("free", 7);
        assert_eq!(err.to_string(), "driver free failed, ret[7]");
    }
}
