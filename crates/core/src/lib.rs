pub mod config;
pub mod driver;
pub mod error;
pub mod ids;
pub mod status;

pub use config::{load_dotenv, GatherConfig, MismatchPolicy, SchedConfig};
pub use driver::{BufferHeader, Driver, EnqueueOutcome, SimDriver, DISCARD_RET_CODE};
pub use error::{DriverError, Result, SchedError};
pub use ids::*;
pub use status::StatusCode;
