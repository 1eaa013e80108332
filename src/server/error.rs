use crate::errors::{AscomError, DriverError};
use thiserror::Error;

/// Dispatch-layer failures. Parameter and routing problems surface as plain
/// HTTP 400s; everything the device itself reports travels inside the
/// Alpaca envelope.
#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("Unknown action {action:?}")]
    UnknownAction { action: String },
    #[error("Missing parameter {name:?}")]
    MissingParameter { name: &'static str },
    #[error("Couldn't parse parameter {name:?}: {err}")]
    BadParameter {
        name: &'static str,
        #[source]
        err: serde_plain::Error,
    },
    #[error(transparent)]
    Ascom(#[from] AscomError),
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Self::Ascom(err.into())
    }
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
