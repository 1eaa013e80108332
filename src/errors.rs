use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;

/// Numeric Alpaca error code as carried in the `ErrorNumber` envelope field.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct AscomErrorCode(pub u16);

/// Error payload of the Alpaca response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("ASCOM error {code}: {message}")]
pub struct AscomError {
    #[serde(rename = "ErrorNumber")]
    pub code: AscomErrorCode,
    #[serde(rename = "ErrorMessage")]
    pub message: Cow<'static, str>,
}

impl AscomError {
    pub fn new(code: AscomErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The all-clear marker merged into every successful envelope.
    pub fn none() -> Self {
        Self::new(AscomErrorCode(0), "")
    }
}

pub type AscomResult<T = ()> = Result<T, AscomError>;

macro_rules! ascom_error_codes {
  ($(#[doc = $doc:literal] $name:ident = $value:literal,)*) => {
    impl AscomErrorCode {
      $(
        #[doc = $doc]
        pub const $name: Self = Self($value);
      )*
    }

    impl std::fmt::Debug for AscomErrorCode {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
          $(
            Self::$name => f.write_str(stringify!($name)),
          )*
          Self(code) => write!(f, "{code:#X}"),
        }
      }
    }

    impl std::fmt::Display for AscomErrorCode {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
      }
    }
  };
}

ascom_error_codes! {
  #[doc = "The communications channel is not connected."]
  NOT_CONNECTED = 0x407,
  #[doc = "Invalid value."]
  INVALID_VALUE = 0x402,
  #[doc = "The requested operation can not be undertaken at this time."]
  INVALID_OPERATION = 0x400,
  #[doc = "Unexpected driver failure (serial timeout, protocol error, ...)."]
  DRIVER_ERROR = 0x500,
  #[doc = "'catch-all' error code used when nothing else was specified."]
  UNSPECIFIED = 0x4FF,
}

/// Failures raised by the protocol engine and the focuser controller.
///
/// The first three kinds are invariant violations and are never retried;
/// the rest surface only after the protocol-level retry budget is spent.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("focuser is not connected")]
    NotConnected,

    #[error("{0}")]
    InvalidValue(String),

    #[error("{0}")]
    InvalidOperation(String),

    #[error("failed to open serial port {port}: {source}")]
    PortOpen {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("no serial port available: {0}")]
    PortUnavailable(String),

    #[error("no valid reply to {cmd} after {attempts} attempts")]
    SerialTimeout { cmd: &'static str, attempts: u32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;

impl DriverError {
    pub fn code(&self) -> AscomErrorCode {
        match self {
            // Opening failures count as "channel not connected".
            Self::NotConnected | Self::PortOpen { .. } | Self::PortUnavailable(_) => {
                AscomErrorCode::NOT_CONNECTED
            }
            Self::InvalidValue(_) => AscomErrorCode::INVALID_VALUE,
            Self::InvalidOperation(_) => AscomErrorCode::INVALID_OPERATION,
            Self::SerialTimeout { .. } | Self::Protocol(_) | Self::Io(_) => {
                AscomErrorCode::DRIVER_ERROR
            }
        }
    }
}

impl From<DriverError> for AscomError {
    fn from(err: DriverError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}
