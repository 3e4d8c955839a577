//! Error types for the MDR session manager.

use std::fmt;

use strum::IntoStaticStr;

/// D-Bus error name prefix used for method replies (`org.mdr.InvalidValue`, ...).
pub(crate) const ERR_PREFIX: &str = "org.mdr.";

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error occurring in the MDR session manager.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed, human readable message.
    pub message: String,
}

/// Taxonomy of errors the session manager produces.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, IntoStaticStr)]
#[non_exhaustive]
pub enum ErrorKind {
    /// malformed frame: {0}
    #[strum(serialize = "BadFrame")]
    BadFrame(String),
    /// link layer exhausted its retransmission budget
    LinkLost,
    /// peer connection is gone
    PeerGone,
    /// request timed out waiting for a reply
    Timeout,
    /// invalid value supplied by client
    InvalidValue,
    /// device rejected the request
    Reject,
    /// failed to allocate resources for the request
    AllocFailure,
    /// connection could not be accepted
    #[strum(serialize = "Error.Rejected")]
    ConnectionRejected,
    /// internal error: {0}
    Internal(InternalErrorKind),
}

/// Internal/wrapping failures that do not originate from the MDR protocol itself.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq)]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// D-Bus error: {0}
    DBus(String),
    /// I/O error: {0:?}
    Io(std::io::ErrorKind),
    /// payload too large to frame ({0} bytes)
    PayloadTooLarge(usize),
    /// task join error
    JoinError,
    /// invalid Bluetooth device address: {0}
    InvalidAddress(String),
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// The bus error name this error should be reported to clients as.
    ///
    /// [ErrorKind::ConnectionRejected] is reported in BlueZ's own profile
    /// error namespace, not this daemon's `org.mdr.` one, since it names a
    /// BlueZ profile contract outcome rather than an MDR protocol failure.
    /// [ErrorKind::InvalidValue] gets its own name; everything else is
    /// mapped generically to `org.mdr.DeviceError`.
    pub(crate) fn bus_name(&self) -> String {
        match &self.kind {
            ErrorKind::ConnectionRejected => "org.bluez.Error.Rejected".to_string(),
            ErrorKind::InvalidValue => format!("{ERR_PREFIX}{}", <&'static str>::from(&self.kind)),
            _ => format!("{ERR_PREFIX}DeviceError"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<dbus::Error> for Error {
    fn from(err: dbus::Error) -> Self {
        Self::with_message(
            ErrorKind::Internal(InternalErrorKind::DBus(err.name().unwrap_or_default().to_string())),
            err.message().unwrap_or_default().to_string(),
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::with_message(ErrorKind::Internal(InternalErrorKind::Io(err.kind())), err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::with_message(ErrorKind::Internal(InternalErrorKind::JoinError), err.to_string())
    }
}

impl From<Error> for dbus::MethodErr {
    fn from(err: Error) -> Self {
        Self::from((err.bus_name(), err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message() {
        let err = Error::with_message(ErrorKind::Reject, "device said no");
        assert_eq!(err.to_string(), "device rejected the request: device said no");
    }

    #[test]
    fn invalid_value_maps_to_invalid_value_bus_name() {
        let err = Error::new(ErrorKind::InvalidValue);
        assert_eq!(err.bus_name(), "org.mdr.InvalidValue");
    }

    #[test]
    fn everything_else_maps_to_device_error() {
        for kind in [ErrorKind::LinkLost, ErrorKind::PeerGone, ErrorKind::Timeout, ErrorKind::Reject] {
            assert_eq!(Error::new(kind).bus_name(), "org.mdr.DeviceError");
        }
    }

    #[test]
    fn connection_rejected_maps_to_bluez_rejected_bus_name() {
        let err = Error::new(ErrorKind::ConnectionRejected);
        assert_eq!(err.bus_name(), "org.bluez.Error.Rejected");
    }
}
