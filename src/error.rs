use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Channel {0} has no hardware pin in the active mapping")]
    UnmappedPin(u32),
    #[error("I/O failure: {context}: {source}")]
    IoFailure {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GpioError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        GpioError::IoFailure {
            context: context.into(),
            source,
        }
    }

    /// Kind of the underlying I/O error, if this is an `IoFailure`.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            GpioError::IoFailure { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GpioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_failure_keeps_context_and_kind() {
        let err = GpioError::io(
            "export pin 17",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.io_kind(), Some(io::ErrorKind::PermissionDenied));
        assert_eq!(err.to_string(), "I/O failure: export pin 17: denied");
    }

    #[test]
    fn non_io_errors_have_no_kind() {
        assert_eq!(GpioError::UnmappedPin(1).io_kind(), None);
        assert_eq!(
            GpioError::InvalidArgument("mode".into()).io_kind(),
            None
        );
    }
}
