use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Unknown shortcut location: {value}")]
    InvalidLocation { value: String },

    #[error("Invalid process arguments: {details}")]
    InvalidArguments { details: String },

    #[error("Failed to launch {path}: {message}")]
    Launch { path: String, message: String },

    #[error("Shell integration failed during {operation}: {details}")]
    Integration {
        operation: &'static str,
        details: String,
    },

    #[error("IO error ({kind}): {message}")]
    IoError {
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl HostError {
    pub fn integration(operation: &'static str, details: impl Into<String>) -> Self {
        Self::Integration {
            operation,
            details: details.into(),
        }
    }
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        HostError::IoError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
