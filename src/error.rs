use crate::validate::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum NovaError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Ambiguous(String),

    #[error("System command failed: {0}")]
    SystemCommandFailed(String),

    #[error("{0}")]
    Os(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    SerdeError(String),
}

impl NovaError {
    /// HTTP status the API layer reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            NovaError::Validation(_) | NovaError::ConfigError(_) | NovaError::SerdeError(_) => 400,
            NovaError::NotFound(_) => 404,
            NovaError::Conflict(_) | NovaError::Ambiguous(_) => 409,
            _ => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, NovaError::NotFound(_))
    }

    /// Prefix the message with context while keeping the error class.
    pub fn context(self, msg: impl std::fmt::Display) -> Self {
        match self {
            NovaError::Validation(e) => NovaError::Validation(format!("{}: {}", msg, e)),
            NovaError::Conflict(e) => NovaError::Conflict(format!("{}: {}", msg, e)),
            NovaError::NotFound(e) => NovaError::NotFound(format!("{}: {}", msg, e)),
            NovaError::Ambiguous(e) => NovaError::Ambiguous(format!("{}: {}", msg, e)),
            NovaError::Database(e) => NovaError::Database(format!("{}: {}", msg, e)),
            other => NovaError::Os(format!("{}: {}", msg, other)),
        }
    }
}

impl From<ValidationError> for NovaError {
    fn from(err: ValidationError) -> Self {
        NovaError::Validation(err.to_string())
    }
}

impl From<toml::de::Error> for NovaError {
    fn from(err: toml::de::Error) -> Self {
        NovaError::SerdeError(err.to_string())
    }
}

impl From<toml::ser::Error> for NovaError {
    fn from(err: toml::ser::Error) -> Self {
        NovaError::SerdeError(err.to_string())
    }
}

impl From<serde_json::Error> for NovaError {
    fn from(err: serde_json::Error) -> Self {
        NovaError::SerdeError(err.to_string())
    }
}
