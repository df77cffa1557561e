use std::time::Duration;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Command '{command}' timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },
    #[error("{message}")]
    Backend { command: String, message: String },
    #[error("{0}")]
    Validation(String),
    #[error("unexpected result for '{command}': {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to {action} profile: {source}")]
    Profile {
        action: &'static str,
        #[source]
        source: Box<CoreError>,
    },
}

impl CoreError {
    pub(crate) fn timeout(command: &str, bound: Duration) -> Self {
        CoreError::Timeout {
            command: command.to_string(),
            timeout_ms: bound.as_millis() as u64,
        }
    }

    pub(crate) fn profile(action: &'static str, source: CoreError) -> Self {
        CoreError::Profile {
            action,
            source: Box::new(source),
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            CoreError::Timeout { .. } => true,
            CoreError::Profile { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}
