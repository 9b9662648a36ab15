use std::process::ExitCode;

/// Errors that cause peerloop to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("{message}")]
    WithCode { code: u8, message: String },

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn new(code: u8, message: String) -> Self {
        ExitError::WithCode { code, message }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) => ExitCode::from(2),
            ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. } => ExitCode::from(4),
            ExitError::Timeout { .. } => ExitCode::from(5),
            ExitError::WithCode { code, .. } => ExitCode::from(*code),
            ExitError::Other(_) => ExitCode::from(1),
        }
    }
}

/// Failures reported by a work store adapter.
///
/// Only [`StoreError::Transient`] is worth retrying; a `Conflict` means a
/// concurrent writer won and the caller must re-read instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} #{id} not found")]
    NotFound { kind: &'static str, id: u64 },

    #[error("{kind} #{id} was modified concurrently")]
    Conflict { kind: &'static str, id: u64 },

    #[error("store unavailable: {0}")]
    Transient(String),

    #[error("store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed store response: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            ExitError::Config("x".into()).exit_code(),
            ExitError::ToolNotFound { tool: "sh".into() }.exit_code(),
            ExitError::Timeout {
                tool: "sh".into(),
                timeout_secs: 1,
            }
            .exit_code(),
            ExitError::Other("x".into()).exit_code(),
        ]
        .map(|code| format!("{code:?}"));
        for (i, a) in codes.iter().enumerate() {
            for b in codes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn store_error_classification() {
        assert!(StoreError::Transient("timeout".into()).is_transient());
        assert!(!StoreError::Conflict { kind: "item", id: 3 }.is_transient());
        assert!(StoreError::Conflict { kind: "item", id: 3 }.is_conflict());
        assert!(StoreError::NotFound { kind: "change", id: 9 }.is_not_found());
    }

    #[test]
    fn store_error_messages_name_the_record() {
        let err = StoreError::NotFound { kind: "item", id: 42 };
        assert_eq!(err.to_string(), "item #42 not found");
    }
}
