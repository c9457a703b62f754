use std::path::PathBuf;
use thiserror::Error;

/// Failure categories for a single step of the agent.
///
/// Transient and parse faults degrade the current cycle. Fatal faults end
/// the supervisor loop and are returned from `main`.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("transient {what}: {detail}")]
    Transient { what: &'static str, detail: String },

    #[error("unexpected {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fatal: {0}")]
    Fatal(String),
}

impl MonitorError {
    pub fn transient(what: &'static str, detail: impl ToString) -> Self {
        Self::Transient {
            what,
            detail: detail.to_string(),
        }
    }

    pub fn parse(what: &'static str, detail: impl ToString) -> Self {
        Self::Parse {
            what,
            detail: detail.to_string(),
        }
    }

    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Worth retrying on the next cycle without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Io { .. })
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_classifies_retryable_faults() {
        assert!(MonitorError::transient("modem", "timeout").is_transient());
        assert!(MonitorError::io(
            "write",
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full")
        )
        .is_transient());
        assert!(!MonitorError::parse("filename", "bad").is_transient());
        assert!(!MonitorError::Fatal("boom".into()).is_transient());
    }

    #[test]
    fn io_error_message_names_path() {
        let err = MonitorError::io(
            "remove",
            "/data/a.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.to_string(), "remove /data/a.json: gone");
    }
}
