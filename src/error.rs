//! Error kinds for the ingestion pipeline.

use thiserror::Error;

use crate::models::Status;

#[derive(Error, Debug)]
pub enum SpiderError {
    /// Remote fetch returned a non-success response or broke mid-stream.
    #[error("transfer failed for {url}: {reason}")]
    Transfer { url: String, reason: String },

    #[error("extraction failed for {file}: {reason}")]
    Extraction { file: String, reason: String },

    #[error("unsupported format '{extension}' for {file}")]
    UnsupportedFormat { file: String, extension: String },

    /// The index reported more batch errors than allowed.
    #[error("batch write failed: {errors} errors (allowed {allowed})")]
    BatchWrite { errors: usize, allowed: usize },

    #[error("file record not found: {0}")]
    NotFound(String),

    #[error("file record already registered: {0}")]
    Conflict(String),

    /// A registered name must be a single path component.
    #[error("file name is not a plain file name: {0:?}")]
    InvalidName(String),

    #[error("illegal status transition {from} -> {to} for {id}")]
    InvalidTransition { id: String, from: Status, to: Status },

    #[error("vector index error: {0}")]
    Index(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SpiderError {
    /// Whether the error only ends the current file, as opposed to the run.
    pub fn is_fatal_for_file(&self) -> bool {
        !matches!(
            self,
            SpiderError::Config(_) | SpiderError::Db(_) | SpiderError::InvalidTransition { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SpiderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_format_display() {
        let err = SpiderError::UnsupportedFormat {
            file: "notes.odt".to_string(),
            extension: "odt".to_string(),
        };
        assert_eq!(err.to_string(), "unsupported format 'odt' for notes.odt");
    }

    #[test]
    fn batch_write_display() {
        let err = SpiderError::BatchWrite {
            errors: 3,
            allowed: 1,
        };
        assert_eq!(err.to_string(), "batch write failed: 3 errors (allowed 1)");
    }

    #[test]
    fn invalid_transition_display() {
        let err = SpiderError::InvalidTransition {
            id: "abc".to_string(),
            from: Status::New,
            to: Status::Done,
        };
        assert_eq!(err.to_string(), "illegal status transition new -> done for abc");
    }

    #[test]
    fn per_file_errors_do_not_abort_run() {
        assert!(SpiderError::Transfer {
            url: "u".into(),
            reason: "404".into()
        }
        .is_fatal_for_file());
        assert!(SpiderError::BatchWrite {
            errors: 2,
            allowed: 1
        }
        .is_fatal_for_file());
        assert!(SpiderError::NotFound("x".into()).is_fatal_for_file());
        assert!(!SpiderError::Config("bad".into()).is_fatal_for_file());
        assert!(!SpiderError::Db(sqlx::Error::PoolClosed).is_fatal_for_file());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SpiderError = io.into();
        assert!(matches!(err, SpiderError::Io(_)));
    }
}
