use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

/// A structured application error that can be serialized and surfaced
/// across the bridge.
///
/// Codes are prefixed by concern: `VALIDATION/*`, `SQLX/*` and `IO/*` for
/// store failures, `SCHEDULE/*`, `AUTH/*`, `BRIDGE/*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message that can be shown directly to the user.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    /// True when the error is a "row does not exist" read miss. Optional
    /// read paths downgrade this to an empty result instead of failing.
    pub fn is_not_found(&self) -> bool {
        self.code == "SQLX/ROW_NOT_FOUND"
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::new("SQLX/ROW_NOT_FOUND", "Record not found"),
            SqlxError::ColumnNotFound(name) => {
                AppError::new("SQLX/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
            }
            SqlxError::PoolTimedOut => AppError::new(
                "SQLX/POOL_TIMEOUT",
                "Timed out acquiring a database connection",
            ),
            SqlxError::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "Database pool is closed"),
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            SqlxError::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("Sqlite/{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                let mut app_error = AppError::new(code, db.message().to_string());
                if let Some(constraint) = db.constraint() {
                    app_error = app_error.with_context("constraint", constraint.to_string());
                }
                app_error
            }
            SqlxError::ColumnDecode { index, source } => {
                AppError::new("SQLX/COLUMN_DECODE", source.to_string())
                    .with_context("column_index", index.to_string())
            }
            SqlxError::Decode(decode_err) => AppError::new("SQLX/DECODE", decode_err.to_string()),
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn builds_error_with_context_and_cause() {
        let error = AppError::new("AUTH/PIN_WRONG", "Wrong PIN")
            .with_context("attempts", "2")
            .with_cause(AppError::from("digest mismatch"));

        assert_eq!(error.code(), "AUTH/PIN_WRONG");
        assert_eq!(error.message(), "Wrong PIN");
        assert_eq!(error.context().get("attempts"), Some(&"2".to_string()));
        let cause = error.cause().expect("cause present");
        assert_eq!(cause.message(), "digest mismatch");
        assert_eq!(cause.code(), AppError::GENERIC_CODE);
    }

    #[test]
    fn converts_anyhow_error_chain_into_nested_causes() {
        let err = (|| -> anyhow::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
                .context("failed to write snapshot")
        })()
        .unwrap_err();

        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), AppError::UNKNOWN_CODE);
        assert_eq!(app_error.message(), "failed to write snapshot");

        let cause = app_error.cause().expect("io cause present");
        assert!(cause.message().contains("disk full"));
    }

    #[test]
    fn sqlx_row_not_found_translates_to_specific_code() {
        let app_error = AppError::from(SqlxError::RowNotFound);
        assert_eq!(app_error.code(), "SQLX/ROW_NOT_FOUND");
        assert!(app_error.is_not_found());
    }

    #[test]
    fn serde_json_errors_capture_position() {
        let err: SerdeJsonError =
            serde_json::from_str::<serde_json::Value>("{\"foo\": }").expect_err("invalid json");
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "JSON/SYNTAX");
        assert!(app_error.context().contains_key("line"));
        assert!(app_error.context().contains_key("column"));
    }

    #[test]
    fn json_shape_is_flat_struct() {
        let error = AppError::new("VALIDATION/MISSING_ID", "nope").with_context("field", "id");
        let json = serde_json::to_string(&error).expect("serialize app error");

        let value: serde_json::Value = serde_json::from_str(&json).expect("parse serialized error");
        assert_eq!(
            value.get("code").and_then(|v| v.as_str()),
            Some("VALIDATION/MISSING_ID")
        );
        assert_eq!(value.get("message").and_then(|v| v.as_str()), Some("nope"));
        assert!(value.get("cause").is_none());
    }
}
