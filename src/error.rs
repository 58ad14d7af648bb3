//! Library error type shared by assembly, resolution and synthesis.
//!
//! Config validation does not use this: it collects every problem into a
//! `Vec<ValidationError>` so the user sees them all at once.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("stack '{stack}': duplicate construct id '{id}'")]
    DuplicateId { stack: String, id: String },

    #[error("construct '{from}' references unknown construct '{to}'")]
    UnknownReference { from: String, to: String },

    #[error("reference cycle detected involving: {0}")]
    Cycle(String),

    #[error("invalid CIDR '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("template error: {0}")]
    Template(String),

    #[error("stack '{stack}' is invalid after template resolution: {}", .problems.join("; "))]
    Invalid {
        stack: String,
        problems: Vec<String>,
    },

    #[error("stack '{stack}' is missing its {section} section")]
    MissingSection { stack: String, section: &'static str },

    #[error("stack '{stack}' failed verification: {}", .violations.join("; "))]
    Verification {
        stack: String,
        violations: Vec<String>,
    },

    #[error("cannot {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialize error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for String {
    fn from(e: Error) -> Self {
        e.to_string()
    }
}
