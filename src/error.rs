//! Error types for resolution, evaluation and sandbox setup.
//!
//! Only [`SandboxError`] ever escapes a render; the other kinds are turned
//! into user-visible text by the renderer.

use std::io;
use thiserror::Error;

/// Failure to locate or open a named resource in either tier.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("resource [{name}] was not found")]
    NotFound { name: String },

    /// Names must be relative paths made of normal components only.
    #[error("invalid resource name [{name}]")]
    InvalidName { name: String },

    #[error("failed to read resource [{name}]: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl ResolveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResolveError::NotFound { .. })
    }
}

/// A script failed to compile or raised while running.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("{message}")]
    Compile { message: String },

    /// Includes policy violations raised by the sandbox.
    #[error("{message}")]
    Runtime { message: String },

    #[error(transparent)]
    Read(#[from] ResolveError),
}

impl ScriptError {
    /// Text shown to the recipient in place of the rendered content.
    pub fn to_user_message(&self) -> String {
        match self {
            ScriptError::Compile { message } => format!("Error in script or template: {}", message),
            ScriptError::Runtime { message } => format!("Exception: {}", message),
            ScriptError::Read(e) => format!("Exception: {}", e),
        }
    }
}

/// Broken execution environment. Never converted to text.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create script runtime: {0}")]
    Runtime(#[source] anyhow::Error),

    #[error("failed to prepare script environment: {0}")]
    Bootstrap(#[source] anyhow::Error),

    #[error("sandbox policy hooks are not available in this runtime")]
    Unavailable,

    #[error("failed to register sandbox policy: {0}")]
    Register(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_errors_use_script_tag() {
        let err = ScriptError::Compile {
            message: "SyntaxError: Unexpected token ')'".to_string(),
        };
        assert_eq!(
            err.to_user_message(),
            "Error in script or template: SyntaxError: Unexpected token ')'"
        );
    }

    #[test]
    fn test_runtime_errors_use_exception_tag() {
        let err = ScriptError::Runtime {
            message: "Uncaught Error: boom".to_string(),
        };
        assert!(err.to_user_message().starts_with("Exception: "));
        assert!(err.to_user_message().contains("boom"));
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        let missing = ResolveError::NotFound { name: "a.js".into() };
        let invalid = ResolveError::InvalidName { name: "../a.js".into() };
        assert!(missing.is_not_found());
        assert!(!invalid.is_not_found());
        assert!(missing.to_string().contains("a.js"));
    }
}
