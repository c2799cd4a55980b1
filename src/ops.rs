//! Ops backing the script runtime: console capture, the host file-read
//! capability and the sandbox policy check.

use crate::error::ResolveError;
use crate::resolver::Resolver;
use crate::sandbox::SandboxPolicy;
use deno_core::{op2, OpState};
use serde::Serialize;

// ============================================================================
// Console Output Capture
// ============================================================================

/// Captured console output from the script runtime
#[derive(Debug, Default, Clone)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

impl ConsoleOutput {
    /// Forward captured lines to the log.
    pub fn emit(&self, script: &str) {
        for log in &self.logs {
            tracing::info!(script = script, "{}", log);
        }
        for warn in &self.warns {
            tracing::warn!(script = script, "{}", warn);
        }
        for err in &self.errors {
            tracing::error!(script = script, "{}", err);
        }
    }
}

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.logs.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.warns.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.errors.push(msg.to_string());
    }
}

// ============================================================================
// Host Capability
// ============================================================================

/// Resolver used by `host.readFile`.
pub struct HostFiles(pub Resolver);

/// Outcome of `host.readFile`, turned into a typed JS error on failure.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HostRead {
    Ok { content: String },
    NotFound { message: String },
    InvalidName { message: String },
    Io { message: String },
}

impl From<Result<String, ResolveError>> for HostRead {
    fn from(result: Result<String, ResolveError>) -> Self {
        match result {
            Ok(content) => HostRead::Ok { content },
            Err(e @ ResolveError::NotFound { .. }) => HostRead::NotFound {
                message: e.to_string(),
            },
            Err(e @ ResolveError::InvalidName { .. }) => HostRead::InvalidName {
                message: e.to_string(),
            },
            Err(e @ ResolveError::Io { .. }) => HostRead::Io {
                message: e.to_string(),
            },
        }
    }
}

#[op2]
#[serde]
pub fn op_host_read_file(state: &mut OpState, #[string] name: String) -> HostRead {
    match state.try_borrow::<HostFiles>() {
        Some(HostFiles(resolver)) => resolver.read_file(&name).into(),
        None => HostRead::Io {
            message: "host file access is not configured".to_string(),
        },
    }
}

// ============================================================================
// Sandbox Policy
// ============================================================================

/// True unless a registered policy denies `name`.
#[op2(fast)]
pub fn op_sandbox_permits(state: &mut OpState, #[string] name: &str) -> bool {
    match state.try_borrow::<SandboxPolicy>() {
        Some(policy) => policy.permits(name),
        None => true,
    }
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    script_content,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_host_read_file,
        op_sandbox_permits,
    ],
    esm_entry_point = "ext:script_content/bootstrap.js",
    esm = ["ext:script_content/bootstrap.js" = "src/bootstrap.js"],
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_read_kinds() {
        let ok: HostRead = Ok("text".to_string()).into();
        assert!(matches!(ok, HostRead::Ok { ref content } if content == "text"));

        let missing: HostRead = Err(ResolveError::NotFound { name: "x.txt".into() }).into();
        assert!(matches!(missing, HostRead::NotFound { ref message } if message.contains("x.txt")));

        let invalid: HostRead = Err(ResolveError::InvalidName { name: "../x".into() }).into();
        assert!(matches!(invalid, HostRead::InvalidName { .. }));
    }

    #[test]
    fn test_host_read_serializes_with_kind_tag() {
        let value = serde_json::to_value(HostRead::NotFound {
            message: "gone".to_string(),
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({"kind": "notFound", "message": "gone"}));
    }
}
