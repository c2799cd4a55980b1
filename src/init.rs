//! Best-effort init script, run before the user script to seed shared state.

use crate::error::{ResolveError, ScriptError};
use crate::resolver::Resolver;
use crate::runtime::run_source;
use deno_core::JsRuntime;
use thiserror::Error;

/// Logical name of the init script.
pub const INIT_SCRIPT_NAME: &str = "js/init.js";

#[derive(Debug, Error)]
pub enum InitFailure {
    #[error("init script unavailable: {0}")]
    Unavailable(#[from] ResolveError),

    #[error("init script failed: {0}")]
    Script(#[from] ScriptError),
}

/// Result of running the init script. Failures are logged where they
/// happen and never abort the render.
#[derive(Debug)]
pub enum InitOutcome {
    Skipped,
    Completed,
    Failed(InitFailure),
}

impl InitOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, InitOutcome::Failed(_))
    }
}

/// Run the init script in the prepared runtime, before any sandbox
/// registration and without source transformation.
pub async fn run_init(runtime: &mut JsRuntime, resolver: &Resolver) -> InitOutcome {
    match try_run_init(runtime, resolver).await {
        Ok(()) => InitOutcome::Completed,
        Err(e) => {
            tracing::error!("Exception on init file: {}", e);
            InitOutcome::Failed(e)
        }
    }
}

async fn try_run_init(runtime: &mut JsRuntime, resolver: &Resolver) -> Result<(), InitFailure> {
    let source = resolver.resolve(INIT_SCRIPT_NAME)?.read_to_string()?;
    run_source(runtime, "[init]", source).await?;
    tracing::debug!("Init script completed");
    Ok(())
}
