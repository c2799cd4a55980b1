//! Script runtime - executes content scripts in a V8 isolate.
//!
//! Provides only what content scripts need:
//! - console.log/warn/error (captured, not printed)
//! - the bound context values and the `host` capability
//! - the `text` and `time` convenience namespaces
//! - No fs, net or env access beyond `host.readFile`

use crate::error::ScriptError;
use crate::ops::{script_content, ConsoleOutput, HostFiles};
use crate::resolver::{ResolvedResource, Resolver};
use crate::sandbox::ExecutionEnvironment;
use anyhow::Error;
use deno_core::error::JsError;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};

/// Create a fresh runtime for one render.
pub fn create_runtime(max_heap_size: Option<usize>, resolver: Resolver) -> Result<JsRuntime, Error> {
    // Configure V8 heap limits if specified
    let create_params =
        max_heap_size.map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![script_content::init_ops_and_esm()],
        create_params,
        ..Default::default()
    });

    if max_heap_size.is_some() {
        runtime.add_near_heap_limit_callback(|current, initial| {
            // Don't increase the limit - let V8 terminate with an OOM error
            tracing::error!(
                "Script runtime near heap limit: current={}MB, initial={}MB",
                current / (1024 * 1024),
                initial / (1024 * 1024)
            );
            current
        });
    }

    runtime.op_state().borrow_mut().put(ConsoleOutput::default());
    runtime.op_state().borrow_mut().put(HostFiles(resolver));

    Ok(runtime)
}

/// Evaluate a user script in `env` and return its final value as text.
///
/// The resource is read in full and released before compilation.
pub async fn evaluate(
    runtime: &mut JsRuntime,
    env: &ExecutionEnvironment,
    script: ResolvedResource,
) -> Result<String, ScriptError> {
    let name = script.name().to_string();
    let source = script.read_to_string()?;
    tracing::debug!(script = %name, sandboxed = env.is_sandboxed(), "Evaluating script");
    run_source(runtime, "[script]", env.compile_source(&source)).await
}

/// Compile and run `source` as a classic script, resolving a returned
/// promise through the event loop.
pub(crate) async fn run_source(
    runtime: &mut JsRuntime,
    label: &'static str,
    source: String,
) -> Result<String, ScriptError> {
    check_syntax(runtime, &source)?;

    let value = runtime.execute_script(label, source).map_err(classify)?;

    let is_promise = {
        let scope = &mut runtime.handle_scope();
        v8::Local::new(scope, &value).is_promise()
    };
    if is_promise {
        runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await
            .map_err(classify)?;
    }

    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, &value);
    match v8::Local::<v8::Promise>::try_from(local) {
        Ok(promise) => match promise.state() {
            v8::PromiseState::Fulfilled => {
                let result = promise.result(scope);
                Ok(to_text(scope, result))
            }
            v8::PromiseState::Rejected => {
                let exception = promise.result(scope);
                Err(ScriptError::Runtime {
                    message: format!(
                        "Uncaught (in promise) {}",
                        exception.to_rust_string_lossy(scope)
                    ),
                })
            }
            v8::PromiseState::Pending => Err(ScriptError::Runtime {
                message: "Script returned unresolved promise".to_string(),
            }),
        },
        Err(_) => Ok(to_text(scope, local)),
    }
}

/// Captured console output since the last call.
pub fn take_console(runtime: &mut JsRuntime) -> ConsoleOutput {
    let state = runtime.op_state();
    let mut state = state.borrow_mut();
    let output = state.try_take::<ConsoleOutput>().unwrap_or_default();
    state.put(ConsoleOutput::default());
    output
}

fn to_text(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> String {
    if value.is_null_or_undefined() {
        String::new()
    } else {
        value.to_rust_string_lossy(scope)
    }
}

/// Compile without running so syntax errors are reported as such.
fn check_syntax(runtime: &mut JsRuntime, source: &str) -> Result<(), ScriptError> {
    let scope = &mut runtime.handle_scope();
    let Some(code) = v8::String::new(scope, source) else {
        return Err(ScriptError::Compile {
            message: "script source is too large".to_string(),
        });
    };

    let tc = &mut v8::TryCatch::new(scope);
    if v8::Script::compile(tc, code, None).is_some() {
        return Ok(());
    }

    let message = match tc.exception() {
        Some(exception) => exception.to_rust_string_lossy(tc),
        None => "script failed to compile".to_string(),
    };
    Err(ScriptError::Compile { message })
}

fn classify(error: Error) -> ScriptError {
    match error.downcast_ref::<JsError>() {
        Some(js_error) => ScriptError::Runtime {
            message: js_error.exception_message.clone(),
        },
        None => ScriptError::Runtime {
            message: error.to_string(),
        },
    }
}
