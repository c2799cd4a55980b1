//! # Script Content
//!
//! Renders build-notification email content from user-supplied scripts
//! running in a deno_core V8 isolate.
//!
//! ## Lookup
//!
//! Scripts and templates are looked up in the bundled resources first, then
//! in `<home>/email-templates`. No other directories are searched.
//!
//! ## Security
//!
//! With security enabled, user scripts are rewritten so restricted
//! identifiers (`eval`, `Function`, `Deno`, ...) go through a policy check,
//! and the policy is registered on the script's runtime for exactly the
//! duration of its evaluation. Each render gets its own runtime.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use script_content::{EmailType, JsonBuild, JsonPublisher, RendererConfig, ScriptContent};
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() {
//!     let content = ScriptContent::new(RendererConfig::default());
//!     let build = JsonBuild {
//!         build: serde_json::json!({ "number": 42, "result": "SUCCESS" }),
//!         project: serde_json::json!({ "name": "core" }),
//!     };
//!
//!     let text = content
//!         .render(&build, &JsonPublisher::default(), &EmailType::new("success"), &HashMap::new())
//!         .await
//!         .unwrap();
//!
//!     println!("{}", text);
//! }
//! ```

mod binding;
mod config;
mod embedded;
mod error;
mod init;
mod ops;
mod renderer;
mod resolver;
mod runtime;
mod sandbox;
mod sanitize;

pub use binding::{
    BindingName, BuildContext, EmailType, ExecutionContext, JsonBuild, JsonPublisher,
    PublisherContext, ScriptRequest, DEFAULT_SCRIPT_NAME, DEFAULT_TEMPLATE_NAME,
};
pub use config::{PluginDescriptor, RendererConfig};
pub use embedded::{BuiltinTemplates, EmbeddedStore, MemoryStore};
pub use error::{ResolveError, SandboxError, ScriptError};
pub use init::{InitFailure, InitOutcome, INIT_SCRIPT_NAME};
pub use ops::ConsoleOutput;
pub use renderer::{RenderOutcome, ScriptContent, TOKEN};
pub use resolver::{Filesystem, Origin, OsFilesystem, ResolvedResource, Resolver};
pub use sandbox::{ExecutionEnvironment, SandboxPolicy, SandboxRegistration, SandboxTransformer};
