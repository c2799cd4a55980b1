//! The `SCRIPT` content token: resolves a script and template, binds the
//! build context, runs the init script and evaluates the user script.
//!
//! Every failure except a broken sandbox setup becomes text, so a bad
//! script degrades to a visible error in the message instead of failing the
//! notification.

use crate::binding::{
    BuildContext, EmailType, ExecutionContext, PublisherContext, ScriptRequest,
    DEFAULT_INIT_VALUE, DEFAULT_SCRIPT_NAME, DEFAULT_TEMPLATE_NAME, SCRIPT_INIT_ARG,
    SCRIPT_NAME_ARG, SCRIPT_TEMPLATE_ARG,
};
use crate::config::{PluginDescriptor, RendererConfig};
use crate::error::{ResolveError, SandboxError, ScriptError};
use crate::init::{run_init, InitOutcome};
use crate::resolver::{Resolver, TEMPLATES_DIRECTORY};
use crate::runtime::{create_runtime, evaluate, take_console};
use crate::sandbox::ExecutionEnvironment;
use std::collections::HashMap;
use std::sync::Arc;

/// Token under which this content is referenced in email templates.
pub const TOKEN: &str = "SCRIPT";

/// Result of a render, before it is flattened to text.
#[derive(Debug)]
pub enum RenderOutcome {
    Rendered(String),
    MissingResource {
        script: String,
        template: String,
        message: String,
    },
    ScriptFailed(ScriptError),
}

impl RenderOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RenderOutcome::Rendered(_))
    }

    /// The text placed in the email.
    pub fn into_text(self) -> String {
        match self {
            RenderOutcome::Rendered(text) => text,
            RenderOutcome::MissingResource { message, .. } => message,
            RenderOutcome::ScriptFailed(e) => e.to_user_message(),
        }
    }
}

/// Renders script-generated email content.
#[derive(Clone)]
pub struct ScriptContent {
    resolver: Resolver,
    descriptor: Arc<dyn PluginDescriptor>,
    max_heap_size: Option<usize>,
}

impl ScriptContent {
    pub fn new(config: RendererConfig) -> Self {
        Self {
            resolver: Resolver::new(&config.home_dir),
            max_heap_size: config.max_heap_size,
            descriptor: Arc::new(config),
        }
    }

    /// Use a custom resolver, e.g. one with host-bundled resources.
    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Read security and root URL settings from an external store.
    pub fn with_descriptor(mut self, descriptor: Arc<dyn PluginDescriptor>) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn token(&self) -> &'static str {
        TOKEN
    }

    pub fn arguments(&self) -> Vec<&'static str> {
        vec![SCRIPT_NAME_ARG, SCRIPT_TEMPLATE_ARG, SCRIPT_INIT_ARG]
    }

    pub fn has_nested_content(&self) -> bool {
        false
    }

    pub fn help_text(&self) -> String {
        format!(
            "Custom message content generated from a script. \
             Custom scripts should be placed in $HOME/{dir}. When using custom scripts, \
             the script filename should be used for the \"{script}\" argument.\n\
             Templates and other items may be loaded using the\n\
             host.readFile(fileName) function.\n\
             The function looks in the bundled resources first, and then in the \
             $HOME/{dir}\ndirectory. No other directories will be searched.\n\
             <ul>\n\
             <li><i>{script}</i> - the script name.<br>\n\
             &nbsp;&nbsp;&nbsp;&nbsp;&nbsp;Defaults to \"{default_script}\".</li>\n\
             <li><i>{template}</i> - the template filename.<br>\n\
             &nbsp;&nbsp;&nbsp;&nbsp;&nbsp;Defaults to \"{default_template}\"</li>\n\
             <li><i>{init}</i> - true to run the init script.<br>\n\
             &nbsp;&nbsp;&nbsp;&nbsp;&nbsp;Defaults to {default_init}</li>\n\
             </ul>\n",
            dir = TEMPLATES_DIRECTORY,
            script = SCRIPT_NAME_ARG,
            template = SCRIPT_TEMPLATE_ARG,
            init = SCRIPT_INIT_ARG,
            default_script = DEFAULT_SCRIPT_NAME,
            default_template = DEFAULT_TEMPLATE_NAME,
            default_init = DEFAULT_INIT_VALUE,
        )
    }

    /// Read a file with the same lookup order scripts get via `host.readFile`.
    pub fn read_file(&self, name: &str) -> Result<String, ResolveError> {
        self.resolver.read_file(name)
    }

    /// Render to text. Only a broken sandbox setup is returned as an error.
    pub async fn render(
        &self,
        build: &dyn BuildContext,
        publisher: &dyn PublisherContext,
        email_type: &EmailType,
        args: &HashMap<String, String>,
    ) -> Result<String, SandboxError> {
        self.render_outcome(build, publisher, email_type, args)
            .await
            .map(RenderOutcome::into_text)
    }

    /// Render, keeping the kind of failure.
    pub async fn render_outcome(
        &self,
        build: &dyn BuildContext,
        publisher: &dyn PublisherContext,
        email_type: &EmailType,
        args: &HashMap<String, String>,
    ) -> Result<RenderOutcome, SandboxError> {
        let request = ScriptRequest::from_args(args);
        tracing::debug!(
            script = %request.script_name,
            template = %request.template_name,
            email_type = %email_type.name,
            "Rendering script content"
        );

        let script = match self.resolver.resolve(&request.script_name) {
            Ok(script) => script,
            Err(e) => return Ok(self.missing(&request, e)),
        };
        // Existence check only; the template is read by the script itself
        match self.resolver.resolve(&request.template_name) {
            Ok(template) => template.discard(),
            Err(e) => return Ok(self.missing(&request, e)),
        }

        let context =
            ExecutionContext::build(&request, build, publisher, self.descriptor.as_ref());
        let env = ExecutionEnvironment::configure(self.descriptor.is_security_enabled());

        let mut runtime = create_runtime(self.max_heap_size, self.resolver.clone())
            .map_err(SandboxError::Runtime)?;
        env.prepare(&mut runtime, &context)?;

        let init = if request.run_init {
            run_init(&mut runtime, &self.resolver).await
        } else {
            InitOutcome::Skipped
        };
        tracing::debug!(?init, "Init phase finished");

        let result = {
            let mut registration = env.register(&mut runtime)?;
            evaluate(&mut registration, &env, script).await
        };
        take_console(&mut runtime).emit(&request.script_name);

        match result {
            Ok(text) => Ok(RenderOutcome::Rendered(text)),
            Err(e) => {
                tracing::error!(script = %request.script_name, "Script failed: {}", e);
                Ok(RenderOutcome::ScriptFailed(e))
            }
        }
    }

    fn missing(&self, request: &ScriptRequest, cause: ResolveError) -> RenderOutcome {
        let message = format!(
            "Script [{}] or template [{}] was not found in {}.",
            request.script_name,
            request.template_name,
            self.resolver.templates_dir().display()
        );
        tracing::error!("{} ({})", message, cause);
        RenderOutcome::MissingResource {
            script: request.script_name.clone(),
            template: request.template_name.clone(),
            message,
        }
    }
}
