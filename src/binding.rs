//! Per-render request and the fixed set of names bound into a script.

use crate::config::PluginDescriptor;
use crate::sanitize::sanitize_binding;
use serde_json::{Map, Value};
use std::collections::HashMap;

pub const SCRIPT_NAME_ARG: &str = "script";
pub const SCRIPT_TEMPLATE_ARG: &str = "template";
pub const SCRIPT_INIT_ARG: &str = "init";

pub const DEFAULT_SCRIPT_NAME: &str = "email-ext.js";
pub const DEFAULT_TEMPLATE_NAME: &str = "js-html.template";
pub const DEFAULT_INIT_VALUE: bool = true;

/// What to render, parsed from the content token's arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRequest {
    pub script_name: String,
    pub template_name: String,
    pub run_init: bool,
}

impl Default for ScriptRequest {
    fn default() -> Self {
        Self {
            script_name: DEFAULT_SCRIPT_NAME.to_string(),
            template_name: DEFAULT_TEMPLATE_NAME.to_string(),
            run_init: DEFAULT_INIT_VALUE,
        }
    }
}

impl ScriptRequest {
    /// Build a request from token arguments, falling back to defaults for
    /// anything missing. An unparseable `init` value keeps the default.
    pub fn from_args(args: &HashMap<String, String>) -> Self {
        let defaults = Self::default();

        let run_init = match args.get(SCRIPT_INIT_ARG) {
            None => defaults.run_init,
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => {
                    tracing::warn!(
                        "Ignoring invalid '{}' argument '{}', using {}",
                        SCRIPT_INIT_ARG,
                        raw,
                        defaults.run_init
                    );
                    defaults.run_init
                }
            },
        };

        Self {
            script_name: args
                .get(SCRIPT_NAME_ARG)
                .cloned()
                .unwrap_or(defaults.script_name),
            template_name: args
                .get(SCRIPT_TEMPLATE_ARG)
                .cloned()
                .unwrap_or(defaults.template_name),
            run_init,
        }
    }
}

/// The build being reported on, supplied by the enclosing build system.
pub trait BuildContext {
    /// The build as seen by scripts.
    fn to_binding(&self) -> Value;

    /// The project the build belongs to.
    fn project(&self) -> Value;
}

/// The notification publisher configuration for this job.
pub trait PublisherContext {
    fn to_binding(&self) -> Value;
}

/// Kind of notification being rendered. Not visible to scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailType {
    pub name: String,
}

impl EmailType {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Build and project given as plain JSON.
#[derive(Debug, Clone, Default)]
pub struct JsonBuild {
    pub build: Value,
    pub project: Value,
}

impl BuildContext for JsonBuild {
    fn to_binding(&self) -> Value {
        self.build.clone()
    }

    fn project(&self) -> Value {
        self.project.clone()
    }
}

/// Publisher given as plain JSON.
#[derive(Debug, Clone, Default)]
pub struct JsonPublisher(pub Value);

impl PublisherContext for JsonPublisher {
    fn to_binding(&self) -> Value {
        self.0.clone()
    }
}

/// Names visible to script code. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingName {
    Build,
    It,
    Project,
    RootUrl,
    Host,
    Publisher,
    Template,
}

impl BindingName {
    pub const ALL: [BindingName; 7] = [
        BindingName::Build,
        BindingName::It,
        BindingName::Project,
        BindingName::RootUrl,
        BindingName::Host,
        BindingName::Publisher,
        BindingName::Template,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BindingName::Build => "build",
            BindingName::It => "it",
            BindingName::Project => "project",
            BindingName::RootUrl => "rooturl",
            BindingName::Host => "host",
            BindingName::Publisher => "publisher",
            BindingName::Template => "template",
        }
    }

    /// Bound to the host capability object rather than a data value.
    pub fn is_capability(self) -> bool {
        matches!(self, BindingName::Host | BindingName::It)
    }
}

/// Values bound for a single evaluation. Built fresh per render.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub build: Value,
    pub project: Value,
    pub publisher: Value,
    pub root_url: String,
    pub template_name: String,
}

impl ExecutionContext {
    pub fn build(
        request: &ScriptRequest,
        build: &dyn BuildContext,
        publisher: &dyn PublisherContext,
        descriptor: &dyn PluginDescriptor,
    ) -> Self {
        Self {
            build: sanitize_binding(BindingName::Build, build.to_binding()),
            project: sanitize_binding(BindingName::Project, build.project()),
            publisher: sanitize_binding(BindingName::Publisher, publisher.to_binding()),
            root_url: descriptor.root_url(),
            template_name: request.template_name.clone(),
        }
    }

    fn value(&self, name: BindingName) -> Option<Value> {
        match name {
            BindingName::Build => Some(self.build.clone()),
            BindingName::Project => Some(self.project.clone()),
            BindingName::Publisher => Some(self.publisher.clone()),
            BindingName::RootUrl => Some(Value::String(self.root_url.clone())),
            BindingName::Template => Some(Value::String(self.template_name.clone())),
            BindingName::Host | BindingName::It => None,
        }
    }

    /// Payload for the runtime's `bind` hook: data values by name plus the
    /// names that receive the host capability.
    pub fn to_payload(&self) -> Value {
        let mut values = Map::new();
        let mut capabilities = Vec::new();
        for name in BindingName::ALL {
            if name.is_capability() {
                capabilities.push(Value::String(name.as_str().to_string()));
            } else if let Some(value) = self.value(name) {
                values.insert(name.as_str().to_string(), value);
            }
        }
        serde_json::json!({
            "values": values,
            "capabilities": capabilities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RendererConfig;
    use serde_json::json;

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_request_defaults() {
        let request = ScriptRequest::from_args(&HashMap::new());
        assert_eq!(request.script_name, "email-ext.js");
        assert_eq!(request.template_name, "js-html.template");
        assert!(request.run_init);
    }

    #[test]
    fn test_request_from_args() {
        let request = ScriptRequest::from_args(&args(&[
            ("script", "custom.js"),
            ("template", "custom.template"),
            ("init", "False"),
        ]));
        assert_eq!(request.script_name, "custom.js");
        assert_eq!(request.template_name, "custom.template");
        assert!(!request.run_init);
    }

    #[test]
    fn test_invalid_init_keeps_default() {
        let request = ScriptRequest::from_args(&args(&[("init", "maybe")]));
        assert!(request.run_init);
    }

    #[test]
    fn test_payload_has_exactly_the_fixed_names() {
        let request = ScriptRequest::default();
        let build = JsonBuild {
            build: json!({"number": 7}),
            project: json!({"name": "core"}),
        };
        let publisher = JsonPublisher(json!({"recipients": "dev@example.com"}));
        let config = RendererConfig {
            root_url: "http://ci.example.com/".to_string(),
            ..Default::default()
        };

        let context = ExecutionContext::build(&request, &build, &publisher, &config);
        let payload = context.to_payload();

        let values = payload["values"].as_object().unwrap();
        let mut keys: Vec<&str> = values.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["build", "project", "publisher", "rooturl", "template"]);
        assert_eq!(values["rooturl"], "http://ci.example.com/");
        assert_eq!(values["template"], "js-html.template");
        assert_eq!(values["project"]["name"], "core");
        assert_eq!(payload["capabilities"], json!(["it", "host"]));
    }

    #[test]
    fn test_binding_values_are_sanitized() {
        let build = JsonBuild {
            build: json!({"number": 1, "__proto__": {"polluted": true}}),
            project: Value::Null,
        };
        let context = ExecutionContext::build(
            &ScriptRequest::default(),
            &build,
            &JsonPublisher::default(),
            &RendererConfig::default(),
        );
        assert_eq!(context.build, json!({"number": 1}));
    }
}
