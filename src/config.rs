//! Renderer configuration and the externally-owned plugin settings.

use std::path::PathBuf;

/// Settings owned by the plugin configuration store, read once per render.
pub trait PluginDescriptor: Send + Sync {
    /// Whether user scripts run under the sandbox policy.
    fn is_security_enabled(&self) -> bool;

    /// Base URL of the build server, bound as `rooturl`.
    fn root_url(&self) -> String;
}

/// Configuration for the script content renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Home directory; custom scripts live in its `email-templates` subdirectory
    pub home_dir: PathBuf,
    /// Run user scripts under the sandbox policy
    pub security_enabled: bool,
    /// Base URL exposed to scripts as `rooturl`
    pub root_url: String,
    /// Maximum V8 heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            home_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            security_enabled: true,
            root_url: String::new(),
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
        }
    }
}

impl PluginDescriptor for RendererConfig {
    fn is_security_enabled(&self) -> bool {
        self.security_enabled
    }

    fn root_url(&self) -> String {
        self.root_url.clone()
    }
}
