//! Embedded resource stores: resources bundled with the binary and looked up
//! by logical path, without touching the filesystem.

use crate::resolver::EMBEDDED_PREFIX;
use std::collections::HashMap;
use std::io::{Cursor, Read};

/// A namespace of bundled resources keyed by logical path
/// (`emailext/templates/<name>`).
pub trait EmbeddedStore: Send + Sync {
    /// Open the resource at `path`, or `None` if the store doesn't have it.
    fn open(&self, path: &str) -> Option<Box<dyn Read + Send>>;
}

const BUILTIN: &[(&str, &[u8])] = &[
    (
        "emailext/templates/email-ext.js",
        include_bytes!("../templates/email-ext.js"),
    ),
    (
        "emailext/templates/js-html.template",
        include_bytes!("../templates/js-html.template"),
    ),
    (
        "emailext/templates/js/init.js",
        include_bytes!("../templates/js/init.js"),
    ),
];

/// The scripts and templates compiled into this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTemplates;

impl EmbeddedStore for BuiltinTemplates {
    fn open(&self, path: &str) -> Option<Box<dyn Read + Send>> {
        BUILTIN
            .iter()
            .find(|(logical, _)| *logical == path)
            .map(|(_, bytes)| Box::new(Cursor::new(*bytes)) as Box<dyn Read + Send>)
    }
}

/// In-memory store, for hosts that bundle their own resources.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `content` under `name`, relative to the embedded prefix.
    pub fn with(mut self, name: &str, content: impl Into<Vec<u8>>) -> Self {
        self.insert(name, content);
        self
    }

    pub fn insert(&mut self, name: &str, content: impl Into<Vec<u8>>) {
        self.entries
            .insert(format!("{}{}", EMBEDDED_PREFIX, name), content.into());
    }
}

impl EmbeddedStore for MemoryStore {
    fn open(&self, path: &str) -> Option<Box<dyn Read + Send>> {
        self.entries
            .get(path)
            .map(|bytes| Box::new(Cursor::new(bytes.clone())) as Box<dyn Read + Send>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(mut reader: Box<dyn Read + Send>) -> String {
        let mut s = String::new();
        reader.read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn test_builtin_lookup_uses_full_logical_path() {
        assert!(BuiltinTemplates.open("emailext/templates/email-ext.js").is_some());
        assert!(BuiltinTemplates.open("email-ext.js").is_none());
    }

    #[test]
    fn test_memory_store_prefixes_names() {
        let store = MemoryStore::new().with("a.js", "'a'");
        assert!(store.open("a.js").is_none());
        assert_eq!(read_all(store.open("emailext/templates/a.js").unwrap()), "'a'");
    }
}
