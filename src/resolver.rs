//! Two-tier resource resolution: embedded store first, then a single
//! filesystem directory under the configured home.
//!
//! Guarantees:
//! - Lookup order is fixed (embedded, then filesystem), never reversed
//! - Only `<home>/email-templates` is consulted on disk, no recursive search
//! - Names that could escape that directory are rejected up front
//! - Every opened handle is owned by a [`ResolvedResource`] and closed on drop

use crate::embedded::{BuiltinTemplates, EmbeddedStore};
use crate::error::ResolveError;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Logical prefix of the embedded resource namespace.
pub const EMBEDDED_PREFIX: &str = "emailext/templates/";

/// Name of the fallback directory under the home directory.
pub const TEMPLATES_DIRECTORY: &str = "email-templates";

/// Where a resource was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Embedded,
    Filesystem,
}

/// Opens files for the filesystem tier.
///
/// Abstracted so handle lifetimes can be observed in tests.
pub trait Filesystem: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFilesystem;

impl Filesystem for OsFilesystem {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        if !path.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a file", path.display()),
            ));
        }
        Ok(Box::new(File::open(path)?))
    }
}

/// An open resource. Dropping it releases the underlying handle.
pub struct ResolvedResource {
    name: String,
    origin: Origin,
    content: Box<dyn Read + Send>,
}

impl ResolvedResource {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Read the full content as UTF-8 and release the handle.
    pub fn read_to_string(mut self) -> Result<String, ResolveError> {
        let mut text = String::new();
        match self.content.read_to_string(&mut text) {
            Ok(_) => Ok(text),
            Err(source) => Err(ResolveError::Io {
                name: self.name,
                source,
            }),
        }
    }

    /// Release the handle without reading.
    pub fn discard(self) {}
}

impl fmt::Debug for ResolvedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedResource")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Resolves logical file names against the embedded store and the
/// templates directory. Cheap to clone; shared with the script runtime.
#[derive(Clone)]
pub struct Resolver {
    embedded: Arc<dyn EmbeddedStore>,
    filesystem: Arc<dyn Filesystem>,
    templates_dir: PathBuf,
}

impl Resolver {
    /// Resolver over the built-in templates and `<home_dir>/email-templates`.
    pub fn new(home_dir: impl AsRef<Path>) -> Self {
        Self {
            embedded: Arc::new(BuiltinTemplates),
            filesystem: Arc::new(OsFilesystem),
            templates_dir: home_dir.as_ref().join(TEMPLATES_DIRECTORY),
        }
    }

    pub fn with_embedded(mut self, embedded: Arc<dyn EmbeddedStore>) -> Self {
        self.embedded = embedded;
        self
    }

    pub fn with_filesystem(mut self, filesystem: Arc<dyn Filesystem>) -> Self {
        self.filesystem = filesystem;
        self
    }

    /// The single filesystem directory consulted after the embedded store.
    pub fn templates_dir(&self) -> &Path {
        &self.templates_dir
    }

    pub fn resolve(&self, name: &str) -> Result<ResolvedResource, ResolveError> {
        let relative = validate_name(name)?;

        let logical = format!("{}{}", EMBEDDED_PREFIX, name);
        if let Some(content) = self.embedded.open(&logical) {
            tracing::debug!("Resolved '{}' from embedded store", name);
            return Ok(ResolvedResource {
                name: name.to_string(),
                origin: Origin::Embedded,
                content,
            });
        }

        let path = self.templates_dir.join(relative);
        match self.filesystem.open(&path) {
            Ok(content) => {
                tracing::debug!("Resolved '{}' from {}", name, path.display());
                Ok(ResolvedResource {
                    name: name.to_string(),
                    origin: Origin::Filesystem,
                    content,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ResolveError::NotFound {
                name: name.to_string(),
            }),
            Err(source) => Err(ResolveError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Resolve and read a resource as UTF-8 text.
    pub fn read_file(&self, name: &str) -> Result<String, ResolveError> {
        self.resolve(name)?.read_to_string()
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("templates_dir", &self.templates_dir)
            .finish_non_exhaustive()
    }
}

/// Accept only relative names made of normal path components.
fn validate_name(name: &str) -> Result<&Path, ResolveError> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && !name.contains('\\')
        && path.components().all(|c| matches!(c, Component::Normal(_)));

    if valid {
        Ok(path)
    } else {
        Err(ResolveError::InvalidName {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedded::MemoryStore;
    use std::fs;
    use tempfile::tempdir;

    fn resolver_with(home: &Path, store: MemoryStore) -> Resolver {
        Resolver::new(home).with_embedded(Arc::new(store))
    }

    #[test]
    fn test_embedded_takes_precedence() {
        let home = tempdir().unwrap();
        let dir = home.path().join(TEMPLATES_DIRECTORY);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.js"), "from disk").unwrap();

        let store = MemoryStore::new().with("a.js", "from store");
        let resolver = resolver_with(home.path(), store);

        let resource = resolver.resolve("a.js").unwrap();
        assert_eq!(resource.origin(), Origin::Embedded);
        assert_eq!(resource.read_to_string().unwrap(), "from store");
    }

    #[test]
    fn test_falls_back_to_templates_dir() {
        let home = tempdir().unwrap();
        let dir = home.path().join(TEMPLATES_DIRECTORY);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("custom.js"), "'custom'").unwrap();

        let resolver = resolver_with(home.path(), MemoryStore::new());
        let resource = resolver.resolve("custom.js").unwrap();
        assert_eq!(resource.origin(), Origin::Filesystem);
        assert_eq!(resource.name(), "custom.js");
        assert_eq!(resource.read_to_string().unwrap(), "'custom'");
    }

    #[test]
    fn test_home_dir_itself_is_not_searched() {
        let home = tempdir().unwrap();
        fs::write(home.path().join("stray.js"), "1").unwrap();

        let resolver = resolver_with(home.path(), MemoryStore::new());
        let err = resolver.resolve("stray.js").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_missing_in_both_tiers() {
        let home = tempdir().unwrap();
        let resolver = resolver_with(home.path(), MemoryStore::new());

        let err = resolver.resolve("nope.js").unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("nope.js"));
    }

    #[test]
    fn test_rejects_path_traversal() {
        let home = tempdir().unwrap();
        fs::write(home.path().join("secret.txt"), "secret").unwrap();
        fs::create_dir_all(home.path().join(TEMPLATES_DIRECTORY)).unwrap();

        let resolver = resolver_with(home.path(), MemoryStore::new());
        for name in ["../secret.txt", "/etc/passwd", "", "a/../../secret.txt", "..\\secret.txt"] {
            let err = resolver.resolve(name).unwrap_err();
            assert!(
                matches!(err, ResolveError::InvalidName { .. }),
                "expected rejection for {:?}",
                name
            );
        }
    }

    #[test]
    fn test_directories_are_not_resources() {
        let home = tempdir().unwrap();
        fs::create_dir_all(home.path().join(TEMPLATES_DIRECTORY).join("js")).unwrap();

        let resolver = resolver_with(home.path(), MemoryStore::new());
        assert!(resolver.resolve("js").unwrap_err().is_not_found());
    }

    #[test]
    fn test_nested_names_resolve() {
        let home = tempdir().unwrap();
        let store = MemoryStore::new().with("js/init.js", "var seeded = true;");
        let resolver = resolver_with(home.path(), store);

        assert_eq!(resolver.read_file("js/init.js").unwrap(), "var seeded = true;");
    }

    #[test]
    fn test_builtin_templates_are_bundled() {
        let home = tempdir().unwrap();
        let resolver = Resolver::new(home.path());

        let script = resolver.resolve(crate::binding::DEFAULT_SCRIPT_NAME).unwrap();
        assert_eq!(script.origin(), Origin::Embedded);
        assert!(resolver.resolve(crate::binding::DEFAULT_TEMPLATE_NAME).is_ok());
        assert!(resolver.resolve(crate::init::INIT_SCRIPT_NAME).is_ok());
    }
}
