//! Pluggable loaders for app configuration documents.

mod toml;

pub use self::toml::TomlLoader;

use crate::app::AppDescriptor;
use crate::error::{Error, Result};
use std::path::Path;
use tracing::debug;

/// A loader for one configuration file format.
pub trait ConfigLoader {
    /// Parse the file into validated app descriptors. Pure: no side
    /// effects beyond reading the file.
    fn load(&self, path: &Path) -> Result<Vec<AppDescriptor>>;

    /// Whether this loader handles the given file extension.
    fn supports_extension(&self, ext: &str) -> bool;

    /// Human-readable format name.
    fn name(&self) -> &'static str;
}

/// All registered loaders.
fn loaders() -> Vec<Box<dyn ConfigLoader>> {
    vec![Box::new(TomlLoader::new())]
}

/// Load app descriptors from a configuration file, dispatching on the
/// file extension. Load is all-or-nothing: any invalid app fails the
/// whole document.
pub fn load_config(path: &Path) -> Result<Vec<AppDescriptor>> {
    let ext = path
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("");

    for loader in loaders() {
        if loader.supports_extension(ext) {
            debug!(loader = loader.name(), path = %path.display(), "Loading config");
            return loader.load(path);
        }
    }

    Err(Error::ConfigError(format!(
        "no loader for '{}' configuration files",
        ext
    )))
}
