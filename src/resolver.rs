//! Discovery of third-party component files.
//!
//! Front-end dependencies installed into the project (fonts, images and
//! other files shipped next to a library's scripts) are not referenced by
//! build blocks but still have to end up in the output. A
//! [`ComponentResolver`] decides which of them to publish.

use camino::Utf8Path;
use serde_json::Value;

use crate::core::{FileRecord, FileSet};
use crate::tasks::assets::referenced_files;
use crate::utils::glob_files;

/// Lists the component files to copy into the output.
pub trait ComponentResolver: Send + Sync {
    /// `markup` holds the project's markup files with root-relative paths,
    /// `config` is the component block of the manifest with the deployment
    /// environment added under `environment`. Returned records carry paths
    /// relative to `root`, which is also where they are placed in the output.
    fn extras(&self, markup: &FileSet, config: &Value, root: &Utf8Path) -> anyhow::Result<FileSet>;
}

/// Publishes files matching the `extras` globs of the component block,
/// except those already pulled in through the markup.
///
/// ```json
/// { "coreConfig": { "extras": ["components/**/*.woff2", "components/**/*.svg"] } }
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestResolver;

impl ComponentResolver for ManifestResolver {
    fn extras(&self, markup: &FileSet, config: &Value, root: &Utf8Path) -> anyhow::Result<FileSet> {
        let globs: Vec<&str> = match config.get("extras") {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            Some(Value::String(item)) => vec![item.as_str()],
            _ => Vec::new(),
        };

        if globs.is_empty() {
            return Ok(FileSet::new());
        }

        let referenced = referenced_files(markup)?;
        let mut output = FileSet::new();

        for pattern in globs {
            for (rel, path) in glob_files(root, pattern)? {
                if referenced.contains(&rel) {
                    tracing::debug!(file = %rel, "already bundled, skipping");
                    continue;
                }
                output.insert(FileRecord::source(rel, path));
            }
        }

        Ok(output)
    }
}
