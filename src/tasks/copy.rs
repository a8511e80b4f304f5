use camino::Utf8Path;

use crate::core::{FileRecord, FileSet};
use crate::engine::TaskContext;
use crate::resolver::ComponentResolver;
use crate::utils::glob_files;

/// Copies a sub-directory of the working directory into the output as is.
pub(crate) fn copy_dir(ctx: &TaskContext<'_>, dir: &str) -> anyhow::Result<FileSet> {
    let config = ctx.config();
    let pattern = format!("{}/**/*", glob::Pattern::escape(dir));

    let output: FileSet = glob_files(&config.src(), &pattern)?
        .into_iter()
        .map(|(rel, path)| FileRecord::source(rel, path))
        .collect();

    output.write_to(&config.dist())?;
    tracing::info!("copied {} file(s) from {dir}", output.len());
    Ok(output)
}

/// Copies the files placed directly in the working directory, dotfiles
/// included, markup excluded.
pub(crate) fn copy_extras(ctx: &TaskContext<'_>) -> anyhow::Result<FileSet> {
    let config = ctx.config();

    let output: FileSet = glob_files(&config.src(), "*")?
        .into_iter()
        .filter(|(rel, _)| rel.extension() != Some("html"))
        .map(|(rel, path)| FileRecord::source(rel, path))
        .collect();

    output.write_to(&config.dist())?;
    tracing::info!("copied {} extra file(s)", output.len());
    Ok(output)
}

/// Copies the component files chosen by `resolver`, keeping their path
/// relative to the project root.
pub(crate) fn copy_components(
    ctx: &TaskContext<'_>,
    resolver: &dyn ComponentResolver,
) -> anyhow::Result<FileSet> {
    let config = ctx.config();
    let working = Utf8Path::new(&config.settings.working_dir);

    let markup: FileSet = glob_files(&config.src(), "**/*.html")?
        .into_iter()
        .map(|(rel, path)| FileRecord::source(working.join(rel), path))
        .collect();

    let output = resolver.extras(&markup, &config.component_config(), &config.root)?;

    output.write_to(&config.dist())?;
    tracing::info!("copied {} component file(s)", output.len());
    Ok(output)
}
