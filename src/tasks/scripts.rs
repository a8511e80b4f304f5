use camino::Utf8Path;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use thiserror::Error;

use crate::config::ToolCommand;
use crate::core::{FileRecord, FileSet};
use crate::engine::TaskContext;
use crate::error::FileError;
use crate::tasks::settle;
use crate::tasks::tool::{ToolError, run_tool};
use crate::utils::glob_files;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("Transpiler output for '{0}' is not valid UTF-8")]
    Encoding(String),
}

/// Transpiles every script below the scripts directory into staging,
/// keeping relative paths.
pub(crate) fn transpile_scripts(ctx: &TaskContext<'_>) -> anyhow::Result<FileSet> {
    let config = ctx.config();
    let settings = &config.settings;
    let source = config.src().join(&settings.script_dir);

    let entries = glob_files(&source, "**/*.js")?;

    let results: Vec<_> = entries
        .par_iter()
        .map(|(rel, path)| {
            let target = Utf8Path::new(&settings.script_dir).join(rel);
            let result = transpile(&settings.transpiler, path, &settings.script_target);
            (path, target, result)
        })
        .collect();

    let mut output = FileSet::new();
    let mut errors = Vec::new();

    for (path, target, result) in results {
        match result {
            Ok(code) => output.insert(FileRecord::new(target, code)),
            Err(e) => {
                tracing::error!(file = %path, "{e}");
                errors.push(FileError {
                    path: path.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    output.write_to(&config.staging())?;
    settle(ctx, errors)?;

    tracing::info!("transpiled {} script(s)", output.len());
    Ok(output)
}

/// Runs one file through the transpiler and returns the lowered source.
pub fn transpile(tool: &ToolCommand, path: &Utf8Path, target: &str) -> Result<String, ScriptError> {
    let args = tool.expand(&[("file", path.as_str()), ("target", target)]);
    let out = run_tool(&tool.program, &args, None)?;
    String::from_utf8(out).map_err(|_| ScriptError::Encoding(path.to_string()))
}

/// Minifies a bundle through the minifier's stdin. The input is returned
/// unchanged when minifying would not make it smaller.
pub(crate) fn minify_script(tool: &ToolCommand, code: &str, target: &str) -> Result<String, ScriptError> {
    let args = tool.expand(&[("target", target)]);
    let out = run_tool(&tool.program, &args, Some(code.as_bytes()))?;
    let minified = String::from_utf8(out).map_err(|_| ScriptError::Encoding("<bundle>".into()))?;

    if minified.len() < code.len() {
        Ok(minified)
    } else {
        Ok(code.to_string())
    }
}
