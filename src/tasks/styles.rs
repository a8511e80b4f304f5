use std::fs;

use camino::Utf8Path;
use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};
use lightningcss::targets::Targets;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use thiserror::Error;

use crate::core::{FileRecord, FileSet};
use crate::engine::TaskContext;
use crate::error::FileError;
use crate::tasks::settle;
use crate::utils::glob_files;

/// Errors that can occur when compiling stylesheets.
#[derive(Debug, Error)]
pub enum StyleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sass compilation error: {0}")]
    Sass(#[from] Box<grass::Error>),

    #[error("CSS processing error: {0}")]
    Css(String),
}

/// Compiles every entry stylesheet into the staging directory.
///
/// Partials (`_name.scss`) are only reachable through imports.
pub(crate) fn compile_styles(ctx: &TaskContext<'_>) -> anyhow::Result<FileSet> {
    let config = ctx.config();
    let settings = &config.settings;
    let source = config.src().join(&settings.style_dir);
    let staging = config.staging();
    let targets = config.targets()?;

    let entries: Vec<_> = glob_files(&source, "*.scss")?
        .into_iter()
        .filter(|(rel, _)| !rel.as_str().starts_with('_'))
        .collect();

    let results: Vec<_> = entries
        .par_iter()
        .map(|(rel, path)| {
            let target = Utf8Path::new(&settings.style_dir)
                .join(rel)
                .with_extension("css");
            let result = compile_scss(path, &config.root, targets, false);
            (path, target, result)
        })
        .collect();

    let mut output = FileSet::new();
    let mut errors = Vec::new();

    for (path, target, result) in results {
        match result {
            Ok(css) => output.insert(FileRecord::new(target, css)),
            Err(e) => {
                tracing::error!(file = %path, "{e}");
                errors.push(FileError {
                    path: path.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    output.write_to(&staging)?;
    settle(ctx, errors)?;

    tracing::info!("compiled {} stylesheet(s)", output.len());
    Ok(output)
}

/// Compiles one Sass file with `load_path` available to imports, then adds
/// vendor prefixes for `targets`.
pub fn compile_scss(
    path: &Utf8Path,
    load_path: &Utf8Path,
    targets: Targets,
    minify: bool,
) -> Result<String, StyleError> {
    let options = grass::Options::default()
        .style(grass::OutputStyle::Expanded)
        .load_path(load_path.as_std_path());

    let css = grass::from_path(path.as_std_path(), &options)?;
    process_css(&css, path.as_str(), targets, minify)
}

/// Runs plain CSS through lightningcss: prefixes and lowers syntax for
/// `targets`, and prints it minified when `minify` is set.
pub fn process_css(
    css: &str,
    filename: &str,
    targets: Targets,
    minify: bool,
) -> Result<String, StyleError> {
    let mut sheet = StyleSheet::parse(
        css,
        ParserOptions {
            filename: filename.to_string(),
            ..ParserOptions::default()
        },
    )
    .map_err(|e| StyleError::Css(e.to_string()))?;

    sheet
        .minify(MinifyOptions {
            targets,
            ..MinifyOptions::default()
        })
        .map_err(|e| StyleError::Css(e.to_string()))?;

    let out = sheet
        .to_css(PrinterOptions {
            minify,
            targets,
            ..PrinterOptions::default()
        })
        .map_err(|e| StyleError::Css(e.to_string()))?;

    Ok(out.code)
}

#[cfg(test)]
mod tests {
    use lightningcss::targets::Browsers;

    use super::*;

    fn safari_10() -> Targets {
        Targets::from(Browsers {
            safari: Some(10 << 16),
            ..Browsers::default()
        })
    }

    #[test]
    fn compiles_variables_from_partials_with_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::create_dir_all(root.join("src/styles")).unwrap();
        fs::write(root.join("src/styles/_vars.scss"), "$radius: 4px;\n").unwrap();
        fs::write(
            root.join("src/styles/a.scss"),
            "@import 'vars';\n.button { border-radius: $radius; user-select: none; }\n",
        )
        .unwrap();

        let css = compile_scss(&root.join("src/styles/a.scss"), root, safari_10(), false).unwrap();

        assert!(css.contains("border-radius: 4px"));
        assert!(css.contains("-webkit-user-select: none"));
        assert!(!css.contains("$radius"));
    }

    #[test]
    fn sass_errors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("broken.scss"), ".a { color: $missing; }").unwrap();

        let err = compile_scss(&root.join("broken.scss"), root, Targets::default(), false);
        assert!(matches!(err, Err(StyleError::Sass(_))));
    }

    #[test]
    fn minified_css_is_smaller() {
        let css = ".a {\n  color: red;\n}\n\n.b {\n  color: red;\n}\n";
        let expanded = process_css(css, "a.css", Targets::default(), false).unwrap();
        let minified = process_css(css, "a.css", Targets::default(), true).unwrap();

        assert!(minified.len() <= expanded.len());
        assert!(!minified.contains('\n') || minified.trim_end().lines().count() == 1);
    }
}
