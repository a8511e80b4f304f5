use thiserror::Error;

use crate::core::FileSet;
use crate::engine::TaskContext;
use crate::tasks::tool::{ToolError, run_tool};
use crate::utils::glob_files;

#[derive(Debug, Error)]
pub enum LintError {
    #[error("Linting failed.\n{0}")]
    Failed(#[source] ToolError),

    #[error(transparent)]
    Glob(#[from] anyhow::Error),
}

/// Runs the configured linter over the scripts directory. The linter may
/// fix files in place; any remaining problem fails the task.
pub(crate) fn lint_scripts(ctx: &TaskContext<'_>) -> Result<FileSet, LintError> {
    let config = ctx.config();
    let dir = config.src().join(&config.settings.script_dir);

    let scripts = glob_files(&dir, "**/*.js")?;
    if scripts.is_empty() {
        tracing::info!("no scripts to lint");
        return Ok(FileSet::new());
    }

    let linter = &config.settings.linter;
    let mut args = linter.args.clone();
    args.push(dir.to_string());

    let out = run_tool(&linter.program, &args, None).map_err(LintError::Failed)?;

    let report = String::from_utf8_lossy(&out);
    if !report.trim().is_empty() {
        tracing::warn!("{}", report.trim_end());
    }

    tracing::info!("linted {} script(s)", scripts.len());
    Ok(FileSet::new())
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::config::{PipelineConfig, ToolCommand};
    use crate::core::{Environment, Mode};

    fn env(linter: ToolCommand, with_script: bool) -> (tempfile::TempDir, Environment) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("src/scripts")).unwrap();
        if with_script {
            fs::write(root.join("src/scripts/main.js"), "var a = 1").unwrap();
        }

        let mut config = PipelineConfig {
            root,
            ..PipelineConfig::default()
        };
        config.settings.linter = linter;
        (dir, Environment::new(Mode::Build, config))
    }

    fn lint(env: &Environment) -> Result<FileSet, LintError> {
        lint_scripts(&TaskContext {
            env,
            span: tracing::Span::none(),
        })
    }

    #[test]
    fn lint_problems_fail_the_task() {
        let (_dir, env) = env(ToolCommand::new("sh", &["-c", "echo 'missing semicolon' >&2; exit 1"]), true);
        let err = lint(&env).unwrap_err();
        assert!(err.to_string().contains("missing semicolon"));
    }

    #[test]
    fn clean_scripts_pass() {
        let (_dir, env) = env(ToolCommand::new("true", &[]), true);
        assert!(lint(&env).unwrap().is_empty());
    }

    #[test]
    fn nothing_to_lint_skips_the_linter() {
        let (_dir, env) = env(ToolCommand::new("false", &[]), false);
        assert!(lint(&env).is_ok());
    }
}
