use camino::Utf8PathBuf;
use thiserror::Error;

/// Top level error returned by the pipeline entry points.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid task graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Invalid configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Error while building:\n{0}")]
    Build(#[from] BuildError),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Problems found while validating task declarations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task '{0}' is declared more than once")]
    Duplicate(String),

    #[error("Task '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Task '{task}' depends on '{dependency}' which doesn't exist")]
    UnknownDependency { task: String, dependency: String },

    #[error("Cycle detected in task graph: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Task '{0}' not found")]
    UnknownTask(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read project manifest '{path}'.\n{source}")]
    Manifest {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse project manifest.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Couldn't parse environment file.\n{0}")]
    EnvFile(#[from] dotenv::Error),

    #[error("Invalid browser targets: {0}")]
    Browsers(String),

    #[error("Unknown deploy environment '{0}'")]
    UnknownTarget(String),

    #[error("Couldn't resolve project root.\n{0}")]
    Root(#[from] std::io::Error),

    #[error("Project root is not valid UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Task '{0}':\n{1}")]
    Task(String, anyhow::Error),

    #[error("Task '{task}' panicked: {message}")]
    Panic { task: String, message: String },

    #[error("Task '{task}' needs the output of '{dependency}', which has not run")]
    MissingDependency { task: String, dependency: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single file that failed to compile inside a transform task.
#[derive(Debug, Error)]
#[error("{path}: {message}")]
pub struct FileError {
    pub path: Utf8PathBuf,
    pub message: String,
}

/// Collected per-file failures of a transform task.
#[derive(Debug, Error)]
#[error("{} file(s) failed to compile:\n{}", .0.len(), render_file_errors(.0))]
pub struct TransformErrors(pub Vec<FileError>);

fn render_file_errors(errors: &[FileError]) -> String {
    errors
        .iter()
        .map(|e| format!("  {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't bind the reload socket.\n{0}")]
    Bind(std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_lists_path() {
        let err = GraphError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Cycle detected in task graph: a -> b -> a");
    }

    #[test]
    fn transform_errors_render_each_file() {
        let err = TransformErrors(vec![
            FileError {
                path: "src/styles/a.scss".into(),
                message: "expected \";\"".into(),
            },
            FileError {
                path: "src/styles/b.scss".into(),
                message: "undefined variable".into(),
            },
        ]);

        let text = err.to_string();
        assert!(text.starts_with("2 file(s) failed to compile"));
        assert!(text.contains("src/styles/a.scss: expected \";\""));
        assert!(text.contains("src/styles/b.scss: undefined variable"));
    }
}
