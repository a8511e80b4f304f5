//! The execution side of the task graph.
//!
//! A [`TaskNode`] is what a [`Blueprint`](crate::Blueprint) declaration turns
//! into: a name, the names of its dependencies, a watch [`Scope`] and the
//! type-erased unit of work. The [`runner`] module schedules these nodes.

pub(crate) mod runner;

use std::sync::Arc;

use camino::Utf8Path;
use glob::{MatchOptions, Pattern};

use crate::config::PipelineConfig;
use crate::core::{Environment, FileSet};

/// The unit of work of a task: dependency outputs in, own output out.
pub(crate) type Work =
    Arc<dyn Fn(&TaskContext<'_>, &[&FileSet]) -> anyhow::Result<FileSet> + Send + Sync>;

pub(crate) struct TaskNode {
    pub name: String,
    pub dependencies: Vec<String>,
    pub scope: Scope,
    pub work: Work,
}

/// Everything a running task can see.
pub struct TaskContext<'a> {
    pub env: &'a Environment,
    /// Span of the running task, progress can be reported through it.
    pub span: tracing::Span,
}

impl TaskContext<'_> {
    pub fn config(&self) -> &PipelineConfig {
        &self.env.config
    }
}

/// Glob patterns, relative to the project root, describing which file
/// changes concern a task.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Scope {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
    }
}

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A [`Scope`] compiled against an absolute project root.
#[derive(Debug, Clone)]
pub(crate) struct ScopeMatcher {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl ScopeMatcher {
    pub fn new(root: &Utf8Path, scope: &Scope) -> Result<Self, glob::PatternError> {
        let root = Pattern::escape(root.as_str());
        let compile = |globs: &[String]| {
            globs
                .iter()
                .map(|glob| Pattern::new(&format!("{root}/{glob}")))
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(Self {
            include: compile(&scope.include)?,
            exclude: compile(&scope.exclude)?,
        })
    }

    pub fn matches(&self, path: &Utf8Path) -> bool {
        let path = path.as_std_path();
        self.include.iter().any(|p| p.matches_path_with(path, MATCH))
            && !self.exclude.iter().any(|p| p.matches_path_with(path, MATCH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_matches_within_root() {
        let scope = Scope {
            include: vec!["src/*".into()],
            exclude: vec!["src/*.html".into()],
        };
        let matcher = ScopeMatcher::new(Utf8Path::new("/project"), &scope).unwrap();

        assert!(matcher.matches(Utf8Path::new("/project/src/robots.txt")));
        assert!(matcher.matches(Utf8Path::new("/project/src/.htaccess")));
        assert!(!matcher.matches(Utf8Path::new("/project/src/index.html")));
        assert!(!matcher.matches(Utf8Path::new("/project/src/img/logo.png")));
        assert!(!matcher.matches(Utf8Path::new("/other/src/robots.txt")));
    }

    #[test]
    fn recursive_scope() {
        let scope = Scope {
            include: vec!["src/scripts/**/*.js".into()],
            exclude: vec![],
        };
        let matcher = ScopeMatcher::new(Utf8Path::new("/project"), &scope).unwrap();

        assert!(matcher.matches(Utf8Path::new("/project/src/scripts/main.js")));
        assert!(matcher.matches(Utf8Path::new("/project/src/scripts/lib/util.js")));
        assert!(!matcher.matches(Utf8Path::new("/project/src/scripts/main.ts")));
    }
}
