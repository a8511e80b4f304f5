use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::{Dfs, Reversed};

use crate::core::{Environment, FileSet};
use crate::engine::{Scope, TaskContext, TaskNode};
use crate::engine::runner::Session;
use crate::error::{BuildError, GraphError};

/// The declaration side of the task graph.
///
/// Tasks are added by name, wired to their dependencies by name, and checked
/// all at once by [`Blueprint::finish`]. Nothing runs until the resulting
/// [`Pipeline`] is asked to.
///
/// ```rust
/// use webpipe::{Blueprint, FileSet};
///
/// let mut blueprint = Blueprint::new();
/// blueprint.task("styles").run(|_, _| Ok(FileSet::new()));
/// blueprint.task("html").depends_on(["styles"]).run(|_, _| Ok(FileSet::new()));
///
/// let pipeline = blueprint.finish().unwrap();
/// assert_eq!(pipeline.dependencies("html").unwrap(), ["styles"]);
/// ```
#[derive(Default)]
pub struct Blueprint {
    tasks: Vec<TaskNode>,
}

impl Blueprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts declaring a task called `name`.
    pub fn task(&mut self, name: impl Into<String>) -> TaskDef<'_> {
        TaskDef {
            blueprint: self,
            name: name.into(),
            dependencies: Vec::new(),
            scope: Scope::default(),
        }
    }

    /// Validates the declarations and builds the graph.
    ///
    /// Fails on duplicate names, unknown or self dependencies and cycles.
    pub fn finish(self) -> Result<Pipeline, GraphError> {
        let mut graph = Graph::new();
        let mut index = HashMap::new();

        for task in self.tasks {
            if index.contains_key(&task.name) {
                return Err(GraphError::Duplicate(task.name));
            }
            let name = task.name.clone();
            index.insert(name, graph.add_node(task));
        }

        let mut edges = Vec::new();
        for (name, &target) in &index {
            for dependency in &graph[target].dependencies {
                if dependency == name {
                    return Err(GraphError::SelfDependency(name.clone()));
                }
                let source = index.get(dependency).ok_or_else(|| GraphError::UnknownDependency {
                    task: name.clone(),
                    dependency: dependency.clone(),
                })?;
                edges.push((*source, target));
            }
        }

        for (source, target) in edges {
            graph.add_edge(source, target, ());
        }

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(GraphError::Cycle(cycle_path(&graph, cycle.node_id())));
        }

        Ok(Pipeline { graph, index })
    }
}

/// Finds a path that starts and ends at `start`, following dependency edges.
fn cycle_path(graph: &Graph<TaskNode, ()>, start: NodeIndex) -> Vec<String> {
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        for next in graph.neighbors(node) {
            if next == start {
                let mut path = vec![start];
                let mut cursor = node;
                while cursor != start {
                    path.push(cursor);
                    cursor = parent[&cursor];
                }
                path.push(start);
                path.reverse();
                return path.into_iter().map(|i| graph[i].name.clone()).collect();
            }
            if let std::collections::hash_map::Entry::Vacant(entry) = parent.entry(next) {
                entry.insert(node);
                queue.push_back(next);
            }
        }
    }

    vec![graph[start].name.clone()]
}

pub struct TaskDef<'a> {
    blueprint: &'a mut Blueprint,
    name: String,
    dependencies: Vec<String>,
    scope: Scope,
}

impl<'a> TaskDef<'a> {
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Adds a glob, relative to the project root, whose changes make this
    /// task dirty in watch mode.
    pub fn watch(mut self, glob: impl Into<String>) -> Self {
        self.scope.include.push(glob.into());
        self
    }

    /// Excludes paths from the watch scope.
    pub fn ignore(mut self, glob: impl Into<String>) -> Self {
        self.scope.exclude.push(glob.into());
        self
    }

    /// Registers the task. The callback receives the outputs of the declared
    /// dependencies, in declaration order.
    pub fn run<F>(self, callback: F)
    where
        F: Fn(&TaskContext<'_>, &[&FileSet]) -> anyhow::Result<FileSet> + Send + Sync + 'static,
    {
        self.blueprint.tasks.push(TaskNode {
            name: self.name,
            dependencies: self.dependencies,
            scope: self.scope,
            work: Arc::new(callback),
        });
    }
}

/// A validated, acyclic task graph.
pub struct Pipeline {
    pub(crate) graph: Graph<TaskNode, ()>,
    index: HashMap<String, NodeIndex>,
}

impl Pipeline {
    pub(crate) fn node(&self, name: &str) -> Result<NodeIndex, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownTask(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Task names in declaration order.
    pub fn names(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .map(|i| self.graph[i].name.as_str())
            .collect()
    }

    pub fn dependencies(&self, name: &str) -> Result<&[String], GraphError> {
        Ok(&self.graph[self.node(name)?].dependencies)
    }

    /// The task itself together with all of its transitive dependencies.
    pub(crate) fn closure(&self, target: NodeIndex) -> HashSet<NodeIndex> {
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, target);
        let mut nodes = HashSet::new();
        while let Some(node) = dfs.next(reversed) {
            nodes.insert(node);
        }
        nodes
    }

    /// The given tasks together with everything that depends on them.
    pub(crate) fn downstream(&self, start: &HashSet<NodeIndex>) -> HashSet<NodeIndex> {
        let mut nodes = HashSet::new();
        for &node in start {
            let mut dfs = Dfs::new(&self.graph, node);
            while let Some(next) = dfs.next(&self.graph) {
                nodes.insert(next);
            }
        }
        nodes
    }

    /// Runs `name` after every task it transitively depends on.
    ///
    /// Each dependency runs exactly once, independent tasks run in parallel.
    /// The first failure stops the run and is returned.
    pub fn run(&self, env: &Environment, name: &str) -> Result<Arc<FileSet>, BuildError> {
        let mut session = Session::new(self, env.clone());
        session.run(name)?;
        session
            .output(name)
            .ok_or_else(|| BuildError::MissingDependency {
                task: name.to_string(),
                dependency: name.to_string(),
            })
    }

    /// Builds a chain pipeline in which each step depends on the one before
    /// it and runs the task of the same name in `main`.
    pub fn sequence(main: &Arc<Pipeline>, steps: &[&str]) -> Result<Pipeline, GraphError> {
        let mut blueprint = Blueprint::new();
        let mut previous: Option<&str> = None;

        for &step in steps {
            main.node(step)?;

            let pipeline = main.clone();
            let target = step.to_string();
            let def = blueprint.task(step);
            let def = match previous {
                Some(previous) => def.depends_on([previous]),
                None => def,
            };

            def.run(move |ctx, _| {
                let output = pipeline.run(ctx.env, &target)?;
                Ok(FileSet::clone(&output))
            });

            previous = Some(step);
        }

        blueprint.finish()
    }
}

impl std::fmt::Display for Pipeline {
    /// Renders the graph as a Mermaid flowchart.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].name.replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(blueprint: &mut Blueprint, name: &str, deps: &[&str]) {
        blueprint
            .task(name)
            .depends_on(deps.iter().copied())
            .run(|_, _| Ok(FileSet::new()));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "html", &["styles"]);

        let err = blueprint.finish().err().unwrap();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                task: "html".into(),
                dependency: "styles".into()
            }
        );
    }

    #[test]
    fn rejects_duplicates_and_self_dependencies() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "a", &[]);
        noop(&mut blueprint, "a", &[]);
        assert_eq!(blueprint.finish().err(), Some(GraphError::Duplicate("a".into())));

        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "a", &["a"]);
        assert_eq!(blueprint.finish().err(), Some(GraphError::SelfDependency("a".into())));
    }

    #[test]
    fn rejects_cycles_with_path() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "a", &["c"]);
        noop(&mut blueprint, "b", &["a"]);
        noop(&mut blueprint, "c", &["b"]);
        noop(&mut blueprint, "d", &[]);

        match blueprint.finish().err() {
            Some(GraphError::Cycle(path)) => {
                assert_eq!(path.len(), 4);
                assert_eq!(path.first(), path.last());
                for name in ["a", "b", "c"] {
                    assert!(path.iter().any(|p| p == name));
                }
                assert!(!path.iter().any(|p| p == "d"));
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn closure_and_downstream() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "styles", &[]);
        noop(&mut blueprint, "scripts", &[]);
        noop(&mut blueprint, "html", &["styles", "scripts"]);
        noop(&mut blueprint, "images", &[]);
        noop(&mut blueprint, "build", &["html", "images"]);
        let pipeline = blueprint.finish().unwrap();

        let names = |set: HashSet<NodeIndex>| {
            let mut names: Vec<_> = set
                .into_iter()
                .map(|i| pipeline.graph[i].name.clone())
                .collect();
            names.sort();
            names
        };

        let html = pipeline.node("html").unwrap();
        assert_eq!(names(pipeline.closure(html)), ["html", "scripts", "styles"]);

        let styles = pipeline.node("styles").unwrap();
        assert_eq!(
            names(pipeline.downstream(&HashSet::from([styles]))),
            ["build", "html", "styles"]
        );
    }

    #[test]
    fn renders_mermaid() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "styles", &[]);
        noop(&mut blueprint, "html", &["styles"]);
        let text = blueprint.finish().unwrap().to_string();

        assert!(text.starts_with("graph LR"));
        assert!(text.contains("0[\"styles\"]"));
        assert!(text.contains("0 --> 1"));
    }
}
