mod diagnostics;
#[cfg(feature = "server")]
pub(crate) mod http;
#[cfg(feature = "live")]
pub(crate) mod watch;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc::{TryRecvError, channel};
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::blueprint::Pipeline;
use crate::core::{Environment, FileSet};
use crate::engine::TaskContext;
use crate::error::BuildError;

pub use diagnostics::{Diagnostics, TaskExecution};

type Message = (NodeIndex, Result<FileSet, BuildError>, Instant, Duration);

/// Holds the outputs of every task that ran so far, so that later runs can
/// reuse them instead of re-running unchanged upstream tasks.
pub struct Session<'p> {
    pipeline: &'p Pipeline,
    env: Environment,
    cache: HashMap<NodeIndex, Arc<FileSet>>,
}

impl<'p> Session<'p> {
    pub fn new(pipeline: &'p Pipeline, env: Environment) -> Self {
        Self {
            pipeline,
            env,
            cache: HashMap::new(),
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn pipeline(&self) -> &'p Pipeline {
        self.pipeline
    }

    /// Runs `name` and all of its transitive dependencies.
    pub fn run(&mut self, name: &str) -> Result<Diagnostics, BuildError> {
        let target = self.pipeline.node(name)?;
        let nodes = self.pipeline.closure(target);
        run_tasks_parallel(self.pipeline, &self.env, &mut self.cache, &nodes)
    }

    /// Re-runs the `dirty` tasks and everything downstream of them, limited
    /// to the tasks `name` depends on. Untouched upstream outputs are reused.
    pub fn rerun(&mut self, dirty: &HashSet<NodeIndex>, name: &str) -> Result<Diagnostics, BuildError> {
        let target = self.pipeline.node(name)?;
        let within = self.pipeline.closure(target);
        let nodes = self
            .pipeline
            .downstream(dirty)
            .intersection(&within)
            .copied()
            .collect();

        run_tasks_parallel(self.pipeline, &self.env, &mut self.cache, &nodes)
    }

    pub fn output(&self, name: &str) -> Option<Arc<FileSet>> {
        let index = self.pipeline.node(name).ok()?;
        self.cache.get(&index).cloned()
    }
}

/// Executes the given nodes of the task graph on the rayon pool. Tasks are
/// spawned as soon as their dependencies are met.
///
/// 1. The dependency count of every node is computed, counting only
///    dependencies that are part of this run.
/// 2. Nodes without pending dependencies are spawned.
/// 3. The calling thread collects results; each success decrements the
///    counts of its dependents and spawns the ones that reach zero.
/// 4. The first failure returns immediately, nothing new is spawned and the
///    scope waits for tasks already in flight.
pub(crate) fn run_tasks_parallel(
    pipeline: &Pipeline,
    env: &Environment,
    cache: &mut HashMap<NodeIndex, Arc<FileSet>>,
    nodes_to_run: &HashSet<NodeIndex>,
) -> Result<Diagnostics, BuildError> {
    let graph = &pipeline.graph;

    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    let mut dependency_counts: HashMap<NodeIndex, usize> = nodes_to_run
        .iter()
        .map(|&i| {
            (
                i,
                graph
                    .neighbors_directed(i, petgraph::Direction::Incoming)
                    .filter(|dep| nodes_to_run.contains(dep))
                    .count(),
            )
        })
        .collect();

    let total_tasks = nodes_to_run.len() as u64;
    let mut completed_tasks = 0;
    let mut diagnostics = Diagnostics::default();

    if total_tasks == 0 {
        return Ok(diagnostics);
    }

    let root_span = tracing::span!(Level::INFO, "running_tasks");
    root_span.pb_set_length(total_tasks);
    root_span.pb_set_style(&crate::utils::get_style_bar());
    let _enter = root_span.enter();

    let pb_style = crate::utils::get_style_task();

    rayon::scope(|s| -> Result<(), BuildError> {
        let (result_sender, result_receiver) = channel::<Message>();

        let spawn_task = |cache: &HashMap<NodeIndex, Arc<FileSet>>,
                          index: NodeIndex|
         -> Result<(), BuildError> {
            let task = &graph[index];

            let mut dependencies = Vec::with_capacity(task.dependencies.len());
            for name in &task.dependencies {
                let dep_index = pipeline.node(name)?;
                let output = cache
                    .get(&dep_index)
                    .ok_or_else(|| BuildError::MissingDependency {
                        task: task.name.clone(),
                        dependency: name.clone(),
                    })?;
                dependencies.push(output.clone());
            }

            let name = task.name.clone();
            let work = task.work.clone();
            let sender = result_sender.clone();
            let pb_style = pb_style.clone();

            s.spawn(move |_| {
                let span = tracing::span!(Level::INFO, "task", name = %name);
                span.pb_set_style(&pb_style);
                span.pb_set_message(&format!("Running {name}"));
                let _enter = span.enter();

                let context = TaskContext {
                    env,
                    span: span.clone(),
                };

                let start_time = Instant::now();
                let inputs: Vec<&FileSet> = dependencies.iter().map(Arc::as_ref).collect();

                let output = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    work(&context, &inputs)
                })) {
                    Ok(result) => result.map_err(|e| BuildError::Task(name.clone(), e)),
                    Err(panic) => {
                        let message = if let Some(s) = panic.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            String::from("unknown payload")
                        };

                        Err(BuildError::Panic {
                            task: name.clone(),
                            message,
                        })
                    }
                };

                // The receiver is gone when the run already failed.
                let _ = sender.send((index, output, start_time, start_time.elapsed()));
            });

            Ok(())
        };

        for &node_index in nodes_to_run {
            if dependency_counts.get(&node_index).copied().unwrap_or(0) == 0 {
                spawn_task(cache, node_index)?;
            }
        }

        while completed_tasks < total_tasks {
            let (completed_index, output, start, duration) = loop {
                match result_receiver.try_recv() {
                    Ok(message) => break message,
                    Err(TryRecvError::Empty) => {
                        // Run queued jobs on this worker rather than parking it,
                        // nested runs would otherwise starve a small pool.
                        if !matches!(rayon::yield_now(), Some(rayon::Yield::Executed)) {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                    }
                    Err(TryRecvError::Disconnected) => {
                        unreachable!("the scheduler holds a sender until it returns")
                    }
                }
            };

            let name = &graph[completed_index].name;
            let output = output?;
            tracing::debug!(task = %name, files = output.len(), "task finished");

            cache.insert(completed_index, Arc::new(output));
            diagnostics.record(name, TaskExecution { start, duration });
            completed_tasks += 1;
            root_span.pb_inc(1);

            if let Some(dependents_of_completed) = dependents.get(&completed_index) {
                for &index in dependents_of_completed {
                    if let Some(count) = dependency_counts.get_mut(&index) {
                        *count -= 1;
                        if *count == 0 {
                            spawn_task(cache, index)?;
                        }
                    }
                }
            }
        }

        Ok(())
    })?;

    diagnostics.log_summary();
    Ok(diagnostics)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::PipelineConfig;
    use crate::core::{FileRecord, Mode};
    use crate::{Blueprint, Pipeline};

    type Log = Arc<Mutex<Vec<String>>>;

    fn env() -> Environment {
        Environment::new(Mode::Build, PipelineConfig::default())
    }

    fn logged(blueprint: &mut Blueprint, log: &Log, name: &str, deps: &[&str]) {
        let log = log.clone();
        let owned = name.to_string();
        blueprint
            .task(name)
            .depends_on(deps.iter().copied())
            .run(move |_, inputs| {
                log.lock().unwrap().push(owned.clone());
                let mut out = FileSet::new();
                for input in inputs {
                    out.merge((*input).clone());
                }
                out.insert(FileRecord::new(format!("{owned}.txt"), owned.clone()));
                Ok(out)
            });
    }

    fn position(log: &[String], name: &str) -> usize {
        log.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn diamond_runs_each_task_once_in_order() {
        let log: Log = Default::default();
        let mut blueprint = Blueprint::new();
        logged(&mut blueprint, &log, "base", &[]);
        logged(&mut blueprint, &log, "left", &["base"]);
        logged(&mut blueprint, &log, "right", &["base"]);
        logged(&mut blueprint, &log, "top", &["left", "right"]);
        logged(&mut blueprint, &log, "unrelated", &[]);
        let pipeline = blueprint.finish().unwrap();

        let output = pipeline.run(&env(), "top").unwrap();
        let log = log.lock().unwrap();

        assert_eq!(log.len(), 4);
        assert_eq!(log.iter().filter(|n| *n == "base").count(), 1);
        assert!(!log.contains(&"unrelated".to_string()));
        assert!(position(&log, "base") < position(&log, "left"));
        assert!(position(&log, "base") < position(&log, "right"));
        assert!(position(&log, "left") < position(&log, "top"));
        assert!(position(&log, "right") < position(&log, "top"));

        let paths: Vec<_> = output.paths().map(|p| p.as_str()).collect();
        assert_eq!(paths, ["base.txt", "left.txt", "right.txt", "top.txt"]);
    }

    #[test]
    fn failure_stops_dependents() {
        let log: Log = Default::default();
        let mut blueprint = Blueprint::new();
        logged(&mut blueprint, &log, "ok", &[]);
        blueprint
            .task("broken")
            .run(|_, _| Err(anyhow::anyhow!("compile error")));
        logged(&mut blueprint, &log, "after", &["broken", "ok"]);
        logged(&mut blueprint, &log, "last", &["after"]);
        let pipeline = blueprint.finish().unwrap();

        let err = pipeline.run(&env(), "last").unwrap_err();

        match err {
            BuildError::Task(name, inner) => {
                assert_eq!(name, "broken");
                assert_eq!(inner.to_string(), "compile error");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let log = log.lock().unwrap();
        assert!(!log.contains(&"after".to_string()));
        assert!(!log.contains(&"last".to_string()));
    }

    #[test]
    fn panics_become_errors() {
        let mut blueprint = Blueprint::new();
        blueprint.task("boom").run(|_, _| panic!("kaboom"));
        let pipeline = blueprint.finish().unwrap();

        match pipeline.run(&env(), "boom") {
            Err(BuildError::Panic { task, message }) => {
                assert_eq!(task, "boom");
                assert_eq!(message, "kaboom");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn unknown_target() {
        let pipeline = Blueprint::new().finish().unwrap();
        assert!(matches!(
            pipeline.run(&env(), "missing"),
            Err(BuildError::Graph(_))
        ));
    }

    #[test]
    fn many_independent_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut blueprint = Blueprint::new();
        let mut names = Vec::new();

        for i in 0..32 {
            let name = format!("leaf{i}");
            let counter = counter.clone();
            blueprint.task(name.clone()).run(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(FileSet::new())
            });
            names.push(name);
        }
        blueprint.task("all").depends_on(names).run(|_, _| Ok(FileSet::new()));
        let pipeline = blueprint.finish().unwrap();

        pipeline.run(&env(), "all").unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn sequence_runs_steps_in_order() {
        let log: Log = Default::default();
        let mut blueprint = Blueprint::new();
        logged(&mut blueprint, &log, "clean", &[]);
        logged(&mut blueprint, &log, "lint", &[]);
        logged(&mut blueprint, &log, "styles", &[]);
        logged(&mut blueprint, &log, "build", &["styles"]);
        let main = Arc::new(blueprint.finish().unwrap());

        let chain = Pipeline::sequence(&main, &["clean", "lint", "build"]).unwrap();
        chain.run(&env(), "build").unwrap();

        assert_eq!(*log.lock().unwrap(), ["clean", "lint", "styles", "build"]);
    }

    #[test]
    fn sequence_stops_at_failing_step() {
        let log: Log = Default::default();
        let mut blueprint = Blueprint::new();
        blueprint
            .task("lint")
            .run(|_, _| Err(anyhow::anyhow!("2 problems")));
        logged(&mut blueprint, &log, "build", &[]);
        let main = Arc::new(blueprint.finish().unwrap());

        let chain = Pipeline::sequence(&main, &["lint", "build"]).unwrap();
        assert!(chain.run(&env(), "build").is_err());
        assert!(log.lock().unwrap().is_empty());

        assert!(Pipeline::sequence(&main, &["lint", "deploy"]).is_err());
    }

    #[test]
    fn rerun_reuses_upstream_outputs() {
        let log: Log = Default::default();
        let mut blueprint = Blueprint::new();
        logged(&mut blueprint, &log, "styles", &[]);
        logged(&mut blueprint, &log, "scripts", &[]);
        logged(&mut blueprint, &log, "html", &["styles", "scripts"]);
        logged(&mut blueprint, &log, "images", &[]);
        logged(&mut blueprint, &log, "build", &["html", "images"]);
        let pipeline = blueprint.finish().unwrap();

        let mut session = Session::new(&pipeline, env());
        session.run("build").unwrap();
        log.lock().unwrap().clear();

        let dirty = HashSet::from([pipeline.node("styles").unwrap()]);
        let diagnostics = session.rerun(&dirty, "build").unwrap();

        let mut ran = log.lock().unwrap().clone();
        ran.sort();
        assert_eq!(ran, ["build", "html", "styles"]);
        assert_eq!(diagnostics.completed().len(), 3);

        let output = session.output("build").unwrap();
        assert!(output.contains("scripts.txt"));
        assert!(output.contains("images.txt"));
    }
}
