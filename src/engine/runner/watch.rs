//! Watch mode is implemented as a three-part system:
//!
//! 1. **File watcher**: [`ChangeStream`] wraps the `notify` debouncer and
//!    yields batches of changed paths, one batch per quiet period.
//! 2. **Dispatcher**: [`Dispatcher`] maps every batch onto the tasks whose
//!    watch scopes match and re-runs them together with everything
//!    downstream, reusing the cached outputs of untouched tasks. It accepts
//!    any iterator of batches, so it can be driven without a filesystem.
//! 3. **WebSocket server**: a dedicated `tungstenite` thread keeps browser
//!    connections open and broadcasts `"reload"` after each rebuild. The
//!    markup task injects the matching client script.

use std::collections::HashSet;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use petgraph::graph::NodeIndex;
use tungstenite::WebSocket;

use crate::blueprint::Pipeline;
use crate::core::Environment;
use crate::engine::ScopeMatcher;
use crate::engine::runner::{Diagnostics, Session};
use crate::error::{BuildError, WatchError};

const DEBOUNCE: Duration = Duration::from_millis(250);

/// A lazy, endless sequence of debounced change batches.
pub struct ChangeStream {
    rx: Receiver<DebounceEventResult>,
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl ChangeStream {
    /// Starts watching every directory in `roots` recursively.
    pub fn new(roots: &[Utf8PathBuf]) -> Result<Self, WatchError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer = new_debouncer(DEBOUNCE, None, tx)?;

        for root in roots {
            tracing::info!("watching {root}");
            debouncer.watch(root.as_std_path(), RecursiveMode::Recursive)?;
        }

        Ok(Self {
            rx,
            _debouncer: debouncer,
        })
    }
}

impl Iterator for ChangeStream {
    type Item = Vec<Utf8PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.rx.recv().ok()? {
                Ok(events) => {
                    let mut paths: Vec<Utf8PathBuf> = events
                        .iter()
                        .filter(|de| {
                            matches!(
                                de.event.kind,
                                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                            )
                        })
                        .flat_map(|de| de.event.paths.iter())
                        .filter_map(|path| Utf8PathBuf::from_path_buf(path.clone()).ok())
                        .collect();

                    paths.sort();
                    paths.dedup();

                    if !paths.is_empty() {
                        return Some(paths);
                    }
                }
                Err(errors) => {
                    for e in errors {
                        tracing::error!("watch error: {e}");
                    }
                }
            }
        }
    }
}

/// Re-runs the parts of a pipeline affected by file changes.
pub struct Dispatcher<'p> {
    session: Session<'p>,
    target: String,
    root: Utf8PathBuf,
    matchers: Vec<(NodeIndex, ScopeMatcher)>,
    healthy: bool,
}

impl<'p> Dispatcher<'p> {
    /// Prepares to keep `target` up to date. Only tasks `target` depends on
    /// are considered.
    pub fn new(pipeline: &'p Pipeline, env: Environment, target: &str) -> Result<Self, WatchError> {
        let root = env.config.root.canonicalize_utf8()?;

        let mut matchers = Vec::new();
        for index in pipeline.closure(pipeline.node(target).map_err(BuildError::from)?) {
            let scope = &pipeline.graph[index].scope;
            if !scope.is_empty() {
                matchers.push((index, ScopeMatcher::new(&root, scope)?));
            }
        }

        Ok(Self {
            session: Session::new(pipeline, env),
            target: target.to_string(),
            root,
            matchers,
            healthy: false,
        })
    }

    /// Runs the full target once, filling the output cache.
    pub fn initial(&mut self) -> Result<Diagnostics, BuildError> {
        let result = self.session.run(&self.target);
        self.healthy = result.is_ok();
        result
    }

    /// Tasks whose watch scope matches one of the given paths.
    pub fn dirty(&self, paths: &[Utf8PathBuf]) -> HashSet<NodeIndex> {
        let mut dirty = HashSet::new();
        for path in paths {
            for (index, matcher) in &self.matchers {
                if matcher.matches(path) {
                    dirty.insert(*index);
                }
            }
        }
        dirty
    }

    /// Handles one batch of changes. Returns `None` when no task cares about
    /// any of the paths.
    pub fn dispatch(&mut self, paths: &[Utf8PathBuf]) -> Option<Result<Diagnostics, BuildError>> {
        let dirty = self.dirty(paths);
        if dirty.is_empty() {
            return None;
        }

        tracing::info!("change detected, re-running tasks...");

        // After a failed run some upstream outputs are missing, so the whole
        // target runs again.
        let result = if self.healthy {
            self.session.rerun(&dirty, &self.target)
        } else {
            self.session.run(&self.target)
        };

        self.healthy = result.is_ok();
        Some(result)
    }

    /// Consumes change batches until the source runs dry, calling
    /// `on_rebuild` after every successful rebuild. Failures are logged.
    pub fn run<I>(&mut self, batches: I, mut on_rebuild: impl FnMut(&Diagnostics))
    where
        I: IntoIterator<Item = Vec<Utf8PathBuf>>,
    {
        for batch in batches {
            tracing::debug!("{} path(s) changed", batch.len());

            match self.dispatch(&batch) {
                None => {}
                Some(Ok(diagnostics)) => {
                    on_rebuild(&diagnostics);
                    tracing::info!("rebuild complete, watching for changes...");
                }
                Some(Err(e)) => tracing::error!("rebuild failed: {e}"),
            }
        }
    }

    /// The smallest set of directories covering every watch scope.
    pub fn watch_roots(&self) -> Vec<Utf8PathBuf> {
        let pipeline = self.session.pipeline();
        let roots = self
            .matchers
            .iter()
            .flat_map(|(index, _)| pipeline.graph[*index].scope.include.iter())
            .map(|glob| resolve_watch_root(&self.root, glob))
            .collect();

        collapse_watch_paths(roots)
    }
}

/// Runs the watch loop for `target` forever: initial build, then rebuilds
/// on every change. `reload` is notified after each successful rebuild.
pub fn watch(
    pipeline: &Pipeline,
    env: Environment,
    target: &str,
    reload: Option<Sender<()>>,
) -> Result<(), WatchError> {
    let mut dispatcher = Dispatcher::new(pipeline, env, target)?;

    tracing::info!("running initial build...");
    match dispatcher.initial() {
        Ok(_) => tracing::info!("initial build completed, now watching for changes..."),
        Err(e) => tracing::error!("initial build failed, watching for changes anyway: {e}"),
    }

    let stream = ChangeStream::new(&dispatcher.watch_roots())?;

    dispatcher.run(stream, |_| {
        if let Some(reload) = &reload
            && reload.send(()).is_err()
        {
            tracing::warn!("live reload channel closed");
        }
    });

    Ok(())
}

/// Starts the live reload WebSocket server, preferring `port` and falling
/// back to any free port. Returns the port in use and the reload trigger.
pub fn start_reload_server(port: u16) -> Result<(u16, Sender<()>), WatchError> {
    let (tcp, port) = reserve_port(port).map_err(WatchError::Bind)?;
    let clients = Arc::new(Mutex::new(vec![]));

    let _thread_i = new_thread_ws_incoming(tcp, clients.clone());
    let (tx_reload, _thread_o) = new_thread_ws_reload(clients);

    tracing::info!(port, "live reload server listening");
    Ok((port, tx_reload))
}

fn reserve_port(port: u16) -> std::io::Result<(TcpListener, u16)> {
    let listener = match TcpListener::bind(("127.0.0.1", port)) {
        Ok(sock) => sock,
        Err(_) => TcpListener::bind("127.0.0.1:0")?,
    };

    let addr = listener.local_addr()?;
    Ok((listener, addr.port()))
}

type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

fn new_thread_ws_incoming(server: TcpListener, clients: Clients) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let socket = match stream.map_err(|e| e.to_string()).and_then(|s| {
                tungstenite::accept(s).map_err(|e| e.to_string())
            }) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::debug!("rejected live reload client: {e}");
                    continue;
                }
            };

            if let Ok(mut clients) = clients.lock() {
                clients.push(socket);
            }
        }
    })
}

fn new_thread_ws_reload(clients: Clients) -> (Sender<()>, JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();

    let thread = std::thread::spawn(move || {
        while rx.recv().is_ok() {
            let Ok(mut clients) = clients.lock() else {
                break;
            };
            let mut broken = vec![];

            for (i, socket) in clients.iter_mut().enumerate() {
                match socket.send("reload".into()) {
                    Ok(_) => {}
                    Err(tungstenite::error::Error::Io(e)) => {
                        if e.kind() == std::io::ErrorKind::BrokenPipe {
                            broken.push(i);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Error: {e:?}");
                        broken.push(i);
                    }
                }
            }

            for i in broken.into_iter().rev() {
                clients.remove(i);
            }

            // Keep only the 10 most recent connections.
            let len = clients.len();
            if len > 10 {
                for mut socket in clients.drain(0..len - 10) {
                    socket.close(None).ok();
                }
            }
        }
    });

    (tx, thread)
}

/// The directory to watch for a glob relative to `root`: its static prefix,
/// or the closest existing ancestor of it.
pub(crate) fn resolve_watch_root(root: &Utf8Path, glob: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(glob);

    let components: Vec<_> = path.components().collect();
    let split_idx = components
        .iter()
        .position(|c| c.as_str().contains(['*', '?', '[']))
        .unwrap_or(components.len());

    let static_part: Utf8PathBuf = components.iter().take(split_idx).collect();
    let mut candidate = root.join(static_part);

    while !candidate.is_dir() {
        match candidate.parent() {
            Some(parent) if candidate != root => candidate = parent.to_path_buf(),
            _ => return root.to_path_buf(),
        }
    }

    candidate
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because
/// the watcher is recursive.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered: Vec<Utf8PathBuf> = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}
