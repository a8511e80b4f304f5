//! The commands offered by the `webpipe` binary, expressed as runs of the
//! standard pipeline.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::blueprint::Pipeline;
use crate::config::PipelineConfig;
use crate::core::{Environment, FileSet, Mode};
use crate::error::{ConfigError, PipelineError};
use crate::resolver::{ComponentResolver, ManifestResolver};
use crate::tasks::{self, BUILD, CLEAN, CLEAR_IMAGE_CACHE, LINT};

/// A loaded project together with its task graph.
pub struct Project {
    config: Arc<PipelineConfig>,
    pipeline: Arc<Pipeline>,
}

impl Project {
    /// Loads the project rooted at `root` with the default component
    /// resolver.
    pub fn open(root: impl AsRef<Utf8Path>) -> Result<Self, PipelineError> {
        let root = std::fs::canonicalize(root.as_ref()).map_err(ConfigError::Root)?;
        let root = Utf8PathBuf::try_from(root).map_err(ConfigError::PathFormat)?;
        let config = PipelineConfig::load(&root)?;

        Self::with_resolver(config, Arc::new(ManifestResolver))
    }

    pub fn with_resolver(
        config: PipelineConfig,
        resolver: Arc<dyn ComponentResolver>,
    ) -> Result<Self, PipelineError> {
        let pipeline = tasks::standard(&config, resolver)?;

        Ok(Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn env(&self) -> Environment {
        Environment::new(Mode::Build, self.config.clone())
    }

    /// Runs a single task of the pipeline and its dependencies.
    pub fn run(&self, name: &str) -> Result<Arc<FileSet>, PipelineError> {
        Ok(self.pipeline.run(&self.env(), name)?)
    }

    /// Runs the given tasks one after another with `env`.
    fn chain(&self, env: &Environment, steps: &[&str]) -> Result<Arc<FileSet>, PipelineError> {
        let chain = Pipeline::sequence(&self.pipeline, steps)?;
        let last = steps.last().copied().unwrap_or(CLEAN);
        Ok(chain.run(env, last)?)
    }

    pub fn build(&self) -> Result<Arc<FileSet>, PipelineError> {
        self.run(BUILD)
    }

    /// Clean, then build.
    pub fn rebuild(&self) -> Result<Arc<FileSet>, PipelineError> {
        self.chain(&self.env(), &[CLEAN, BUILD])
    }

    pub fn clean(&self) -> Result<(), PipelineError> {
        self.run(CLEAN).map(|_| ())
    }

    pub fn lint(&self) -> Result<(), PipelineError> {
        self.run(LINT).map(|_| ())
    }

    pub fn clear_image_cache(&self) -> Result<(), PipelineError> {
        self.run(CLEAR_IMAGE_CACHE).map(|_| ())
    }

    /// Produces a compressed build from scratch and publishes it to the
    /// target of `environment`.
    pub fn deploy(&self, environment: &str) -> Result<Arc<FileSet>, PipelineError> {
        let config = self.config.for_deploy(environment)?;
        let env = Environment::new(Mode::Build, config);
        let publish = tasks::deploy_task(environment);

        self.chain(&env, &[CLEAR_IMAGE_CACHE, CLEAN, LINT, BUILD, publish.as_str()])
    }

    /// Mermaid rendering of the task graph.
    pub fn graph(&self) -> String {
        self.pipeline.to_string()
    }

    /// Clean, build and rebuild on every change until interrupted.
    #[cfg(feature = "live")]
    pub fn watch(&self) -> Result<(), PipelineError> {
        self.clean()?;

        let env = Environment::new(Mode::Watch, self.config.clone());
        crate::engine::runner::watch::watch(&self.pipeline, env, BUILD, None)?;
        Ok(())
    }

    /// Like [`Project::watch`], additionally serving the output directory and
    /// reloading connected browsers after every rebuild.
    #[cfg(feature = "server")]
    pub fn serve(&self) -> Result<(), PipelineError> {
        use crate::engine::runner::{http, watch};

        self.clean()?;

        let settings = &self.config.settings;
        let (port, reload) = watch::start_reload_server(settings.reload_port)?;
        let env = Environment::new(Mode::Watch, self.config.clone()).with_port(port);

        let _thread_http = http::start(self.config.dist(), settings.http_port);

        watch::watch(&self.pipeline, env, BUILD, Some(reload))?;
        Ok(())
    }
}
