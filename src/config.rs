//! Project configuration.
//!
//! Configuration comes from three places, in increasing priority:
//! 1. Built-in defaults mirroring the usual `src`/`dist` starter layout.
//! 2. The `package.json` manifest: `name`, the opaque `coreConfig` block and
//!    an optional `webpipe` block overriding any [`Settings`] field.
//! 3. Key/value overrides from the process environment and the optional
//!    `.env` file, used for deployment paths.
//!
//! The resulting [`PipelineConfig`] is never mutated while tasks run.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use lightningcss::targets::{Browsers, Targets};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

pub const MANIFEST: &str = "package.json";
pub const ENV_FILE: &str = ".env";

/// An external program together with its arguments. Arguments may contain
/// `{file}` and `{target}` placeholders, filled in per invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The arguments with every `{name}` placeholder replaced by its value.
    pub fn expand(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |arg, (name, value)| {
                    arg.replace(&format!("{{{name}}}"), value)
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMethod {
    /// Replace the target directory with a copy of the output tree.
    Copy,
    /// Pack the output tree into a timestamped archive inside the target.
    Archive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployTarget {
    pub method: DeployMethod,
    /// Fallback location used when no override is present.
    pub path: String,
    /// Name of the variable that overrides `path`.
    #[serde(default)]
    pub env_var: Option<String>,
}

/// Overridable layout and tool settings, the `webpipe` manifest block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub working_dir: String,
    pub dist_dir: String,
    pub staging_dir: String,
    pub cache_dir: String,
    pub font_dir: String,
    pub image_dir: String,
    pub script_dir: String,
    pub style_dir: String,
    /// Browserslist queries used for vendor prefixing.
    pub browsers: Vec<String>,
    /// Syntax level scripts are lowered to.
    pub script_target: String,
    /// Lowers one script file, printing the result.
    pub transpiler: ToolCommand,
    /// Minifies a bundle read from stdin.
    pub minifier: ToolCommand,
    pub linter: ToolCommand,
    /// JPEG quality used when compressing images.
    pub image_quality: u8,
    pub http_port: u16,
    pub reload_port: u16,
    pub deploy: BTreeMap<String, DeployTarget>,
}

impl Default for Settings {
    fn default() -> Self {
        let deploy = BTreeMap::from([
            (
                "dev".to_string(),
                DeployTarget {
                    method: DeployMethod::Copy,
                    path: "deploy/dev".into(),
                    env_var: Some("DEV_DEPLOY_PATH".into()),
                },
            ),
            (
                "qa".to_string(),
                DeployTarget {
                    method: DeployMethod::Archive,
                    path: "deploy/qa".into(),
                    env_var: Some("QA_DEPLOY_PATH".into()),
                },
            ),
        ]);

        Self {
            working_dir: "src".into(),
            dist_dir: "dist".into(),
            staging_dir: ".tmp".into(),
            cache_dir: ".cache".into(),
            font_dir: "fonts".into(),
            image_dir: "img".into(),
            script_dir: "scripts".into(),
            style_dir: "styles".into(),
            browsers: vec!["> 1%".into(), "last 2 versions".into(), "Firefox ESR".into()],
            script_target: "es5".into(),
            transpiler: ToolCommand::new("swc", &["{file}", "-C", "jsc.target={target}"]),
            minifier: ToolCommand::new(
                "esbuild",
                &["--log-level=error", "--minify", "--loader=js", "--target={target}"],
            ),
            linter: ToolCommand::new("eslint", &["--fix"]),
            image_quality: 80,
            http_port: 9000,
            reload_port: 1337,
            deploy,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    name: String,
    #[serde(default, rename = "coreConfig")]
    core_config: Option<Value>,
    #[serde(default)]
    webpipe: Settings,
}

/// Everything a task may need to know about the project.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Project root, every other path is relative to it.
    pub root: Utf8PathBuf,
    /// Project name from the manifest.
    pub name: String,
    pub settings: Settings,
    /// Enables minification and image compression.
    pub compress: bool,
    /// Deployment environment tag, `dev` unless deploying elsewhere.
    pub environment: String,
    /// The opaque `coreConfig` block handed to the component resolver.
    pub components: Value,
    /// Values read from the `.env` file.
    pub overrides: BTreeMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from("."),
            name: "app".into(),
            settings: Settings::default(),
            compress: false,
            environment: "dev".into(),
            components: Value::Object(Default::default()),
            overrides: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Load the configuration of the project rooted at `root`.
    pub fn load(root: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref().to_path_buf();
        let path = root.join(MANIFEST);

        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Manifest {
            path: path.clone(),
            source,
        })?;
        let manifest: Manifest = serde_json::from_str(&text)?;
        let overrides = load_env_file(&root.join(ENV_FILE))?;

        tracing::debug!(name = %manifest.name, %root, "loaded project manifest");

        Ok(Self {
            root,
            name: manifest.name,
            settings: manifest.webpipe,
            compress: false,
            environment: "dev".into(),
            components: manifest
                .core_config
                .unwrap_or_else(|| Value::Object(Default::default())),
            overrides,
        })
    }

    /// Returns the configuration used by a deploy run: compression on and the
    /// environment tag set to `environment`.
    pub fn for_deploy(&self, environment: &str) -> Result<Self, ConfigError> {
        if !self.settings.deploy.contains_key(environment) {
            return Err(ConfigError::UnknownTarget(environment.to_string()));
        }

        Ok(Self {
            compress: true,
            environment: environment.to_string(),
            ..self.clone()
        })
    }

    /// The same configuration with compression switched.
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn src(&self) -> Utf8PathBuf {
        self.root.join(&self.settings.working_dir)
    }

    pub fn dist(&self) -> Utf8PathBuf {
        self.root.join(&self.settings.dist_dir)
    }

    pub fn staging(&self) -> Utf8PathBuf {
        self.root.join(&self.settings.staging_dir)
    }

    pub fn cache(&self) -> Utf8PathBuf {
        self.root.join(&self.settings.cache_dir)
    }

    /// Look up a variable, process environment first, then the `.env` file.
    pub fn var(&self, key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .or_else(|| self.overrides.get(key).cloned())
    }

    /// Resolve where the given deploy environment publishes to.
    pub fn deploy_target(&self, environment: &str) -> Result<(DeployMethod, Utf8PathBuf), ConfigError> {
        let target = self
            .settings
            .deploy
            .get(environment)
            .ok_or_else(|| ConfigError::UnknownTarget(environment.to_string()))?;

        let path = target
            .env_var
            .as_deref()
            .and_then(|key| self.var(key))
            .unwrap_or_else(|| target.path.clone());

        Ok((target.method, self.root.join(path)))
    }

    /// Browser targets for vendor prefixing and minification.
    pub fn targets(&self) -> Result<Targets, ConfigError> {
        let browsers = Browsers::from_browserslist(self.settings.browsers.iter())
            .map_err(|e| ConfigError::Browsers(e.to_string()))?;

        Ok(browsers.map(Targets::from).unwrap_or_default())
    }

    /// The component configuration block with the environment tag added.
    pub fn component_config(&self) -> Value {
        let mut value = self.components.clone();
        if let Value::Object(map) = &mut value {
            map.insert("environment".into(), Value::String(self.environment.clone()));
        }
        value
    }
}

fn load_env_file(path: &Utf8Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let iter = match dotenv::from_path_iter(path.as_std_path()) {
        Ok(iter) => iter,
        Err(_) => {
            tracing::warn!("no {ENV_FILE} file found, using default deploy paths");
            return Ok(BTreeMap::new());
        }
    };

    let mut map = BTreeMap::new();
    for item in iter {
        let (key, value) = item?;
        map.insert(key, value);
    }

    Ok(map)
}
