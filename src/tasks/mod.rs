//! The standard front-end pipeline.
//!
//! ```text
//! styles ──┐
//!          ├── html ──┐
//! scripts ─┘          │
//! images ─────────────┤
//! fonts ──────────────┼── build
//! extras ─────────────┤
//! components ─────────┘
//! ```
//!
//! `clean`, `lint`, `clear_image_cache` and one `deploy:<env>` task per
//! deploy target stand on their own and are chained by the commands in
//! [`crate::project`].

pub mod assets;
pub(crate) mod copy;
pub mod deploy;
pub mod images;
pub mod lint;
pub mod scripts;
pub mod styles;
pub mod tool;

use std::io::Write;
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::blueprint::{Blueprint, Pipeline};
use crate::config::PipelineConfig;
use crate::core::{FileSet, Mode};
use crate::engine::TaskContext;
use crate::error::{FileError, GraphError, TransformErrors};
use crate::resolver::ComponentResolver;
use crate::utils::{glob_files, human_size, remove_dir};

pub const STYLES: &str = "styles";
pub const SCRIPTS: &str = "scripts";
pub const HTML: &str = "html";
pub const IMAGES: &str = "images";
pub const FONTS: &str = "fonts";
pub const EXTRAS: &str = "extras";
pub const COMPONENTS: &str = "components";
pub const BUILD: &str = "build";
pub const LINT: &str = "lint";
pub const CLEAN: &str = "clean";
pub const CLEAR_IMAGE_CACHE: &str = "clear_image_cache";

/// Name of the task publishing to the given deploy environment.
pub fn deploy_task(environment: &str) -> String {
    format!("deploy:{environment}")
}

/// Decides what per-file failures mean for a transform task: fatal in a
/// one-off build, notifications only while watching.
pub(crate) fn settle(ctx: &TaskContext<'_>, errors: Vec<FileError>) -> Result<(), TransformErrors> {
    if errors.is_empty() {
        return Ok(());
    }

    match ctx.env.mode {
        Mode::Build => Err(TransformErrors(errors)),
        Mode::Watch => {
            tracing::warn!("{} file(s) failed to compile, kept the rest", errors.len());
            Ok(())
        }
    }
}

/// Declares the standard pipeline for the project layout in `config`.
pub fn standard(
    config: &PipelineConfig,
    resolver: Arc<dyn ComponentResolver>,
) -> Result<Pipeline, GraphError> {
    let s = &config.settings;
    let src = glob::Pattern::escape(&s.working_dir);
    let mut blueprint = Blueprint::new();

    blueprint
        .task(STYLES)
        .watch(format!("{src}/{}/**/*.scss", s.style_dir))
        .run(|ctx, _| styles::compile_styles(ctx));

    blueprint
        .task(SCRIPTS)
        .watch(format!("{src}/{}/**/*.js", s.script_dir))
        .run(|ctx, _| scripts::transpile_scripts(ctx));

    blueprint
        .task(HTML)
        .depends_on([STYLES, SCRIPTS])
        .watch(format!("{src}/**/*.html"))
        .run(assets::assemble_markup);

    blueprint
        .task(IMAGES)
        .watch(format!("{src}/{}/**/*", s.image_dir))
        .run(|ctx, _| images::build_images(ctx));

    let font_dir = s.font_dir.clone();
    blueprint
        .task(FONTS)
        .watch(format!("{src}/{}/**/*", s.font_dir))
        .run(move |ctx, _| copy::copy_dir(ctx, &font_dir));

    blueprint
        .task(EXTRAS)
        .watch(format!("{src}/*"))
        .ignore(format!("{src}/*.html"))
        .run(|ctx, _| copy::copy_extras(ctx));

    blueprint
        .task(COMPONENTS)
        .run(move |ctx, _| copy::copy_components(ctx, resolver.as_ref()));

    blueprint
        .task(BUILD)
        .depends_on([HTML, IMAGES, FONTS, EXTRAS, COMPONENTS])
        .run(finish_build);

    blueprint.task(CLEAN).run(|ctx, _| clean(ctx));

    blueprint
        .task(LINT)
        .run(|ctx, _| Ok(lint::lint_scripts(ctx)?));

    blueprint
        .task(CLEAR_IMAGE_CACHE)
        .run(|ctx, _| images::clear_image_cache(ctx));

    for environment in s.deploy.keys() {
        blueprint
            .task(deploy_task(environment))
            .run(|ctx, _| Ok(deploy::deploy(ctx)?));
    }

    blueprint.finish()
}

fn clean(ctx: &TaskContext<'_>) -> anyhow::Result<FileSet> {
    let config = ctx.config();
    for dir in [config.staging(), config.dist()] {
        if remove_dir(&dir)? {
            tracing::info!(%dir, "removed");
        }
    }
    Ok(FileSet::new())
}

/// Collects the output of every publishing task and, for production builds,
/// reports the size of the output tree.
fn finish_build(ctx: &TaskContext<'_>, inputs: &[&FileSet]) -> anyhow::Result<FileSet> {
    let config = ctx.config();

    let mut output = FileSet::new();
    for input in inputs {
        output.merge((*input).clone());
    }

    if config.compress {
        let (total, gzip) = output_size(&config.dist())?;
        tracing::info!(
            "build complete: {} file(s), {} ({} gzipped)",
            output.len(),
            human_size(total),
            human_size(gzip)
        );
    } else {
        tracing::info!("build complete: {} file(s)", output.len());
    }

    Ok(output)
}

/// Total and gzipped size of every file below `dir`.
fn output_size(dir: &camino::Utf8Path) -> anyhow::Result<(u64, u64)> {
    let mut total = 0;
    let mut gzip = 0;

    for (_, path) in glob_files(dir, "**/*")? {
        let bytes = std::fs::read(&path)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&bytes)?;

        total += bytes.len() as u64;
        gzip += encoder.finish()?.len() as u64;
    }

    Ok((total, gzip))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::{Utf8Path, Utf8PathBuf};

    use super::*;
    use crate::core::Environment;
    use crate::error::BuildError;
    use crate::resolver::ManifestResolver;

    fn config() -> PipelineConfig {
        PipelineConfig::default()
    }

    #[test]
    fn standard_graph_shape() {
        let pipeline = standard(&config(), Arc::new(ManifestResolver)).unwrap();

        assert_eq!(pipeline.dependencies(HTML).unwrap(), [STYLES, SCRIPTS]);
        assert_eq!(
            pipeline.dependencies(BUILD).unwrap(),
            [HTML, IMAGES, FONTS, EXTRAS, COMPONENTS]
        );
        assert!(pipeline.dependencies(IMAGES).unwrap().is_empty());
        assert!(pipeline.contains("deploy:dev"));
        assert!(pipeline.contains("deploy:qa"));
        assert!(!pipeline.contains("deploy:prod"));
    }

    fn ctx(env: &Environment) -> TaskContext<'_> {
        TaskContext {
            env,
            span: tracing::Span::none(),
        }
    }

    #[test]
    fn per_file_errors_depend_on_mode() {
        let errors = || {
            vec![FileError {
                path: "src/styles/a.scss".into(),
                message: "boom".into(),
            }]
        };

        let build = Environment::new(Mode::Build, config());
        assert!(settle(&ctx(&build), errors()).is_err());
        assert!(settle(&ctx(&build), Vec::new()).is_ok());

        let watch = Environment::new(Mode::Watch, config());
        assert!(settle(&ctx(&watch), errors()).is_ok());
    }

    fn project() -> (tempfile::TempDir, PipelineConfig) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        for sub in ["src/styles", "src/img", "src/fonts"] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }
        fs::write(root.join("src/styles/_vars.scss"), "$accent: #336699;\n").unwrap();
        fs::write(
            root.join("src/styles/main.scss"),
            "@import 'vars';\n.card { color: $accent; user-select: none; }\n",
        )
        .unwrap();
        fs::write(
            root.join("src/index.html"),
            "<html>\n<head>\n<!-- build:css styles/main.css -->\n<link rel=\"stylesheet\" href=\"styles/main.css\">\n<!-- endbuild -->\n</head>\n<body></body>\n</html>\n",
        )
        .unwrap();
        fs::write(root.join("src/robots.txt"), "User-agent: *\n").unwrap();
        fs::write(root.join("src/img/logo.svg"), "<svg/>").unwrap();
        fs::write(root.join("src/fonts/a.woff"), "woff").unwrap();

        let mut config = PipelineConfig {
            root,
            ..PipelineConfig::default()
        };
        config.settings.browsers = vec!["safari 10".into()];
        (dir, config)
    }

    fn snapshot(dir: &Utf8Path) -> Vec<(Utf8PathBuf, Vec<u8>)> {
        glob_files(dir, "**/*")
            .unwrap()
            .into_iter()
            .map(|(rel, path)| (rel, fs::read(path).unwrap()))
            .collect()
    }

    #[test]
    fn build_is_reproducible() {
        let (_dir, config) = project();
        let dist = config.dist();
        let pipeline = standard(&config, Arc::new(ManifestResolver)).unwrap();
        let env = Environment::new(Mode::Build, config);

        pipeline.run(&env, BUILD).unwrap();
        let first = snapshot(&dist);

        pipeline.run(&env, CLEAN).unwrap();
        assert!(!dist.exists());

        pipeline.run(&env, BUILD).unwrap();
        assert_eq!(first, snapshot(&dist));

        let paths: Vec<_> = first.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            paths,
            ["fonts/a.woff", "img/logo.svg", "index.html", "robots.txt", "styles/main.css"]
        );

        let css = String::from_utf8(first[4].1.clone()).unwrap();
        assert!(css.contains("#369") || css.contains("#336699"));
        assert!(!css.contains("$accent"));
        assert!(css.contains("-webkit-user-select"));
    }

    #[test]
    fn broken_style_fails_a_build() {
        let (_dir, config) = project();
        fs::write(config.root.join("src/styles/broken.scss"), ".a { color: $nope; }").unwrap();
        let pipeline = standard(&config, Arc::new(ManifestResolver)).unwrap();

        let env = Environment::new(Mode::Build, config.clone());
        match pipeline.run(&env, BUILD) {
            Err(BuildError::Task(name, _)) => assert_eq!(name, STYLES),
            other => panic!("unexpected result {other:?}"),
        }

        let env = Environment::new(Mode::Watch, config);
        let output = pipeline.run(&env, BUILD).unwrap();
        assert!(output.contains("styles/main.css"));
    }
}
