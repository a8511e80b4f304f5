//! Markup assembly.
//!
//! Markup files mark groups of stylesheet and script references with build
//! blocks:
//!
//! ```html
//! <!-- build:css styles/vendor.css -->
//! <link rel="stylesheet" href="/components/normalize.css/normalize.css">
//! <link rel="stylesheet" href="styles/main.css">
//! <!-- endbuild -->
//! ```
//!
//! Each block is replaced by a single tag pointing at a bundle made of the
//! referenced files, concatenated in order. An optional search path can be
//! given in parentheses after the block type, `build:js(vendor) …`, and is
//! searched before the usual locations.

use std::collections::HashSet;
use std::fs;
use std::sync::LazyLock;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use regex::{Captures, Regex};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::core::{FileRecord, FileSet};
use crate::engine::TaskContext;
use crate::tasks::scripts::{ScriptError, minify_script};
use crate::tasks::styles::{StyleError, process_css};
use crate::utils::glob_files;

static BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<!--\s*build:(\w+)(?:\(([^)]*)\))?(?:\s+(\S+?))?\s*-->(.*?)<!--\s*endbuild\s*-->",
    )
    .expect("valid build block pattern")
});

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:src|href)\s*=\s*["']([^"']+)["']"#).expect("valid reference pattern")
});

/// Comments and elements whose content is whitespace sensitive, in the order
/// they open.
static VERBATIM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<!--.*?-->|<pre\b.*?</pre\s*>|<textarea\b.*?</textarea\s*>|<script\b.*?</script\s*>|<style\b.*?</style\s*>",
    )
    .expect("valid verbatim pattern")
});

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("'{markup}' references '{reference}' which couldn't be found")]
    Unresolved { markup: Utf8PathBuf, reference: String },

    #[error("'{markup}' has a build block of unknown type '{kind}'")]
    UnknownBlock { markup: Utf8PathBuf, kind: String },

    #[error("'{0}' has a build block without a target")]
    MissingTarget(Utf8PathBuf),

    #[error("'{0}' is not valid UTF-8")]
    Encoding(Utf8PathBuf),

    #[error(transparent)]
    Style(#[from] StyleError),

    #[error(transparent)]
    Script(#[from] ScriptError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BundleKind {
    Css,
    Js,
    Remove,
}

impl BundleKind {
    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "css" => Some(Self::Css),
            "js" => Some(Self::Js),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

/// Places searched for a bundle reference, in order.
struct Resolver<'a> {
    staged: &'a [&'a FileSet],
    dirs: Vec<Utf8PathBuf>,
}

impl<'a> Resolver<'a> {
    fn new(config: &PipelineConfig, staged: &'a [&'a FileSet]) -> Self {
        Self {
            staged,
            dirs: vec![config.staging(), config.src(), config.root.clone()],
        }
    }

    fn resolve(&self, path: &Utf8Path, extra: Option<&Utf8Path>) -> Result<Option<Vec<u8>>, AssetError> {
        if let Some(extra) = extra {
            let candidate = extra.join(path);
            if candidate.is_file() {
                return Ok(Some(fs::read(candidate)?));
            }
        }

        for set in self.staged {
            if let Some(record) = set.get(path) {
                return Ok(Some(record.content.read()?.into_owned()));
            }
        }

        for dir in &self.dirs {
            let candidate = dir.join(path);
            if candidate.is_file() {
                return Ok(Some(fs::read(candidate)?));
            }
        }

        Ok(None)
    }
}

/// Assembles every markup file of the working directory into the output
/// directory, together with the bundles its build blocks describe.
pub(crate) fn assemble_markup(ctx: &TaskContext<'_>, staged: &[&FileSet]) -> anyhow::Result<FileSet> {
    let config = ctx.config();
    let src = config.src();
    let resolver = Resolver::new(config, staged);
    let reload = ctx.env.get_refresh_script();

    let mut output = FileSet::new();

    for (rel, path) in glob_files(&src, "**/*.html")? {
        let text = String::from_utf8(fs::read(&path)?).map_err(|_| AssetError::Encoding(path.clone()))?;
        let page = assemble_page(config, &resolver, &rel, &text)?;

        let mut markup = page.markup;
        if config.compress {
            markup = minify_markup(&markup);
        }
        if let Some(script) = &reload {
            markup = inject_before_body_end(&markup, script);
        }

        for (target, kind, code) in page.bundles {
            let code = match (config.compress, kind) {
                (true, BundleKind::Css) => process_css(&code, target.as_str(), config.targets()?, true)?,
                (true, BundleKind::Js) => {
                    let settings = &config.settings;
                    minify_script(&settings.minifier, &code, &settings.script_target)?
                }
                _ => code,
            };
            output.insert(FileRecord::new(target, code));
        }

        output.insert(FileRecord::new(rel, markup));
    }

    output.write_to(&config.dist())?;

    tracing::info!("assembled {} file(s)", output.len());
    Ok(output)
}

struct Page {
    markup: String,
    bundles: Vec<(Utf8PathBuf, BundleKind, String)>,
}

fn assemble_page(
    config: &PipelineConfig,
    resolver: &Resolver<'_>,
    rel: &Utf8Path,
    text: &str,
) -> Result<Page, AssetError> {
    let base = rel.parent().unwrap_or(Utf8Path::new(""));
    let mut bundles = Vec::new();
    let mut failure = None;

    let markup = BLOCK.replace_all(text, |caps: &Captures<'_>| {
        if failure.is_some() {
            return String::new();
        }

        match assemble_block(config, resolver, rel, base, caps) {
            Ok(Some((tag, bundle))) => {
                bundles.push(bundle);
                tag
            }
            Ok(None) => String::new(),
            Err(e) => {
                failure = Some(e);
                String::new()
            }
        }
    });

    if let Some(e) = failure {
        return Err(e);
    }

    Ok(Page {
        markup: markup.into_owned(),
        bundles,
    })
}

type Block = (String, (Utf8PathBuf, BundleKind, String));

fn assemble_block(
    config: &PipelineConfig,
    resolver: &Resolver<'_>,
    markup: &Utf8Path,
    base: &Utf8Path,
    caps: &Captures<'_>,
) -> Result<Option<Block>, AssetError> {
    let kind = BundleKind::parse(&caps[1]).ok_or_else(|| AssetError::UnknownBlock {
        markup: markup.to_path_buf(),
        kind: caps[1].to_string(),
    })?;

    if kind == BundleKind::Remove {
        return Ok(None);
    }

    let extra = caps
        .get(2)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(|s| config.root.join(s));

    let target = caps
        .get(3)
        .map(|m| m.as_str())
        .ok_or_else(|| AssetError::MissingTarget(markup.to_path_buf()))?;
    let mut parts = Vec::new();

    for reference in extract_references(&caps[4]) {
        let path = reference_path(base, &reference);
        let bytes = resolver
            .resolve(&path, extra.as_deref())?
            .ok_or_else(|| AssetError::Unresolved {
                markup: markup.to_path_buf(),
                reference: reference.clone(),
            })?;
        parts.push(String::from_utf8(bytes).map_err(|_| AssetError::Encoding(path))?);
    }

    let tag = match kind {
        BundleKind::Css => format!(r#"<link rel="stylesheet" href="{target}">"#),
        BundleKind::Js => format!(r#"<script src="{target}"></script>"#),
        BundleKind::Remove => unreachable!(),
    };

    let bundle = (reference_path(base, target), kind, parts.join("\n"));
    Ok(Some((tag, bundle)))
}

/// Every `src`/`href` value in the fragment, in document order.
pub(crate) fn extract_references(fragment: &str) -> Vec<String> {
    REFERENCE
        .captures_iter(fragment)
        .map(|caps| caps[1].to_string())
        .filter(|r| !r.contains("://") && !r.starts_with("//") && !r.starts_with("data:"))
        .collect()
}

/// Resolves a reference found in a markup file living in `base`. Leading
/// slashes make it relative to the search roots instead, and query strings or
/// fragments are dropped.
pub(crate) fn reference_path(base: &Utf8Path, reference: &str) -> Utf8PathBuf {
    let reference = reference
        .split(['?', '#'])
        .next()
        .unwrap_or(reference);

    match reference.strip_prefix('/') {
        Some(absolute) => normalize_path(Utf8Path::new(absolute)),
        None => normalize_path(&base.join(reference)),
    }
}

/// All files referenced by the given markup, as paths relative to the
/// project root. Markup paths are expected to be root-relative too.
pub(crate) fn referenced_files(markup: &FileSet) -> Result<HashSet<Utf8PathBuf>, AssetError> {
    let mut found = HashSet::new();

    for record in markup {
        let bytes = record.content.read()?;
        let text = String::from_utf8_lossy(&bytes);
        let base = record.path.parent().unwrap_or(Utf8Path::new(""));

        for reference in extract_references(&text) {
            found.insert(reference_path(base, &reference));
            if !reference.starts_with('/') {
                found.insert(reference_path(Utf8Path::new(""), &reference));
            }
        }
    }

    Ok(found)
}

pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut ret = Utf8PathBuf::new();

    for component in path.components() {
        match component {
            Utf8Component::Prefix(..) | Utf8Component::RootDir | Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                ret.pop();
            }
            Utf8Component::Normal(c) => ret.push(c),
        }
    }

    ret
}

/// Drops comments (conditional comments survive), indentation and blank
/// lines. The content of `pre`, `textarea`, `script` and `style` elements is
/// left as it is.
pub(crate) fn minify_markup(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut pending = String::new();
    let mut at_start = true;
    let mut last = 0;

    for found in VERBATIM.find_iter(markup) {
        pending.push_str(&markup[last..found.start()]);
        last = found.end();

        let text = found.as_str();
        let is_comment = text.starts_with("<!--");
        if is_comment && !(text.starts_with("<!--[if") || text.starts_with("<!--<![endif]")) {
            continue;
        }

        out.push_str(&collapse_lines(&pending, at_start, false));
        out.push_str(text);
        pending.clear();
        at_start = false;
    }

    pending.push_str(&markup[last..]);
    out.push_str(&collapse_lines(&pending, at_start, true));
    out
}

/// Trims every line of `text` and drops the blank ones. Whitespace touching
/// a neighbouring element shrinks to a single newline or space.
fn collapse_lines(text: &str, at_start: bool, at_end: bool) -> String {
    let body = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let edge = |ws: &str| match ws {
        "" => "",
        ws if ws.contains('\n') => "\n",
        _ => " ",
    };

    let trimmed = text.trim_start();
    let lead = if at_start { "" } else { edge(&text[..text.len() - trimmed.len()]) };

    if body.is_empty() {
        return lead.to_string();
    }

    let trimmed = text.trim_end();
    let trail = if at_end { "" } else { edge(&text[trimmed.len()..]) };

    format!("{lead}{body}{trail}")
}

fn inject_before_body_end(markup: &str, script: &str) -> String {
    match markup.rfind("</body>") {
        Some(at) => format!("{}{}\n{}", &markup[..at], script, &markup[at..]),
        None => format!("{markup}\n{script}"),
    }
}
