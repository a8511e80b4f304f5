use std::fmt::Display;
use std::fs;
use std::io;
use std::sync::LazyLock;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::Style;
use glob::{MatchOptions, Pattern};
use indicatif::ProgressStyle;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const ANSI_BLUE: Style = Style::new().blue();

static STYLE_BAR: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("valid progress bar template")
        .progress_chars("=>-")
});

static STYLE_TASK: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .expect("valid spinner template")
});

pub(crate) fn get_style_bar() -> ProgressStyle {
    STYLE_BAR.clone()
}

pub(crate) fn get_style_task() -> ProgressStyle {
    STYLE_TASK.clone()
}

/// Installs the global subscriber: `RUST_LOG` style filtering (default
/// `info`), formatted output and progress bars for task spans.
pub fn init_logging() -> anyhow::Result<()> {
    let indicatif_layer = IndicatifLayer::new();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .try_init()?;

    Ok(())
}

pub fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

pub(crate) fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.2} {}", UNITS[unit])
    }
}

/// Lists files (not directories) matching `pattern` below `base`, sorted,
/// as `(relative, absolute)` pairs. Dotfiles are matched by wildcards.
pub(crate) fn glob_files(
    base: &Utf8Path,
    pattern: &str,
) -> anyhow::Result<Vec<(Utf8PathBuf, Utf8PathBuf)>> {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    let full = format!("{}/{}", Pattern::escape(base.as_str()), pattern);
    let mut files = Vec::new();

    for entry in glob::glob_with(&full, options)? {
        let path = Utf8PathBuf::try_from(entry?)?;
        if !path.is_file() {
            continue;
        }
        let relative = path.strip_prefix(base)?.to_path_buf();
        files.push((relative, path));
    }

    files.sort();
    Ok(files)
}

/// Removes a directory tree, a missing directory is not an error.
pub(crate) fn remove_dir(path: &Utf8Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub(crate) fn copy_rec(src: &Utf8Path, dst: &Utf8Path) -> io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut count = 0;

    for entry in src.read_dir_utf8()? {
        let entry = entry?;
        let filetype = entry.file_type()?;
        if filetype.is_dir() {
            count += copy_rec(entry.path(), &dst.join(entry.file_name()))?;
        } else {
            fs::copy(entry.path(), dst.join(entry.file_name()))?;
            count += 1;
        }
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_readable() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.00 kB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn glob_lists_relative_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        fs::create_dir_all(base.join("img/icons")).unwrap();
        fs::write(base.join("img/a.png"), b"a").unwrap();
        fs::write(base.join("img/icons/b.png"), b"b").unwrap();
        fs::write(base.join(".htaccess"), b"deny").unwrap();
        fs::write(base.join("index.html"), b"<html>").unwrap();

        let files = glob_files(base, "img/**/*").unwrap();
        let rel: Vec<_> = files.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(rel, ["img/a.png", "img/icons/b.png"]);

        let files = glob_files(base, "*").unwrap();
        let rel: Vec<_> = files.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(rel, [".htaccess", "index.html"]);
    }

    #[test]
    fn copies_and_removes_trees() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        fs::create_dir_all(base.join("from/nested")).unwrap();
        fs::write(base.join("from/a.txt"), b"a").unwrap();
        fs::write(base.join("from/nested/b.txt"), b"b").unwrap();

        assert_eq!(copy_rec(&base.join("from"), &base.join("to")).unwrap(), 2);
        assert_eq!(fs::read(base.join("to/nested/b.txt")).unwrap(), b"b");

        assert!(remove_dir(&base.join("to")).unwrap());
        assert!(!remove_dir(&base.join("to")).unwrap());
    }
}
